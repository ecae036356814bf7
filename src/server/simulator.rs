//! Exchange Simulator
//!
//! Single-threaded reactor owning the listening socket and every client
//! socket. One loop iteration: poll readiness with a 1 ms ceiling,
//! drain pending accepts and subscription reads, then pace tick
//! generation against wall time and heartbeat once per second.
//!
//! Ticks are only generated while at least one client is connected, so
//! an idle simulator emits nothing but heartbeats.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::net::{socket, PollEvent, Poller};
use crate::server::clients::ClientManager;
use crate::ticks::{MarketCondition, TickGenerator};
use crate::wire::{decode_subscription, DEFAULT_PORT, QUOTE_MSG_SIZE, SUBSCRIBE_CMD};

/// Ticks emitted per iteration are capped so a stall cannot turn into
/// an unbounded burst.
const MAX_CATCHUP_TICKS: u64 = 100;
const MIN_TICK_RATE: u32 = 1;
const MAX_TICK_RATE: u32 = 500_000;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub port: u16,
    pub num_symbols: usize,
    pub tick_rate: u32,
    pub market: MarketCondition,
    pub fault_injection: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            num_symbols: 100,
            tick_rate: 100_000,
            market: MarketCondition::Neutral,
            fault_injection: false,
        }
    }
}

pub struct ExchangeSimulator {
    listener: std::net::TcpListener,
    listener_fd: RawFd,
    poller: Poller,

    generator: TickGenerator,
    clients: ClientManager,

    tick_interval: Duration,
    fault_injection: bool,
    fault_counter: u32,

    running: Arc<AtomicBool>,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ExchangeSimulator {
    /// Bind the listening socket and prepare the generator. The loop
    /// itself starts with [`run`](Self::run).
    pub fn bind(config: SimulatorConfig) -> Result<Self> {
        let listener = socket::listen(config.port)
            .with_context(|| format!("failed to bind port {}", config.port))?;
        let listener_fd = listener.as_raw_fd();

        let poller = Poller::new().context("failed to create poller")?;
        poller
            .register(listener_fd)
            .context("failed to register listener")?;

        let tick_rate = config.tick_rate.clamp(MIN_TICK_RATE, MAX_TICK_RATE);
        let mut generator = TickGenerator::new(config.num_symbols);
        generator.set_market_condition(config.market);

        info!(
            port = listener.local_addr().map(|a| a.port()).unwrap_or(0),
            symbols = config.num_symbols,
            tick_rate,
            fault = config.fault_injection,
            "exchange simulator bound"
        );

        Ok(Self {
            listener,
            listener_fd,
            poller,
            generator,
            clients: ClientManager::new(),
            tick_interval: Duration::from_nanos(1_000_000_000 / tick_rate as u64),
            fault_injection: config.fault_injection,
            fault_counter: 0,
            running: Arc::new(AtomicBool::new(false)),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    /// Actual bound port (useful with port 0).
    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Flag observed by the loop; clear it to stop, from any thread or a
    /// signal handler.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn client_count(&self) -> usize {
        self.clients.client_count()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Run the reactor until the shutdown flag is cleared.
    pub fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let mut events: Vec<PollEvent> = Vec::with_capacity(64);
        let mut frame = [0u8; QUOTE_MSG_SIZE];
        let mut last_tick = Instant::now();
        let mut last_heartbeat = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            self.poller
                .wait(&mut events, 1)
                .context("poll wait failed")?;

            for &event in events.iter() {
                if event.fd == self.listener_fd {
                    self.accept_pending();
                } else if event.error {
                    self.disconnect(event.fd, "connection error");
                } else if event.readable {
                    self.read_client(event.fd);
                }
            }

            let now = Instant::now();
            let elapsed = now.duration_since(last_tick);
            if elapsed >= self.tick_interval {
                let due = (elapsed.as_nanos() / self.tick_interval.as_nanos()) as u64;
                let ticks = due.min(MAX_CATCHUP_TICKS);
                for _ in 0..ticks {
                    if self.clients.client_count() == 0 {
                        break;
                    }
                    self.emit_tick(&mut frame);
                }
                last_tick = now;
            }

            if now.duration_since(last_heartbeat) >= Duration::from_secs(1) {
                self.send_heartbeat(&mut frame);
                last_heartbeat = now;
            }
        }

        info!(
            messages = self.messages_sent(),
            bytes = self.bytes_sent(),
            "exchange simulator stopped"
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Drain every pending connection; required in edge-triggered mode.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let fd = stream.as_raw_fd();
                    if let Err(e) = self.poller.register(fd) {
                        error!(%addr, "failed to register client: {e}");
                        continue;
                    }
                    match self.clients.add_client(stream, addr) {
                        Ok(fd) => info!(%addr, fd, "client connected"),
                        Err(e) => {
                            error!(%addr, "failed to configure client: {e}");
                            let _ = self.poller.deregister(fd);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Drain subscription commands from a client socket.
    fn read_client(&mut self, fd: RawFd) {
        let mut buf = [0u8; 1024];
        loop {
            match socket::recv_nonblocking(fd, &mut buf) {
                Ok(Some(n)) => {
                    if buf[0] == SUBSCRIBE_CMD {
                        match decode_subscription(&buf[..n]) {
                            Some(ids) => {
                                info!(fd, count = ids.len(), "subscription received");
                                self.clients.handle_subscription(fd, &ids);
                            }
                            None => debug!(fd, n, "incomplete subscription command"),
                        }
                    } else {
                        debug!(fd, "ignoring unknown client data");
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    self.disconnect(fd, "read failed");
                    break;
                }
            }
        }
    }

    fn disconnect(&mut self, fd: RawFd, reason: &str) {
        let _ = self.poller.deregister(fd);
        if let Some(client) = self.clients.remove_client(fd) {
            info!(
                fd,
                addr = %client.addr,
                messages_sent = client.messages_sent,
                reason,
                "client disconnected"
            );
        }
    }

    fn emit_tick(&mut self, frame: &mut [u8]) {
        if self.fault_injection {
            self.fault_counter = self.fault_counter.wrapping_add(1);
            if self.fault_counter % 100 == 0 {
                // Burn a sequence number without broadcasting it,
                // manufacturing a gap for every consumer
                let _ = self.generator.generate_tick(frame);
            }
        }

        let (size, symbol_id) = self.generator.generate_tick(frame);
        let delivered = self.clients.broadcast(&frame[..size], symbol_id);
        self.messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add((delivered * size) as u64, Ordering::Relaxed);
    }

    /// Heartbeats go to every client, bypassing subscription filtering
    /// and the slow skip (still a non-blocking send).
    fn send_heartbeat(&mut self, frame: &mut [u8]) {
        let size = self.generator.generate_heartbeat(frame);
        for fd in self.clients.client_fds() {
            if self.clients.send_to_client(fd, &frame[..size]) {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let config = SimulatorConfig {
            port: 0,
            ..Default::default()
        };
        let sim = ExchangeSimulator::bind(config).unwrap();
        assert_ne!(sim.local_port(), 0);
        assert_eq!(sim.client_count(), 0);
        assert_eq!(sim.messages_sent(), 0);
    }

    #[test]
    fn test_tick_rate_clamped() {
        let config = SimulatorConfig {
            port: 0,
            tick_rate: 0,
            ..Default::default()
        };
        let sim = ExchangeSimulator::bind(config).unwrap();
        // Rate 0 clamps to 1 tick per second
        assert_eq!(sim.tick_interval, Duration::from_secs(1));

        let config = SimulatorConfig {
            port: 0,
            tick_rate: u32::MAX,
            ..Default::default()
        };
        let sim = ExchangeSimulator::bind(config).unwrap();
        assert_eq!(sim.tick_interval, Duration::from_nanos(2000));
    }
}
