//! Feed Socket
//!
//! Client-side connection to the exchange feed: connect with a timeout,
//! non-blocking receive, subscription send, and reconnection with
//! exponential backoff (100 ms doubling to a 30 s ceiling, five
//! attempts before giving up).

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::net::{socket, PollEvent, Poller};
use crate::wire::encode_subscription;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct FeedSocket {
    host: String,
    port: u16,
    connect_timeout: Duration,

    stream: Option<TcpStream>,
    poller: Poller,

    connected: AtomicBool,
    bytes_received: AtomicU64,
    recv_calls: AtomicU64,

    reconnect_attempts: u32,
    backoff: Duration,
}

impl FeedSocket {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            host: host.into(),
            port,
            connect_timeout,
            stream: None,
            poller: Poller::new().context("failed to create poller")?,
            connected: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            recv_calls: AtomicU64::new(0),
            reconnect_attempts: 0,
            backoff: INITIAL_BACKOFF,
        })
    }

    /// Resolve the host and establish a fresh connection. Resets the
    /// reconnect accounting.
    pub fn connect(&mut self) -> Result<()> {
        self.reconnect_attempts = 0;
        self.backoff = INITIAL_BACKOFF;
        self.do_connect()
    }

    fn do_connect(&mut self) -> Result<()> {
        self.close();

        let target = format!("{}:{}", self.host, self.port);
        let addr = target
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {target}"))?
            .next()
            .ok_or_else(|| anyhow!("no address for {target}"))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .with_context(|| format!("failed to connect to {target}"))?;

        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let granted = socket::set_recv_buffer(fd, socket::SOCKET_BUFFER_SIZE)?;
        debug!(fd, granted, "feed socket configured");

        self.poller
            .register(fd)
            .context("failed to register feed socket")?;
        self.stream = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        info!(%addr, "connected to feed");
        Ok(())
    }

    /// Wait for readable data. `Ok(true)` means data is pending; a dead
    /// or errored connection surfaces as `Err` (the edge-triggered
    /// poller will not re-report a hang-up that `receive` already hit).
    pub fn wait_for_data(&mut self, timeout_ms: i32) -> io::Result<bool> {
        if self.stream.is_none() || !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        }

        let mut events: Vec<PollEvent> = Vec::with_capacity(1);
        self.poller.wait(&mut events, timeout_ms)?;

        for event in &events {
            if event.error && !event.readable {
                self.connected.store(false, Ordering::SeqCst);
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection error",
                ));
            }
        }
        Ok(!events.is_empty())
    }

    /// Non-blocking read into `buf`. `Ok(0)` means no data available;
    /// a closed or broken connection is an error.
    pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        };

        self.recv_calls.fetch_add(1, Ordering::Relaxed);
        match stream.read(buf) {
            Ok(0) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ))
            }
            Ok(n) => {
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Send a subscription command. An empty list subscribes to all
    /// symbols.
    pub fn send_subscription(&mut self, symbol_ids: &[u16]) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        };

        let command = encode_subscription(symbol_ids);
        let sent = stream.write(&command)?;
        if sent != command.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short subscription write",
            ));
        }
        debug!(count = symbol_ids.len(), "subscription sent");
        Ok(())
    }

    /// One backoff-delayed reconnection attempt. The backoff doubles on
    /// each call and resets once a connection succeeds.
    pub fn reconnect(&mut self) -> Result<()> {
        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            bail!("max reconnect attempts ({MAX_RECONNECT_ATTEMPTS}) exceeded");
        }

        let delay = self.backoff;
        warn!(
            attempt = self.reconnect_attempts + 1,
            ?delay,
            "reconnecting"
        );
        std::thread::sleep(delay);
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        self.reconnect_attempts += 1;

        match self.do_connect() {
            Ok(()) => {
                self.backoff = INITIAL_BACKOFF;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn disconnect(&mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(stream) = self.stream.take() {
            let _ = self.poller.deregister(stream.as_raw_fd());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn recv_calls(&self) -> u64 {
        self.recv_calls.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn current_backoff(&self) -> Duration {
        self.backoff
    }
}

impl Drop for FeedSocket {
    fn drop(&mut self) {
        self.close();
    }
}
