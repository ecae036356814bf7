//! Feed Handler
//!
//! The client-side event loop: waits on readiness, drains the socket
//! into the parser, and applies decoded messages to the symbol cache
//! while recording end-to-end latency. Other threads (the monitor, or
//! any embedding application) read the cache through seqlock snapshots
//! and never block this loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::cache::{MarketState, SymbolCache};
use crate::client::socket::{FeedSocket, MAX_RECONNECT_ATTEMPTS};
use crate::latency::{LatencyStats, LatencyTracker};
use crate::parser::{MessageParser, ParserStats};
use crate::wall_clock_ns;
use crate::wire::{DEFAULT_PORT, MAX_SYMBOLS};

/// Receive buffer drained into the parser on each readiness event.
const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Readiness poll ceiling; also bounds shutdown-flag latency.
const POLL_TIMEOUT_MS: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct FeedHandlerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub num_symbols: usize,
    pub auto_reconnect: bool,
    /// Empty means subscribe to every symbol.
    pub subscribe_symbols: Vec<u16>,
}

impl Default for FeedHandlerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_millis(5000),
            num_symbols: MAX_SYMBOLS,
            auto_reconnect: true,
            subscribe_symbols: Vec::new(),
        }
    }
}

/// Point-in-time counters for display or export.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatsSnapshot {
    pub state: ConnectionState,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub trades: u64,
    pub quotes: u64,
    pub heartbeats: u64,
    pub sequence_gaps: u64,
    pub checksum_errors: u64,
    pub malformed_messages: u64,
    pub parser_buffer_used: usize,
    pub total_cache_updates: u64,
    pub latency: LatencyStats,
}

pub struct FeedHandler {
    config: FeedHandlerConfig,
    socket: FeedSocket,
    parser: MessageParser,

    cache: Arc<SymbolCache>,
    latency: Arc<LatencyTracker>,
    parser_stats: Arc<ParserStats>,

    state: Arc<RwLock<ConnectionState>>,
    running: Arc<AtomicBool>,
    messages_received: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,

    recv_buffer: Vec<u8>,
}

impl FeedHandler {
    pub fn new(config: FeedHandlerConfig) -> Result<Self> {
        let socket = FeedSocket::new(config.host.clone(), config.port, config.connect_timeout)?;
        let cache = Arc::new(SymbolCache::new(config.num_symbols));
        let latency = Arc::new(LatencyTracker::new());

        let mut parser = MessageParser::new();
        let parser_stats = parser.stats();

        let trade_cache = Arc::clone(&cache);
        let trade_latency = Arc::clone(&latency);
        parser.set_trade_callback(Box::new(move |header, payload| {
            let timestamp_ns = header.timestamp_ns;
            let now = wall_clock_ns();
            if now >= timestamp_ns {
                trade_latency.record(now - timestamp_ns);
            }
            trade_cache.update_trade(
                header.symbol_id,
                payload.price,
                payload.quantity,
                timestamp_ns,
            );
        }));

        let quote_cache = Arc::clone(&cache);
        let quote_latency = Arc::clone(&latency);
        parser.set_quote_callback(Box::new(move |header, payload| {
            let timestamp_ns = header.timestamp_ns;
            let now = wall_clock_ns();
            if now >= timestamp_ns {
                quote_latency.record(now - timestamp_ns);
            }
            quote_cache.update_quote(
                header.symbol_id,
                payload.bid_price,
                payload.bid_quantity,
                payload.ask_price,
                payload.ask_quantity,
                timestamp_ns,
            );
        }));

        parser.set_heartbeat_callback(Box::new(|header| {
            trace!(seq = { header.sequence_number }, "heartbeat");
        }));

        parser.set_gap_callback(Box::new(|expected, received| {
            warn!(expected, received, "sequence gap");
        }));

        Ok(Self {
            config,
            socket,
            parser,
            cache,
            latency,
            parser_stats,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            running: Arc::new(AtomicBool::new(false)),
            messages_received: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    /// Connect and send the initial subscription.
    pub fn start(&mut self) -> Result<()> {
        *self.state.write() = ConnectionState::Connecting;
        match self.socket.connect() {
            Ok(()) => {}
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                return Err(e);
            }
        }
        *self.state.write() = ConnectionState::Connected;

        if !self.config.subscribe_symbols.is_empty() {
            self.socket
                .send_subscription(&self.config.subscribe_symbols)
                .context("failed to send subscription")?;
            info!(
                symbols = self.config.subscribe_symbols.len(),
                "subscribed"
            );
        }
        Ok(())
    }

    /// Run the receive loop until stopped or the connection is lost
    /// beyond recovery.
    pub fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::Relaxed) {
            match self.socket.wait_for_data(POLL_TIMEOUT_MS) {
                Ok(true) => self.process_data(),
                Ok(false) => {}
                Err(e) => {
                    debug!("feed connection lost: {e}");
                    if !self.handle_disconnect() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Returns false when the loop should terminate.
    fn handle_disconnect(&mut self) -> bool {
        *self.state.write() = ConnectionState::Degraded;

        if !self.config.auto_reconnect {
            warn!("connection lost, auto-reconnect disabled");
            *self.state.write() = ConnectionState::Terminated;
            return false;
        }

        match self.socket.reconnect() {
            Ok(()) => {
                info!("reconnected to feed");
                *self.state.write() = ConnectionState::Connected;
                if !self.config.subscribe_symbols.is_empty() {
                    if let Err(e) = self.socket.send_subscription(&self.config.subscribe_symbols) {
                        warn!("failed to resend subscription: {e}");
                    }
                }
                true
            }
            Err(e) => {
                if self.socket.reconnect_attempts() >= MAX_RECONNECT_ATTEMPTS {
                    warn!("giving up after {} reconnect attempts", MAX_RECONNECT_ATTEMPTS);
                    *self.state.write() = ConnectionState::Terminated;
                    return false;
                }
                debug!("reconnect attempt failed: {e}");
                true
            }
        }
    }

    /// Drain the socket completely (edge-triggered mode) and parse
    /// every complete frame.
    fn process_data(&mut self) {
        loop {
            match self.socket.receive(&mut self.recv_buffer) {
                Ok(0) => break,
                Ok(n) => {
                    self.parser.append_data(&self.recv_buffer[..n]);
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    let parsed = self.parser.parse_messages();
                    self.messages_received
                        .fetch_add(parsed as u64, Ordering::Relaxed);
                }
                Err(_) => break, // handled by the next wait_for_data
            }
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.socket.disconnect();
        *self.state.write() = ConnectionState::Disconnected;
    }

    /// Flag checked by the loop; clear from any thread to stop.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn market_state(&self, symbol_id: u16) -> MarketState {
        self.cache.snapshot(symbol_id)
    }

    pub fn cache(&self) -> Arc<SymbolCache> {
        Arc::clone(&self.cache)
    }

    pub fn latency(&self) -> Arc<LatencyTracker> {
        Arc::clone(&self.latency)
    }

    pub fn parser_stats(&self) -> Arc<ParserStats> {
        Arc::clone(&self.parser_stats)
    }

    pub fn latency_stats(&self) -> LatencyStats {
        self.latency.stats()
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn messages_received_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.messages_received)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn sequence_gaps(&self) -> u64 {
        self.parser_stats.sequence_gaps.load(Ordering::Relaxed)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn connection_state_handle(&self) -> Arc<RwLock<ConnectionState>> {
        Arc::clone(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Clear statistics and cached market state. Call from the loop
    /// thread only (the cache reset uses the writer protocol).
    pub fn reset_stats(&mut self) {
        self.parser.reset();
        self.latency.reset();
        self.cache.reset();
        self.messages_received.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
    }

    pub fn stats_snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            state: self.connection_state(),
            messages_received: self.messages_received(),
            bytes_received: self.bytes_received(),
            trades: self.parser_stats.trades_parsed.load(Ordering::Relaxed),
            quotes: self.parser_stats.quotes_parsed.load(Ordering::Relaxed),
            heartbeats: self.parser_stats.heartbeats_parsed.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps(),
            checksum_errors: self.parser_stats.checksum_errors.load(Ordering::Relaxed),
            malformed_messages: self
                .parser_stats
                .malformed_messages
                .load(Ordering::Relaxed),
            parser_buffer_used: self.parser.buffer_used(),
            total_cache_updates: self.cache.total_updates(),
            latency: self.latency.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FeedHandlerConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.auto_reconnect);
        assert!(config.subscribe_symbols.is_empty());
    }

    #[test]
    fn test_start_fails_fast_when_unreachable() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let config = FeedHandlerConfig {
            host: "127.0.0.1".to_string(),
            port: dead_port,
            connect_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut handler = FeedHandler::new(config).unwrap();
        assert!(handler.start().is_err());
        assert_eq!(handler.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stats_snapshot_serializes() {
        let config = FeedHandlerConfig {
            num_symbols: 10,
            ..Default::default()
        };
        let handler = FeedHandler::new(config).unwrap();
        let snapshot = handler.stats_snapshot();
        assert_eq!(snapshot.messages_received, 0);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"Disconnected\""));
        assert!(json.contains("\"sequence_gaps\":0"));
    }
}
