//! Client Manager
//!
//! Tracks every connected subscriber: its subscription filter, send
//! statistics, and slow-consumer status derived from the kernel send
//! queue. Broadcast never blocks and never retries: a client whose queue
//! is backed up is flagged slow and skipped until it drains below half
//! the threshold, so one stalled reader cannot hold up the rest.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, warn};

use crate::net::socket;

/// Send buffer requested for each client socket.
pub const MAX_SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Kernel queue depth beyond which a client is considered slow.
pub const SLOW_CONSUMER_THRESHOLD: usize = 1024 * 1024;

/// State for one connected subscriber.
pub struct ClientConnection {
    stream: TcpStream,
    pub addr: SocketAddr,

    pub subscribed_symbols: HashSet<u16>,
    pub subscribe_all: bool,

    pub pending_bytes: usize,
    pub slow_count: u64,
    pub is_slow: bool,

    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub connect_time: Instant,
    pub last_activity: Instant,
}

impl ClientConnection {
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Whether this client's filter matches a symbol.
    #[inline]
    pub fn wants(&self, symbol_id: u16) -> bool {
        self.subscribe_all || self.subscribed_symbols.contains(&symbol_id)
    }
}

pub struct ClientManager {
    clients: HashMap<RawFd, ClientConnection>,
    slow_threshold: usize,

    total_messages_sent: AtomicU64,
    total_bytes_sent: AtomicU64,
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            slow_threshold: SLOW_CONSUMER_THRESHOLD,
            total_messages_sent: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
        }
    }

    /// Take ownership of an accepted connection. The socket is switched
    /// to non-blocking with Nagle disabled and a large send buffer.
    pub fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) -> std::io::Result<RawFd> {
        let fd = stream.as_raw_fd();
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let granted = socket::set_send_buffer(fd, MAX_SEND_BUFFER_SIZE)?;
        debug!(%addr, fd, granted, "client socket configured");

        let now = Instant::now();
        self.clients.insert(
            fd,
            ClientConnection {
                stream,
                addr,
                subscribed_symbols: HashSet::new(),
                subscribe_all: true,
                pending_bytes: 0,
                slow_count: 0,
                is_slow: false,
                messages_sent: 0,
                bytes_sent: 0,
                connect_time: now,
                last_activity: now,
            },
        );
        Ok(fd)
    }

    /// Drop a client; closing happens when the stream is dropped.
    pub fn remove_client(&mut self, fd: RawFd) -> Option<ClientConnection> {
        self.clients.remove(&fd)
    }

    pub fn has_client(&self, fd: RawFd) -> bool {
        self.clients.contains_key(&fd)
    }

    pub fn get_client(&self, fd: RawFd) -> Option<&ClientConnection> {
        self.clients.get(&fd)
    }

    /// Replace a client's subscription set. An empty list restores the
    /// default subscribe-all behavior.
    pub fn handle_subscription(&mut self, fd: RawFd, symbol_ids: &[u16]) -> bool {
        let Some(client) = self.clients.get_mut(&fd) else {
            return false;
        };
        client.subscribed_symbols = symbol_ids.iter().copied().collect();
        client.subscribe_all = symbol_ids.is_empty();
        client.last_activity = Instant::now();
        debug!(
            fd,
            count = symbol_ids.len(),
            subscribe_all = client.subscribe_all,
            "subscription updated"
        );
        true
    }

    /// Fan a frame out to every eligible client. Slow clients and
    /// non-matching subscriptions are skipped. Returns the delivery count.
    pub fn broadcast(&mut self, data: &[u8], symbol_id: u16) -> usize {
        let threshold = self.slow_threshold;
        let mut delivered = 0usize;

        for client in self.clients.values_mut() {
            if client.is_slow || !client.wants(symbol_id) {
                continue;
            }
            if Self::send_one(client, data, threshold) {
                delivered += 1;
            }
        }

        self.total_messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.total_bytes_sent
            .fetch_add((delivered * data.len()) as u64, Ordering::Relaxed);
        delivered
    }

    /// Send to one client regardless of its subscription (heartbeats).
    /// Returns true only when every byte was handed to the kernel.
    pub fn send_to_client(&mut self, fd: RawFd, data: &[u8]) -> bool {
        let threshold = self.slow_threshold;
        let Some(client) = self.clients.get_mut(&fd) else {
            return false;
        };
        if Self::send_one(client, data, threshold) {
            self.total_messages_sent.fetch_add(1, Ordering::Relaxed);
            self.total_bytes_sent
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn send_one(client: &mut ClientConnection, data: &[u8], threshold: usize) -> bool {
        // Check queue depth before touching the socket
        let pending = socket::pending_out_bytes(client.fd());
        client.pending_bytes = pending;

        if pending > threshold {
            Self::mark_slow(client, pending);
            return false;
        }

        match socket::send_nonblocking(client.fd(), data) {
            Ok(Some(sent)) if sent == data.len() => {
                if client.is_slow && pending < threshold / 2 {
                    client.is_slow = false;
                    debug!(fd = client.fd(), pending, "slow consumer recovered");
                }
                client.messages_sent += 1;
                client.bytes_sent += data.len() as u64;
                client.last_activity = Instant::now();
                true
            }
            Ok(Some(_partial)) => {
                // Partial write: the tail is NOT retried, the slow flag
                // absorbs it
                Self::mark_slow(client, pending);
                false
            }
            Ok(None) => {
                Self::mark_slow(client, pending);
                false
            }
            Err(_) => {
                // Broken pipe or reset; the event loop will observe the
                // hang-up and remove the client
                false
            }
        }
    }

    fn mark_slow(client: &mut ClientConnection, pending: usize) {
        if !client.is_slow {
            warn!(
                fd = client.fd(),
                addr = %client.addr,
                pending,
                "marking slow consumer"
            );
        }
        client.is_slow = true;
        client.slow_count += 1;
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.clients.keys().copied().collect()
    }

    pub fn slow_clients(&self) -> Vec<RawFd> {
        self.clients
            .values()
            .filter(|c| c.is_slow)
            .map(|c| c.fd())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn total_messages_sent(&self) -> u64 {
        self.total_messages_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn set_slow_threshold(&mut self, bytes: usize) {
        self.slow_threshold = bytes;
    }
}
