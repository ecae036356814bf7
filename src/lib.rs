//! Market Data Feed Library
//!
//! Core components for the exchange simulator and feed handler pair:
//! - **wire**: fixed-layout binary protocol with per-message checksums
//! - **parser**: streaming frame parser with sequence-gap detection
//! - **cache**: lock-free seqlock symbol cache (single writer, many readers)
//! - **latency**: concurrent bucketed latency histogram
//! - **ticks**: geometric-Brownian-motion tick generator
//! - **net**: non-blocking sockets and edge-triggered readiness polling
//! - **server** / **client**: the two single-threaded event loops

pub mod cache;
pub mod client;
pub mod latency;
pub mod net;
pub mod parser;
pub mod server;
pub mod ticks;
pub mod wire;

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
///
/// Both sides of the feed stamp and diff against this clock, so end-to-end
/// latency is only meaningful between hosts with synchronized clocks.
#[inline]
pub fn wall_clock_ns() -> u64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64
}
