//! Latency Tracker
//!
//! Fixed-bucket histogram for end-to-end message latency: 1000 buckets
//! of 1 microsecond covering [0, 1 ms), plus an overflow counter.
//! Recording is a handful of relaxed atomic operations, so any number of
//! threads may insert concurrently; readers of `stats()` see a
//! best-effort view, not a transactional one.
//!
//! A ring of the last 2^20 raw samples is kept for offline analysis.
//! `stats()` never consults it and its contents may be stale or torn.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub const NUM_BUCKETS: usize = 1000;
pub const BUCKET_WIDTH_NS: u64 = 1000;
pub const MAX_TRACKED_NS: u64 = NUM_BUCKETS as u64 * BUCKET_WIDTH_NS;
pub const RING_BUFFER_SIZE: usize = 1 << 20;

/// Point-in-time latency summary, all values in nanoseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub mean: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub sample_count: u64,
    pub overflow_count: u64,
}

pub struct LatencyTracker {
    histogram: Vec<AtomicU64>,
    overflow_count: AtomicU64,

    sample_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,

    ring_buffer: Vec<AtomicU64>,
    write_index: AtomicU64,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            histogram: (0..NUM_BUCKETS).map(|_| AtomicU64::new(0)).collect(),
            overflow_count: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            ring_buffer: (0..RING_BUFFER_SIZE).map(|_| AtomicU64::new(0)).collect(),
            write_index: AtomicU64::new(0),
        }
    }

    /// Record one latency sample in nanoseconds.
    #[inline]
    pub fn record(&self, latency_ns: u64) {
        self.sample_count.fetch_add(1, Ordering::Relaxed);
        // May wrap at extreme lifetimes; mean is informational
        self.sum.fetch_add(latency_ns, Ordering::Relaxed);

        let mut current = self.min.load(Ordering::Relaxed);
        while latency_ns < current {
            match self.min.compare_exchange_weak(
                current,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let mut current = self.max.load(Ordering::Relaxed);
        while latency_ns > current {
            match self.max.compare_exchange_weak(
                current,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        if latency_ns < MAX_TRACKED_NS {
            let bucket = (latency_ns / BUCKET_WIDTH_NS) as usize;
            self.histogram[bucket].fetch_add(1, Ordering::Relaxed);
        } else {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }

        let idx = self.write_index.fetch_add(1, Ordering::Relaxed);
        self.ring_buffer[idx as usize % RING_BUFFER_SIZE].store(latency_ns, Ordering::Relaxed);
    }

    /// Summarize everything recorded so far.
    pub fn stats(&self) -> LatencyStats {
        let sample_count = self.sample_count.load(Ordering::Relaxed);
        if sample_count == 0 {
            return LatencyStats::default();
        }

        LatencyStats {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            mean: self.sum.load(Ordering::Relaxed) / sample_count,
            p50: self.percentile(50.0, sample_count),
            p95: self.percentile(95.0, sample_count),
            p99: self.percentile(99.0, sample_count),
            p999: self.percentile(99.9, sample_count),
            sample_count,
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
        }
    }

    /// Walk the histogram to the target rank and return the bucket
    /// midpoint; samples past the tracked range fall back to `max`.
    fn percentile(&self, percentile: f64, total: u64) -> u64 {
        let target = ((percentile / 100.0) * total as f64) as u64;
        let mut cumulative = 0u64;

        for (i, bucket) in self.histogram.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return i as u64 * BUCKET_WIDTH_NS + BUCKET_WIDTH_NS / 2;
            }
        }

        self.max.load(Ordering::Relaxed)
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Clear all statistics and the raw-sample ring.
    pub fn reset(&self) {
        self.sample_count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        self.overflow_count.store(0, Ordering::Relaxed);
        for bucket in &self.histogram {
            bucket.store(0, Ordering::Relaxed);
        }
        for slot in &self.ring_buffer {
            slot.store(0, Ordering::Relaxed);
        }
        self.write_index.store(0, Ordering::Relaxed);
    }

    /// Export non-empty histogram buckets as CSV:
    /// `bucket_start_ns,bucket_end_ns,count`, with a trailing
    /// `MAX_TRACKED_NS,inf,overflow` row when overflow occurred.
    pub fn export_csv(&self, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);

        writeln!(out, "bucket_start_ns,bucket_end_ns,count")?;
        for (i, bucket) in self.histogram.iter().enumerate() {
            let count = bucket.load(Ordering::Relaxed);
            if count > 0 {
                writeln!(
                    out,
                    "{},{},{}",
                    i as u64 * BUCKET_WIDTH_NS,
                    (i as u64 + 1) * BUCKET_WIDTH_NS,
                    count
                )?;
            }
        }

        let overflow = self.overflow_count.load(Ordering::Relaxed);
        if overflow > 0 {
            writeln!(out, "{MAX_TRACKED_NS},inf,{overflow}")?;
        }

        out.flush()
    }
}
