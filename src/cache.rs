//! Symbol Cache
//!
//! Lock-free last-value store for per-symbol market state using the
//! seqlock pattern: the writer flips a per-entry sequence counter to odd
//! before mutating and back to even after, and readers retry until two
//! reads of the counter agree and are even.
//!
//! Single writer per symbol (the feed handler's receive loop), any
//! number of readers. Writes to different symbols never serialize
//! against each other because every entry owns its own counter.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::wire::MAX_SYMBOLS;

/// Market state for a single symbol.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketState {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_quantity: u32,
    pub ask_quantity: u32,
    pub last_price: f64,
    pub last_quantity: u32,
    pub last_update_ns: u64,
    pub update_count: u64,
    pub opening_price: f64,
}

impl MarketState {
    /// Percentage change of the mid (or last trade) against the open.
    pub fn percent_change(&self) -> f64 {
        if self.opening_price <= 0.0 {
            return 0.0;
        }
        let current = if self.best_bid > 0.0 && self.best_ask > 0.0 {
            (self.best_bid + self.best_ask) / 2.0
        } else {
            self.last_price
        };
        if current <= 0.0 {
            return 0.0;
        }
        (current - self.opening_price) / self.opening_price * 100.0
    }
}

const _: () = assert!(std::mem::size_of::<MarketState>() == 64);

/// Padding to fill each entry out to two cache lines so adjacent
/// symbols never share a line.
const ENTRY_PAD_SIZE: usize =
    128 - std::mem::size_of::<AtomicU64>() - std::mem::size_of::<MarketState>();

/// One symbol slot: sequence counter (odd = write in progress) plus the
/// state it guards.
#[repr(C, align(128))]
struct SymbolEntry {
    sequence: AtomicU64,
    state: UnsafeCell<MarketState>,
    _pad: [u8; ENTRY_PAD_SIZE],
}

const _: () = assert!(std::mem::size_of::<SymbolEntry>() == 128);

// SAFETY: the seqlock protocol makes concurrent access sound as long as
// at most one thread writes a given entry at a time, which is the
// documented contract of the writer methods.
unsafe impl Sync for SymbolEntry {}
unsafe impl Send for SymbolEntry {}

impl SymbolEntry {
    fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            state: UnsafeCell::new(MarketState::default()),
            _pad: [0; ENTRY_PAD_SIZE],
        }
    }
}

/// Seqlock-protected cache of per-symbol market state.
pub struct SymbolCache {
    entries: Vec<SymbolEntry>,
}

impl SymbolCache {
    pub fn new(num_symbols: usize) -> Self {
        let n = num_symbols.min(MAX_SYMBOLS);
        Self {
            entries: (0..n).map(|_| SymbolEntry::new()).collect(),
        }
    }

    pub fn num_symbols(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn begin_write(&self, entry: &SymbolEntry) {
        let seq = entry.sequence.load(Ordering::Relaxed);
        entry.sequence.store(seq + 1, Ordering::Release);
        fence(Ordering::Release);
    }

    #[inline]
    fn end_write(&self, entry: &SymbolEntry) {
        fence(Ordering::Release);
        let seq = entry.sequence.load(Ordering::Relaxed);
        entry.sequence.store(seq + 1, Ordering::Release);
    }

    /// Apply a full quote. Writer thread only.
    pub fn update_quote(
        &self,
        symbol_id: u16,
        bid_price: f64,
        bid_qty: u32,
        ask_price: f64,
        ask_qty: u32,
        timestamp_ns: u64,
    ) {
        let Some(entry) = self.entries.get(symbol_id as usize) else {
            return;
        };
        self.begin_write(entry);
        // SAFETY: single-writer contract; readers detect in-flight writes
        unsafe {
            let state = &mut *entry.state.get();
            state.best_bid = bid_price;
            state.bid_quantity = bid_qty;
            state.best_ask = ask_price;
            state.ask_quantity = ask_qty;
            state.last_update_ns = timestamp_ns;
            state.update_count += 1;
            if state.opening_price == 0.0 {
                state.opening_price = (bid_price + ask_price) / 2.0;
            }
        }
        self.end_write(entry);
    }

    /// Apply a trade print. Writer thread only.
    pub fn update_trade(&self, symbol_id: u16, price: f64, quantity: u32, timestamp_ns: u64) {
        let Some(entry) = self.entries.get(symbol_id as usize) else {
            return;
        };
        self.begin_write(entry);
        unsafe {
            let state = &mut *entry.state.get();
            state.last_price = price;
            state.last_quantity = quantity;
            state.last_update_ns = timestamp_ns;
            state.update_count += 1;
            if state.opening_price == 0.0 {
                state.opening_price = price;
            }
        }
        self.end_write(entry);
    }

    /// Update only the bid side. Writer thread only.
    pub fn update_bid(&self, symbol_id: u16, price: f64, quantity: u32, timestamp_ns: u64) {
        let Some(entry) = self.entries.get(symbol_id as usize) else {
            return;
        };
        self.begin_write(entry);
        unsafe {
            let state = &mut *entry.state.get();
            state.best_bid = price;
            state.bid_quantity = quantity;
            state.last_update_ns = timestamp_ns;
            state.update_count += 1;
        }
        self.end_write(entry);
    }

    /// Update only the ask side. Writer thread only.
    pub fn update_ask(&self, symbol_id: u16, price: f64, quantity: u32, timestamp_ns: u64) {
        let Some(entry) = self.entries.get(symbol_id as usize) else {
            return;
        };
        self.begin_write(entry);
        unsafe {
            let state = &mut *entry.state.get();
            state.best_ask = price;
            state.ask_quantity = quantity;
            state.last_update_ns = timestamp_ns;
            state.update_count += 1;
        }
        self.end_write(entry);
    }

    /// Consistent snapshot of one symbol. Never blocks the writer;
    /// retries while a write is in flight.
    pub fn snapshot(&self, symbol_id: u16) -> MarketState {
        let Some(entry) = self.entries.get(symbol_id as usize) else {
            return MarketState::default();
        };
        loop {
            let mut seq1 = entry.sequence.load(Ordering::Acquire);
            while seq1 & 1 == 1 {
                hint::spin_loop();
                seq1 = entry.sequence.load(Ordering::Acquire);
            }

            fence(Ordering::Acquire);
            // SAFETY: torn reads are detected by the sequence recheck
            let state = unsafe { *entry.state.get() };
            fence(Ordering::Acquire);

            if entry.sequence.load(Ordering::Acquire) == seq1 {
                return state;
            }
            hint::spin_loop();
        }
    }

    /// The `count` most-updated symbols, by update count descending with
    /// ties broken by ascending id. Unused slots are zeroed. Best-effort
    /// aggregate: no atomicity across symbols.
    pub fn top_symbols(&self, count: usize) -> Vec<(u16, MarketState)> {
        let mut populated: Vec<(u64, u16)> = Vec::with_capacity(self.entries.len());
        for id in 0..self.entries.len() as u16 {
            let state = self.snapshot(id);
            if state.update_count > 0 {
                populated.push((state.update_count, id));
            }
        }

        populated.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        populated.truncate(count);

        let mut out = Vec::with_capacity(count);
        for &(_, id) in &populated {
            out.push((id, self.snapshot(id)));
        }
        out.resize(count, (0, MarketState::default()));
        out
    }

    /// Sum of update counts across all symbols. Best-effort aggregate.
    pub fn total_updates(&self) -> u64 {
        (0..self.entries.len() as u16)
            .map(|id| self.snapshot(id).update_count)
            .sum()
    }

    /// Reset every entry in place. Must be called from the writer thread
    /// (it uses the write protocol so concurrent readers stay consistent).
    pub fn reset(&self) {
        for entry in &self.entries {
            self.begin_write(entry);
            unsafe {
                *entry.state.get() = MarketState::default();
            }
            self.end_write(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_basic_operations() {
        let cache = SymbolCache::new(100);

        let state = cache.snapshot(0);
        assert_eq!(state.update_count, 0);

        cache.update_quote(0, 100.0, 1000, 100.5, 2000, 1_234_567_890);
        let state = cache.snapshot(0);
        assert_eq!(state.best_bid, 100.0);
        assert_eq!(state.best_ask, 100.5);
        assert_eq!(state.bid_quantity, 1000);
        assert_eq!(state.ask_quantity, 2000);
        assert_eq!(state.update_count, 1);

        cache.update_trade(0, 100.25, 500, 1_234_567_891);
        let state = cache.snapshot(0);
        assert_eq!(state.last_price, 100.25);
        assert_eq!(state.last_quantity, 500);
        assert_eq!(state.update_count, 2);
    }

    #[test]
    fn test_out_of_range_symbol_ignored() {
        let cache = SymbolCache::new(10);
        cache.update_trade(10, 1.0, 1, 0);
        assert_eq!(cache.total_updates(), 0);
        assert_eq!(cache.snapshot(499).update_count, 0);
    }

    #[test]
    fn test_opening_price_latched_once() {
        let cache = SymbolCache::new(10);

        cache.update_quote(3, 99.0, 100, 101.0, 100, 1);
        assert_eq!(cache.snapshot(3).opening_price, 100.0); // mid of first quote

        cache.update_quote(3, 200.0, 100, 202.0, 100, 2);
        assert_eq!(cache.snapshot(3).opening_price, 100.0);

        // Trades latch their own open on a fresh symbol
        cache.update_trade(4, 55.5, 10, 1);
        cache.update_trade(4, 66.6, 10, 2);
        assert_eq!(cache.snapshot(4).opening_price, 55.5);
    }

    #[test]
    fn test_single_side_updates() {
        let cache = SymbolCache::new(10);
        cache.update_bid(1, 9.5, 300, 10);
        cache.update_ask(1, 10.5, 400, 11);

        let state = cache.snapshot(1);
        assert_eq!(state.best_bid, 9.5);
        assert_eq!(state.best_ask, 10.5);
        assert_eq!(state.bid_quantity, 300);
        assert_eq!(state.ask_quantity, 400);
        assert_eq!(state.update_count, 2);
        assert_eq!(state.last_update_ns, 11);
    }

    #[test]
    fn test_total_updates() {
        let cache = SymbolCache::new(10);
        for i in 0..5 {
            cache.update_quote(0, 100.0, 1000, 100.5, 2000, i);
        }
        for i in 0..3 {
            cache.update_trade(1, 200.0, 500, i);
        }
        assert_eq!(cache.total_updates(), 8);
    }

    #[test]
    fn test_top_symbols_ordering() {
        let cache = SymbolCache::new(10);
        for i in 0..10 {
            cache.update_trade(2, 10.0, 1, i);
        }
        for i in 0..5 {
            cache.update_trade(5, 10.0, 1, i);
        }
        cache.update_trade(0, 10.0, 1, 0);

        let top = cache.top_symbols(5);
        assert_eq!(top[0].0, 2);
        assert_eq!(top[0].1.update_count, 10);
        assert_eq!(top[1].0, 5);
        assert_eq!(top[1].1.update_count, 5);
        assert_eq!(top[2].0, 0);
        assert_eq!(top[2].1.update_count, 1);
        // Remaining slots zeroed
        assert_eq!(top[3].0, 0);
        assert_eq!(top[3].1.update_count, 0);
        assert_eq!(top[4].0, 0);
        assert_eq!(top[4].1.update_count, 0);
    }

    #[test]
    fn test_top_symbols_tie_break_ascending_id() {
        let cache = SymbolCache::new(10);
        cache.update_trade(7, 1.0, 1, 0);
        cache.update_trade(4, 1.0, 1, 0);
        cache.update_trade(9, 1.0, 1, 0);

        let top = cache.top_symbols(3);
        assert_eq!(top[0].0, 4);
        assert_eq!(top[1].0, 7);
        assert_eq!(top[2].0, 9);
    }

    #[test]
    fn test_reset() {
        let cache = SymbolCache::new(10);
        cache.update_trade(1, 5.0, 1, 0);
        cache.reset();
        assert_eq!(cache.total_updates(), 0);
        assert_eq!(cache.snapshot(1).last_price, 0.0);
    }

    #[test]
    fn test_concurrent_snapshots_never_torn() {
        const WRITES: u64 = 100_000;
        const READERS: usize = 4;
        const READS_PER_READER: usize = 10_000;

        let cache = Arc::new(SymbolCache::new(8));
        let mut handles = Vec::new();

        for _ in 0..READERS {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for _ in 0..READS_PER_READER {
                    let state = cache.snapshot(0);
                    if state.best_bid > 0.0 && state.best_ask > 0.0 {
                        let spread = state.best_ask - state.best_bid;
                        assert!(
                            (spread - 0.2).abs() < 0.01,
                            "torn snapshot: bid={} ask={}",
                            state.best_bid,
                            state.best_ask
                        );
                    }
                }
            }));
        }

        let writer_cache = Arc::clone(&cache);
        let writer = std::thread::spawn(move || {
            for i in 1..=WRITES {
                let mid = 100.0 + i as f64 * 0.001;
                writer_cache.update_quote(0, mid - 0.1, 100, mid + 0.1, 100, i);
            }
        });

        for handle in handles {
            handle.join().unwrap();
        }
        writer.join().unwrap();

        assert_eq!(cache.snapshot(0).update_count, WRITES);
    }
}
