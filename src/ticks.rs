//! Tick Generator
//!
//! Synthesizes quote/trade messages by walking each symbol's price with
//! geometric Brownian motion: `dS = mu * S * dt + sigma * S * dW`.
//! Normals come from a Box-Muller transform with the spare value cached
//! across calls.

use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::wire::{
    seal, MessageHeader, MessageType, QuotePayload, TradePayload, CHECKSUM_SIZE, HEADER_SIZE,
    HEARTBEAT_MSG_SIZE, QUOTE_MSG_SIZE, QUOTE_PAYLOAD_SIZE, TRADE_MSG_SIZE, TRADE_PAYLOAD_SIZE,
};
use crate::wall_clock_ns;

pub const MIN_PRICE: f64 = 1.0;
pub const MAX_PRICE: f64 = 100_000.0;
pub const DEFAULT_TIME_STEP: f64 = 0.001;

/// Drift regime applied to every symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarketCondition {
    #[default]
    Neutral,
    Bullish,
    Bearish,
}

impl MarketCondition {
    fn drift(self) -> f64 {
        match self {
            Self::Neutral => 0.0,
            Self::Bullish => 0.05,
            Self::Bearish => -0.05,
        }
    }
}

/// Walk state for one simulated symbol.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolState {
    pub price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub volatility: f64,
    pub drift: f64,
    pub bid_quantity: u32,
    pub ask_quantity: u32,
    pub last_trade_qty: u32,
}

pub struct TickGenerator {
    symbols: Vec<SymbolState>,
    sequence: u32,
    dt: f64,
    condition: MarketCondition,
    rng: StdRng,
    // Cached second Box-Muller output
    spare_normal: Option<f64>,
}

impl TickGenerator {
    pub fn new(num_symbols: usize) -> Self {
        Self::with_rng(num_symbols, StdRng::from_entropy())
    }

    /// Deterministic generator for tests and replayable runs.
    pub fn with_seed(num_symbols: usize, seed: u64) -> Self {
        Self::with_rng(num_symbols, StdRng::seed_from_u64(seed))
    }

    fn with_rng(num_symbols: usize, rng: StdRng) -> Self {
        let mut gen = Self {
            symbols: vec![SymbolState::default(); num_symbols.max(1)],
            sequence: 0,
            dt: DEFAULT_TIME_STEP,
            condition: MarketCondition::Neutral,
            rng,
            spare_normal: None,
        };
        gen.reset();
        gen
    }

    /// Re-seed every symbol with a fresh starting price, volatility and
    /// depth. The sequence counter restarts.
    pub fn reset(&mut self) {
        self.sequence = 0;
        let drift = self.condition.drift();
        for i in 0..self.symbols.len() {
            let price = self.rng.gen_range(100.0..5000.0);
            let volatility = self.rng.gen_range(0.01..0.06);
            let bid_quantity = self.rng.gen_range(100..=10_000);
            let ask_quantity = self.rng.gen_range(100..=10_000);

            let sym = &mut self.symbols[i];
            sym.price = price;
            sym.volatility = volatility;
            sym.drift = drift;
            sym.bid_quantity = bid_quantity;
            sym.ask_quantity = ask_quantity;
            sym.last_trade_qty = 0;
            self.update_spread(i);
        }
    }

    /// Standard normal via Box-Muller, producing values in pairs.
    fn generate_normal(&mut self) -> f64 {
        if let Some(z) = self.spare_normal.take() {
            return z;
        }

        let mut u1: f64 = self.rng.gen();
        while u1 <= 0.0 {
            u1 = self.rng.gen();
        }
        let u2: f64 = self.rng.gen();

        let mag = (-2.0 * u1.ln()).sqrt();
        let (sin, cos) = (2.0 * PI * u2).sin_cos();
        self.spare_normal = Some(mag * sin);
        mag * cos
    }

    fn update_price(&mut self, idx: usize) {
        let dw = self.generate_normal() * self.dt.sqrt();
        let sym = &self.symbols[idx];
        let step = sym.drift * sym.price * self.dt + sym.volatility * sym.price * dw;

        let sym = &mut self.symbols[idx];
        sym.price = (sym.price + step).clamp(MIN_PRICE, MAX_PRICE);
        self.update_spread(idx);
    }

    /// Spread is 0.05% to 0.2% of price, split around the mid.
    fn update_spread(&mut self, idx: usize) {
        let spread_pct = 0.0005 + self.rng.gen::<f64>() * 0.0015;
        let sym = &mut self.symbols[idx];
        let half_spread = sym.price * spread_pct / 2.0;
        sym.bid_price = round2(sym.price - half_spread);
        sym.ask_price = round2(sym.price + half_spread);
    }

    /// Generate one tick for a uniformly random symbol into `out`.
    /// Returns the frame length and the symbol chosen.
    /// `out` must hold at least a quote frame.
    pub fn generate_tick(&mut self, out: &mut [u8]) -> (usize, u16) {
        let symbol_id = self.rng.gen_range(0..self.symbols.len() as u16);
        let size = self.generate_tick_for_symbol(symbol_id, out);
        (size, symbol_id)
    }

    /// Generate one tick for a specific symbol; 70% quotes, 30% trades.
    pub fn generate_tick_for_symbol(&mut self, symbol_id: u16, out: &mut [u8]) -> usize {
        let idx = symbol_id as usize;
        if idx >= self.symbols.len() {
            return 0;
        }

        self.update_price(idx);
        let is_trade = self.rng.gen::<f64>() < 0.3;

        self.sequence = self.sequence.wrapping_add(1);
        let header = MessageHeader {
            message_type: if is_trade {
                MessageType::Trade as u16
            } else {
                MessageType::Quote as u16
            },
            sequence_number: self.sequence,
            timestamp_ns: wall_clock_ns(),
            symbol_id,
        };

        if is_trade {
            let sym = self.symbols[idx];
            // Trades print near the mid, inside the spread
            let offset = (self.rng.gen::<f64>() - 0.5) * (sym.ask_price - sym.bid_price);
            let payload = TradePayload {
                price: round2(sym.price + offset),
                quantity: 100 + (self.rng.gen::<f64>() * 9900.0) as u32,
            };
            self.symbols[idx].last_trade_qty = payload.quantity;

            header.write_to(out);
            payload.write_to(&mut out[HEADER_SIZE..]);
            seal(&mut out[..TRADE_MSG_SIZE]);
            TRADE_MSG_SIZE
        } else {
            let bid_change = self.rng.gen_range(-500i32..=500);
            let ask_change = self.rng.gen_range(-500i32..=500);
            let sym = &mut self.symbols[idx];
            sym.bid_quantity = (sym.bid_quantity as i32 + bid_change).max(100) as u32;
            sym.ask_quantity = (sym.ask_quantity as i32 + ask_change).max(100) as u32;

            let payload = QuotePayload {
                bid_price: sym.bid_price,
                bid_quantity: sym.bid_quantity,
                ask_price: sym.ask_price,
                ask_quantity: sym.ask_quantity,
            };

            header.write_to(out);
            payload.write_to(&mut out[HEADER_SIZE..]);
            seal(&mut out[..QUOTE_MSG_SIZE]);
            QUOTE_MSG_SIZE
        }
    }

    /// Generate a heartbeat frame; consumes a sequence number.
    pub fn generate_heartbeat(&mut self, out: &mut [u8]) -> usize {
        self.sequence = self.sequence.wrapping_add(1);
        let header = MessageHeader {
            message_type: MessageType::Heartbeat as u16,
            sequence_number: self.sequence,
            timestamp_ns: wall_clock_ns(),
            symbol_id: 0,
        };
        header.write_to(out);
        seal(&mut out[..HEARTBEAT_MSG_SIZE]);
        HEARTBEAT_MSG_SIZE
    }

    pub fn set_market_condition(&mut self, condition: MarketCondition) {
        self.condition = condition;
        let drift = condition.drift();
        for sym in &mut self.symbols {
            sym.drift = drift;
        }
    }

    pub fn set_time_step(&mut self, dt: f64) {
        self.dt = dt;
    }

    pub fn current_sequence(&self) -> u32 {
        self.sequence
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol_state(&self, symbol_id: u16) -> SymbolState {
        self.symbols
            .get(symbol_id as usize)
            .copied()
            .unwrap_or_default()
    }
}

#[inline]
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// Keep the payload sizes visible here so a layout change breaks loudly
const _: () = assert!(TRADE_MSG_SIZE == HEADER_SIZE + TRADE_PAYLOAD_SIZE + CHECKSUM_SIZE);
const _: () = assert!(QUOTE_MSG_SIZE == HEADER_SIZE + QUOTE_PAYLOAD_SIZE + CHECKSUM_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::validate_checksum;

    #[test]
    fn test_reset_initializes_symbols() {
        let gen = TickGenerator::with_seed(50, 42);
        for id in 0..50u16 {
            let sym = gen.symbol_state(id);
            assert!(sym.price >= 100.0 && sym.price < 5000.0);
            assert!(sym.volatility >= 0.01 && sym.volatility < 0.06);
            assert!(sym.bid_price < sym.ask_price);
            assert!(sym.bid_quantity >= 100 && sym.bid_quantity <= 10_000);
            assert_eq!(sym.drift, 0.0);
        }
    }

    #[test]
    fn test_generated_frames_validate() {
        let mut gen = TickGenerator::with_seed(10, 7);
        let mut buf = [0u8; QUOTE_MSG_SIZE];

        let mut trades = 0;
        let mut quotes = 0;
        for i in 0..500u32 {
            let (size, symbol_id) = gen.generate_tick(&mut buf);
            assert!(size == TRADE_MSG_SIZE || size == QUOTE_MSG_SIZE);
            assert!(validate_checksum(&buf[..size]));
            assert!((symbol_id as usize) < 10);

            let header = MessageHeader::read_from(&buf);
            assert_eq!({ header.sequence_number }, i + 1);
            if size == TRADE_MSG_SIZE {
                trades += 1;
            } else {
                quotes += 1;
            }
        }

        // Roughly 30% trades
        assert!(trades > 80 && trades < 220, "trades={trades}");
        assert!(quotes > 280, "quotes={quotes}");
    }

    #[test]
    fn test_heartbeat_frame() {
        let mut gen = TickGenerator::with_seed(10, 7);
        let mut buf = [0u8; QUOTE_MSG_SIZE];

        let size = gen.generate_heartbeat(&mut buf);
        assert_eq!(size, HEARTBEAT_MSG_SIZE);
        assert!(validate_checksum(&buf[..size]));

        let header = MessageHeader::read_from(&buf);
        assert_eq!({ header.message_type }, MessageType::Heartbeat as u16);
        assert_eq!({ header.symbol_id }, 0);
        assert_eq!({ header.sequence_number }, 1);
        assert_eq!(gen.current_sequence(), 1);
    }

    #[test]
    fn test_prices_stay_clamped() {
        let mut gen = TickGenerator::with_seed(1, 3);
        gen.symbols[0].volatility = 0.06;
        let mut buf = [0u8; QUOTE_MSG_SIZE];
        for _ in 0..50_000 {
            gen.generate_tick_for_symbol(0, &mut buf);
            let price = gen.symbol_state(0).price;
            assert!((MIN_PRICE..=MAX_PRICE).contains(&price));
        }
    }

    #[test]
    fn test_log_return_volatility_matches_sigma() {
        let mut gen = TickGenerator::with_seed(1, 1234);
        gen.symbols[0].price = 1000.0;
        gen.symbols[0].volatility = 0.02;
        gen.symbols[0].drift = 0.0;

        let mut returns = Vec::with_capacity(10_000);
        let mut prev = gen.symbol_state(0).price;
        let mut buf = [0u8; QUOTE_MSG_SIZE];
        for _ in 0..10_000 {
            gen.generate_tick_for_symbol(0, &mut buf);
            let price = gen.symbol_state(0).price;
            returns.push((price / prev).ln());
            prev = price;
        }

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        let observed = var.sqrt();
        let expected = 0.02 * DEFAULT_TIME_STEP.sqrt();

        assert!(
            (observed - expected).abs() < expected * 0.2,
            "observed={observed}, expected={expected}"
        );
    }

    #[test]
    fn test_bullish_drift_positive_mean_return() {
        let mut gen = TickGenerator::with_seed(1, 99);
        gen.set_market_condition(MarketCondition::Bullish);
        gen.symbols[0].price = 100.0;
        gen.symbols[0].volatility = 0.02;
        assert_eq!(gen.symbol_state(0).drift, 0.05);

        let mut sum = 0.0;
        let mut prev = gen.symbol_state(0).price;
        let mut buf = [0u8; QUOTE_MSG_SIZE];
        for _ in 0..100_000 {
            gen.generate_tick_for_symbol(0, &mut buf);
            let price = gen.symbol_state(0).price;
            sum += (price / prev).ln();
            prev = price;
        }

        assert!(sum / 100_000.0 > 0.0, "mean log-return {}", sum / 100_000.0);
    }

    #[test]
    fn test_market_condition_drift_values() {
        let mut gen = TickGenerator::with_seed(3, 5);
        gen.set_market_condition(MarketCondition::Bearish);
        for id in 0..3u16 {
            assert_eq!(gen.symbol_state(id).drift, -0.05);
        }
        gen.set_market_condition(MarketCondition::Neutral);
        assert_eq!(gen.symbol_state(0).drift, 0.0);
    }
}
