//! Streaming Message Parser
//!
//! Frames messages out of an append-only byte stream, validates
//! checksums, and tracks the sequence number for gap detection.
//!
//! Error recovery is byte-granular: an unknown type or a checksum
//! failure advances the read position by a single byte so the next
//! attempt re-examines the shifted window. This re-synchronizes on the
//! next valid header without dropping more than the corrupted frame.
//!
//! Headers and payloads are decoded into stack-local copies before the
//! handlers run, so the buffer is free to compact between frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::wire::{
    message_size, validate_checksum, MessageHeader, MessageType, QuotePayload, TradePayload,
    HEADER_SIZE, MAX_MSG_SIZE,
};

/// Hard cap on buffered unparsed bytes.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;
/// Starting buffer capacity.
pub const INITIAL_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub type TradeCallback = Box<dyn FnMut(&MessageHeader, &TradePayload) + Send>;
pub type QuoteCallback = Box<dyn FnMut(&MessageHeader, &QuotePayload) + Send>;
pub type HeartbeatCallback = Box<dyn FnMut(&MessageHeader) + Send>;
pub type GapCallback = Box<dyn FnMut(u32, u32) + Send>;

/// Outcome of a single framing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    Success,
    NeedMoreData,
    InvalidType,
    ChecksumError,
    SequenceGap,
}

/// Monotonic parse counters, readable from any thread.
#[derive(Debug, Default)]
pub struct ParserStats {
    pub messages_parsed: AtomicU64,
    pub trades_parsed: AtomicU64,
    pub quotes_parsed: AtomicU64,
    pub heartbeats_parsed: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub malformed_messages: AtomicU64,
}

impl ParserStats {
    fn reset(&self) {
        self.messages_parsed.store(0, Ordering::Relaxed);
        self.trades_parsed.store(0, Ordering::Relaxed);
        self.quotes_parsed.store(0, Ordering::Relaxed);
        self.heartbeats_parsed.store(0, Ordering::Relaxed);
        self.checksum_errors.store(0, Ordering::Relaxed);
        self.sequence_gaps.store(0, Ordering::Relaxed);
        self.malformed_messages.store(0, Ordering::Relaxed);
    }
}

pub struct MessageParser {
    buffer: Vec<u8>,
    read_pos: usize,
    write_pos: usize,

    expected_sequence: u32,
    first_message: bool,

    trade_cb: Option<TradeCallback>,
    quote_cb: Option<QuoteCallback>,
    heartbeat_cb: Option<HeartbeatCallback>,
    gap_cb: Option<GapCallback>,

    stats: Arc<ParserStats>,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageParser {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; INITIAL_BUFFER_SIZE],
            read_pos: 0,
            write_pos: 0,
            expected_sequence: 0,
            first_message: true,
            trade_cb: None,
            quote_cb: None,
            heartbeat_cb: None,
            gap_cb: None,
            stats: Arc::new(ParserStats::default()),
        }
    }

    pub fn set_trade_callback(&mut self, cb: TradeCallback) {
        self.trade_cb = Some(cb);
    }

    pub fn set_quote_callback(&mut self, cb: QuoteCallback) {
        self.quote_cb = Some(cb);
    }

    pub fn set_heartbeat_callback(&mut self, cb: HeartbeatCallback) {
        self.heartbeat_cb = Some(cb);
    }

    pub fn set_gap_callback(&mut self, cb: GapCallback) {
        self.gap_cb = Some(cb);
    }

    /// Shared handle to the parse counters.
    pub fn stats(&self) -> Arc<ParserStats> {
        Arc::clone(&self.stats)
    }

    /// Append raw stream bytes. Returns the number of bytes accepted;
    /// 0 when the 16 MiB cap would be exceeded (counted as malformed).
    pub fn append_data(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let mut available = self.buffer.len() - self.write_pos;
        if available < data.len() {
            self.compact_buffer();
            available = self.buffer.len() - self.write_pos;

            if available < data.len() {
                let new_size = (self.buffer.len() * 2).min(MAX_BUFFER_SIZE);
                if new_size <= self.buffer.len() || new_size - self.write_pos < data.len() {
                    self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                    return 0;
                }
                self.buffer.resize(new_size, 0);
            }
        }

        self.buffer[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
        data.len()
    }

    fn compact_buffer(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let used = self.write_pos - self.read_pos;
        if used > 0 {
            self.buffer.copy_within(self.read_pos..self.write_pos, 0);
        }
        self.write_pos = used;
        self.read_pos = 0;
    }

    /// Parse every complete frame in the buffer, continuing past
    /// recoverable errors. Returns the number of decoded frames
    /// (gap-flagged frames included).
    pub fn parse_messages(&mut self) -> usize {
        let mut count = 0;
        loop {
            match self.parse_one() {
                ParseResult::NeedMoreData => break,
                ParseResult::Success | ParseResult::SequenceGap => count += 1,
                ParseResult::InvalidType | ParseResult::ChecksumError => {}
            }
        }
        count
    }

    /// Attempt to frame and dispatch a single message.
    pub fn parse_one(&mut self) -> ParseResult {
        let available = self.write_pos - self.read_pos;
        if available < HEADER_SIZE {
            return ParseResult::NeedMoreData;
        }

        let header = MessageHeader::read_from(&self.buffer[self.read_pos..]);
        let raw_type = header.message_type;
        let msg_size = message_size(raw_type);

        if msg_size == 0 {
            // Unknown type: shift one byte and retry on the next call
            self.read_pos += 1;
            self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
            trace!(raw_type, "invalid message type, resyncing");
            return ParseResult::InvalidType;
        }

        if msg_size > MAX_MSG_SIZE {
            self.read_pos += 1;
            self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
            return ParseResult::InvalidType;
        }

        if available < msg_size {
            return ParseResult::NeedMoreData;
        }

        let frame = &self.buffer[self.read_pos..self.read_pos + msg_size];
        if !validate_checksum(frame) {
            self.read_pos += 1;
            self.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
            trace!(seq = { header.sequence_number }, "checksum mismatch, resyncing");
            return ParseResult::ChecksumError;
        }

        let has_gap = !self.check_sequence(header.sequence_number);

        match MessageType::from_u16(raw_type) {
            Some(MessageType::Trade) => {
                let payload =
                    TradePayload::read_from(&self.buffer[self.read_pos + HEADER_SIZE..]);
                if let Some(cb) = self.trade_cb.as_mut() {
                    cb(&header, &payload);
                }
                self.stats.trades_parsed.fetch_add(1, Ordering::Relaxed);
            }
            Some(MessageType::Quote) => {
                let payload =
                    QuotePayload::read_from(&self.buffer[self.read_pos + HEADER_SIZE..]);
                if let Some(cb) = self.quote_cb.as_mut() {
                    cb(&header, &payload);
                }
                self.stats.quotes_parsed.fetch_add(1, Ordering::Relaxed);
            }
            Some(MessageType::Heartbeat) => {
                if let Some(cb) = self.heartbeat_cb.as_mut() {
                    cb(&header);
                }
                self.stats.heartbeats_parsed.fetch_add(1, Ordering::Relaxed);
            }
            None => unreachable!("type validated above"),
        }

        self.stats.messages_parsed.fetch_add(1, Ordering::Relaxed);
        self.read_pos += msg_size;

        if has_gap {
            ParseResult::SequenceGap
        } else {
            ParseResult::Success
        }
    }

    /// Returns false when a gap was detected. The expected sequence is
    /// unconditionally re-baselined to `received + 1`.
    fn check_sequence(&mut self, received: u32) -> bool {
        if self.first_message {
            self.first_message = false;
            self.expected_sequence = received.wrapping_add(1);
            return true;
        }

        if received != self.expected_sequence {
            let expected = self.expected_sequence;
            if let Some(cb) = self.gap_cb.as_mut() {
                cb(expected, received);
            }
            self.stats.sequence_gaps.fetch_add(1, Ordering::Relaxed);
            self.expected_sequence = received.wrapping_add(1);
            return false;
        }

        self.expected_sequence = received.wrapping_add(1);
        true
    }

    /// Clear buffered data, sequence tracking, and counters.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.expected_sequence = 0;
        self.first_message = true;
        self.stats.reset();
    }

    pub fn buffer_used(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn expected_sequence(&self) -> u32 {
        self.expected_sequence
    }

    /// Force the sequence baseline (resync support and tests).
    pub fn set_expected_sequence(&mut self, seq: u32) {
        self.expected_sequence = seq;
        self.first_message = false;
    }

    pub fn messages_parsed(&self) -> u64 {
        self.stats.messages_parsed.load(Ordering::Relaxed)
    }

    pub fn trades_parsed(&self) -> u64 {
        self.stats.trades_parsed.load(Ordering::Relaxed)
    }

    pub fn quotes_parsed(&self) -> u64 {
        self.stats.quotes_parsed.load(Ordering::Relaxed)
    }

    pub fn heartbeats_parsed(&self) -> u64 {
        self.stats.heartbeats_parsed.load(Ordering::Relaxed)
    }

    pub fn checksum_errors(&self) -> u64 {
        self.stats.checksum_errors.load(Ordering::Relaxed)
    }

    pub fn sequence_gaps(&self) -> u64 {
        self.stats.sequence_gaps.load(Ordering::Relaxed)
    }

    pub fn malformed_messages(&self) -> u64 {
        self.stats.malformed_messages.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{seal, QUOTE_MSG_SIZE, TRADE_MSG_SIZE};
    use std::sync::atomic::AtomicU32;

    fn make_quote(seq: u32, symbol_id: u16, bid: f64, ask: f64) -> Vec<u8> {
        let header = MessageHeader {
            message_type: MessageType::Quote as u16,
            sequence_number: seq,
            timestamp_ns: 1_000_000 + seq as u64,
            symbol_id,
        };
        let payload = QuotePayload {
            bid_price: bid,
            bid_quantity: 100,
            ask_price: ask,
            ask_quantity: 200,
        };
        let mut frame = vec![0u8; QUOTE_MSG_SIZE];
        header.write_to(&mut frame);
        payload.write_to(&mut frame[HEADER_SIZE..]);
        seal(&mut frame);
        frame
    }

    fn make_trade(seq: u32, symbol_id: u16, price: f64) -> Vec<u8> {
        let header = MessageHeader {
            message_type: MessageType::Trade as u16,
            sequence_number: seq,
            timestamp_ns: 1_000_000 + seq as u64,
            symbol_id,
        };
        let payload = TradePayload {
            price,
            quantity: 50,
        };
        let mut frame = vec![0u8; TRADE_MSG_SIZE];
        header.write_to(&mut frame);
        payload.write_to(&mut frame[HEADER_SIZE..]);
        seal(&mut frame);
        frame
    }

    #[test]
    fn test_parses_complete_stream() {
        let mut parser = MessageParser::new();
        let quotes = Arc::new(AtomicU64::new(0));
        let quotes_cb = Arc::clone(&quotes);
        parser.set_quote_callback(Box::new(move |_, p| {
            assert!({ p.bid_price } < { p.ask_price });
            quotes_cb.fetch_add(1, Ordering::Relaxed);
        }));

        let mut stream = Vec::new();
        for seq in 1..=10u32 {
            stream.extend_from_slice(&make_quote(seq, 3, 99.5, 100.5));
        }
        parser.append_data(&stream);

        assert_eq!(parser.parse_messages(), 10);
        assert_eq!(quotes.load(Ordering::Relaxed), 10);
        assert_eq!(parser.quotes_parsed(), 10);
        assert_eq!(parser.sequence_gaps(), 0);
        assert_eq!(parser.buffer_used(), 0);
    }

    #[test]
    fn test_truncated_frame_resumes_without_duplicates() {
        let mut parser = MessageParser::new();

        let a = make_trade(1, 0, 500.0);
        let b = make_trade(2, 0, 501.0);

        // Complete frame plus half of the next
        let mut stream = a.clone();
        stream.extend_from_slice(&b[..TRADE_MSG_SIZE / 2]);
        parser.append_data(&stream);

        assert_eq!(parser.parse_messages(), 1);
        assert_eq!(parser.buffer_used(), TRADE_MSG_SIZE / 2);

        // Remainder completes exactly one more frame
        parser.append_data(&b[TRADE_MSG_SIZE / 2..]);
        assert_eq!(parser.parse_messages(), 1);
        assert_eq!(parser.messages_parsed(), 2);
        assert_eq!(parser.buffer_used(), 0);
    }

    fn make_quote_at(seq: u32, ts: u64) -> Vec<u8> {
        let header = MessageHeader {
            message_type: MessageType::Quote as u16,
            sequence_number: seq,
            timestamp_ns: ts,
            symbol_id: 0,
        };
        let payload = QuotePayload {
            bid_price: 99.0,
            bid_quantity: 100,
            ask_price: 100.0,
            ask_quantity: 200,
        };
        let mut frame = vec![0u8; QUOTE_MSG_SIZE];
        header.write_to(&mut frame);
        payload.write_to(&mut frame[HEADER_SIZE..]);
        seal(&mut frame);
        frame
    }

    #[test]
    fn test_payload_corruption_single_checksum_error() {
        let mut parser = MessageParser::new();

        // Sequence 16 keeps every interior byte pair from aliasing a
        // valid type during the one-byte resync scan.
        let mut corrupted = make_quote_at(16, 0);
        corrupted[HEADER_SIZE + 4] ^= 0xFF; // payload byte, not the checksum
        let good = make_quote_at(17, 0);

        let mut stream = corrupted;
        stream.extend_from_slice(&good);
        parser.append_data(&stream);
        let parsed = parser.parse_messages();

        // Exactly one checksum failure, then the scan walks byte by byte
        // to the next valid frame and decoding resumes.
        assert_eq!(parser.checksum_errors(), 1);
        assert_eq!(parser.malformed_messages(), (QUOTE_MSG_SIZE - 1) as u64);
        assert_eq!(parsed, 1);
        assert_eq!(parser.quotes_parsed(), 1);
        assert_eq!(parser.sequence_gaps(), 0);
    }

    #[test]
    fn test_leading_garbage_resyncs() {
        let mut parser = MessageParser::new();

        let mut stream = vec![0xEEu8]; // one garbage byte ahead of the frame
        stream.extend_from_slice(&make_trade(1, 7, 250.0));
        stream.extend_from_slice(&make_trade(2, 7, 251.0));
        parser.append_data(&stream);

        let parsed = parser.parse_messages();
        assert!(parser.malformed_messages() >= 1);
        assert_eq!(parsed, 2);
        assert_eq!(parser.trades_parsed(), 2);
    }

    #[test]
    fn test_sequence_gap_callback_values() {
        let mut parser = MessageParser::new();
        let observed = Arc::new((AtomicU32::new(0), AtomicU32::new(0)));
        let observed_cb = Arc::clone(&observed);
        parser.set_gap_callback(Box::new(move |expected, received| {
            observed_cb.0.store(expected, Ordering::Relaxed);
            observed_cb.1.store(received, Ordering::Relaxed);
        }));

        let mut stream = Vec::new();
        for seq in [3u32, 4] {
            stream.extend_from_slice(&make_trade(seq, 0, 10.0));
        }
        stream.extend_from_slice(&make_trade(8, 0, 10.0)); // expected 5
        parser.append_data(&stream);
        parser.parse_messages();

        assert_eq!(parser.sequence_gaps(), 1);
        assert_eq!(observed.0.load(Ordering::Relaxed), 5);
        assert_eq!(observed.1.load(Ordering::Relaxed), 8);
        assert_eq!(parser.expected_sequence(), 9);
    }

    #[test]
    fn test_gap_frames_still_counted_as_parsed() {
        let mut parser = MessageParser::new();
        let mut stream = make_trade(1, 0, 10.0);
        stream.extend_from_slice(&make_trade(5, 0, 10.0));
        parser.append_data(&stream);

        assert_eq!(parser.parse_messages(), 2);
        assert_eq!(parser.sequence_gaps(), 1);
    }

    #[test]
    fn test_compaction_keeps_partial_frame() {
        let mut parser = MessageParser::new();
        let frame = make_quote(1, 0, 1.0, 2.0);

        // Fill most of the buffer with complete frames, parse them out,
        // then force a compaction by appending past the write position.
        let reps = INITIAL_BUFFER_SIZE / QUOTE_MSG_SIZE - 1;
        for seq in 0..reps as u32 {
            parser.append_data(&make_quote(seq + 1, 0, 1.0, 2.0));
        }
        parser.parse_messages();

        // Partial frame at the tail survives the compacting append
        parser.append_data(&frame[..10]);
        let big = vec![0u8; INITIAL_BUFFER_SIZE - 16];
        let accepted = parser.append_data(&big);
        assert!(accepted > 0);
        assert_eq!(parser.buffer_used(), 10 + accepted);
    }

    #[test]
    fn test_buffer_overflow_drops_append() {
        let mut parser = MessageParser::new();

        // Grow to the cap with unparseable data (zero bytes are invalid
        // types, but we never call parse here).
        let chunk = vec![0u8; 4 * 1024 * 1024];
        assert_eq!(parser.append_data(&chunk), chunk.len());
        assert_eq!(parser.append_data(&chunk), chunk.len());
        assert_eq!(parser.append_data(&chunk), chunk.len());
        assert_eq!(parser.append_data(&chunk), chunk.len());

        // Buffer now holds 16 MiB unread; further appends are dropped
        assert_eq!(parser.append_data(&[0u8; 1]), 0);
        assert_eq!(parser.malformed_messages(), 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut parser = MessageParser::new();
        parser.append_data(&make_trade(1, 0, 10.0));
        parser.parse_messages();
        assert_eq!(parser.messages_parsed(), 1);

        parser.reset();
        assert_eq!(parser.messages_parsed(), 0);
        assert_eq!(parser.buffer_used(), 0);

        // Sequence tracking restarts from the first message
        parser.append_data(&make_trade(100, 0, 10.0));
        assert_eq!(parser.parse_messages(), 1);
        assert_eq!(parser.sequence_gaps(), 0);
        assert_eq!(parser.expected_sequence(), 101);
    }
}
