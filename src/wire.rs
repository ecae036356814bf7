//! Wire Protocol
//!
//! Fixed-layout binary format for market data messages. All multi-byte
//! fields are little-endian; every framed message carries a trailing
//! 4-byte XOR checksum over the header and payload.
//!
//! Layout:
//! ```text
//! MessageHeader (16 bytes)
//!   0   2  message_type   0x01=Trade, 0x02=Quote, 0x03=Heartbeat
//!   2   4  sequence_number
//!   6   8  timestamp_ns
//!   14  2  symbol_id
//! TradePayload (12 bytes): price f64, quantity u32
//! QuotePayload (24 bytes): bid_price f64, bid_quantity u32,
//!                          ask_price f64, ask_quantity u32
//! checksum (4 bytes)
//! ```

use std::borrow::Cow;

/// Subscription command byte (client -> server).
pub const SUBSCRIBE_CMD: u8 = 0xFF;

pub const HEADER_SIZE: usize = 16;
pub const TRADE_PAYLOAD_SIZE: usize = 12;
pub const QUOTE_PAYLOAD_SIZE: usize = 24;
pub const CHECKSUM_SIZE: usize = 4;

pub const TRADE_MSG_SIZE: usize = HEADER_SIZE + TRADE_PAYLOAD_SIZE + CHECKSUM_SIZE;
pub const QUOTE_MSG_SIZE: usize = HEADER_SIZE + QUOTE_PAYLOAD_SIZE + CHECKSUM_SIZE;
pub const HEARTBEAT_MSG_SIZE: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// Largest frame on the wire; anything claiming to be bigger is garbage.
pub const MAX_MSG_SIZE: usize = QUOTE_MSG_SIZE;

pub const MAX_SYMBOLS: usize = 500;
pub const DEFAULT_PORT: u16 = 9876;

/// Message type discriminants as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Trade = 0x01,
    Quote = 0x02,
    Heartbeat = 0x03,
}

impl MessageType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x01 => Some(Self::Trade),
            0x02 => Some(Self::Quote),
            0x03 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Total framed size for a raw type value, 0 for unknown types.
#[inline]
pub fn message_size(raw_type: u16) -> usize {
    match MessageType::from_u16(raw_type) {
        Some(MessageType::Trade) => TRADE_MSG_SIZE,
        Some(MessageType::Quote) => QUOTE_MSG_SIZE,
        Some(MessageType::Heartbeat) => HEARTBEAT_MSG_SIZE,
        None => 0,
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct MessageHeader {
    pub message_type: u16,
    pub sequence_number: u32,
    pub timestamp_ns: u64,
    pub symbol_id: u16,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TradePayload {
    pub price: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct QuotePayload {
    pub bid_price: f64,
    pub bid_quantity: u32,
    pub ask_price: f64,
    pub ask_quantity: u32,
}

// Verify layout at compile time
const _: () = assert!(std::mem::size_of::<MessageHeader>() == HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<TradePayload>() == TRADE_PAYLOAD_SIZE);
const _: () = assert!(std::mem::size_of::<QuotePayload>() == QUOTE_PAYLOAD_SIZE);

macro_rules! impl_wire_codec {
    ($ty:ty, $size:expr) => {
        impl $ty {
            /// Copy the struct into the front of `out`.
            #[inline]
            pub fn write_to(&self, out: &mut [u8]) {
                assert!(out.len() >= $size);
                // SAFETY: repr(C, packed) with the size verified above
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self as *const Self as *const u8,
                        out.as_mut_ptr(),
                        $size,
                    );
                }
            }

            /// Decode from the front of `buf` (unaligned read).
            #[inline]
            pub fn read_from(buf: &[u8]) -> Self {
                assert!(buf.len() >= $size);
                // SAFETY: packed layout, any bit pattern is a valid value
                unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Self) }
            }
        }
    };
}

impl_wire_codec!(MessageHeader, HEADER_SIZE);
impl_wire_codec!(TradePayload, TRADE_PAYLOAD_SIZE);
impl_wire_codec!(QuotePayload, QUOTE_PAYLOAD_SIZE);

/// XOR checksum over consecutive 32-bit little-endian words.
///
/// Trailing bytes (fewer than 4) contribute as `byte << (8 * offset)`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(4);
    for word in &mut chunks {
        sum ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    }
    for (i, &byte) in chunks.remainder().iter().enumerate() {
        sum ^= (byte as u32) << (i * 8);
    }
    sum
}

/// Recompute the checksum over everything but the trailing 4 bytes and
/// compare against them.
pub fn validate_checksum(frame: &[u8]) -> bool {
    if frame.len() < CHECKSUM_SIZE {
        return false;
    }
    let body = frame.len() - CHECKSUM_SIZE;
    let received = u32::from_le_bytes(frame[body..].try_into().unwrap());
    checksum(&frame[..body]) == received
}

/// Compute the checksum over `frame[..len-4]` and write it into the
/// trailing 4 bytes, completing the frame.
pub fn seal(frame: &mut [u8]) {
    let body = frame.len() - CHECKSUM_SIZE;
    let sum = checksum(&frame[..body]);
    frame[body..].copy_from_slice(&sum.to_le_bytes());
}

/// Build a subscription command: `0xFF`, count, then the symbol ids.
/// An empty list subscribes to every symbol.
pub fn encode_subscription(symbol_ids: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + symbol_ids.len() * 2);
    buf.push(SUBSCRIBE_CMD);
    buf.extend_from_slice(&(symbol_ids.len() as u16).to_le_bytes());
    for id in symbol_ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    buf
}

/// Parse a subscription command. Returns the symbol ids (possibly empty
/// for subscribe-all), or `None` if `buf` is not a complete command.
pub fn decode_subscription(buf: &[u8]) -> Option<Vec<u16>> {
    if buf.len() < 3 || buf[0] != SUBSCRIBE_CMD {
        return None;
    }
    let count = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < 3 + count * 2 {
        return None;
    }
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let off = 3 + i * 2;
        ids.push(u16::from_le_bytes([buf[off], buf[off + 1]]));
    }
    Some(ids)
}

/// Display names for the first symbol ids (sample NSE stocks); the rest
/// fall back to a generated `SYMnnn` name.
static SYMBOL_NAMES: &[&str] = &[
    "RELIANCE", "TCS", "INFY", "HDFC", "ICICIBANK",
    "HDFCBANK", "SBIN", "BHARTIARTL", "ITC", "KOTAKBANK",
    "LT", "HINDUNILVR", "AXISBANK", "BAJFINANCE", "MARUTI",
    "ASIANPAINT", "TITAN", "SUNPHARMA", "ULTRACEMCO", "WIPRO",
    "HCLTECH", "TECHM", "POWERGRID", "NTPC", "ONGC",
    "TATASTEEL", "JSWSTEEL", "COALINDIA", "BPCL", "IOC",
    "GRASIM", "ADANIPORTS", "DRREDDY", "DIVISLAB", "CIPLA",
    "APOLLOHOSP", "EICHERMOT", "HEROMOTOCO", "BAJAJ-AUTO", "M&M",
    "TATAMOTORS", "NESTLEIND", "BRITANNIA", "DABUR", "GODREJCP",
    "PIDILITIND", "BERGER", "HAVELLS", "VOLTAS", "BLUESTAR",
];

pub fn symbol_name(symbol_id: u16) -> Cow<'static, str> {
    match SYMBOL_NAMES.get(symbol_id as usize) {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("SYM{symbol_id:03}")),
    }
}
