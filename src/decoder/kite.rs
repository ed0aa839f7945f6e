//! Kite-style binary tick decoder
//!
//! Frame layout (big-endian): a 2-byte packet count, then for each packet a
//! 2-byte length followed by the packet bytes. The packet length selects the
//! mode:
//!
//! | len | packet                                  |
//! |-----|-----------------------------------------|
//! | 8   | LTP: token, last price                  |
//! | 28  | index quote                             |
//! | 32  | index full (quote + exchange timestamp) |
//! | 44  | quote                                   |
//! | 184 | full (quote + OI + timestamps + depth)  |

use tracing::debug;

use super::{decode_typed_message, Decoded, Frame, TickDecoder};
use crate::error::{FeedError, FeedResult};
use crate::types::{DepthLevel, MarketDepth, Ohlc, StreamMode, Tick};

const LTP_LEN: usize = 8;
const INDEX_QUOTE_LEN: usize = 28;
const INDEX_FULL_LEN: usize = 32;
const QUOTE_LEN: usize = 44;
const FULL_LEN: usize = 184;
const DEPTH_OFFSET: usize = 64;
const DEPTH_ENTRY_LEN: usize = 12;
const DEPTH_LEVELS_PER_SIDE: usize = 5;

const SEGMENT_CDS: u32 = 3;
const SEGMENT_BCD: u32 = 6;

#[derive(Debug, Clone, Default)]
pub struct KiteDecoder;

impl KiteDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Prices arrive as integers scaled by a per-segment divisor
    fn price_divisor(token: u32) -> f64 {
        match token & 0xff {
            SEGMENT_CDS => 10_000_000.0,
            SEGMENT_BCD => 10_000.0,
            _ => 100.0,
        }
    }

    fn decode_frame(&self, data: &[u8]) -> FeedResult<Vec<Tick>> {
        if data.len() < 2 {
            return Err(FeedError::Decode(format!("frame too short: {} bytes", data.len())));
        }

        let count = read_u16(data, 0) as usize;
        let mut offset = 2;
        let mut ticks = Vec::with_capacity(count);

        for index in 0..count {
            if offset + 2 > data.len() {
                return Err(FeedError::Decode(format!(
                    "packet {index} header past end of frame"
                )));
            }
            let len = read_u16(data, offset) as usize;
            offset += 2;
            if offset + len > data.len() {
                return Err(FeedError::Decode(format!(
                    "packet {index} declares {len} bytes, only {} left",
                    data.len() - offset
                )));
            }

            match parse_packet(&data[offset..offset + len]) {
                Some(tick) => ticks.push(tick),
                None => debug!(len, "skipping packet with unknown length"),
            }
            offset += len;
        }

        Ok(ticks)
    }
}

impl TickDecoder for KiteDecoder {
    fn name(&self) -> &'static str {
        "kite"
    }

    fn decode(&self, frame: Frame<'_>) -> FeedResult<Decoded> {
        match frame {
            Frame::Binary(data) => self.decode_frame(data).map(Decoded::Ticks),
            Frame::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text)?;
                Ok(decode_typed_message(&value).unwrap_or(Decoded::Ignored))
            }
        }
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_i32(data: &[u8], at: usize) -> i32 {
    read_u32(data, at) as i32
}

fn change_pct(last: f64, close: f64) -> Option<f64> {
    (close != 0.0).then(|| (last - close) * 100.0 / close)
}

fn parse_packet(packet: &[u8]) -> Option<Tick> {
    let len = packet.len();
    if !matches!(len, LTP_LEN | INDEX_QUOTE_LEN | INDEX_FULL_LEN | QUOTE_LEN | FULL_LEN) {
        return None;
    }

    let token = read_u32(packet, 0);
    let divisor = KiteDecoder::price_divisor(token);
    let price = |at: usize| read_i32(packet, at) as f64 / divisor;

    let mut tick = Tick::new(token);
    tick.last_price = Some(price(4));

    match len {
        LTP_LEN => {
            tick.mode = Some(StreamMode::Ltp);
        }
        INDEX_QUOTE_LEN | INDEX_FULL_LEN => {
            let ohlc = Ohlc {
                high: price(8),
                low: price(12),
                open: price(16),
                close: price(20),
            };
            tick.change = change_pct(price(4), ohlc.close);
            tick.ohlc = Some(ohlc);
            if len == INDEX_FULL_LEN {
                tick.mode = Some(StreamMode::Full);
                tick.exchange_timestamp = Some(read_u32(packet, 28) as i64 * 1000);
            } else {
                tick.mode = Some(StreamMode::Quote);
            }
        }
        _ => {
            tick.last_quantity = Some(read_u32(packet, 8) as u64);
            tick.average_price = Some(price(12));
            tick.volume = Some(read_u32(packet, 16) as u64);
            tick.total_buy_quantity = Some(read_u32(packet, 20) as u64);
            tick.total_sell_quantity = Some(read_u32(packet, 24) as u64);
            let ohlc = Ohlc {
                open: price(28),
                high: price(32),
                low: price(36),
                close: price(40),
            };
            tick.change = change_pct(price(4), ohlc.close);
            tick.ohlc = Some(ohlc);

            if len == FULL_LEN {
                tick.mode = Some(StreamMode::Full);
                tick.last_trade_time = Some(read_u32(packet, 44) as i64 * 1000);
                tick.open_interest = Some(read_u32(packet, 48) as u64);
                tick.oi_day_high = Some(read_u32(packet, 52) as u64);
                tick.oi_day_low = Some(read_u32(packet, 56) as u64);
                tick.exchange_timestamp = Some(read_u32(packet, 60) as i64 * 1000);
                tick.depth = Some(parse_depth(packet, divisor));
            } else {
                tick.mode = Some(StreamMode::Quote);
            }
        }
    }

    Some(tick)
}

fn parse_depth(packet: &[u8], divisor: f64) -> MarketDepth {
    let level = |i: usize| {
        let at = DEPTH_OFFSET + i * DEPTH_ENTRY_LEN;
        DepthLevel {
            quantity: read_u32(packet, at) as u64,
            price: read_i32(packet, at + 4) as f64 / divisor,
            orders: read_u16(packet, at + 8) as u32,
        }
    };

    MarketDepth {
        buy: (0..DEPTH_LEVELS_PER_SIDE).map(level).collect(),
        sell: (DEPTH_LEVELS_PER_SIDE..DEPTH_LEVELS_PER_SIDE * 2)
            .map(level)
            .collect(),
    }
}
