//! JSON tick decoding
//!
//! Covers the alternate broker's text frames and REST quote snapshots. A
//! snapshot body is either the Kite-style quote map keyed by instrument name
//! or the gateway's own `/poll` response, whose `data` is already a list of
//! ticks.

use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use serde::Deserialize;
use serde_json::Value;

use super::{decode_typed_message, Decoded, Frame, TickDecoder};
use crate::error::{FeedError, FeedResult};
use crate::types::{DepthLevel, MarketDepth, Ohlc, StreamMode, Tick};

/// Exchange-local timestamps in quote snapshots are IST
const EXCHANGE_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;
const SNAPSHOT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default)]
pub struct JsonDecoder;

impl JsonDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_value(&self, value: Value) -> FeedResult<Decoded> {
        match value {
            Value::Array(_) => Ok(Decoded::Ticks(serde_json::from_value(value)?)),
            Value::Object(ref map) if map.get("type").and_then(Value::as_str) == Some("tick") => {
                let data = map.get("data").cloned().unwrap_or(Value::Array(Vec::new()));
                match data {
                    Value::Array(_) => Ok(Decoded::Ticks(serde_json::from_value(data)?)),
                    single => Ok(Decoded::Ticks(vec![serde_json::from_value(single)?])),
                }
            }
            Value::Object(ref map) if map.contains_key("type") => {
                Ok(decode_typed_message(&value).unwrap_or(Decoded::Ignored))
            }
            Value::Object(ref map)
                if map.contains_key("instrument_token") || map.contains_key("token") =>
            {
                Ok(Decoded::Ticks(vec![serde_json::from_value(value)?]))
            }
            _ => Ok(Decoded::Ignored),
        }
    }
}

impl TickDecoder for JsonDecoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, frame: Frame<'_>) -> FeedResult<Decoded> {
        match frame {
            Frame::Text(text) => self.decode_value(serde_json::from_str(text)?),
            Frame::Binary(data) => Err(FeedError::Decode(format!(
                "unexpected {}-byte binary frame on a JSON feed",
                data.len()
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuoteEntry {
    instrument_token: u32,
    #[serde(default)]
    last_price: Option<f64>,
    #[serde(default)]
    last_quantity: Option<u64>,
    #[serde(default)]
    average_price: Option<f64>,
    #[serde(default)]
    volume: Option<u64>,
    #[serde(default)]
    buy_quantity: Option<u64>,
    #[serde(default)]
    sell_quantity: Option<u64>,
    #[serde(default)]
    ohlc: Option<Ohlc>,
    #[serde(default)]
    net_change: Option<f64>,
    #[serde(default)]
    oi: Option<u64>,
    #[serde(default)]
    oi_day_high: Option<u64>,
    #[serde(default)]
    oi_day_low: Option<u64>,
    #[serde(default)]
    depth: Option<QuoteDepth>,
    #[serde(default)]
    last_trade_time: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuoteDepth {
    #[serde(default)]
    buy: Vec<DepthLevel>,
    #[serde(default)]
    sell: Vec<DepthLevel>,
}

fn parse_exchange_time(raw: Option<&str>) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(raw?, SNAPSHOT_TIME_FORMAT).ok()?;
    let offset = FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
}

impl QuoteEntry {
    fn into_tick(self, symbol: &str) -> Tick {
        let mode = if self.depth.is_some() {
            StreamMode::Full
        } else if self.ohlc.is_some() {
            StreamMode::Quote
        } else {
            StreamMode::Ltp
        };

        let mut tick = Tick::new(self.instrument_token);
        tick.symbol = Some(symbol.to_string());
        tick.mode = Some(mode);
        tick.last_price = self.last_price;
        tick.last_quantity = self.last_quantity;
        tick.average_price = self.average_price;
        tick.volume = self.volume;
        tick.total_buy_quantity = self.buy_quantity;
        tick.total_sell_quantity = self.sell_quantity;
        tick.change = self.net_change;
        tick.ohlc = self.ohlc;
        tick.open_interest = self.oi;
        tick.oi_day_high = self.oi_day_high;
        tick.oi_day_low = self.oi_day_low;
        tick.depth = self.depth.map(|d| MarketDepth {
            buy: d.buy,
            sell: d.sell,
        });
        tick.last_trade_time = parse_exchange_time(self.last_trade_time.as_deref());
        tick.exchange_timestamp = parse_exchange_time(self.timestamp.as_deref());
        tick
    }
}

/// Decode a REST quote snapshot body into ticks
pub fn decode_quote_snapshot(body: &Value) -> FeedResult<Vec<Tick>> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("");
    if status != "success" {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("snapshot request failed");
        return Err(FeedError::Decode(format!("snapshot status '{status}': {message}")));
    }

    match body.get("data") {
        Some(Value::Object(entries)) => {
            let mut ticks = Vec::with_capacity(entries.len());
            for (symbol, entry) in entries {
                let entry: QuoteEntry = serde_json::from_value(entry.clone())?;
                ticks.push(entry.into_tick(symbol));
            }
            ticks.sort_by_key(|t| t.instrument_token);
            Ok(ticks)
        }
        Some(list @ Value::Array(_)) => Ok(serde_json::from_value(list.clone())?),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(FeedError::Decode(format!("unexpected snapshot data: {other}"))),
    }
}
