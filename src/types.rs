//! Core types used throughout Tickstream
//!
//! Defines the normalized tick record, subscription modes, broker kinds and
//! the instance key shared by the gateway and the ingestion worker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric instrument identifier assigned by the exchange/broker
pub type InstrumentToken = u32;

/// Subscription mode requested from the upstream feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Last traded price only
    Ltp,
    /// Price, volume and OHLC
    #[default]
    Quote,
    /// Quote plus open interest, timestamps and market depth
    Full,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Ltp => "ltp",
            StreamMode::Quote => "quote",
            StreamMode::Full => "full",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ltp" => Some(StreamMode::Ltp),
            "quote" => Some(StreamMode::Quote),
            "full" => Some(StreamMode::Full),
            _ => None,
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire dialect spoken by an upstream broker socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// `{a, v}` control frames, packed binary ticks
    #[default]
    Kite,
    /// `{action, mode, instruments}` control frames, JSON ticks
    Alternate,
}

impl BrokerKind {
    /// Best-effort mapping from a broker id to its dialect
    pub fn for_broker_id(id: &str) -> Self {
        match id.to_lowercase().as_str() {
            "kite" | "zerodha" => BrokerKind::Kite,
            _ => BrokerKind::Alternate,
        }
    }
}

/// Transport used by a worker instance for its primary link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bidirectional websocket
    #[serde(rename = "websocket")]
    Socket,
    /// One-directional server-sent event stream
    #[serde(rename = "sse")]
    EventStream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Socket => write!(f, "websocket"),
            TransportKind::EventStream => write!(f, "sse"),
        }
    }
}

/// Identity of one worker subscription session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub endpoint: String,
    pub transport: TransportKind,
}

impl InstanceKey {
    pub fn new(endpoint: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.endpoint)
    }
}

/// Open/high/low/close for the current session
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One price level of the order book
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: u64,
    pub orders: u32,
}

/// Bid (`buy`) and ask (`sell`) ladders, best level first
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketDepth {
    pub buy: Vec<DepthLevel>,
    pub sell: Vec<DepthLevel>,
}

impl MarketDepth {
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.buy.first()
    }

    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.sell.first()
    }
}

/// Normalized market-data update for one instrument.
///
/// Only `instrument_token` is always present. Brokers and subscription modes
/// report different subsets of the remaining fields; an unreported field is
/// `None` and is omitted from JSON. `fused_price` and `ema` are filled in by
/// the ingestion worker, never by a decoder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tick {
    #[serde(alias = "token")]
    pub instrument_token: InstrumentToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StreamMode>,
    #[serde(default, alias = "ltp", skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_buy_quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_sell_quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<Ohlc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<f64>,
    #[serde(default, alias = "oi", skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi_day_high: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi_day_low: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<MarketDepth>,
    /// Unix millis of the last trade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_time: Option<i64>,
    /// Unix millis stamped by the exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_timestamp: Option<i64>,
    /// Unix millis at which this process received the update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema: Option<f64>,
}

macro_rules! merge_present {
    ($dst:expr, $src:expr; $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

impl Tick {
    pub fn new(instrument_token: InstrumentToken) -> Self {
        Self {
            instrument_token,
            ..Default::default()
        }
    }

    /// Overlay `newer` onto `self`: present fields win, absent fields keep
    /// the older value.
    pub fn merge_from(&mut self, newer: Tick) {
        self.instrument_token = newer.instrument_token;
        merge_present!(self, newer;
            symbol,
            broker,
            mode,
            last_price,
            last_quantity,
            average_price,
            volume,
            total_buy_quantity,
            total_sell_quantity,
            ohlc,
            change,
            open_interest,
            oi_day_high,
            oi_day_low,
            depth,
            last_trade_time,
            exchange_timestamp,
            received_at,
            fused_price,
            ema,
        );
    }

    /// Key used for cross-broker fusion and indicator history
    pub fn fusion_key(&self) -> String {
        match &self.symbol {
            Some(symbol) if !symbol.is_empty() => symbol.clone(),
            _ => self.instrument_token.to_string(),
        }
    }

    /// Price consumers should treat as authoritative
    pub fn display_price(&self) -> Option<f64> {
        self.fused_price.or(self.last_price)
    }
}
