//! Decoder module - pluggable per-broker tick decoding
//!
//! Turns raw upstream frames into normalized `Tick` records. Each broker
//! dialect gets its own `TickDecoder`; the connector and the worker links
//! only ever see `Decoded` values.

mod json;
mod kite;

pub use json::{decode_quote_snapshot, JsonDecoder};
pub use kite::KiteDecoder;

use std::sync::Arc;

use crate::error::FeedResult;
use crate::types::{BrokerKind, Tick};

/// One raw frame as received from a socket
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    Binary(&'a [u8]),
    Text(&'a str),
}

impl Frame<'_> {
    /// Single-byte frames are keep-alives and carry no data
    pub fn is_heartbeat(&self) -> bool {
        match self {
            Frame::Binary(data) => data.len() == 1,
            Frame::Text(text) => text.len() == 1,
        }
    }
}

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Ticks(Vec<Tick>),
    /// Order-update payload, forwarded verbatim
    Order(serde_json::Value),
    /// Broker notice or error message
    Notice(String),
    Ignored,
}

/// Trait for broker frame decoders
pub trait TickDecoder: Send + Sync {
    /// Get the decoder name
    fn name(&self) -> &'static str;

    /// Decode one non-heartbeat frame
    fn decode(&self, frame: Frame<'_>) -> FeedResult<Decoded>;
}

/// Decoder for a broker dialect
pub fn decoder_for(kind: BrokerKind) -> Arc<dyn TickDecoder> {
    match kind {
        BrokerKind::Kite => Arc::new(KiteDecoder::new()),
        BrokerKind::Alternate => Arc::new(JsonDecoder::new()),
    }
}

/// Shared handling of `{"type": "...", "data": ...}` control messages
pub(crate) fn decode_typed_message(value: &serde_json::Value) -> Option<Decoded> {
    let kind = value.get("type")?.as_str()?;
    let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
    match kind {
        "order" => Some(Decoded::Order(data)),
        "error" | "message" => Some(Decoded::Notice(match data {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })),
        _ => None,
    }
}
