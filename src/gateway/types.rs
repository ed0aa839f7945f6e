//! Gateway wire types

use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::{FeedError, FeedResult};
use crate::types::{InstrumentToken, Tick};

/// Payload of a `status` event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusPayload {
    /// `websocket`, `poll` or `demo`
    pub source: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl StatusPayload {
    pub fn new(source: impl Into<String>, connected: bool) -> Self {
        Self {
            source: source.into(),
            connected,
            ..Default::default()
        }
    }

    pub fn broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = Some(broker.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn stale(mut self) -> Self {
        self.stale = Some(true);
        self
    }

    pub fn fallback(mut self) -> Self {
        self.fallback = Some(true);
        self
    }

    pub fn code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }
}

/// One event on a client's stream
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Status(StatusPayload),
    Tick(Vec<Tick>),
    /// Server time, unix millis
    Heartbeat(i64),
    Order(serde_json::Value),
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::Status(_) => "status",
            GatewayEvent::Tick(_) => "tick",
            GatewayEvent::Heartbeat(_) => "heartbeat",
            GatewayEvent::Order(_) => "order",
        }
    }

    pub fn to_sse(&self) -> Event {
        let event = Event::default().event(self.name());
        let encoded = match self {
            GatewayEvent::Status(status) => event.json_data(status),
            GatewayEvent::Tick(ticks) => event.json_data(ticks),
            GatewayEvent::Heartbeat(ts) => event.json_data(json!({ "timestamp": ts })),
            GatewayEvent::Order(payload) => event.json_data(payload),
        };
        encoded.unwrap_or_else(|e| {
            warn!(event = self.name(), error = %e, "Failed to encode stream event");
            Event::default().event("status").data(r#"{"source":"gateway","connected":false}"#)
        })
    }
}

/// Query string of `/stream` and `/poll`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub tokens: Option<String>,
    pub mode: Option<String>,
    pub broker: Option<String>,
}

/// Parse a comma-separated token list; duplicates collapse, order is kept
pub fn parse_tokens(raw: Option<&str>) -> FeedResult<Vec<InstrumentToken>> {
    let raw = raw
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| FeedError::InvalidRequest("tokens is required".to_string()))?;

    let mut tokens: Vec<InstrumentToken> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let token = part
            .parse::<InstrumentToken>()
            .map_err(|_| FeedError::InvalidRequest(format!("invalid token '{part}'")))?;
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }

    if tokens.is_empty() {
        return Err(FeedError::InvalidRequest("tokens is required".to_string()));
    }
    Ok(tokens)
}

/// Body of `/poll` responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Tick>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PollResponse {
    pub fn success(data: Vec<Tick>) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            message: Some(message.into()),
        }
    }
}

/// Generic API envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// GET /health payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub active_sessions: usize,
    pub brokers: Vec<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens_accepts_csv_and_dedupes() {
        assert_eq!(parse_tokens(Some("256265, 260105,256265")).expect("valid"), vec![256265, 260105]);
        assert_eq!(parse_tokens(Some("5,,6,")).expect("valid"), vec![5, 6]);
    }

    #[test]
    fn test_parse_tokens_rejects_missing_and_garbage() {
        assert!(matches!(parse_tokens(None), Err(FeedError::InvalidRequest(_))));
        assert!(matches!(parse_tokens(Some(" ")), Err(FeedError::InvalidRequest(_))));
        assert!(matches!(parse_tokens(Some(",,")), Err(FeedError::InvalidRequest(_))));
        assert!(matches!(parse_tokens(Some("12,abc")), Err(FeedError::InvalidRequest(_))));
        assert!(matches!(parse_tokens(Some("-4")), Err(FeedError::InvalidRequest(_))));
    }

    #[test]
    fn test_status_payload_omits_unset_fields() {
        let status = StatusPayload::new("websocket", true).broker("kite").stale().fallback();
        let json = serde_json::to_value(&status).expect("serializes");
        assert_eq!(
            json,
            json!({"source": "websocket", "connected": true, "broker": "kite", "stale": true, "fallback": true})
        );

        let demo = StatusPayload::new("demo", false).code(401);
        let json = serde_json::to_value(&demo).expect("serializes");
        assert!(json.get("stale").is_none());
        assert_eq!(json["code"], 401);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(GatewayEvent::Heartbeat(1).name(), "heartbeat");
        assert_eq!(GatewayEvent::Tick(Vec::new()).name(), "tick");
        assert_eq!(GatewayEvent::Order(json!({})).name(), "order");
        assert_eq!(GatewayEvent::Status(StatusPayload::default()).name(), "status");
    }
}
