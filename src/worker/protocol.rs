//! Worker message protocol
//!
//! Commands in, events out. Both are adjacently tagged so they read as
//! `{"type": "CONNECT", "payload": {...}}` on the wire.

use serde::{Deserialize, Serialize};

use crate::risk::UnifiedMargin;
use crate::types::{Tick, TransportKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    Connect {
        url: String,
        #[serde(rename = "type")]
        transport: TransportKind,
        broker: String,
    },
    Disconnect {
        url: String,
    },
    UpdateRiskLimits {
        #[serde(rename = "maxLoss")]
        max_loss: f64,
        #[serde(rename = "maxTrades")]
        max_trades: u32,
    },
    MarkToMarket {
        pnl: f64,
    },
    RecordTrade,
    UpdateMargin {
        broker: String,
        available: f64,
        utilised: f64,
    },
    ResetHalt,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    /// One flushed batch: latest merged tick per instrument
    Tick { data: Vec<Tick>, key: String },
    Status { connected: bool, key: String },
    Error { message: String, key: String },
    StaleData { key: String, broker: String },
    UnifiedMargin(UnifiedMargin),
    CyberPauseTriggered { reason: String, value: f64 },
}

impl WorkerEvent {
    pub fn key(&self) -> Option<&str> {
        match self {
            WorkerEvent::Tick { key, .. }
            | WorkerEvent::Status { key, .. }
            | WorkerEvent::Error { key, .. }
            | WorkerEvent::StaleData { key, .. } => Some(key),
            WorkerEvent::UnifiedMargin(_) | WorkerEvent::CyberPauseTriggered { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_command_wire_shape() {
        let cmd: WorkerCommand = serde_json::from_value(json!({
            "type": "CONNECT",
            "payload": {"url": "http://localhost:8080/stream?tokens=1", "type": "sse", "broker": "kite"}
        }))
        .expect("connect parses");

        assert_eq!(
            cmd,
            WorkerCommand::Connect {
                url: "http://localhost:8080/stream?tokens=1".to_string(),
                transport: TransportKind::EventStream,
                broker: "kite".to_string(),
            }
        );
    }

    #[test]
    fn test_risk_limits_use_camel_case_fields() {
        let cmd: WorkerCommand = serde_json::from_value(json!({
            "type": "UPDATE_RISK_LIMITS",
            "payload": {"maxLoss": -2500.0, "maxTrades": 40}
        }))
        .expect("limits parse");
        assert_eq!(
            cmd,
            WorkerCommand::UpdateRiskLimits {
                max_loss: -2500.0,
                max_trades: 40
            }
        );

        let reset: WorkerCommand =
            serde_json::from_value(json!({"type": "RESET_HALT"})).expect("unit command parses");
        assert_eq!(reset, WorkerCommand::ResetHalt);
    }

    #[test]
    fn test_events_serialize_with_screaming_tags() {
        let stale = WorkerEvent::StaleData {
            key: "websocket:ws://feed".to_string(),
            broker: "kite".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&stale).expect("serializes"),
            json!({"type": "STALE_DATA", "payload": {"key": "websocket:ws://feed", "broker": "kite"}})
        );

        let halt = WorkerEvent::CyberPauseTriggered {
            reason: "MAX_LOSS".to_string(),
            value: -5200.0,
        };
        assert_eq!(
            serde_json::to_value(&halt).expect("serializes")["type"],
            "CYBER_PAUSE_TRIGGERED"
        );
        assert_eq!(halt.key(), None);
        assert_eq!(stale.key(), Some("websocket:ws://feed"));
    }
}
