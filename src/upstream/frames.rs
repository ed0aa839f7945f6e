//! Subscription control frames per broker dialect

use serde_json::{json, Value};

use crate::types::{BrokerKind, InstrumentToken, StreamMode};

/// Frames sent right after the socket opens, in order
pub fn subscribe_frames(kind: BrokerKind, tokens: &[InstrumentToken], mode: StreamMode) -> Vec<Value> {
    match kind {
        BrokerKind::Kite => vec![
            json!({"a": "subscribe", "v": tokens}),
            json!({"a": "mode", "v": [mode.as_str(), tokens]}),
        ],
        BrokerKind::Alternate => vec![json!({
            "action": "subscribe",
            "mode": mode.as_str(),
            "instruments": tokens,
        })],
    }
}

/// Frame sent before a deliberate close
pub fn unsubscribe_frame(kind: BrokerKind, tokens: &[InstrumentToken]) -> Value {
    match kind {
        BrokerKind::Kite => json!({"a": "unsubscribe", "v": tokens}),
        BrokerKind::Alternate => json!({"action": "unsubscribe", "instruments": tokens}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kite_subscribe_then_mode() {
        let frames = subscribe_frames(BrokerKind::Kite, &[256265, 260105], StreamMode::Full);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], json!({"a": "subscribe", "v": [256265, 260105]}));
        assert_eq!(frames[1], json!({"a": "mode", "v": ["full", [256265, 260105]]}));
    }

    #[test]
    fn test_alternate_subscribe_carries_mode_inline() {
        let frames = subscribe_frames(BrokerKind::Alternate, &[7], StreamMode::Ltp);
        assert_eq!(
            frames,
            vec![json!({"action": "subscribe", "mode": "ltp", "instruments": [7]})]
        );
    }

    #[test]
    fn test_unsubscribe_frames_per_dialect() {
        assert_eq!(
            unsubscribe_frame(BrokerKind::Kite, &[1, 2]),
            json!({"a": "unsubscribe", "v": [1, 2]})
        );
        assert_eq!(
            unsubscribe_frame(BrokerKind::Alternate, &[3]),
            json!({"action": "unsubscribe", "instruments": [3]})
        );
    }
}
