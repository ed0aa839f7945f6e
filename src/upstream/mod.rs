//! Upstream module - broker feed connections
//!
//! A `UpstreamFactory` opens one long-lived link per subscription and reports
//! everything that happens on it as `UpstreamEvent`s. The real factory is the
//! websocket `WsConnector`; tests swap in scripted fakes.

mod connector;
mod frames;
mod snapshot;

pub use connector::{ConnectorHandle, WsConnector};
pub use frames::{subscribe_frames, unsubscribe_frame};
pub use snapshot::{QuoteClient, SnapshotSource};

#[cfg(test)]
pub use snapshot::MockSnapshotSource;

use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::UpstreamConfig;
use crate::types::{BrokerKind, InstrumentToken, StreamMode, Tick};

/// What to subscribe to, and where
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub broker: String,
    pub kind: BrokerKind,
    pub ws_url: String,
    pub tokens: Vec<InstrumentToken>,
    pub mode: StreamMode,
}

/// Broker session credentials. Obtained and refreshed outside this process.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub api_key: String,
    pub access_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("access_token", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            access_token: access_token.into(),
        }
    }
}

/// Everything a connector reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Socket open and subscribe frames sent
    Open,
    Ticks(Vec<Tick>),
    Order(serde_json::Value),
    /// Connection lost; a reconnect is already scheduled
    Closed { reason: String },
    Error(String),
}

/// Handle to one running upstream connection
pub trait UpstreamLink: Send {
    fn is_open(&self) -> bool;

    /// Unsubscribe (if open), close normally and stop reconnecting.
    /// No event is delivered after this returns.
    fn shutdown(&mut self);
}

/// Opens upstream links
pub trait UpstreamFactory: Send + Sync {
    fn connect(
        &self,
        request: SubscribeRequest,
        credentials: Credentials,
        events: UnboundedSender<UpstreamEvent>,
    ) -> Box<dyn UpstreamLink>;
}

/// Source of per-broker credentials
pub trait CredentialStore: Send + Sync {
    fn credentials(&self, broker: &str) -> Option<Credentials>;
}

/// Credentials read from the `upstream.brokers` table
#[derive(Debug, Clone, Default)]
pub struct ConfigCredentialStore {
    entries: HashMap<String, Credentials>,
}

impl ConfigCredentialStore {
    pub fn from_config(cfg: &UpstreamConfig) -> Self {
        let entries = cfg
            .brokers
            .iter()
            .filter_map(|(id, broker)| {
                let api_key = broker.api_key.as_deref().filter(|k| !k.is_empty())?;
                let token = broker.access_token.as_deref().filter(|t| !t.is_empty())?;
                Some((id.clone(), Credentials::new(api_key, token)))
            })
            .collect();
        Self { entries }
    }

    pub fn with(mut self, broker: impl Into<String>, credentials: Credentials) -> Self {
        self.entries.insert(broker.into(), credentials);
        self
    }
}

impl CredentialStore for ConfigCredentialStore {
    fn credentials(&self, broker: &str) -> Option<Credentials> {
        self.entries.get(broker).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_brokers_without_both_secrets_have_no_credentials() {
        let mut cfg = AppConfig::defaults().expect("defaults").upstream;
        let store = ConfigCredentialStore::from_config(&cfg);
        assert!(store.credentials("kite").is_none());

        if let Some(kite) = cfg.brokers.get_mut("kite") {
            kite.api_key = Some("key".to_string());
            kite.access_token = Some("token".to_string());
        }
        let store = ConfigCredentialStore::from_config(&cfg);
        assert_eq!(store.credentials("kite"), Some(Credentials::new("key", "token")));
    }

    #[test]
    fn test_debug_output_hides_access_token() {
        let creds = Credentials::new("key", "very-secret");
        assert!(!format!("{:?}", creds).contains("very-secret"));
    }
}
