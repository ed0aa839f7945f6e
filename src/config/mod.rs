//! Configuration management for Tickstream
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::types::BrokerKind;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub upstream: UpstreamConfig,
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Broker used when a request omits `broker`
    pub default_broker: String,
    /// Fixed delay between upstream reconnect attempts
    pub reconnect_delay_secs: u64,
    /// Known brokers by id
    pub brokers: HashMap<String, BrokerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Wire dialect of the broker socket
    pub kind: BrokerKind,
    /// Streaming socket URL
    pub ws_url: String,
    /// REST quote snapshot URL
    pub quote_url: String,
    /// API key (usually supplied via TICKSTREAM__UPSTREAM__BROKERS__<ID>__API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Session access token, obtained and refreshed outside this process
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Heartbeat event cadence
    pub heartbeat_secs: u64,
    /// Staleness watchdog cadence
    pub watchdog_secs: u64,
    /// Silence after which a nominally connected upstream is stale
    pub stale_after_secs: u64,
    /// Snapshot polling cadence while in fallback
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Tick buffer flush cadence
    pub flush_interval_ms: u64,
    /// Global staleness watchdog cadence
    pub watchdog_interval_ms: u64,
    /// Silence after which an instance is stale
    pub stale_after_ms: u64,
    /// Polling cadence against the derived snapshot endpoint
    pub poll_interval_ms: u64,
    /// Fixed delay before reopening a failed socket
    pub reconnect_delay_ms: u64,
    /// Consecutive event-stream errors before switching to polling
    pub max_stream_failures: u32,
    /// Event-stream internal retry delay
    pub event_stream_retry_ms: u64,
    /// EMA period computed on fused prices
    pub ema_period: usize,
    /// Price history retained per symbol
    pub history_cap: usize,
    /// Gateway stream URLs to connect at startup (event-stream transport)
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Mark-to-market floor; a P&L at or below this halts everything
    pub max_loss: f64,
    /// Trades allowed per session before halting
    pub max_trades: u32,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::builder_with_defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (TICKSTREAM__*)
            .add_source(Environment::with_prefix("TICKSTREAM").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Built-in defaults only; used by `load` and by tests
    pub fn defaults() -> Result<Self> {
        let config = Self::builder_with_defaults()?
            .build()
            .context("Failed to build default configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize default configuration")
    }

    fn builder_with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            // Server defaults
            .set_default("server.bind_addr", "0.0.0.0:8080")?
            // Logging defaults
            .set_default("logging.filter", "info,tickstream=debug")?
            .set_default("logging.json", false)?
            // Upstream defaults
            .set_default("upstream.default_broker", "kite")?
            .set_default("upstream.reconnect_delay_secs", 5)?
            .set_default("upstream.brokers.kite.kind", "kite")?
            .set_default("upstream.brokers.kite.ws_url", "wss://ws.kite.trade")?
            .set_default("upstream.brokers.kite.quote_url", "https://api.kite.trade/quote")?
            // Gateway defaults
            .set_default("gateway.heartbeat_secs", 15)?
            .set_default("gateway.watchdog_secs", 5)?
            .set_default("gateway.stale_after_secs", 10)?
            .set_default("gateway.poll_interval_ms", 2000)?
            // Worker defaults
            .set_default("worker.flush_interval_ms", 250)?
            .set_default("worker.watchdog_interval_ms", 1000)?
            .set_default("worker.stale_after_ms", 3000)?
            .set_default("worker.poll_interval_ms", 1500)?
            .set_default("worker.reconnect_delay_ms", 5000)?
            .set_default("worker.max_stream_failures", 3)?
            .set_default("worker.event_stream_retry_ms", 3000)?
            .set_default("worker.ema_period", 20)?
            .set_default("worker.history_cap", 500)?
            .set_default("worker.endpoints", Vec::<String>::new())?
            // Risk defaults
            .set_default("risk.max_loss", -5000.0)?
            .set_default("risk.max_trades", 100)?;
        Ok(builder)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.upstream.brokers.contains_key(&self.upstream.default_broker) {
            bail!(
                "upstream.default_broker '{}' is not in upstream.brokers",
                self.upstream.default_broker
            );
        }

        let intervals = [
            ("upstream.reconnect_delay_secs", self.upstream.reconnect_delay_secs),
            ("gateway.heartbeat_secs", self.gateway.heartbeat_secs),
            ("gateway.watchdog_secs", self.gateway.watchdog_secs),
            ("gateway.poll_interval_ms", self.gateway.poll_interval_ms),
            ("worker.flush_interval_ms", self.worker.flush_interval_ms),
            ("worker.watchdog_interval_ms", self.worker.watchdog_interval_ms),
            ("worker.poll_interval_ms", self.worker.poll_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.worker.max_stream_failures == 0 {
            bail!("worker.max_stream_failures must be at least 1");
        }
        if self.worker.ema_period == 0 || self.worker.ema_period > self.worker.history_cap {
            bail!(
                "worker.ema_period must be between 1 and worker.history_cap ({})",
                self.worker.history_cap
            );
        }

        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        let mut brokers: Vec<&str> = self.upstream.brokers.keys().map(String::as_str).collect();
        brokers.sort_unstable();
        format!(
            "bind={} brokers={:?} default_broker={} flush_ms={} max_loss={:.2} max_trades={}",
            self.server.bind_addr,
            brokers,
            self.upstream.default_broker,
            self.worker.flush_interval_ms,
            self.risk.max_loss,
            self.risk.max_trades
        )
    }
}

impl UpstreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_match_documented_timings() {
        let cfg = AppConfig::defaults().expect("defaults should deserialize");
        assert_eq!(cfg.gateway.heartbeat_secs, 15);
        assert_eq!(cfg.gateway.stale_after_secs, 10);
        assert_eq!(cfg.gateway.poll_interval_ms, 2000);
        assert_eq!(cfg.worker.flush_interval_ms, 250);
        assert_eq!(cfg.worker.stale_after_ms, 3000);
        assert_eq!(cfg.worker.poll_interval_ms, 1500);
        assert_eq!(cfg.worker.max_stream_failures, 3);
        assert_eq!(cfg.worker.history_cap, 500);
        assert!(cfg.worker.endpoints.is_empty());
        assert_eq!(cfg.upstream.brokers["kite"].kind, BrokerKind::Kite);
        assert_ok!(cfg.validate());
    }

    #[test]
    fn test_validate_rejects_unknown_default_broker() {
        let mut cfg = AppConfig::defaults().expect("defaults");
        cfg.upstream.default_broker = "nobody".to_string();
        assert_err!(cfg.validate());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut cfg = AppConfig::defaults().expect("defaults");
        cfg.worker.flush_interval_ms = 0;
        assert_err!(cfg.validate());
    }

    #[test]
    fn test_digest_never_contains_secrets() {
        let mut cfg = AppConfig::defaults().expect("defaults");
        if let Some(kite) = cfg.upstream.brokers.get_mut("kite") {
            kite.access_token = Some("super-secret-token".to_string());
        }
        assert!(!cfg.digest().contains("super-secret-token"));
    }
}
