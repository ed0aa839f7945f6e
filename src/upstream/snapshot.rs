//! REST quote snapshots
//!
//! Pull-style fallback used while a streaming session is stale or
//! disconnected, and by the `/poll` endpoint.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::Credentials;
use crate::config::UpstreamConfig;
use crate::decoder::decode_quote_snapshot;
use crate::error::{FeedError, FeedResult};
use crate::types::{InstrumentToken, Tick};

/// Anything that can fetch a point-in-time quote for a set of instruments
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(
        &self,
        broker: &str,
        tokens: &[InstrumentToken],
        credentials: &Credentials,
    ) -> FeedResult<Vec<Tick>>;
}

/// Quote endpoint client for the configured brokers
#[derive(Debug, Clone)]
pub struct QuoteClient {
    client: Client,
    quote_urls: HashMap<String, String>,
}

impl QuoteClient {
    pub fn new(cfg: &UpstreamConfig) -> FeedResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("X-Kite-Version", HeaderValue::from_static("3"));

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()?;

        let quote_urls = cfg
            .brokers
            .iter()
            .map(|(id, broker)| (id.clone(), broker.quote_url.clone()))
            .collect();

        Ok(Self { client, quote_urls })
    }
}

#[async_trait]
impl SnapshotSource for QuoteClient {
    async fn fetch(
        &self,
        broker: &str,
        tokens: &[InstrumentToken],
        credentials: &Credentials,
    ) -> FeedResult<Vec<Tick>> {
        let url = self
            .quote_urls
            .get(broker)
            .ok_or_else(|| FeedError::InvalidRequest(format!("unknown broker '{broker}'")))?;

        let query: Vec<(&str, String)> = tokens.iter().map(|t| ("i", t.to_string())).collect();
        let response = self
            .client
            .get(url)
            .query(&query)
            .header(
                "Authorization",
                format!("token {}:{}", credentials.api_key, credentials.access_token),
            )
            .send()
            .await
            .map_err(|e| FeedError::transport(url.as_str(), e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FeedError::Unauthorized);
        }
        if !status.is_success() {
            return Err(FeedError::transport(url.as_str(), format!("HTTP {status}")));
        }

        let body: serde_json::Value = response.json().await?;
        let mut ticks = decode_quote_snapshot(&body)?;
        let now = chrono::Utc::now().timestamp_millis();
        for tick in &mut ticks {
            tick.broker = Some(broker.to_string());
            tick.received_at = Some(now);
        }

        debug!(broker = %broker, ticks = ticks.len(), "Fetched quote snapshot");
        Ok(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[tokio::test]
    async fn test_unknown_broker_is_rejected_before_any_request() {
        let cfg = AppConfig::defaults().expect("defaults");
        let client = QuoteClient::new(&cfg.upstream).expect("client builds");

        let result = client
            .fetch("nobody", &[1], &Credentials::new("k", "t"))
            .await;
        assert!(matches!(result, Err(FeedError::InvalidRequest(_))));
    }
}
