//! Error types for the feed pipeline
//!
//! Transport and decode failures are recovered locally and only surface as
//! status. `Unauthorized` and `Halted` are the two hard failures that stop an
//! instance (or everything) without retry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Connect/read/write failure on a network link; retried by the owner
    #[error("transport error on {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// Snapshot endpoint answered 401/403
    #[error("upstream rejected credentials")]
    Unauthorized,

    /// Frame or payload could not be turned into ticks
    #[error("decode error: {0}")]
    Decode(String),

    /// Caller supplied bad parameters (tokens, mode, broker, url)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Circuit breaker is tripped; requires an explicit reset
    #[error("trading halted: {0}")]
    Halted(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    pub fn transport(endpoint: impl Into<String>, message: impl ToString) -> Self {
        FeedError::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Errors that must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Unauthorized | FeedError::Halted(_))
    }
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;
