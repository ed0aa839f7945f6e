//! Gateway HTTP API
//!
//! `/stream` opens a long-lived server-sent event stream backed by one
//! `GatewaySession`; `/poll` is a one-shot snapshot; `/health` reports
//! process state.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::session::GatewaySession;
use super::types::*;
use crate::config::AppConfig;
use crate::error::{FeedError, FeedResult};
use crate::types::StreamMode;
use crate::upstream::{CredentialStore, SnapshotSource, SubscribeRequest, UpstreamFactory};

/// Shared state behind every handler
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub upstream: Arc<dyn UpstreamFactory>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub credentials: Arc<dyn CredentialStore>,
    pub active_sessions: Arc<AtomicUsize>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Flips to true once the process starts shutting down
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        upstream: Arc<dyn UpstreamFactory>,
        snapshots: Arc<dyn SnapshotSource>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config,
            upstream,
            snapshots,
            credentials,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            started_at: chrono::Utc::now(),
            shutdown: watch::channel(false).0,
        }
    }

    /// Ask every open stream session, and any opened later, to close
    pub fn begin_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(
                active_sessions = self.active_sessions.load(Ordering::SeqCst),
                "Closing stream sessions for shutdown"
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolve a query into a concrete upstream subscription
    fn subscribe_request(&self, query: &StreamQuery) -> FeedResult<SubscribeRequest> {
        let tokens = parse_tokens(query.tokens.as_deref())?;

        let mode = match query.mode.as_deref() {
            None => StreamMode::default(),
            Some(raw) => StreamMode::from_str(raw)
                .ok_or_else(|| FeedError::InvalidRequest(format!("unknown mode '{raw}'")))?,
        };

        let broker = query
            .broker
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.config.upstream.default_broker.clone());
        let broker_cfg = self
            .config
            .upstream
            .brokers
            .get(&broker)
            .ok_or_else(|| FeedError::InvalidRequest(format!("unknown broker '{broker}'")))?;

        Ok(SubscribeRequest {
            broker,
            kind: broker_cfg.kind,
            ws_url: broker_cfg.ws_url.clone(),
            tokens,
            mode,
        })
    }
}

/// Decrements the session gauge when a session task ends
struct SessionGuard(Arc<AtomicUsize>);

impl SessionGuard {
    fn enter(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge.clone())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Create the gateway router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .route("/poll", get(poll))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn bad_request(e: FeedError) -> Response {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::<()>::error(e.to_string()))).into_response()
}

/// GET /stream?tokens=256265,260105&mode=full&broker=kite
async fn stream(State(state): State<Arc<AppState>>, Query(query): Query<StreamQuery>) -> Response {
    let request = match state.subscribe_request(&query) {
        Ok(request) => request,
        Err(e) => return bad_request(e),
    };

    let credentials = state.credentials.credentials(&request.broker);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (session, inbox) = GatewaySession::new(
        request,
        credentials,
        state.upstream.clone(),
        state.snapshots.clone(),
        state.config.gateway.clone(),
        out_tx,
    );
    let session = session.with_shutdown(state.shutdown.subscribe());

    let guard = SessionGuard::enter(&state.active_sessions);
    info!(
        session = %session.id(),
        active_sessions = state.active_sessions.load(Ordering::SeqCst),
        "Stream client connected"
    );
    tokio::spawn(async move {
        let _guard = guard;
        session.run(inbox).await;
    });

    Sse::new(event_stream(out_rx)).into_response()
}

fn event_stream(
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    UnboundedReceiverStream::new(rx).map(|event| Ok(event.to_sse()))
}

/// GET /poll?tokens=256265&broker=kite
async fn poll(State(state): State<Arc<AppState>>, Query(query): Query<StreamQuery>) -> Response {
    let request = match state.subscribe_request(&query) {
        Ok(request) => request,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(PollResponse::error(e.to_string()))).into_response()
        }
    };

    let Some(credentials) = state.credentials.credentials(&request.broker) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(PollResponse::error("not authenticated")),
        )
            .into_response();
    };

    match state
        .snapshots
        .fetch(&request.broker, &request.tokens, &credentials)
        .await
    {
        Ok(ticks) => Json(PollResponse::success(ticks)).into_response(),
        Err(FeedError::Unauthorized) => (
            StatusCode::UNAUTHORIZED,
            Json(PollResponse::error("upstream rejected credentials")),
        )
            .into_response(),
        Err(FeedError::InvalidRequest(message)) => {
            (StatusCode::BAD_REQUEST, Json(PollResponse::error(message))).into_response()
        }
        Err(e) => {
            warn!(broker = %request.broker, error = %e, "Snapshot poll failed");
            (StatusCode::BAD_GATEWAY, Json(PollResponse::error(e.to_string()))).into_response()
        }
    }
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut brokers: Vec<String> = state.config.upstream.brokers.keys().cloned().collect();
    brokers.sort();
    Json(ApiResponse::success(HealthResponse {
        active_sessions: state.active_sessions.load(Ordering::SeqCst),
        brokers,
        started_at: state.started_at,
    }))
}
