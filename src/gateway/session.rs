//! One client stream session
//!
//! Bridges a single upstream connector to one outgoing event stream. The
//! session is a plain state machine driven by three inputs: upstream events,
//! its own timer messages, and the client going away. `run` wires those to a
//! `tokio::select!` loop; tests call the handlers directly.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{GatewayEvent, StatusPayload};
use crate::config::GatewayConfig;
use crate::error::FeedError;
use crate::sched::{spawn_every, TaskHandle};
use crate::types::Tick;
use crate::upstream::{
    Credentials, SnapshotSource, SubscribeRequest, UpstreamEvent, UpstreamFactory, UpstreamLink,
};

const SOURCE_SOCKET: &str = "websocket";
const SOURCE_POLL: &str = "poll";
const SOURCE_DEMO: &str = "demo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Streaming,
    Polling,
    Closed,
}

/// Poll outcome as seen by the session
#[derive(Debug, Clone, PartialEq)]
pub enum PollFailure {
    Unauthorized,
    Failed(String),
}

/// Messages posted by the session's own timers and poller
#[derive(Debug, Clone, PartialEq)]
pub enum SessionMsg {
    Heartbeat,
    Watchdog,
    PollResult(Result<Vec<Tick>, PollFailure>),
}

/// Receiving ends the session loop selects over
pub struct SessionInbox {
    pub upstream: UnboundedReceiver<UpstreamEvent>,
    pub mailbox: UnboundedReceiver<SessionMsg>,
}

pub struct GatewaySession {
    id: Uuid,
    request: SubscribeRequest,
    credentials: Option<Credentials>,
    factory: Arc<dyn UpstreamFactory>,
    snapshots: Arc<dyn SnapshotSource>,
    timings: GatewayConfig,
    state: SessionState,
    upstream: Option<Box<dyn UpstreamLink>>,
    upstream_tx: UnboundedSender<UpstreamEvent>,
    mailbox: UnboundedSender<SessionMsg>,
    out: UnboundedSender<GatewayEvent>,
    heartbeat: Option<TaskHandle>,
    watchdog: Option<TaskHandle>,
    poller: Option<TaskHandle>,
    /// Set after the snapshot endpoint rejected our credentials
    polling_disabled: bool,
    last_tick_at: Instant,
    /// Process shutdown flag; the session closes when it turns true
    shutdown: Option<watch::Receiver<bool>>,
}

impl GatewaySession {
    pub fn new(
        request: SubscribeRequest,
        credentials: Option<Credentials>,
        factory: Arc<dyn UpstreamFactory>,
        snapshots: Arc<dyn SnapshotSource>,
        timings: GatewayConfig,
        out: UnboundedSender<GatewayEvent>,
    ) -> (Self, SessionInbox) {
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();

        let session = Self {
            id: Uuid::new_v4(),
            request,
            credentials,
            factory,
            snapshots,
            timings,
            state: SessionState::Init,
            upstream: None,
            upstream_tx,
            mailbox: mailbox_tx,
            out,
            heartbeat: None,
            watchdog: None,
            poller: None,
            polling_disabled: false,
            last_tick_at: Instant::now(),
            shutdown: None,
        };
        let inbox = SessionInbox {
            upstream: upstream_rx,
            mailbox: mailbox_rx,
        };
        (session, inbox)
    }

    /// Close the session once `shutdown` reads true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Names of the timers and tasks this session still holds
    pub fn active_timers(&self) -> Vec<&'static str> {
        [&self.heartbeat, &self.watchdog, &self.poller]
            .into_iter()
            .flatten()
            .map(TaskHandle::name)
            .collect()
    }

    pub fn upstream_open(&self) -> bool {
        self.upstream.as_ref().map(|u| u.is_open()).unwrap_or(false)
    }

    fn emit(&self, event: GatewayEvent) {
        if self.out.send(event).is_err() {
            debug!(session = %self.id, "Client stream already gone");
        }
    }

    fn status(&self, source: &str, connected: bool) -> StatusPayload {
        StatusPayload::new(source, connected).broker(self.request.broker.clone())
    }

    /// Open the upstream and start timers. Returns false when the session
    /// ended immediately (no credentials).
    pub fn start(&mut self) -> bool {
        let Some(credentials) = self.credentials.clone() else {
            info!(session = %self.id, broker = %self.request.broker, "No credentials, serving demo status");
            self.emit(GatewayEvent::Status(
                StatusPayload::new(SOURCE_DEMO, false)
                    .error("not authenticated")
                    .code(401),
            ));
            self.state = SessionState::Closed;
            return false;
        };

        info!(
            session = %self.id,
            broker = %self.request.broker,
            mode = %self.request.mode,
            tokens = self.request.tokens.len(),
            "Opening stream session"
        );
        self.state = SessionState::Connecting;
        self.last_tick_at = Instant::now();
        self.upstream = Some(self.factory.connect(
            self.request.clone(),
            credentials,
            self.upstream_tx.clone(),
        ));

        self.heartbeat = Some(spawn_every(
            "gateway-heartbeat",
            Duration::from_secs(self.timings.heartbeat_secs),
            self.mailbox.clone(),
            SessionMsg::Heartbeat,
        ));
        self.watchdog = Some(spawn_every(
            "gateway-watchdog",
            Duration::from_secs(self.timings.watchdog_secs),
            self.mailbox.clone(),
            SessionMsg::Watchdog,
        ));
        true
    }

    pub fn on_upstream(&mut self, event: UpstreamEvent) {
        if self.state == SessionState::Closed {
            return;
        }

        match event {
            UpstreamEvent::Open => {
                self.last_tick_at = Instant::now();
                self.stop_polling();
                self.state = SessionState::Streaming;
                self.emit(GatewayEvent::Status(self.status(SOURCE_SOCKET, true)));
            }
            UpstreamEvent::Ticks(ticks) => {
                self.last_tick_at = Instant::now();
                if self.state == SessionState::Polling {
                    info!(session = %self.id, "Upstream ticks resumed, stopping fallback polling");
                    self.stop_polling();
                }
                self.state = SessionState::Streaming;
                self.emit(GatewayEvent::Tick(ticks));
            }
            UpstreamEvent::Order(payload) => self.emit(GatewayEvent::Order(payload)),
            UpstreamEvent::Closed { reason } | UpstreamEvent::Error(reason) => {
                self.on_upstream_down(reason);
            }
        }
    }

    fn on_upstream_down(&mut self, reason: String) {
        warn!(session = %self.id, broker = %self.request.broker, reason = %reason, "Upstream down");
        let mut status = self.status(SOURCE_SOCKET, false).error(reason);
        if !self.polling_disabled {
            status = status.fallback();
        }
        self.emit(GatewayEvent::Status(status));
        // The connector reconnects on its own; poll in the meantime
        self.start_polling();
    }

    pub fn on_watchdog(&mut self, now: Instant) {
        if self.state != SessionState::Streaming || !self.upstream_open() {
            return;
        }

        let silence = now.saturating_duration_since(self.last_tick_at);
        if silence > Duration::from_secs(self.timings.stale_after_secs) && !self.polling_disabled {
            warn!(
                session = %self.id,
                broker = %self.request.broker,
                silence_ms = silence.as_millis() as u64,
                "Upstream stale, falling back to snapshot polling"
            );
            self.emit(GatewayEvent::Status(
                self.status(SOURCE_SOCKET, true).stale().fallback(),
            ));
            self.start_polling();
        }
    }

    pub fn on_heartbeat(&mut self) {
        self.emit(GatewayEvent::Heartbeat(chrono::Utc::now().timestamp_millis()));
    }

    pub fn on_poll_result(&mut self, result: Result<Vec<Tick>, PollFailure>) {
        if self.poller.is_none() {
            // Late result from a poller that was already stopped
            return;
        }

        match result {
            Ok(ticks) => {
                if !ticks.is_empty() {
                    self.emit(GatewayEvent::Tick(ticks));
                }
            }
            Err(PollFailure::Unauthorized) => {
                warn!(session = %self.id, broker = %self.request.broker, "Snapshot endpoint rejected credentials, polling stopped");
                self.stop_polling();
                self.polling_disabled = true;
                self.emit(GatewayEvent::Status(
                    self.status(SOURCE_POLL, false)
                        .error("upstream rejected credentials")
                        .code(401),
                ));
            }
            Err(PollFailure::Failed(message)) => {
                debug!(session = %self.id, error = %message, "Snapshot poll failed, retrying next interval");
            }
        }
    }

    pub fn handle_msg(&mut self, msg: SessionMsg) {
        match msg {
            SessionMsg::Heartbeat => self.on_heartbeat(),
            SessionMsg::Watchdog => self.on_watchdog(Instant::now()),
            SessionMsg::PollResult(result) => self.on_poll_result(result),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    fn start_polling(&mut self) {
        if self.poller.is_some() || self.polling_disabled || self.state == SessionState::Closed {
            return;
        }
        let Some(credentials) = self.credentials.clone() else {
            return;
        };

        let snapshots = self.snapshots.clone();
        let broker = self.request.broker.clone();
        let tokens = self.request.tokens.clone();
        let tx = self.mailbox.clone();
        let period = Duration::from_millis(self.timings.poll_interval_ms);

        debug!(session = %self.id, period_ms = self.timings.poll_interval_ms, "Starting snapshot polling");
        self.poller = Some(TaskHandle::spawn("gateway-poll", async move {
            loop {
                let result = snapshots
                    .fetch(&broker, &tokens, &credentials)
                    .await
                    .map_err(|e| match e {
                        FeedError::Unauthorized => PollFailure::Unauthorized,
                        other => PollFailure::Failed(other.to_string()),
                    });
                if tx.send(SessionMsg::PollResult(result)).is_err() {
                    break;
                }
                tokio::time::sleep(period).await;
            }
        }));
        self.state = SessionState::Polling;
    }

    fn stop_polling(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.cancel();
            debug!(session = %self.id, "Snapshot polling stopped");
        }
    }

    /// Tear everything down. Upstream is unsubscribed and closed, every timer
    /// is cancelled, and the session is `Closed` when this returns.
    pub fn close(&mut self) {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.shutdown();
        }
        for handle in [&mut self.heartbeat, &mut self.watchdog, &mut self.poller] {
            if let Some(mut task) = handle.take() {
                task.cancel();
            }
        }
        if self.state != SessionState::Closed {
            info!(session = %self.id, broker = %self.request.broker, "Stream session closed");
        }
        self.state = SessionState::Closed;
    }

    /// Drive the session until the client disconnects
    pub async fn run(mut self, mut inbox: SessionInbox) {
        if !self.start() {
            return;
        }

        let out = self.out.clone();
        let mut shutdown = self.shutdown.take();
        loop {
            tokio::select! {
                _ = out.closed() => {
                    info!(session = %self.id, "Client disconnected");
                    break;
                }
                _ = shutdown_requested(shutdown.as_mut()) => {
                    info!(session = %self.id, "Server shutting down, closing session");
                    break;
                }
                Some(event) = inbox.upstream.recv() => self.on_upstream(event),
                Some(msg) = inbox.mailbox.recv() => self.handle_msg(msg),
            }
        }
        self.close();
    }
}

/// Resolves once the flag reads true. Never resolves without a flag, or after
/// its sender is gone.
async fn shutdown_requested(flag: Option<&mut watch::Receiver<bool>>) {
    let Some(flag) = flag else {
        return std::future::pending().await;
    };
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.close();
    }
}
