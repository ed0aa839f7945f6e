//! Worker network links
//!
//! A link is one running network handle (socket, event stream or poll loop)
//! owned by an instance. Links never retry at the instance level on their
//! own; they report what happened and the worker decides. The one exception
//! is the event stream, which retries internally the way a browser event
//! source does and reports each failure.

use futures_util::{SinkExt, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use super::sse::{SseEvent, SseParser};
use crate::config::WorkerConfig;
use crate::decoder::{decode_quote_snapshot, decoder_for, Decoded, Frame, TickDecoder};
use crate::error::{FeedError, FeedResult};
use crate::gateway::StatusPayload;
use crate::sched::TaskHandle;
use crate::types::{BrokerKind, InstanceKey, Tick};

const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Socket,
    EventStream,
    Poll,
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Socket => write!(f, "socket"),
            LinkKind::EventStream => write!(f, "event-stream"),
            LinkKind::Poll => write!(f, "poll"),
        }
    }
}

/// Everything needed to open one link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub key: InstanceKey,
    /// Bumped by the instance on every open; stale events are dropped
    pub generation: u64,
    pub kind: LinkKind,
    pub url: String,
    pub broker: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    Open,
    Ticks(Vec<Tick>),
    Error(String),
    Closed(String),
    /// Poll endpoint answered 401/403
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub key: InstanceKey,
    pub generation: u64,
    pub kind: LinkEventKind,
}

/// A live network handle
pub trait Link: Send {
    fn kind(&self) -> LinkKind;

    /// Stop the link. No event is produced afterwards.
    fn close(&mut self);
}

/// Opens links for the worker
pub trait LinkFactory: Send + Sync {
    fn open(&self, spec: LinkSpec, events: UnboundedSender<LinkEvent>) -> Box<dyn Link>;
}

/// A link backed by one spawned task
pub struct TaskLink {
    kind: LinkKind,
    task: TaskHandle,
}

impl Link for TaskLink {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    fn close(&mut self) {
        self.task.cancel();
    }
}

/// Real network links
#[derive(Debug, Clone)]
pub struct NetworkLinks {
    client: Client,
    poll_interval: Duration,
    event_stream_retry: Duration,
}

impl NetworkLinks {
    pub fn new(cfg: &WorkerConfig) -> FeedResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            event_stream_retry: Duration::from_millis(cfg.event_stream_retry_ms),
        })
    }
}

impl LinkFactory for NetworkLinks {
    fn open(&self, spec: LinkSpec, events: UnboundedSender<LinkEvent>) -> Box<dyn Link> {
        let kind = spec.kind;
        let reporter = Reporter { spec, events };
        let task = match kind {
            LinkKind::Socket => TaskHandle::spawn("worker-socket", run_socket(reporter)),
            LinkKind::EventStream => TaskHandle::spawn(
                "worker-event-stream",
                run_event_stream(self.client.clone(), reporter, self.event_stream_retry),
            ),
            LinkKind::Poll => TaskHandle::spawn(
                "worker-poll",
                run_poll(self.client.clone(), reporter, self.poll_interval),
            ),
        };
        Box::new(TaskLink { kind, task })
    }
}

/// Tags events with the link's key and generation
struct Reporter {
    spec: LinkSpec,
    events: UnboundedSender<LinkEvent>,
}

impl Reporter {
    fn send(&self, kind: LinkEventKind) -> bool {
        self.events
            .send(LinkEvent {
                key: self.spec.key.clone(),
                generation: self.spec.generation,
                kind,
            })
            .is_ok()
    }

    fn ticks(&self, mut ticks: Vec<Tick>) {
        if ticks.is_empty() {
            return;
        }
        let now = chrono::Utc::now().timestamp_millis();
        for tick in &mut ticks {
            tick.broker.get_or_insert_with(|| self.spec.broker.clone());
            tick.received_at.get_or_insert(now);
        }
        self.send(LinkEventKind::Ticks(ticks));
    }
}

async fn run_socket(reporter: Reporter) {
    let spec = &reporter.spec;
    let decoder = decoder_for(BrokerKind::for_broker_id(&spec.broker));

    let (ws_stream, _) = match connect_async(spec.url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(key = %spec.key, error = %e, "Worker socket connect failed");
            reporter.send(LinkEventKind::Error(e.to_string()));
            return;
        }
    };
    reporter.send(LinkEventKind::Open);

    let (mut write, mut read) = ws_stream.split();
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Binary(data))) => {
                decode_into(&reporter, decoder.as_ref(), Frame::Binary(&data));
            }
            Some(Ok(Message::Text(text))) => {
                decode_into(&reporter, decoder.as_ref(), Frame::Text(&text));
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(key = %spec.key, ?frame, "Worker socket closed by server");
                break "closed by server".to_string();
            }
            Some(Err(e)) => {
                warn!(key = %spec.key, error = %e, "Worker socket error");
                reporter.send(LinkEventKind::Error(e.to_string()));
                return;
            }
            None => break "stream ended".to_string(),
            _ => {}
        }
    };
    reporter.send(LinkEventKind::Closed(reason));
}

fn decode_into(reporter: &Reporter, decoder: &dyn TickDecoder, frame: Frame<'_>) {
    if frame.is_heartbeat() {
        return;
    }
    match decoder.decode(frame) {
        Ok(Decoded::Ticks(ticks)) => reporter.ticks(ticks),
        Ok(_) => {}
        Err(e) => {
            warn!(key = %reporter.spec.key, error = %e, "Dropping undecodable frame");
        }
    }
}

async fn run_event_stream(client: Client, reporter: Reporter, retry: Duration) {
    let spec = &reporter.spec;
    loop {
        let response = client
            .get(&spec.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await;

        let failure = match response {
            Ok(response) if response.status().is_success() => {
                reporter.send(LinkEventKind::Open);
                let mut parser = SseParser::new();
                let mut body = response.bytes_stream();
                loop {
                    match body.next().await {
                        Some(Ok(chunk)) => {
                            for event in parser.feed(&chunk) {
                                handle_stream_event(&reporter, event);
                            }
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "event stream ended".to_string(),
                    }
                }
            }
            Ok(response) => format!("HTTP {}", response.status()),
            Err(e) => e.to_string(),
        };

        debug!(key = %spec.key, error = %failure, retry_ms = retry.as_millis() as u64, "Event stream failed");
        if !reporter.send(LinkEventKind::Error(failure)) {
            return;
        }
        tokio::time::sleep(retry).await;
    }
}

fn handle_stream_event(reporter: &Reporter, event: SseEvent) {
    match event.event.as_str() {
        "tick" => match serde_json::from_str::<Vec<Tick>>(&event.data) {
            Ok(ticks) => reporter.ticks(ticks),
            Err(e) => warn!(key = %reporter.spec.key, error = %e, "Dropping malformed tick event"),
        },
        "status" => match serde_json::from_str::<StatusPayload>(&event.data) {
            Ok(status) => debug!(
                key = %reporter.spec.key,
                source = %status.source,
                connected = status.connected,
                stale = status.stale.unwrap_or(false),
                "Gateway status"
            ),
            Err(e) => warn!(key = %reporter.spec.key, error = %e, "Dropping malformed status event"),
        },
        other => trace!(key = %reporter.spec.key, event = other, "Ignoring stream event"),
    }
}

async fn run_poll(client: Client, reporter: Reporter, interval: Duration) {
    let spec = &reporter.spec;
    let mut opened = false;
    loop {
        match fetch_snapshot(&client, &spec.url).await {
            Ok(ticks) => {
                if !opened {
                    opened = true;
                    reporter.send(LinkEventKind::Open);
                }
                reporter.ticks(ticks);
            }
            Err(FeedError::Unauthorized) => {
                reporter.send(LinkEventKind::Unauthorized);
                return;
            }
            Err(e) => {
                if !reporter.send(LinkEventKind::Error(e.to_string())) {
                    return;
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

async fn fetch_snapshot(client: &Client, url: &str) -> FeedResult<Vec<Tick>> {
    let response = client
        .get(url)
        .timeout(POLL_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| FeedError::transport(url, e))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FeedError::Unauthorized);
    }
    if !status.is_success() {
        return Err(FeedError::transport(url, format!("HTTP {status}")));
    }

    let body: serde_json::Value = response.json().await?;
    decode_quote_snapshot(&body)
}
