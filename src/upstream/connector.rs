//! Websocket upstream connector
//!
//! One task per subscription. The task owns the socket, sends the subscribe
//! frames on every (re)connect, decodes frames into ticks and reconnects after
//! a fixed delay, forever, until its handle shuts it down.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::frames::{subscribe_frames, unsubscribe_frame};
use super::{Credentials, SubscribeRequest, UpstreamEvent, UpstreamFactory, UpstreamLink};
use crate::decoder::{decoder_for, Decoded, Frame, TickDecoder};
use crate::error::{FeedError, FeedResult};
use crate::sched::TaskHandle;

#[derive(Debug)]
enum Control {
    Shutdown,
}

/// Factory for websocket upstream links
#[derive(Debug, Clone)]
pub struct WsConnector {
    reconnect_delay: Duration,
}

impl WsConnector {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self { reconnect_delay }
    }

    /// Start the connection task
    pub fn spawn(
        &self,
        request: SubscribeRequest,
        credentials: Credentials,
        events: UnboundedSender<UpstreamEvent>,
    ) -> ConnectorHandle {
        let open = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let task = TaskHandle::spawn(
            "upstream-connector",
            run_connection(
                request,
                credentials,
                events,
                open.clone(),
                control_rx,
                self.reconnect_delay,
            ),
        );

        ConnectorHandle {
            open,
            control: control_tx,
            task: Some(task),
        }
    }
}

impl UpstreamFactory for WsConnector {
    fn connect(
        &self,
        request: SubscribeRequest,
        credentials: Credentials,
        events: UnboundedSender<UpstreamEvent>,
    ) -> Box<dyn UpstreamLink> {
        Box::new(self.spawn(request, credentials, events))
    }
}

/// Owner's side of a running connector task
#[derive(Debug)]
pub struct ConnectorHandle {
    open: Arc<AtomicBool>,
    control: UnboundedSender<Control>,
    task: Option<TaskHandle>,
}

impl UpstreamLink for ConnectorHandle {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            self.open.store(false, Ordering::SeqCst);
            let _ = self.control.send(Control::Shutdown);
            // The task finishes the unsubscribe and close handshake on its own
            task.detach();
        }
    }
}

impl Drop for ConnectorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Socket URL with the session credentials appended
pub fn connect_url(request: &SubscribeRequest, credentials: &Credentials) -> FeedResult<String> {
    let mut url = reqwest::Url::parse(&request.ws_url)
        .map_err(|e| FeedError::InvalidRequest(format!("bad socket url {}: {e}", request.ws_url)))?;
    url.query_pairs_mut()
        .append_pair("api_key", &credentials.api_key)
        .append_pair("access_token", &credentials.access_token);
    Ok(url.into())
}

fn dispatch_frame(
    decoder: &dyn TickDecoder,
    frame: Frame<'_>,
    broker: &str,
    events: &UnboundedSender<UpstreamEvent>,
) {
    if frame.is_heartbeat() {
        return;
    }

    match decoder.decode(frame) {
        Ok(Decoded::Ticks(mut ticks)) if !ticks.is_empty() => {
            let now = chrono::Utc::now().timestamp_millis();
            for tick in &mut ticks {
                tick.broker.get_or_insert_with(|| broker.to_string());
                tick.received_at = Some(now);
            }
            let _ = events.send(UpstreamEvent::Ticks(ticks));
        }
        Ok(Decoded::Order(payload)) => {
            let _ = events.send(UpstreamEvent::Order(payload));
        }
        Ok(Decoded::Notice(message)) => {
            info!(broker = %broker, message = %message, "Upstream notice");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(broker = %broker, decoder = decoder.name(), error = %e, "Dropping undecodable frame");
        }
    }
}

async fn run_connection(
    request: SubscribeRequest,
    credentials: Credentials,
    events: UnboundedSender<UpstreamEvent>,
    open: Arc<AtomicBool>,
    mut control: UnboundedReceiver<Control>,
    reconnect_delay: Duration,
) {
    let url = match connect_url(&request, &credentials) {
        Ok(url) => url,
        Err(e) => {
            error!(broker = %request.broker, error = %e, "Cannot build upstream url");
            let _ = events.send(UpstreamEvent::Error(e.to_string()));
            return;
        }
    };
    let decoder = decoder_for(request.kind);
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        info!(
            broker = %request.broker,
            endpoint = %request.ws_url,
            tokens = request.tokens.len(),
            attempt = attempt,
            "Connecting upstream websocket"
        );

        let connected = tokio::select! {
            res = connect_async(url.as_str()) => res,
            _ = control.recv() => {
                debug!(broker = %request.broker, "Shutdown while connecting");
                return;
            }
        };

        match connected {
            Ok((ws_stream, _)) => {
                let (mut write, mut read) = ws_stream.split();

                let mut subscribed = true;
                for frame in subscribe_frames(request.kind, &request.tokens, request.mode) {
                    if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                        warn!(broker = %request.broker, error = %e, "Failed to send subscription");
                        let _ = events.send(UpstreamEvent::Error(e.to_string()));
                        subscribed = false;
                        break;
                    }
                }

                if subscribed {
                    open.store(true, Ordering::SeqCst);
                    attempt = 0;
                    let _ = events.send(UpstreamEvent::Open);
                    info!(broker = %request.broker, mode = %request.mode, "Upstream connected");

                    let reason = loop {
                        tokio::select! {
                            _ = control.recv() => {
                                open.store(false, Ordering::SeqCst);
                                let frame = unsubscribe_frame(request.kind, &request.tokens);
                                if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                                    debug!(broker = %request.broker, error = %e, "Unsubscribe not delivered");
                                }
                                let close = CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "client disconnected".into(),
                                };
                                let _ = write.send(Message::Close(Some(close))).await;
                                info!(broker = %request.broker, "Upstream shut down");
                                return;
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Binary(data))) => {
                                        dispatch_frame(decoder.as_ref(), Frame::Binary(&data), &request.broker, &events);
                                    }
                                    Some(Ok(Message::Text(text))) => {
                                        dispatch_frame(decoder.as_ref(), Frame::Text(&text), &request.broker, &events);
                                    }
                                    Some(Ok(Message::Ping(data))) => {
                                        let _ = write.send(Message::Pong(data)).await;
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        warn!(broker = %request.broker, ?frame, "Upstream closed by server");
                                        break "closed by server".to_string();
                                    }
                                    Some(Err(e)) => {
                                        error!(broker = %request.broker, error = %e, "Upstream websocket error");
                                        let _ = events.send(UpstreamEvent::Error(e.to_string()));
                                        break e.to_string();
                                    }
                                    None => {
                                        warn!(broker = %request.broker, "Upstream stream ended");
                                        break "stream ended".to_string();
                                    }
                                    _ => {}
                                }
                            }
                        }
                    };

                    open.store(false, Ordering::SeqCst);
                    let _ = events.send(UpstreamEvent::Closed { reason });
                }
            }
            Err(e) => {
                error!(broker = %request.broker, error = %e, "Failed to connect upstream");
                let _ = events.send(UpstreamEvent::Error(e.to_string()));
            }
        }

        debug!(
            broker = %request.broker,
            delay_ms = reconnect_delay.as_millis() as u64,
            "Scheduling upstream reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = control.recv() => {
                debug!(broker = %request.broker, "Shutdown during reconnect backoff");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BrokerKind, StreamMode};

    fn request(ws_url: &str) -> SubscribeRequest {
        SubscribeRequest {
            broker: "kite".to_string(),
            kind: BrokerKind::Kite,
            ws_url: ws_url.to_string(),
            tokens: vec![256265],
            mode: StreamMode::Quote,
        }
    }

    #[test]
    fn test_connect_url_appends_credentials() {
        let url = connect_url(&request("wss://ws.kite.trade"), &Credentials::new("k", "t"))
            .expect("valid url");
        assert_eq!(url, "wss://ws.kite.trade/?api_key=k&access_token=t");
    }

    #[test]
    fn test_connect_url_rejects_garbage() {
        assert!(matches!(
            connect_url(&request("not a url"), &Credentials::new("k", "t")),
            Err(FeedError::InvalidRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_stops_reconnecting() {
        let connector = WsConnector::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Nothing listens on port 9; the first attempt fails fast
        let mut handle = connector.spawn(request("ws://127.0.0.1:9"), Credentials::new("k", "t"), tx);

        match rx.recv().await {
            Some(UpstreamEvent::Error(_)) => {}
            other => panic!("expected connect error, got {:?}", other),
        }
        assert!(!handle.is_open());

        handle.shutdown();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_ticks_get_broker_and_receive_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let decoder = decoder_for(BrokerKind::Alternate);
        dispatch_frame(decoder.as_ref(), Frame::Text(r#"{"token": 3, "ltp": 1.5}"#), "upstox", &tx);

        match rx.try_recv() {
            Ok(UpstreamEvent::Ticks(ticks)) => {
                assert_eq!(ticks[0].broker.as_deref(), Some("upstox"));
                assert!(ticks[0].received_at.is_some());
            }
            other => panic!("expected ticks, got {:?}", other),
        }

        // heartbeats and undecodable frames produce nothing
        dispatch_frame(decoder.as_ref(), Frame::Binary(&[0]), "upstox", &tx);
        dispatch_frame(decoder.as_ref(), Frame::Text("{broken"), "upstox", &tx);
        assert!(rx.try_recv().is_err());
    }
}
