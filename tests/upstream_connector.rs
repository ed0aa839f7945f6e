//! Upstream connector against a local websocket server

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::{Duration, Instant};
    use tickstream::types::{BrokerKind, StreamMode};
    use tickstream::upstream::{Credentials, SubscribeRequest, UpstreamEvent, UpstreamLink, WsConnector};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    fn request(port: u16, kind: BrokerKind) -> SubscribeRequest {
        SubscribeRequest {
            broker: "kite".to_string(),
            kind,
            ws_url: format!("ws://127.0.0.1:{port}"),
            tokens: vec![256265],
            mode: StreamMode::Full,
        }
    }

    /// One LTP packet in a one-packet frame
    fn ltp_frame(token: u32, paise: i32) -> Vec<u8> {
        let mut frame = 1u16.to_be_bytes().to_vec();
        frame.extend_from_slice(&8u16.to_be_bytes());
        frame.extend_from_slice(&token.to_be_bytes());
        frame.extend_from_slice(&paise.to_be_bytes());
        frame
    }

    fn text(msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>) -> Value {
        match msg {
            Some(Ok(Message::Text(body))) => serde_json::from_str(&body).expect("json frame"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    // ============================================================================
    // Subscribe, stream, shutdown
    // ============================================================================

    #[tokio::test]
    async fn test_subscribe_tick_and_normal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let (server_done_tx, server_done_rx) = tokio::sync::oneshot::channel();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");

            let subscribe = text(ws.next().await);
            let mode = text(ws.next().await);
            assert_eq!(subscribe, json!({"a": "subscribe", "v": [256265]}));
            assert_eq!(mode, json!({"a": "mode", "v": ["full", [256265]]}));

            ws.send(Message::Binary(vec![1])).await.expect("heartbeat");
            ws.send(Message::Binary(ltp_frame(256265, 2_450_050)))
                .await
                .expect("tick");

            go_rx.await.expect("client asked to stop");
            let unsubscribe = text(ws.next().await);
            let close = match ws.next().await {
                Some(Ok(Message::Close(frame))) => frame,
                other => panic!("expected close, got {:?}", other),
            };
            let _ = server_done_tx.send((unsubscribe, close));
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = WsConnector::new(Duration::from_secs(1)).spawn(
            request(port, BrokerKind::Kite),
            Credentials::new("key", "token"),
            tx,
        );

        match timeout(WAIT, rx.recv()).await.expect("open in time") {
            Some(UpstreamEvent::Open) => {}
            other => panic!("expected open, got {:?}", other),
        }
        assert!(handle.is_open());

        match timeout(WAIT, rx.recv()).await.expect("tick in time") {
            Some(UpstreamEvent::Ticks(ticks)) => {
                assert_eq!(ticks.len(), 1);
                assert_eq!(ticks[0].instrument_token, 256265);
                assert_eq!(ticks[0].last_price, Some(24_500.5));
                assert_eq!(ticks[0].broker.as_deref(), Some("kite"));
            }
            other => panic!("expected ticks, got {:?}", other),
        }

        handle.shutdown();
        assert!(!handle.is_open());
        go_tx.send(()).expect("server waiting");

        let (unsubscribe, close) = timeout(WAIT, server_done_rx)
            .await
            .expect("server finished in time")
            .expect("server result");
        assert_eq!(unsubscribe, json!({"a": "unsubscribe", "v": [256265]}));
        let close = close.expect("close frame carries a code");
        assert_eq!(close.code, CloseCode::Normal);

        server.await.expect("server task");
        // The task has ended, so the event sender is gone
        assert_eq!(timeout(WAIT, rx.recv()).await.expect("channel closes"), None);
    }

    #[tokio::test]
    async fn test_dropped_socket_reconnects_after_fixed_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let delay = Duration::from_millis(500);

        let server = tokio::spawn(async move {
            let mut accepted = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.expect("accept");
                accepted.push(Instant::now());
                let mut ws = accept_async(stream).await.expect("handshake");
                let subscribe = text(ws.next().await);
                let mode = text(ws.next().await);
                assert_eq!(subscribe, json!({"a": "subscribe", "v": [256265]}));
                assert_eq!(mode, json!({"a": "mode", "v": ["full", [256265]]}));
                if accepted.len() == 1 {
                    // Server-side drop of the first session
                    ws.close(None).await.expect("close");
                } else {
                    return (accepted, ws);
                }
            }
            unreachable!("second connection returns")
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = WsConnector::new(delay).spawn(
            request(port, BrokerKind::Kite),
            Credentials::new("key", "token"),
            tx,
        );

        assert_eq!(
            timeout(WAIT, rx.recv()).await.expect("open in time"),
            Some(UpstreamEvent::Open)
        );
        match timeout(WAIT, rx.recv()).await.expect("close in time") {
            Some(UpstreamEvent::Closed { .. }) => {}
            other => panic!("expected closed, got {:?}", other),
        }
        assert_eq!(
            timeout(WAIT, rx.recv()).await.expect("reopen in time"),
            Some(UpstreamEvent::Open)
        );
        assert!(handle.is_open());

        let (accepted, _ws) = timeout(WAIT, server)
            .await
            .expect("server finished in time")
            .expect("server task");
        // Subscribe frames went out again on the second session
        assert!(accepted[1].duration_since(accepted[0]) >= delay);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_alternate_dialect_subscribes_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            let subscribe = text(ws.next().await);
            ws.send(Message::Text(r#"{"type":"tick","data":[{"token":256265,"ltp":101.25}]}"#.to_string()))
                .await
                .expect("tick");
            subscribe
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = WsConnector::new(Duration::from_secs(1)).spawn(
            request(port, BrokerKind::Alternate),
            Credentials::new("key", "token"),
            tx,
        );

        assert_eq!(
            timeout(WAIT, rx.recv()).await.expect("open in time"),
            Some(UpstreamEvent::Open)
        );
        match timeout(WAIT, rx.recv()).await.expect("tick in time") {
            Some(UpstreamEvent::Ticks(ticks)) => assert_eq!(ticks[0].last_price, Some(101.25)),
            other => panic!("expected ticks, got {:?}", other),
        }

        let subscribe = server.await.expect("server task");
        assert_eq!(
            subscribe,
            json!({"action": "subscribe", "mode": "full", "instruments": [256265]})
        );
        handle.shutdown();
    }
}
