//! Gateway router driven in-process

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use futures_util::StreamExt;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tickstream::config::AppConfig;
    use tickstream::error::{FeedError, FeedResult};
    use tickstream::gateway::{create_router, AppState};
    use tickstream::types::{InstrumentToken, Tick};
    use tickstream::upstream::{
        ConfigCredentialStore, Credentials, SnapshotSource, SubscribeRequest, UpstreamEvent,
        UpstreamFactory, UpstreamLink,
    };
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::time::timeout;
    use tower::ServiceExt;

    // ============================================================================
    // Fakes
    // ============================================================================

    enum Reply {
        Ticks(Vec<Tick>),
        Unauthorized,
        Down,
    }

    struct FakeSnapshots(Reply);

    #[async_trait]
    impl SnapshotSource for FakeSnapshots {
        async fn fetch(
            &self,
            broker: &str,
            tokens: &[InstrumentToken],
            _credentials: &Credentials,
        ) -> FeedResult<Vec<Tick>> {
            match &self.0 {
                Reply::Ticks(ticks) => Ok(ticks
                    .iter()
                    .filter(|t| tokens.contains(&t.instrument_token))
                    .cloned()
                    .map(|mut t| {
                        t.broker = Some(broker.to_string());
                        t
                    })
                    .collect()),
                Reply::Unauthorized => Err(FeedError::Unauthorized),
                Reply::Down => Err(FeedError::transport("https://api.kite.trade/quote", "HTTP 503")),
            }
        }
    }

    #[derive(Default)]
    struct LinkCounters {
        connects: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    struct FakeLink(Arc<LinkCounters>);

    impl UpstreamLink for FakeLink {
        fn is_open(&self) -> bool {
            true
        }

        fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Opens immediately and delivers one tick
    struct FakeUpstream(Arc<LinkCounters>);

    impl UpstreamFactory for FakeUpstream {
        fn connect(
            &self,
            request: SubscribeRequest,
            _credentials: Credentials,
            events: UnboundedSender<UpstreamEvent>,
        ) -> Box<dyn UpstreamLink> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            let _ = events.send(UpstreamEvent::Open);
            let ticks = request
                .tokens
                .iter()
                .map(|token| {
                    let mut tick = Tick::new(*token);
                    tick.last_price = Some(24_500.5);
                    tick
                })
                .collect();
            let _ = events.send(UpstreamEvent::Ticks(ticks));
            Box::new(FakeLink(self.0.clone()))
        }
    }

    struct Harness {
        app: Router,
        state: Arc<AppState>,
        links: Arc<LinkCounters>,
    }

    fn harness(reply: Reply, authenticated: bool) -> Harness {
        let config = Arc::new(AppConfig::defaults().expect("defaults"));
        let links = Arc::new(LinkCounters::default());
        let credentials = if authenticated {
            ConfigCredentialStore::default().with("kite", Credentials::new("key", "token"))
        } else {
            ConfigCredentialStore::default()
        };
        let state = Arc::new(AppState::new(
            config,
            Arc::new(FakeUpstream(links.clone())),
            Arc::new(FakeSnapshots(reply)),
            Arc::new(credentials),
        ));
        Harness {
            app: create_router(state.clone()),
            state,
            links,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    async fn json_body(body: Body) -> Value {
        let bytes = to_bytes(body, usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn quote(token: InstrumentToken, price: f64) -> Tick {
        let mut tick = Tick::new(token);
        tick.last_price = Some(price);
        tick
    }

    // ============================================================================
    // /poll
    // ============================================================================

    #[tokio::test]
    async fn test_poll_returns_snapshot() {
        let h = harness(Reply::Ticks(vec![quote(256265, 24_500.5), quote(260105, 51_000.0)]), true);

        let res = h.app.oneshot(get("/poll?tokens=256265")).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let body = json_body(res.into_body()).await;
        assert_eq!(body["status"], "success");
        let data = body["data"].as_array().expect("data array");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["instrument_token"], 256265);
        assert_eq!(data[0]["last_price"], 24_500.5);
        assert_eq!(data[0]["broker"], "kite");
    }

    #[tokio::test]
    async fn test_poll_without_credentials_is_401() {
        let h = harness(Reply::Ticks(Vec::new()), false);

        let res = h.app.oneshot(get("/poll?tokens=256265")).await.expect("response");
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(res.into_body()).await["status"], "error");
    }

    #[tokio::test]
    async fn test_poll_rejected_upstream_is_401() {
        let h = harness(Reply::Unauthorized, true);

        let res = h.app.oneshot(get("/poll?tokens=256265")).await.expect("response");
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_poll_upstream_failure_is_502() {
        let h = harness(Reply::Down, true);

        let res = h.app.oneshot(get("/poll?tokens=256265")).await.expect("response");
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(res.into_body()).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().expect("message").contains("503"));
    }

    #[tokio::test]
    async fn test_bad_requests_are_400() {
        for uri in [
            "/poll",
            "/poll?tokens=abc",
            "/poll?tokens=1&broker=nobody",
            "/stream?tokens=",
            "/stream?tokens=1,x",
            "/stream?tokens=1&mode=candles",
            "/stream?tokens=1&broker=nobody",
        ] {
            let h = harness(Reply::Ticks(Vec::new()), true);
            let res = h.app.oneshot(get(uri)).await.expect("response");
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "uri {uri}");
            assert_eq!(h.links.connects.load(Ordering::SeqCst), 0);
        }
    }

    // ============================================================================
    // /stream
    // ============================================================================

    #[tokio::test]
    async fn test_unauthenticated_stream_is_one_demo_status() {
        let h = harness(Reply::Ticks(Vec::new()), false);

        let res = h.app.oneshot(get("/stream?tokens=256265")).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()["content-type"].to_str().expect("header"),
            "text/event-stream"
        );

        let bytes = timeout(Duration::from_secs(5), to_bytes(res.into_body(), usize::MAX))
            .await
            .expect("stream ends")
            .expect("body");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert_eq!(text.matches("event: status").count(), 1);
        assert!(text.contains(r#""source":"demo""#));
        assert!(text.contains(r#""code":401"#));
        assert_eq!(h.links.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_delivers_ticks_and_tears_down_on_disconnect() {
        let h = harness(Reply::Ticks(Vec::new()), true);

        let res = h
            .app
            .oneshot(get("/stream?tokens=256265&mode=full"))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(h.state.active_sessions.load(Ordering::SeqCst), 1);

        let mut body = res.into_body().into_data_stream();
        let mut seen = String::new();
        while !seen.contains("event: tick") {
            let chunk = timeout(Duration::from_secs(5), body.next())
                .await
                .expect("event in time")
                .expect("stream open")
                .expect("chunk");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(seen.contains(r#""connected":true"#));
        assert!(seen.contains(r#""last_price":24500.5"#));
        assert_eq!(h.links.connects.load(Ordering::SeqCst), 1);

        // Client goes away
        drop(body);
        timeout(Duration::from_secs(5), async {
            while h.state.active_sessions.load(Ordering::SeqCst) != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session ends after disconnect");
        assert_eq!(h.links.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_streams() {
        let h = harness(Reply::Ticks(Vec::new()), true);

        let res = h
            .app
            .clone()
            .oneshot(get("/stream?tokens=256265"))
            .await
            .expect("response");
        let mut body = res.into_body().into_data_stream();
        let first = timeout(Duration::from_secs(5), body.next())
            .await
            .expect("event in time")
            .expect("stream open")
            .expect("chunk");
        assert!(String::from_utf8_lossy(&first).contains("event:"));

        h.state.begin_shutdown();
        assert!(h.state.is_shutting_down());

        // Remaining events drain, then the body ends
        timeout(Duration::from_secs(5), async {
            while let Some(chunk) = body.next().await {
                chunk.expect("chunk");
            }
        })
        .await
        .expect("stream ends after shutdown");
        assert_eq!(h.links.shutdowns.load(Ordering::SeqCst), 1);

        // Streams opened afterwards close straight away
        let res = h.app.oneshot(get("/stream?tokens=256265")).await.expect("response");
        timeout(Duration::from_secs(5), to_bytes(res.into_body(), usize::MAX))
            .await
            .expect("late stream ends")
            .expect("body");
        timeout(Duration::from_secs(5), async {
            while h.state.active_sessions.load(Ordering::SeqCst) != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions finish");
    }

    // ============================================================================
    // /health
    // ============================================================================

    #[tokio::test]
    async fn test_health_reports_brokers() {
        let h = harness(Reply::Ticks(Vec::new()), true);

        let res = h.app.oneshot(get("/health")).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let body = json_body(res.into_body()).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["active_sessions"], 0);
        assert_eq!(body["data"]["brokers"], serde_json::json!(["kite"]));
    }
}
