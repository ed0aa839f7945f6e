//! One subscription session inside the worker

use tokio::time::Instant;

use super::buffer::TickBuffer;
use super::transport::{Link, LinkKind};
use crate::error::{FeedError, FeedResult};
use crate::sched::TaskHandle;
use crate::types::{InstanceKey, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Disconnected,
    Connecting,
    Connected,
    Stale,
    Polling,
    Error,
}

pub struct Instance {
    pub key: InstanceKey,
    pub broker: String,
    pub status: InstanceStatus,
    pub last_tick_at: Instant,
    /// Set when the watchdog last rebuilt the link; the silence clock restarts there
    pub rebuilt_at: Option<Instant>,
    /// The only live network handle
    link: Option<Box<dyn Link>>,
    /// Generation of `link`; events tagged otherwise are stale
    pub generation: u64,
    pub reconnect_timer: Option<TaskHandle>,
    pub reconnect_seq: u64,
    pub failure_count: u32,
    pub stale_episode: bool,
    /// Polling is covering for a primary transport that will be retried
    pub polling_is_stopgap: bool,
    pub buffer: TickBuffer,
}

impl Instance {
    pub fn new(key: InstanceKey, broker: impl Into<String>) -> Self {
        Self {
            key,
            broker: broker.into(),
            status: InstanceStatus::Disconnected,
            last_tick_at: Instant::now(),
            rebuilt_at: None,
            link: None,
            generation: 0,
            reconnect_timer: None,
            reconnect_seq: 0,
            failure_count: 0,
            stale_episode: false,
            polling_is_stopgap: false,
            buffer: TickBuffer::new(),
        }
    }

    pub fn primary_link_kind(&self) -> LinkKind {
        match self.key.transport {
            TransportKind::Socket => LinkKind::Socket,
            TransportKind::EventStream => LinkKind::EventStream,
        }
    }

    pub fn link_kind(&self) -> Option<LinkKind> {
        self.link.as_ref().map(|l| l.kind())
    }

    pub fn live_links(&self) -> usize {
        usize::from(self.link.is_some())
    }

    /// Store a new link, closing the previous one first
    pub fn replace_link(&mut self, link: Box<dyn Link>) {
        self.close_link();
        self.link = Some(link);
    }

    pub fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(mut timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
    }

    /// Time since the last tick, or since the last rebuild if that is later
    pub fn silence(&self, now: Instant) -> std::time::Duration {
        let since = match self.rebuilt_at {
            Some(rebuilt) if rebuilt > self.last_tick_at => rebuilt,
            _ => self.last_tick_at,
        };
        now.saturating_duration_since(since)
    }

    /// Close the link, cancel timers and drop buffered ticks
    pub fn teardown(&mut self) {
        self.close_link();
        self.cancel_reconnect();
        self.buffer.clear();
        self.status = InstanceStatus::Disconnected;
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.close_link();
        self.cancel_reconnect();
    }
}

/// Snapshot endpoint next to a stream endpoint: same query, last path
/// segment replaced by `poll`, socket schemes mapped to http(s)
pub fn derive_poll_url(endpoint: &str) -> FeedResult<String> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| FeedError::InvalidRequest(format!("bad endpoint {endpoint}: {e}")))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(FeedError::InvalidRequest(format!(
                "unsupported scheme '{other}' in {endpoint}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| FeedError::InvalidRequest(format!("cannot map scheme of {endpoint}")))?;

    url.path_segments_mut()
        .map_err(|_| FeedError::InvalidRequest(format!("endpoint has no path: {endpoint}")))?
        .pop()
        .push("poll");

    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountedLink(Arc<AtomicUsize>);

    impl Link for CountedLink {
        fn kind(&self) -> LinkKind {
            LinkKind::Socket
        }

        fn close(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn counted(live: &Arc<AtomicUsize>) -> Box<dyn Link> {
        live.fetch_add(1, Ordering::SeqCst);
        Box::new(CountedLink(live.clone()))
    }

    #[test]
    fn test_derive_poll_url() {
        assert_eq!(
            derive_poll_url("http://localhost:8080/stream?tokens=1,2&mode=full").expect("derives"),
            "http://localhost:8080/poll?tokens=1,2&mode=full"
        );
        assert_eq!(
            derive_poll_url("wss://feed.example.com/md/stream?tokens=5").expect("derives"),
            "https://feed.example.com/md/poll?tokens=5"
        );
        assert_eq!(
            derive_poll_url("ws://127.0.0.1:9000").expect("derives"),
            "http://127.0.0.1:9000/poll"
        );
        assert!(derive_poll_url("ftp://host/stream").is_err());
        assert!(derive_poll_url("nonsense").is_err());
    }

    #[tokio::test]
    async fn test_replacing_a_link_closes_the_old_one() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut inst = Instance::new(
            InstanceKey::new("ws://feed", TransportKind::Socket),
            "kite",
        );

        inst.replace_link(counted(&live));
        inst.replace_link(counted(&live));
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(inst.live_links(), 1);

        inst.teardown();
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(inst.live_links(), 0);
        assert_eq!(inst.status, InstanceStatus::Disconnected);
    }
}
