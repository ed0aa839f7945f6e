//! Cancellable background tasks
//!
//! Every timer in the pipeline (heartbeat, watchdog, reconnect, poll) is a
//! spawned task that posts a message back into its owner's loop. The owner
//! keeps the `TaskHandle`; cancelling or dropping it aborts the task, so a
//! torn-down gateway session or worker instance never receives a late fire
//! from a timer it owned.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    inner: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            inner: Some(tokio::spawn(fut)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Abort the task. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.inner.take() {
            handle.abort();
            tracing::trace!(task = self.name, "task cancelled");
        }
    }

    /// Let the task run to completion on its own; the handle no longer owns it.
    pub fn detach(mut self) {
        self.inner.take();
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Post `msg` to `tx` once, after `delay`.
pub fn spawn_after<M>(name: &'static str, delay: Duration, tx: UnboundedSender<M>, msg: M) -> TaskHandle
where
    M: Send + 'static,
{
    TaskHandle::spawn(name, async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(msg);
    })
}

/// Post a clone of `msg` to `tx` every `period`, first fire one period from now.
/// Stops on its own once the receiver is gone.
pub fn spawn_every<M>(name: &'static str, period: Duration, tx: UnboundedSender<M>, msg: M) -> TaskHandle
where
    M: Clone + Send + 'static,
{
    TaskHandle::spawn(name, async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tx.send(msg.clone()).is_err() {
                break;
            }
        }
    })
}
