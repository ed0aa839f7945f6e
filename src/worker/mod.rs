//! Ingestion worker
//!
//! Background actor that owns every subscription instance, their network
//! links and timers, the tick buffers, price fusion, indicators, margin and
//! the circuit breaker. It runs on its own OS thread with a current-thread
//! runtime and talks to the rest of the process only through channels.
//!
//! All state lives in `IngestionWorker` and is mutated from one loop, so
//! nothing here takes a lock.

mod buffer;
mod instance;
mod protocol;
mod sse;
mod transport;

pub use buffer::TickBuffer;
pub use instance::{derive_poll_url, Instance, InstanceStatus};
pub use protocol::{WorkerCommand, WorkerEvent};
pub use sse::{SseEvent, SseParser};
pub use transport::{
    Link, LinkEvent, LinkEventKind, LinkFactory, LinkKind, LinkSpec, NetworkLinks, TaskLink,
};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::WorkerConfig;
use crate::error::FeedError;
use crate::fusion::FusionTable;
use crate::indicators::IndicatorBook;
use crate::risk::{CircuitBreaker, MarginBook, RiskLimits, Trip};
use crate::sched::{spawn_after, spawn_every, TaskHandle};
use crate::types::{InstanceKey, Tick};

/// Timer fires posted back into the worker loop
#[derive(Debug, Clone, PartialEq)]
pub enum TimerMsg {
    Flush,
    Watchdog,
    Reconnect { key: InstanceKey, seq: u64 },
}

/// Receiving ends the worker loop selects over, besides commands
pub struct WorkerInbox {
    pub links: UnboundedReceiver<LinkEvent>,
    pub timers: UnboundedReceiver<TimerMsg>,
}

/// Outbound event sink
struct Outbox(UnboundedSender<WorkerEvent>);

impl Outbox {
    fn emit(&self, event: WorkerEvent) {
        if self.0.send(event).is_err() {
            trace!("Worker event receiver dropped");
        }
    }

    fn status(&self, key: &InstanceKey, connected: bool) {
        self.emit(WorkerEvent::Status {
            connected,
            key: key.to_string(),
        });
    }
}

/// Opens links on behalf of instances
struct LinkOpener {
    factory: Arc<dyn LinkFactory>,
    events: UnboundedSender<LinkEvent>,
    /// Worker-wide, so a replaced instance never shares a generation with its successor
    generation: u64,
}

impl LinkOpener {
    fn open(&mut self, inst: &mut Instance, kind: LinkKind, url: String) {
        self.generation += 1;
        let generation = self.generation;
        inst.generation = generation;
        debug!(key = %inst.key, kind = %kind, generation, url = %url, "Opening link");
        let link = self.factory.open(
            LinkSpec {
                key: inst.key.clone(),
                generation,
                kind,
                url,
                broker: inst.broker.clone(),
            },
            self.events.clone(),
        );
        inst.replace_link(link);
    }

    fn open_primary(&mut self, inst: &mut Instance) {
        inst.polling_is_stopgap = false;
        inst.status = InstanceStatus::Connecting;
        let kind = inst.primary_link_kind();
        let url = inst.key.endpoint.clone();
        self.open(inst, kind, url);
    }

    /// Start polling the derived snapshot endpoint. Returns false (and leaves
    /// the instance in `Error`) when no endpoint can be derived.
    fn open_poll(&mut self, inst: &mut Instance, stopgap: bool, out: &Outbox) -> bool {
        match derive_poll_url(&inst.key.endpoint) {
            Ok(url) => {
                inst.polling_is_stopgap = stopgap;
                inst.status = InstanceStatus::Polling;
                self.open(inst, LinkKind::Poll, url);
                true
            }
            Err(e) => {
                error!(key = %inst.key, error = %e, "Cannot derive polling endpoint");
                inst.teardown();
                inst.status = InstanceStatus::Error;
                out.emit(WorkerEvent::Error {
                    message: e.to_string(),
                    key: inst.key.to_string(),
                });
                false
            }
        }
    }
}

/// Schedules per-instance reconnects
struct Reconnects {
    tx: UnboundedSender<TimerMsg>,
    delay: Duration,
    seq: u64,
}

impl Reconnects {
    fn schedule(&mut self, inst: &mut Instance) {
        self.seq += 1;
        inst.reconnect_seq = self.seq;
        debug!(key = %inst.key, delay_ms = self.delay.as_millis() as u64, "Scheduling reconnect");
        inst.reconnect_timer = Some(spawn_after(
            "worker-reconnect",
            self.delay,
            self.tx.clone(),
            TimerMsg::Reconnect {
                key: inst.key.clone(),
                seq: inst.reconnect_seq,
            },
        ));
    }
}

pub struct IngestionWorker {
    cfg: WorkerConfig,
    instances: HashMap<InstanceKey, Instance>,
    fusion: FusionTable,
    indicators: IndicatorBook,
    breaker: CircuitBreaker,
    margin: MarginBook,
    out: Outbox,
    links: LinkOpener,
    reconnects: Reconnects,
    timer_tx: UnboundedSender<TimerMsg>,
    flush_timer: Option<TaskHandle>,
    watchdog_timer: Option<TaskHandle>,
}

impl IngestionWorker {
    pub fn new(
        cfg: WorkerConfig,
        limits: RiskLimits,
        factory: Arc<dyn LinkFactory>,
        events: UnboundedSender<WorkerEvent>,
    ) -> (Self, WorkerInbox) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let worker = Self {
            instances: HashMap::new(),
            fusion: FusionTable::new(),
            indicators: IndicatorBook::new(cfg.history_cap, cfg.ema_period),
            breaker: CircuitBreaker::new(limits),
            margin: MarginBook::new(),
            out: Outbox(events),
            links: LinkOpener {
                factory,
                events: link_tx,
                generation: 0,
            },
            reconnects: Reconnects {
                tx: timer_tx.clone(),
                delay: Duration::from_millis(cfg.reconnect_delay_ms),
                seq: 0,
            },
            timer_tx,
            flush_timer: None,
            watchdog_timer: None,
            cfg,
        };
        let inbox = WorkerInbox {
            links: link_rx,
            timers: timer_rx,
        };
        (worker, inbox)
    }

    pub fn instance(&self, key: &InstanceKey) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_halted(&self) -> bool {
        self.breaker.is_halted()
    }

    /// Start the global flush and watchdog timers
    pub fn start_timers(&mut self) {
        self.flush_timer = Some(spawn_every(
            "worker-flush",
            Duration::from_millis(self.cfg.flush_interval_ms),
            self.timer_tx.clone(),
            TimerMsg::Flush,
        ));
        self.watchdog_timer = Some(spawn_every(
            "worker-watchdog",
            Duration::from_millis(self.cfg.watchdog_interval_ms),
            self.timer_tx.clone(),
            TimerMsg::Watchdog,
        ));
    }

    pub fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Connect {
                url,
                transport,
                broker,
            } => self.connect(InstanceKey::new(url, transport), broker),
            WorkerCommand::Disconnect { url } => self.disconnect(&url),
            WorkerCommand::UpdateRiskLimits {
                max_loss,
                max_trades,
            } => {
                info!(max_loss, max_trades, "Risk limits updated");
                self.breaker.set_limits(RiskLimits {
                    max_loss,
                    max_trades,
                });
            }
            WorkerCommand::MarkToMarket { pnl } => {
                if let Some(trip) = self.breaker.check_mtm(pnl) {
                    self.halt(trip);
                }
            }
            WorkerCommand::RecordTrade => {
                if let Some(trip) = self.breaker.record_trade() {
                    self.halt(trip);
                }
            }
            WorkerCommand::UpdateMargin {
                broker,
                available,
                utilised,
            } => {
                let unified = self.margin.update(&broker, available, utilised);
                self.out.emit(WorkerEvent::UnifiedMargin(unified));
            }
            WorkerCommand::ResetHalt => self.breaker.reset(),
            WorkerCommand::Shutdown => self.shutdown(),
        }
    }

    fn connect(&mut self, key: InstanceKey, broker: String) {
        if let Some(trip) = self.breaker.halt_reason() {
            warn!(key = %key, reason = %trip.reason, "Connect rejected while halted");
            self.out.emit(WorkerEvent::Error {
                message: FeedError::Halted(trip.reason.to_string()).to_string(),
                key: key.to_string(),
            });
            return;
        }

        let previous = self.instances.remove(&key).map(|mut previous| {
            info!(key = %key, "Replacing existing instance");
            previous.teardown();
            previous.broker.clone()
        });

        info!(key = %key, broker = %broker, "Connecting instance");
        let mut inst = Instance::new(key.clone(), broker);
        self.links.open_primary(&mut inst);
        self.instances.insert(key, inst);

        if let Some(previous) = previous {
            self.forget_broker_if_gone(&previous);
        }
    }

    fn disconnect(&mut self, url: &str) {
        let keys: Vec<InstanceKey> = self
            .instances
            .keys()
            .filter(|k| k.endpoint == url)
            .cloned()
            .collect();

        for key in keys {
            if let Some(mut inst) = self.instances.remove(&key) {
                inst.teardown();
                info!(key = %key, "Instance disconnected");
                self.out.status(&key, false);
                self.forget_broker_if_gone(&inst.broker);
            }
        }
    }

    /// Drop a broker's prices from fusion once no instance reports for it
    fn forget_broker_if_gone(&mut self, broker: &str) {
        if self.instances.values().any(|inst| inst.broker == broker) {
            return;
        }
        debug!(broker = %broker, "Removing broker from price fusion");
        self.fusion.remove_broker(broker);
    }

    /// Trip handling: every instance is gone before this returns
    fn halt(&mut self, trip: Trip) {
        let torn_down = self.instances.len();
        let mut brokers = Vec::new();
        for (_, mut inst) in self.instances.drain() {
            inst.teardown();
            brokers.push(inst.broker.clone());
        }
        for broker in &brokers {
            self.fusion.remove_broker(broker);
        }
        error!(reason = %trip.reason, value = trip.value, instances = torn_down, "Trading halted, all feeds torn down");
        self.out.emit(WorkerEvent::CyberPauseTriggered {
            reason: trip.reason.to_string(),
            value: trip.value,
        });
    }

    pub fn on_link_event(&mut self, event: LinkEvent) {
        let Some(inst) = self.instances.get_mut(&event.key) else {
            trace!(key = %event.key, "Event for unknown instance");
            return;
        };
        if event.generation != inst.generation {
            trace!(
                key = %event.key,
                generation = event.generation,
                current = inst.generation,
                "Dropping event from superseded link"
            );
            return;
        }
        let Some(link_kind) = inst.link_kind() else {
            return;
        };

        match event.kind {
            LinkEventKind::Open => {
                inst.failure_count = 0;
                inst.last_tick_at = Instant::now();
                if link_kind != LinkKind::Poll && inst.status != InstanceStatus::Connected {
                    inst.status = InstanceStatus::Connected;
                    info!(key = %inst.key, "Instance connected");
                    self.out.status(&inst.key, true);
                }
            }
            LinkEventKind::Ticks(ticks) => {
                if ticks.is_empty() {
                    return;
                }
                inst.last_tick_at = Instant::now();
                inst.failure_count = 0;
                if inst.stale_episode {
                    debug!(key = %inst.key, "Stale episode over");
                    inst.stale_episode = false;
                }
                if link_kind != LinkKind::Poll && inst.status != InstanceStatus::Connected {
                    inst.status = InstanceStatus::Connected;
                    self.out.status(&inst.key, true);
                }

                for mut tick in ticks {
                    let broker = tick.broker.get_or_insert_with(|| inst.broker.clone()).clone();
                    enrich(&mut self.fusion, &mut self.indicators, &mut tick, &broker);
                    inst.buffer.merge(tick);
                }
            }
            LinkEventKind::Error(message) | LinkEventKind::Closed(message) => match link_kind {
                LinkKind::EventStream => {
                    inst.failure_count += 1;
                    warn!(
                        key = %inst.key,
                        failures = inst.failure_count,
                        max = self.cfg.max_stream_failures,
                        error = %message,
                        "Event stream error"
                    );
                    let was_connected = inst.status == InstanceStatus::Connected;
                    if inst.failure_count >= self.cfg.max_stream_failures {
                        warn!(key = %inst.key, "Event stream failing, switching to polling");
                        inst.close_link();
                        inst.cancel_reconnect();
                        if self.links.open_poll(inst, false, &self.out) {
                            self.out.status(&inst.key, false);
                        }
                    } else {
                        inst.status = InstanceStatus::Connecting;
                        if was_connected {
                            self.out.status(&inst.key, false);
                        }
                    }
                }
                LinkKind::Socket => {
                    inst.failure_count += 1;
                    warn!(key = %inst.key, error = %message, "Socket lost");
                    let was_connected = inst.status == InstanceStatus::Connected;
                    inst.close_link();
                    inst.status = InstanceStatus::Disconnected;
                    self.reconnects.schedule(inst);
                    if was_connected {
                        self.out.status(&inst.key, false);
                    }
                }
                LinkKind::Poll => {
                    debug!(key = %inst.key, error = %message, "Poll failed, retrying next interval");
                }
            },
            LinkEventKind::Unauthorized => {
                error!(key = %inst.key, "Polling endpoint rejected credentials");
                inst.close_link();
                inst.cancel_reconnect();
                inst.status = InstanceStatus::Error;
                self.out.emit(WorkerEvent::Error {
                    message: "polling endpoint returned 401, polling stopped".to_string(),
                    key: inst.key.to_string(),
                });
            }
        }
    }

    pub fn on_timer(&mut self, msg: TimerMsg) {
        match msg {
            TimerMsg::Flush => self.flush(),
            TimerMsg::Watchdog => self.watchdog(Instant::now()),
            TimerMsg::Reconnect { key, seq } => {
                let Some(inst) = self.instances.get_mut(&key) else {
                    return;
                };
                if seq != inst.reconnect_seq || inst.status == InstanceStatus::Error {
                    return;
                }
                if inst.link_kind() == Some(LinkKind::Poll) && !inst.polling_is_stopgap {
                    return;
                }
                inst.reconnect_timer = None;
                info!(key = %key, "Reconnecting primary transport");
                self.links.open_primary(inst);
            }
        }
    }

    /// Dispatch every non-empty buffer as one batch
    pub fn flush(&mut self) {
        for inst in self.instances.values_mut() {
            if inst.buffer.is_empty() {
                continue;
            }
            let data = inst.buffer.drain();
            trace!(key = %inst.key, ticks = data.len(), "Flushing batch");
            self.out.emit(WorkerEvent::Tick {
                data,
                key: inst.key.to_string(),
            });
        }
    }

    /// Detect silent links and rebuild them
    pub fn watchdog(&mut self, now: Instant) {
        let stale_after = Duration::from_millis(self.cfg.stale_after_ms);

        for inst in self.instances.values_mut() {
            if !matches!(inst.status, InstanceStatus::Connected | InstanceStatus::Polling) {
                continue;
            }
            if inst.silence(now) <= stale_after {
                continue;
            }

            if !inst.stale_episode {
                inst.stale_episode = true;
                warn!(
                    key = %inst.key,
                    broker = %inst.broker,
                    silence_ms = inst.silence(now).as_millis() as u64,
                    "Instance stale, rebuilding transport"
                );
                self.out.emit(WorkerEvent::StaleData {
                    key: inst.key.to_string(),
                    broker: inst.broker.clone(),
                });
            }
            inst.rebuilt_at = Some(now);

            match inst.link_kind() {
                Some(LinkKind::Socket) => {
                    inst.status = InstanceStatus::Stale;
                    inst.close_link();
                    self.links.open_primary(inst);
                }
                Some(LinkKind::EventStream) => {
                    inst.status = InstanceStatus::Stale;
                    inst.close_link();
                    if self.links.open_poll(inst, true, &self.out) {
                        self.reconnects.schedule(inst);
                    }
                }
                Some(LinkKind::Poll) => {
                    let stopgap = inst.polling_is_stopgap;
                    self.links.open_poll(inst, stopgap, &self.out);
                }
                None => {}
            }
        }
    }

    /// Tear down everything and stop timers
    pub fn shutdown(&mut self) {
        for (_, mut inst) in self.instances.drain() {
            inst.teardown();
        }
        for timer in [&mut self.flush_timer, &mut self.watchdog_timer] {
            if let Some(mut t) = timer.take() {
                t.cancel();
            }
        }
    }

    /// Drive the worker until `SHUTDOWN` or until the command channel closes
    pub async fn run(mut self, mut commands: UnboundedReceiver<WorkerCommand>, mut inbox: WorkerInbox) {
        self.start_timers();
        info!(
            flush_ms = self.cfg.flush_interval_ms,
            stale_after_ms = self.cfg.stale_after_ms,
            "Ingestion worker started"
        );

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None | Some(WorkerCommand::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(event) = inbox.links.recv() => self.on_link_event(event),
                Some(msg) = inbox.timers.recv() => self.on_timer(msg),
            }
        }

        self.shutdown();
        info!("Ingestion worker stopped");
    }
}

/// Fuse the raw price and compute the EMA on the fused value
fn enrich(fusion: &mut FusionTable, indicators: &mut IndicatorBook, tick: &mut Tick, broker: &str) {
    let Some(price) = tick.last_price else {
        return;
    };
    let symbol = tick.fusion_key();
    tick.fused_price = fusion.update(&symbol, broker, price);
    if let Some(fused) = tick.fused_price {
        tick.ema = indicators.push(&symbol, fused);
    }
}

/// Handle to a worker running on its own thread
pub struct WorkerHandle {
    commands: UnboundedSender<WorkerCommand>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, cmd: WorkerCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("ingestion worker has stopped"))
    }

    pub fn sender(&self) -> UnboundedSender<WorkerCommand> {
        self.commands.clone()
    }

    /// Ask the worker to stop and wait for its thread
    pub fn shutdown(mut self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Ingestion worker thread panicked");
            }
        }
    }
}

/// Start the worker on a dedicated thread with its own runtime
pub fn spawn_worker(
    cfg: WorkerConfig,
    limits: RiskLimits,
    factory: Arc<dyn LinkFactory>,
) -> Result<(WorkerHandle, UnboundedReceiver<WorkerEvent>)> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build worker runtime")?;

    let thread = std::thread::Builder::new()
        .name("ingestion-worker".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let (worker, inbox) = IngestionWorker::new(cfg, limits, factory, event_tx);
                worker.run(cmd_rx, inbox).await;
            });
        })
        .context("Failed to spawn worker thread")?;

    Ok((
        WorkerHandle {
            commands: cmd_tx,
            thread: Some(thread),
        },
        event_rx,
    ))
}
