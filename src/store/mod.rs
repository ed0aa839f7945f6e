//! Consumer-side store
//!
//! Latest state per instrument, fed by worker events at flush cadence.
//! Values are never blanked: a dropped or stale connection only marks the
//! instruments it last updated as stale.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::risk::UnifiedMargin;
use crate::types::{InstrumentToken, Tick};
use crate::worker::WorkerEvent;

/// Latest merged view of one instrument
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentState {
    pub tick: Tick,
    /// Instance key of the batch that last touched this instrument
    pub source: String,
    /// Unix millis when the last update arrived
    pub updated_at: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub stale: bool,
    pub broker: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HaltRecord {
    pub reason: String,
    pub value: f64,
    pub at: i64,
}

#[derive(Debug, Default)]
struct StoreInner {
    instruments: HashMap<InstrumentToken, InstrumentState>,
    connections: HashMap<String, ConnectionState>,
    halt: Option<HaltRecord>,
    margin: Option<UnifiedMargin>,
    batches: u64,
}

impl StoreInner {
    fn mark_stale(&mut self, source: &str) -> usize {
        let mut marked = 0;
        for state in self.instruments.values_mut() {
            if state.source == source && !state.stale {
                state.stale = true;
                marked += 1;
            }
        }
        marked
    }
}

#[derive(Debug, Default)]
pub struct ConsumerStore {
    inner: RwLock<StoreInner>,
}

impl ConsumerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &WorkerEvent) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        match event {
            WorkerEvent::Tick { data, key } => {
                inner.batches += 1;
                for tick in data {
                    let updated_at = tick.received_at.unwrap_or(now);
                    inner
                        .instruments
                        .entry(tick.instrument_token)
                        .and_modify(|state| {
                            state.tick.merge_from(tick.clone());
                            state.source.clone_from(key);
                            state.updated_at = updated_at;
                            state.stale = false;
                        })
                        .or_insert_with(|| InstrumentState {
                            tick: tick.clone(),
                            source: key.clone(),
                            updated_at,
                            stale: false,
                        });
                }
                let conn = inner.connections.entry(key.clone()).or_default();
                conn.connected = true;
                conn.stale = false;
                conn.updated_at = now;
            }
            WorkerEvent::Status { connected, key } => {
                let conn = inner.connections.entry(key.clone()).or_default();
                conn.connected = *connected;
                conn.updated_at = now;
                if *connected {
                    conn.last_error = None;
                } else {
                    let marked = inner.mark_stale(key);
                    debug!(key = %key, marked, "Connection down, instruments marked stale");
                }
            }
            WorkerEvent::Error { message, key } => {
                warn!(key = %key, error = %message, "Worker reported error");
                let conn = inner.connections.entry(key.clone()).or_default();
                conn.connected = false;
                conn.last_error = Some(message.clone());
                conn.updated_at = now;
                inner.mark_stale(key);
            }
            WorkerEvent::StaleData { key, broker } => {
                let conn = inner.connections.entry(key.clone()).or_default();
                conn.stale = true;
                conn.broker = Some(broker.clone());
                conn.updated_at = now;
                let marked = inner.mark_stale(key);
                warn!(key = %key, broker = %broker, marked, "Feed stale");
            }
            WorkerEvent::UnifiedMargin(margin) => {
                inner.margin = Some(margin.clone());
            }
            WorkerEvent::CyberPauseTriggered { reason, value } => {
                warn!(reason = %reason, value, "Trading halted");
                inner.halt = Some(HaltRecord {
                    reason: reason.clone(),
                    value: *value,
                    at: now,
                });
                for conn in inner.connections.values_mut() {
                    conn.connected = false;
                    conn.updated_at = now;
                }
                for state in inner.instruments.values_mut() {
                    state.stale = true;
                }
            }
        }
    }

    pub fn instrument(&self, token: InstrumentToken) -> Option<InstrumentState> {
        self.read(|inner| inner.instruments.get(&token).cloned())
    }

    /// Fused price when one was computed, else the last traded price
    pub fn price(&self, token: InstrumentToken) -> Option<f64> {
        self.read(|inner| inner.instruments.get(&token).and_then(|s| s.tick.display_price()))
    }

    /// Every instrument, ordered by token
    pub fn instruments(&self) -> Vec<InstrumentState> {
        self.read(|inner| {
            let mut all: Vec<InstrumentState> = inner.instruments.values().cloned().collect();
            all.sort_by_key(|s| s.tick.instrument_token);
            all
        })
    }

    pub fn connection(&self, key: &str) -> Option<ConnectionState> {
        self.read(|inner| inner.connections.get(key).cloned())
    }

    pub fn connections(&self) -> HashMap<String, ConnectionState> {
        self.read(|inner| inner.connections.clone())
    }

    pub fn halt(&self) -> Option<HaltRecord> {
        self.read(|inner| inner.halt.clone())
    }

    pub fn margin(&self) -> Option<UnifiedMargin> {
        self.read(|inner| inner.margin.clone())
    }

    /// Tick batches applied so far
    pub fn batches(&self) -> u64 {
        self.read(|inner| inner.batches)
    }

    pub fn len(&self) -> usize {
        self.read(|inner| inner.instruments.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&StoreInner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }

    /// Apply worker events until the worker's sender is dropped
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(&event);
        }
        info!(instruments = self.len(), batches = self.batches(), "Worker event stream ended");
    }
}
