//! Per-instance tick buffer between flushes

use std::collections::HashMap;

use crate::types::{InstrumentToken, Tick};

/// Latest merged tick per instrument since the last flush
#[derive(Debug, Default)]
pub struct TickBuffer {
    ticks: HashMap<InstrumentToken, Tick>,
    order: Vec<InstrumentToken>,
}

impl TickBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a tick; fields it carries replace older ones
    pub fn merge(&mut self, tick: Tick) {
        match self.ticks.get_mut(&tick.instrument_token) {
            Some(existing) => existing.merge_from(tick),
            None => {
                self.order.push(tick.instrument_token);
                self.ticks.insert(tick.instrument_token, tick);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Take everything, in first-receipt order, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<Tick> {
        let mut ticks = std::mem::take(&mut self.ticks);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|token| ticks.remove(&token))
            .collect()
    }

    pub fn clear(&mut self) {
        self.ticks.clear();
        self.order.clear();
    }
}
