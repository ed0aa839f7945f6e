//! Risk controls - loss-limit circuit breaker and unified margin
//!
//! Implements:
//! - Mark-to-market loss floor (one-way halt)
//! - Per-session trade count limit
//! - Cross-broker margin aggregation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::RiskConfig;

/// Process-wide limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLimits {
    /// P&L floor; a mark-to-market at or below this trips the breaker
    pub max_loss: f64,
    /// Trades allowed before the breaker trips
    pub max_trades: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_loss: -5000.0,
            max_trades: 100,
        }
    }
}

impl From<&RiskConfig> for RiskLimits {
    fn from(cfg: &RiskConfig) -> Self {
        Self {
            max_loss: cfg.max_loss,
            max_trades: cfg.max_trades,
        }
    }
}

/// Why the breaker tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    MaxLoss,
    MaxTrades,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::MaxLoss => write!(f, "MAX_LOSS"),
            HaltReason::MaxTrades => write!(f, "MAX_TRADES"),
        }
    }
}

/// A breach that just tripped the breaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trip {
    pub reason: HaltReason,
    /// Offending P&L or trade count
    pub value: f64,
}

/// One-way halt switch. Once tripped it stays tripped until `reset`.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    limits: RiskLimits,
    halted: Option<Trip>,
    trades: u32,
}

impl CircuitBreaker {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            halted: None,
            trades: 0,
        }
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: RiskLimits) {
        self.limits = limits;
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<Trip> {
        self.halted
    }

    pub fn trades(&self) -> u32 {
        self.trades
    }

    /// Check a mark-to-market P&L. Returns the trip only on the transition.
    pub fn check_mtm(&mut self, pnl: f64) -> Option<Trip> {
        if pnl <= self.limits.max_loss {
            return self.trip(HaltReason::MaxLoss, pnl);
        }
        None
    }

    /// Count one executed trade. Returns the trip only on the transition.
    pub fn record_trade(&mut self) -> Option<Trip> {
        self.trades = self.trades.saturating_add(1);
        if self.trades > self.limits.max_trades {
            return self.trip(HaltReason::MaxTrades, self.trades as f64);
        }
        None
    }

    fn trip(&mut self, reason: HaltReason, value: f64) -> Option<Trip> {
        if self.halted.is_some() {
            return None;
        }
        let trip = Trip { reason, value };
        self.halted = Some(trip);
        tracing::error!(reason = %reason, value = value, "🛑 Circuit breaker tripped");
        Some(trip)
    }

    /// Clear the halt and the session trade count
    pub fn reset(&mut self) {
        if self.halted.take().is_some() {
            tracing::warn!("Circuit breaker reset");
        }
        self.trades = 0;
    }
}

/// Margin reported by one broker
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BrokerMargin {
    pub available: f64,
    pub utilised: f64,
}

/// Margin across every broker
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnifiedMargin {
    #[serde(rename = "totalAvailable")]
    pub total_available: f64,
    #[serde(rename = "totalUtilised")]
    pub total_utilised: f64,
    pub brokers: BTreeMap<String, BrokerMargin>,
}

/// Latest margin per broker
#[derive(Debug, Clone, Default)]
pub struct MarginBook {
    brokers: BTreeMap<String, BrokerMargin>,
}

impl MarginBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one broker's figures and return the recomputed totals
    pub fn update(&mut self, broker: &str, available: f64, utilised: f64) -> UnifiedMargin {
        self.brokers
            .insert(broker.to_string(), BrokerMargin { available, utilised });
        self.unified()
    }

    pub fn unified(&self) -> UnifiedMargin {
        UnifiedMargin {
            total_available: self.brokers.values().map(|m| m.available).sum(),
            total_utilised: self.brokers.values().map(|m| m.utilised).sum(),
            brokers: self.brokers.clone(),
        }
    }
}
