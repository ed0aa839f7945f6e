//! Fusion - combines one instrument's price across brokers
//!
//! Each broker's latest raw price is kept per symbol; the fused price is the
//! median of the reporters, which ignores a single broker quoting far off the
//! others.

use std::collections::HashMap;

/// Latest raw price per symbol per broker
#[derive(Debug, Clone, Default)]
pub struct FusionTable {
    prices: HashMap<String, HashMap<String, f64>>,
}

impl FusionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a broker's price and return the recomputed fused price
    pub fn update(&mut self, symbol: &str, broker: &str, price: f64) -> Option<f64> {
        if !price.is_finite() {
            return self.fused(symbol);
        }
        self.prices
            .entry(symbol.to_string())
            .or_default()
            .insert(broker.to_string(), price);
        self.fused(symbol)
    }

    /// Median of the latest price from each reporting broker
    pub fn fused(&self, symbol: &str) -> Option<f64> {
        let reporters = self.prices.get(symbol)?;
        let mut values: Vec<f64> = reporters.values().copied().collect();
        median(&mut values)
    }

    /// Brokers currently reporting a symbol
    pub fn reporters(&self, symbol: &str) -> usize {
        self.prices.get(symbol).map(HashMap::len).unwrap_or(0)
    }

    /// Forget one broker everywhere (its feed went away)
    pub fn remove_broker(&mut self, broker: &str) {
        for reporters in self.prices.values_mut() {
            reporters.remove(broker);
        }
        self.prices.retain(|_, reporters| !reporters.is_empty());
    }
}

/// Median; mean of the two middle values for an even count
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
