//! Indicators - bounded price history and EMA per symbol

use std::collections::{HashMap, VecDeque};

/// EMA over a price slice, seeded with the first value
pub fn ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[0];
    for p in prices.iter().skip(1) {
        ema = (p - ema) * multiplier + ema;
    }
    Some(ema)
}

/// Capped price history for one symbol
#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    prices: VecDeque<f64>,
    cap: usize,
}

impl IndicatorSeries {
    pub fn new(cap: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(cap.min(1024)),
            cap: cap.max(1),
        }
    }

    /// Append a price, evicting the oldest past the cap
    pub fn push(&mut self, price: f64) {
        self.prices.push_back(price);
        while self.prices.len() > self.cap {
            self.prices.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    /// EMA over the whole retained window, recomputed from the oldest point
    pub fn ema(&self, period: usize) -> Option<f64> {
        let (head, tail) = self.prices.as_slices();
        if tail.is_empty() {
            return ema(head, period);
        }
        let window: Vec<f64> = self.prices.iter().copied().collect();
        ema(&window, period)
    }
}

/// History for every symbol seen
#[derive(Debug, Clone)]
pub struct IndicatorBook {
    series: HashMap<String, IndicatorSeries>,
    cap: usize,
    period: usize,
}

impl IndicatorBook {
    pub fn new(cap: usize, period: usize) -> Self {
        Self {
            series: HashMap::new(),
            cap,
            period,
        }
    }

    /// Record a price and return the symbol's current EMA
    pub fn push(&mut self, symbol: &str, price: f64) -> Option<f64> {
        let cap = self.cap;
        let series = self
            .series
            .entry(symbol.to_string())
            .or_insert_with(|| IndicatorSeries::new(cap));
        series.push(price);
        series.ema(self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_needs_a_full_period() {
        assert_eq!(ema(&[1.0, 2.0], 3), None);
        assert_eq!(ema(&[1.0, 2.0, 3.0], 0), None);
    }

    #[test]
    fn test_ema_seeded_from_oldest() {
        // k = 0.5: 10 -> 15 -> 17.5
        let value = ema(&[10.0, 20.0, 20.0], 3).expect("three points");
        assert!((value - 17.5).abs() < 1e-9, "got {value}");
    }

    #[test]
    fn test_series_is_capped() {
        let mut series = IndicatorSeries::new(500);
        for i in 0..600 {
            series.push(i as f64);
        }
        assert_eq!(series.len(), 500);
        assert_eq!(series.last(), Some(599.0));

        // Oldest retained point is 100, so the EMA must sit above it
        let value = series.ema(20).expect("window is full");
        assert!(value > 100.0 && value < 599.0);
    }

    #[test]
    fn test_constant_prices_have_constant_ema() {
        let mut book = IndicatorBook::new(500, 5);
        let mut last = None;
        for _ in 0..10 {
            last = book.push("NIFTY", 42.0);
        }
        assert_eq!(last, Some(42.0));
        assert_eq!(book.push("OTHER", 1.0), None);
    }
}
