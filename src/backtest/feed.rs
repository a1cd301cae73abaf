//! Market Data Feed
//!
//! Source of per-symbol bar streams. The driver asks for one stream per
//! symbol of the universe before the loop starts and merges them lazily.
//! Each stream must be timestamp-ascending; that is the feed's obligation.

use crate::backtest::clock::Nanos;
use crate::backtest::events::{MarketDataEvent, Price};
use crate::backtest::queue::BarStream;
use std::collections::HashMap;

pub trait DataFeed {
    /// Feed identifier for logging/diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }

    /// Lazy, timestamp-ascending bars of `symbol` with `start <= ts <= end`
    /// (open bounds when `None`). Not restartable: the driver calls this once
    /// per symbol per run.
    fn stream(&self, symbol: &str, start: Option<Nanos>, end: Option<Nanos>) -> anyhow::Result<BarStream>;
}

#[inline]
pub(crate) fn in_range(t: Nanos, start: Option<Nanos>, end: Option<Nanos>) -> bool {
    start.map_or(true, |s| t >= s) && end.map_or(true, |e| t <= e)
}

/// A feed backed by in-memory bars.
pub struct VecFeed {
    name: String,
    bars: HashMap<String, Vec<MarketDataEvent>>,
}

impl VecFeed {
    pub fn new(name: impl Into<String>, bars: Vec<MarketDataEvent>) -> Self {
        let mut by_symbol: HashMap<String, Vec<MarketDataEvent>> = HashMap::new();
        for bar in bars {
            by_symbol.entry(bar.symbol.clone()).or_default().push(bar);
        }
        // Stable: equal timestamps keep their input order.
        for series in by_symbol.values_mut() {
            series.sort_by_key(|b| b.timestamp);
        }
        Self {
            name: name.into(),
            bars: by_symbol,
        }
    }

    /// Flat bars from `(timestamp, close)` pairs.
    pub fn from_closes(symbol: &str, closes: &[(Nanos, Price)]) -> Self {
        let bars = closes
            .iter()
            .map(|&(t, close)| MarketDataEvent::flat(t, symbol, close))
            .collect();
        Self::new(symbol, bars)
    }

    /// Add bars of another symbol.
    pub fn with_closes(mut self, symbol: &str, closes: &[(Nanos, Price)]) -> Self {
        let series = self.bars.entry(symbol.to_string()).or_default();
        series.extend(closes.iter().map(|&(t, close)| MarketDataEvent::flat(t, symbol, close)));
        series.sort_by_key(|b| b.timestamp);
        self
    }

    pub fn len(&self) -> usize {
        self.bars.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self.bars.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        symbols
    }
}

impl DataFeed for VecFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self, symbol: &str, start: Option<Nanos>, end: Option<Nanos>) -> anyhow::Result<BarStream> {
        let bars: Vec<MarketDataEvent> = self
            .bars
            .get(symbol)
            .map(|series| {
                series
                    .iter()
                    .filter(|b| in_range(b.timestamp, start, end))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if bars.is_empty() {
            tracing::warn!(feed = %self.name, symbol, "no bars for symbol in requested range");
        }
        Ok(Box::new(bars.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_feed_sorts_and_filters() {
        let feed = VecFeed::from_closes("AAPL", &[(30, 3.0), (10, 1.0), (20, 2.0)])
            .with_closes("MSFT", &[(15, 5.0)]);
        assert_eq!(feed.len(), 4);
        assert_eq!(feed.symbols(), vec!["AAPL", "MSFT"]);

        let times: Vec<Nanos> = feed
            .stream("AAPL", Some(15), Some(30))
            .unwrap()
            .map(|b| b.unwrap().timestamp)
            .collect();
        assert_eq!(times, vec![20, 30]);
    }

    #[test]
    fn test_unknown_symbol_is_empty_stream() {
        let feed = VecFeed::new("empty", Vec::new());
        assert!(feed.is_empty());
        assert_eq!(feed.stream("TSLA", None, None).unwrap().count(), 0);
    }
}
