//! Close-price history per symbol.
//!
//! Filled as bars are pulled from the feed streams, including the one-bar
//! look-ahead the merger holds per symbol. Lookups are "at or after": the
//! first recorded close whose timestamp is >= the requested time.

use crate::backtest::clock::Nanos;
use crate::backtest::error::NoPriceDataError;
use crate::backtest::events::{MarketDataEvent, Price};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    closes: HashMap<String, Vec<(Nanos, Price)>>,
    timestamps: BTreeSet<Nanos>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bar. Bars for one symbol are expected in ascending order; an
    /// out-of-order bar is inserted at its sorted position.
    pub fn record(&mut self, bar: &MarketDataEvent) {
        self.record_close(&bar.symbol, bar.timestamp, bar.close);
    }

    pub fn record_close(&mut self, symbol: &str, timestamp: Nanos, close: Price) {
        let series = self.closes.entry(symbol.to_string()).or_default();
        match series.last() {
            Some(&(last, _)) if timestamp < last => {
                let idx = series.partition_point(|&(t, _)| t <= timestamp);
                series.insert(idx, (timestamp, close));
            }
            _ => series.push((timestamp, close)),
        }
        self.timestamps.insert(timestamp);
    }

    /// Close of the first bar at or after `timestamp`.
    pub fn price_at_or_after(&self, symbol: &str, timestamp: Nanos) -> Result<Price, NoPriceDataError> {
        self.closes
            .get(symbol)
            .and_then(|series| {
                let idx = series.partition_point(|&(t, _)| t < timestamp);
                series.get(idx).map(|&(_, price)| price)
            })
            .ok_or_else(|| NoPriceDataError::new(symbol, timestamp))
    }

    /// Most recent close at or before `timestamp`, if any.
    pub fn price_at_or_before(&self, symbol: &str, timestamp: Nanos) -> Option<Price> {
        let series = self.closes.get(symbol)?;
        let idx = series.partition_point(|&(t, _)| t <= timestamp);
        idx.checked_sub(1).map(|i| series[i].1)
    }

    /// Every distinct bar timestamp recorded so far, ascending.
    pub fn timestamps(&self) -> impl Iterator<Item = Nanos> + '_ {
        self.timestamps.iter().copied()
    }

    pub fn bar_count(&self, symbol: &str) -> usize {
        self.closes.get(symbol).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> PriceHistory {
        let mut h = PriceHistory::new();
        h.record(&MarketDataEvent::flat(10, "AAPL", 100.0));
        h.record(&MarketDataEvent::flat(20, "AAPL", 110.0));
        h.record(&MarketDataEvent::flat(15, "MSFT", 50.0));
        h
    }

    #[test]
    fn test_at_or_after() {
        let h = history();
        assert_eq!(h.price_at_or_after("AAPL", 10).unwrap(), 100.0);
        assert_eq!(h.price_at_or_after("AAPL", 11).unwrap(), 110.0);
        assert_eq!(h.price_at_or_after("AAPL", 0).unwrap(), 100.0);
        assert_eq!(
            h.price_at_or_after("AAPL", 21).unwrap_err(),
            NoPriceDataError::new("AAPL", 21)
        );
        assert!(h.price_at_or_after("TSLA", 0).is_err());
    }

    #[test]
    fn test_at_or_before() {
        let h = history();
        assert_eq!(h.price_at_or_before("AAPL", 19), Some(100.0));
        assert_eq!(h.price_at_or_before("AAPL", 20), Some(110.0));
        assert_eq!(h.price_at_or_before("AAPL", 9), None);
    }

    #[test]
    fn test_out_of_order_insert_keeps_series_sorted() {
        let mut h = history();
        h.record_close("AAPL", 15, 105.0);
        assert_eq!(h.price_at_or_after("AAPL", 11).unwrap(), 105.0);
        assert_eq!(h.timestamps().collect::<Vec<_>>(), vec![10, 15, 20]);
        assert_eq!(h.bar_count("AAPL"), 3);
    }
}
