//! Backtest configuration
//!
//! Run parameters loaded from TOML. Every field has a default so a config
//! file only needs the universe and the strategies.

use crate::backtest::broker::ExecutionConfig;
use crate::backtest::clock::{parse_timestamp, Nanos};
use crate::backtest::csv_feed::CsvColumns;
use crate::backtest::error::BacktestError;
use crate::backtest::router::RunWindow;
use crate::backtest::slippage::SlippageConfig;
use crate::backtest::strategy::StrategyConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Starting cash balance.
    pub initial_cash: f64,

    /// Leverage factor applied to portfolio value for buying power.
    pub margin_ratio: f64,

    /// Traded symbols, in stream registration order.
    pub symbols: Vec<String>,

    /// Benchmark symbol; streamed and priced but not traded by default.
    pub benchmark: Option<String>,

    /// First timestamp requested from the feed (RFC3339 or YYYY-MM-DD).
    /// Defaults to `backtest_start`.
    pub data_start: Option<String>,

    pub backtest_start: Option<String>,

    pub backtest_end: Option<String>,

    pub execution: ExecutionConfig,

    pub strategies: Vec<StrategyConfig>,

    /// Stop after this many dispatched queue events (0 = unlimited).
    pub max_events: u64,

    /// Column names for CSV input.
    pub csv: CsvColumns,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_cash: 100_000.0,
            margin_ratio: 1.0,
            symbols: Vec::new(),
            benchmark: None,
            data_start: None,
            backtest_start: None,
            backtest_end: None,
            execution: ExecutionConfig::default(),
            strategies: Vec::new(),
            max_events: 0,
            csv: CsvColumns::default(),
        }
    }
}

impl BacktestConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Symbols to stream: the configured universe plus the benchmark,
    /// duplicates removed, order preserved.
    pub fn universe(&self) -> Vec<String> {
        let mut universe: Vec<String> = Vec::with_capacity(self.symbols.len() + 1);
        for symbol in self.symbols.iter().chain(self.benchmark.iter()) {
            if !universe.contains(symbol) {
                universe.push(symbol.clone());
            }
        }
        universe
    }

    /// Parsed run window.
    pub fn window(&self) -> Result<RunWindow, BacktestError> {
        let parse = |field: &str, value: &Option<String>| -> Result<Option<Nanos>, BacktestError> {
            value
                .as_deref()
                .map(|raw| {
                    parse_timestamp(raw).ok_or_else(|| {
                        BacktestError::configuration(format!("{field}: cannot parse '{raw}'"))
                    })
                })
                .transpose()
        };
        Ok(RunWindow {
            data_start: parse("data_start", &self.data_start)?,
            start: parse("backtest_start", &self.backtest_start)?,
            end: parse("backtest_end", &self.backtest_end)?,
        })
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        if !self.initial_cash.is_finite() || self.initial_cash <= 0.0 {
            return Err(BacktestError::configuration(format!(
                "initial_cash must be positive, got {}",
                self.initial_cash
            )));
        }
        if !self.margin_ratio.is_finite() || self.margin_ratio <= 0.0 {
            return Err(BacktestError::configuration(format!(
                "margin_ratio must be positive, got {}",
                self.margin_ratio
            )));
        }
        if self.universe().is_empty() {
            return Err(BacktestError::configuration("no symbols configured"));
        }

        let commission = self.execution.commission.parameter();
        if !commission.is_finite() || commission < 0.0 {
            return Err(BacktestError::configuration(format!(
                "commission parameter must be non-negative, got {commission}"
            )));
        }
        if let SlippageConfig::FixedBps { bps } = self.execution.slippage {
            if !bps.is_finite() || bps < 0.0 {
                return Err(BacktestError::configuration(format!(
                    "slippage bps must be non-negative, got {bps}"
                )));
            }
        }

        let window = self.window()?;
        if let (Some(start), Some(end)) = (window.start, window.end) {
            if start > end {
                return Err(BacktestError::configuration("backtest_start is after backtest_end"));
            }
        }
        if let (Some(data_start), Some(start)) = (window.data_start, window.start) {
            if data_start > start {
                return Err(BacktestError::configuration("data_start is after backtest_start"));
            }
        }

        let universe = self.universe();
        for strategy in &self.strategies {
            let StrategyConfig::BuyAndHold { symbol, target_weight } = strategy;
            if !universe.contains(symbol) {
                return Err(BacktestError::configuration(format!(
                    "strategy symbol {symbol} is not in the universe"
                )));
            }
            if !target_weight.is_finite() || *target_weight < 0.0 {
                return Err(BacktestError::configuration(format!(
                    "target_weight for {symbol} must be non-negative, got {target_weight}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::broker::LimitOrderExpiry;
    use crate::backtest::fees::CommissionConfig;

    const SAMPLE: &str = r#"
        initial_cash = 50000.0
        symbols = ["AAPL", "MSFT"]
        benchmark = "SPY"
        backtest_start = "2024-01-02"
        backtest_end = "2024-12-31T00:00:00Z"

        [execution]
        limit_order_expiry = "persist_unfilled"
        slippage = { type = "fixed_bps", bps = 5.0 }
        commission = { type = "per_share", rate = 0.01 }

        [[strategies]]
        type = "buy_and_hold"
        symbol = "AAPL"
        target_weight = 1.0
    "#;

    #[test]
    fn test_defaults() {
        let config: BacktestConfig = toml::from_str("").unwrap();
        assert_eq!(config.initial_cash, 100_000.0);
        assert_eq!(config.margin_ratio, 1.0);
        assert_eq!(config.max_events, 0);
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_parse_sample() {
        let config: BacktestConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.initial_cash, 50_000.0);
        assert_eq!(config.universe(), vec!["AAPL", "MSFT", "SPY"]);
        assert_eq!(config.execution.commission, CommissionConfig::PerShare { rate: 0.01 });
        assert_eq!(config.execution.limit_order_expiry, LimitOrderExpiry::PersistUnfilled);
        config.validate().unwrap();

        let window = config.window().unwrap();
        assert!(window.start.unwrap() < window.end.unwrap());
        assert_eq!(window.feed_start(), window.start);
    }

    #[test]
    fn test_validation_failures() {
        let base: BacktestConfig = toml::from_str(SAMPLE).unwrap();

        let mut c = base.clone();
        c.margin_ratio = 0.0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.backtest_start = Some("2025-01-01".into());
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.backtest_end = Some("not a date".into());
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.execution.commission = CommissionConfig::Fixed { amount: -1.0 };
        assert!(c.validate().is_err());

        let mut c = base;
        c.strategies = vec![StrategyConfig::BuyAndHold {
            symbol: "TSLA".into(),
            target_weight: 1.0,
        }];
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_universe_dedupes_benchmark() {
        let config = BacktestConfig {
            symbols: vec!["SPY".into(), "AAPL".into()],
            benchmark: Some("SPY".into()),
            ..Default::default()
        };
        assert_eq!(config.universe(), vec!["SPY", "AAPL"]);
    }

    #[test]
    fn test_save_and_load() {
        let config: BacktestConfig = toml::from_str(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backtest.toml");
        config.save(&path).unwrap();
        assert_eq!(BacktestConfig::load(&path).unwrap(), config);
    }
}
