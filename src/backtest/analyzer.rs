//! Analyzer role and the equity-curve analyzer.
//!
//! Analyzers observe events read-only. [`EquityCurveAnalyzer`] samples the
//! portfolio value at every MARKET_DATA and FILL timestamp inside the run
//! window (last sample per timestamp wins) and the benchmark close, and
//! reports return and risk metrics in its summary.

use crate::backtest::clock::{Nanos, NANOS_PER_DAY};
use crate::backtest::events::{Event, Topic};
use crate::backtest::router::{Context, Subscriber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Analyzer role.
pub trait Analyzer: Subscriber {}

// =============================================================================
// METRICS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub points: usize,
    pub initial_value: f64,
    pub final_value: f64,
    pub total_return: f64,
    /// Peak-to-trough as a fraction of the peak.
    pub max_drawdown: f64,
    /// `None` when the curve spans less than one whole day.
    pub annualized_return: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
}

impl PerformanceMetrics {
    /// Metrics over a time-ordered curve. `None` for an empty curve.
    pub fn from_curve(curve: &[(Nanos, f64)]) -> Option<Self> {
        let &(first_t, initial_value) = curve.first()?;
        let &(last_t, final_value) = curve.last()?;
        let values: Vec<f64> = curve.iter().map(|&(_, v)| v).collect();
        let days = (last_t - first_t) / NANOS_PER_DAY;

        let annualized_return = (days > 0 && initial_value > 0.0)
            .then(|| (final_value / initial_value).powf(365.0 / days as f64) - 1.0);
        let (sharpe_ratio, sortino_ratio) = if days > 0 && values.len() > 1 {
            let per_year = values.len() as f64 / days as f64 * 365.0;
            (
                Some(sharpe_ratio(&values, per_year)),
                Some(sortino_ratio(&values, per_year)),
            )
        } else {
            (None, None)
        };

        Some(Self {
            points: curve.len(),
            initial_value,
            final_value,
            total_return: if initial_value != 0.0 {
                final_value / initial_value - 1.0
            } else {
                0.0
            },
            max_drawdown: max_drawdown(&values),
            annualized_return,
            sharpe_ratio,
            sortino_ratio,
        })
    }
}

pub fn max_drawdown(values: &[f64]) -> f64 {
    let Some(&first) = values.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut worst: f64 = 0.0;
    for &v in values {
        peak = peak.max(v);
        if peak > 0.0 {
            worst = worst.max((peak - v) / peak);
        }
    }
    worst
}

fn period_returns(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] / w[0] - 1.0).collect()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Annualized Sharpe ratio, zero risk-free rate. 0 when returns are flat.
pub fn sharpe_ratio(values: &[f64], periods_per_year: f64) -> f64 {
    let returns = period_returns(values);
    let mu = mean(&returns);
    let std = mean(&returns.iter().map(|r| (r - mu).powi(2)).collect::<Vec<_>>()).sqrt();
    if std == 0.0 {
        return 0.0;
    }
    mu * periods_per_year.sqrt() / std
}

/// Like Sharpe, but the deviation only counts losing periods.
pub fn sortino_ratio(values: &[f64], periods_per_year: f64) -> f64 {
    let returns = period_returns(values);
    let mu = mean(&returns);
    let downside: Vec<f64> = returns.iter().map(|r| (r.min(0.0) - mu).powi(2)).collect();
    let deviation = mean(&downside).sqrt();
    if deviation == 0.0 {
        return 0.0;
    }
    mu * periods_per_year.sqrt() / deviation
}

// =============================================================================
// ANALYZER
// =============================================================================

pub struct EquityCurveAnalyzer {
    name: String,
    benchmark: Option<String>,
    values: BTreeMap<Nanos, f64>,
    benchmark_closes: BTreeMap<Nanos, f64>,
    fills: u64,
}

impl EquityCurveAnalyzer {
    pub fn new() -> Self {
        Self {
            name: "equity_curve".to_string(),
            benchmark: None,
            values: BTreeMap::new(),
            benchmark_closes: BTreeMap::new(),
            fills: 0,
        }
    }

    pub fn with_benchmark(mut self, symbol: impl Into<String>) -> Self {
        self.benchmark = Some(symbol.into());
        self
    }

    pub fn curve(&self) -> Vec<(Nanos, f64)> {
        self.values.iter().map(|(&t, &v)| (t, v)).collect()
    }

    /// Benchmark closes scaled to start at the portfolio's first value.
    pub fn benchmark_curve(&self) -> Vec<(Nanos, f64)> {
        let (Some((_, &base)), Some((_, &start))) =
            (self.benchmark_closes.iter().next(), self.values.iter().next())
        else {
            return Vec::new();
        };
        if base == 0.0 {
            return Vec::new();
        }
        self.benchmark_closes
            .iter()
            .map(|(&t, &close)| (t, close * start / base))
            .collect()
    }

    pub fn metrics(&self) -> Option<PerformanceMetrics> {
        PerformanceMetrics::from_curve(&self.curve())
    }

    pub fn benchmark_metrics(&self) -> Option<PerformanceMetrics> {
        PerformanceMetrics::from_curve(&self.benchmark_curve())
    }

    pub fn fill_count(&self) -> u64 {
        self.fills
    }
}

impl Default for EquityCurveAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber for EquityCurveAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::MarketData, Topic::Fill]
    }

    fn on_event(&mut self, event: &Event, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        let t = event.timestamp();
        if !ctx.window().contains(t) {
            return Ok(());
        }
        match event {
            Event::MarketData(bar) => {
                if self.benchmark.as_deref() == Some(bar.symbol.as_str()) {
                    self.benchmark_closes.insert(t, bar.close);
                }
            }
            Event::Fill(_) => self.fills += 1,
            _ => return Ok(()),
        }
        let value = ctx.portfolio().portfolio_value(t)?;
        self.values.insert(t, value);
        Ok(())
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "fills": self.fills,
            "metrics": self.metrics(),
            "benchmark": self.benchmark,
            "benchmark_metrics": self.benchmark_metrics(),
        }))
    }
}

impl Analyzer for EquityCurveAnalyzer {}
