//! Strategy role and the reference buy-and-hold strategy.
//!
//! Strategies react to MARKET_DATA (and optionally PORTFOLIO_UPDATE) by
//! publishing ORDER events through the [`Context`]. They read the ledger only
//! through `ctx.portfolio()` and must not read wall-clock time; use
//! `ctx.now()` or the event timestamp.

use crate::backtest::broker::ExecutionConfig;
use crate::backtest::events::{Event, MarketDataEvent, OrderEvent, Side, Topic};
use crate::backtest::fees::{CommissionModel, NoCommission};
use crate::backtest::router::{Context, PublishMode, Subscriber};
use crate::backtest::slippage::{NoSlippage, SlippageModel};
use serde::{Deserialize, Serialize};

/// Strategy role.
pub trait Strategy: Subscriber {}

/// Serializable strategy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    BuyAndHold { symbol: String, target_weight: f64 },
}

impl StrategyConfig {
    pub fn build(&self) -> BuyAndHold {
        match self {
            StrategyConfig::BuyAndHold {
                symbol,
                target_weight,
            } => BuyAndHold::new(symbol.clone(), *target_weight),
        }
    }
}

/// Keeps `target_weight` of portfolio value in one symbol, rebalancing with
/// market orders on every bar of that symbol inside the run window.
///
/// Buys are sized against the broker's expected fill price and commission so
/// that the order stays within both the target and the buying power.
pub struct BuyAndHold {
    name: String,
    symbol: String,
    target_weight: f64,
    /// Rebalances smaller than this notional are skipped.
    min_trade_value: f64,
    slippage: Box<dyn SlippageModel>,
    commission: Box<dyn CommissionModel>,
    orders_sent: u64,
}

impl BuyAndHold {
    pub fn new(symbol: impl Into<String>, target_weight: f64) -> Self {
        let symbol = symbol.into();
        Self {
            name: format!("buy_and_hold:{symbol}"),
            symbol,
            target_weight,
            min_trade_value: 0.01,
            slippage: Box::new(NoSlippage),
            commission: Box::new(NoCommission),
            orders_sent: 0,
        }
    }

    /// Size buys with the same cost policies the broker will apply.
    pub fn with_costs(mut self, execution: &ExecutionConfig) -> Self {
        self.slippage = execution.slippage.build();
        self.commission = execution.commission.build();
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn target_weight(&self) -> f64 {
        self.target_weight
    }

    fn on_bar(&mut self, bar: &MarketDataEvent, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        if bar.symbol != self.symbol || !ctx.window().contains(bar.timestamp) {
            return Ok(());
        }

        let (portfolio_value, position_value, buying_power) = {
            let portfolio = ctx.portfolio();
            (
                portfolio.portfolio_value(bar.timestamp)?,
                portfolio.position_value(&self.symbol, bar.timestamp)?,
                portfolio.buying_power(portfolio.margin_ratio(), bar.timestamp)?,
            )
        };
        let diff = portfolio_value * self.target_weight - position_value;
        if diff.abs() < self.min_trade_value {
            return Ok(());
        }

        let (side, qty) = if diff > 0.0 {
            let price = self.slippage.adjust(Side::Buy, bar.close);
            let budget = diff.min(buying_power);
            (Side::Buy, self.commission.affordable_quantity(budget, price))
        } else {
            (Side::Sell, -diff / bar.close)
        };
        if qty * bar.close < self.min_trade_value {
            tracing::debug!(symbol = %self.symbol, diff, buying_power, "rebalance skipped, nothing affordable");
            return Ok(());
        }

        tracing::debug!(
            symbol = %self.symbol,
            ?side,
            qty,
            portfolio_value,
            "rebalance"
        );
        self.orders_sent += 1;
        ctx.publish(
            OrderEvent::market(bar.timestamp, self.symbol.clone(), side, qty),
            PublishMode::Immediate,
        )
    }
}

impl Subscriber for BuyAndHold {
    fn name(&self) -> &str {
        &self.name
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::MarketData]
    }

    fn on_event(&mut self, event: &Event, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        match event {
            Event::MarketData(bar) => self.on_bar(bar, ctx),
            _ => Ok(()),
        }
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "symbol": self.symbol,
            "target_weight": self.target_weight,
            "orders_sent": self.orders_sent,
        }))
    }
}

impl Strategy for BuyAndHold {}
