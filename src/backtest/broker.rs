//! Execution Engine
//!
//! Simulated broker. Consumes ORDER events, validates them against the
//! ledger's read surface, prices them through the slippage and commission
//! policies and publishes a FILL in immediate mode, so the ledger has applied
//! it before any later market data is dispatched.
//!
//! Per-order state machine: `Received -> Validated -> {Rejected | Filled}`.
//! Fills are atomic. A limit order that is not yet marketable stands between
//! `Validated` (static checks) and the final state; buying power and position
//! are checked again when it triggers.
//!
//! Rejections are non-fatal: they are reported as diagnostics and the run
//! continues. A missing price for a market order is fatal.

use crate::backtest::clock::{format_nanos, Nanos};
use crate::backtest::error::{NoPriceDataError, ValidationError};
use crate::backtest::events::{
    Event, FillEvent, MarketDataEvent, OrderEvent, OrderKind, Price, Side, Topic,
};
use crate::backtest::fees::{CommissionConfig, CommissionModel};
use crate::backtest::portfolio::{PortfolioView, QTY_EPSILON};
use crate::backtest::router::{Context, DiagnosticKind, PublishMode, Subscriber};
use crate::backtest::slippage::{SlippageConfig, SlippageModel};
use serde::{Deserialize, Serialize};

/// Tolerance for the buying-power comparison.
const CASH_EPSILON: f64 = 1e-9;

/// Broker role. Exactly one broker must be registered for a run.
pub trait Broker: Subscriber {}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// What happens to standing limit orders when the input is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitOrderExpiry {
    /// Drop them and report each as expired.
    #[default]
    ExpireAtEnd,
    /// Keep them and report each as open.
    PersistUnfilled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub slippage: SlippageConfig,
    pub commission: CommissionConfig,
    pub limit_order_expiry: LimitOrderExpiry,
}

// =============================================================================
// ORDER STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Received,
    Validated,
    Rejected,
    Filled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub orders_received: u64,
    pub orders_filled: u64,
    pub orders_rejected: u64,
    pub limit_orders_expired: u64,
    pub total_commission: f64,
    pub total_slippage: f64,
}

/// Static checks that need no market state.
pub fn check_order(order: &OrderEvent) -> Result<(), ValidationError> {
    if !order.quantity.is_finite() || order.quantity <= 0.0 {
        return Err(ValidationError::InvalidQuantity(order.quantity));
    }
    if order.kind == OrderKind::Limit {
        match order.limit_price {
            None => return Err(ValidationError::MissingLimitPrice),
            Some(p) if !p.is_finite() || p <= 0.0 => return Err(ValidationError::InvalidPrice(p)),
            Some(_) => {}
        }
    }
    Ok(())
}

/// Whether a standing limit order is marketable at `close`.
#[inline]
fn crosses(side: Side, limit: Price, close: Price) -> bool {
    match side {
        Side::Buy => close <= limit,
        Side::Sell => close >= limit,
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ExecutionEngine {
    name: String,
    slippage: Box<dyn SlippageModel>,
    commission: Box<dyn CommissionModel>,
    expiry: LimitOrderExpiry,
    /// Standing limit orders in arrival order.
    standing: Vec<OrderEvent>,
    expired: Vec<OrderEvent>,
    stats: ExecutionStats,
}

impl ExecutionEngine {
    pub fn new(slippage: Box<dyn SlippageModel>, commission: Box<dyn CommissionModel>) -> Self {
        Self {
            name: "broker".to_string(),
            slippage,
            commission,
            expiry: LimitOrderExpiry::default(),
            standing: Vec::new(),
            expired: Vec::new(),
            stats: ExecutionStats::default(),
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.slippage.build(), config.commission.build())
            .with_expiry(config.limit_order_expiry)
    }

    pub fn with_expiry(mut self, expiry: LimitOrderExpiry) -> Self {
        self.expiry = expiry;
        self
    }

    fn on_order(&mut self, order: &OrderEvent, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        self.stats.orders_received += 1;
        tracing::debug!(
            symbol = %order.symbol,
            side = ?order.side,
            qty = order.quantity,
            kind = ?order.kind,
            state = ?OrderState::Received,
            "order"
        );

        if let Err(reason) = check_order(order) {
            self.reject(order, order.timestamp, reason, ctx);
            return Ok(());
        }

        match order.kind {
            OrderKind::Market => {
                let base = ctx.prices().price_at_or_after(&order.symbol, order.timestamp)?;
                self.execute(order, order.timestamp, base, None, ctx)
            }
            OrderKind::Limit => {
                tracing::debug!(
                    symbol = %order.symbol,
                    limit = ?order.limit_price,
                    "limit order standing"
                );
                self.standing.push(order.clone());
                Ok(())
            }
        }
    }

    /// Trigger standing limit orders for `bar.symbol` placed strictly before
    /// the bar.
    fn on_bar(&mut self, bar: &MarketDataEvent, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        let mut i = 0;
        while i < self.standing.len() {
            let order = &self.standing[i];
            let marketable = order.symbol == bar.symbol
                && bar.timestamp > order.timestamp
                && order
                    .limit_price
                    .is_some_and(|limit| crosses(order.side, limit, bar.close));
            if !marketable {
                i += 1;
                continue;
            }
            let order = self.standing.remove(i);
            self.execute(&order, bar.timestamp, bar.close, order.limit_price, ctx)?;
        }
        Ok(())
    }

    /// Price, validate and fill one order at time `t`.
    fn execute(
        &mut self,
        order: &OrderEvent,
        t: Nanos,
        base: Price,
        limit: Option<Price>,
        ctx: &mut Context<'_>,
    ) -> anyhow::Result<()> {
        let mut price = self.slippage.adjust(order.side, base);
        if let Some(limit) = limit {
            price = match order.side {
                Side::Buy => price.min(limit),
                Side::Sell => price.max(limit),
            };
        }
        let commission = self.commission.commission(order.quantity, price);

        let verdict = self.validate(order, t, price, commission, &ctx.portfolio())?;
        if let Err(reason) = verdict {
            self.reject(order, t, reason, ctx);
            return Ok(());
        }

        let fill = FillEvent {
            timestamp: t,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            fill_price: price,
            commission,
            slippage_cost: (price - base).abs() * order.quantity,
        };
        self.stats.orders_filled += 1;
        self.stats.total_commission += fill.commission;
        self.stats.total_slippage += fill.slippage_cost;
        tracing::debug!(
            symbol = %fill.symbol,
            side = ?fill.side,
            qty = fill.quantity,
            price = fill.fill_price,
            commission = fill.commission,
            state = ?OrderState::Filled,
            "order filled"
        );
        ctx.publish(fill, PublishMode::Immediate)
    }

    /// Ledger-dependent checks. The outer error is fatal, the inner one is a
    /// rejection.
    fn validate(
        &self,
        order: &OrderEvent,
        t: Nanos,
        price: Price,
        commission: f64,
        portfolio: &PortfolioView<'_>,
    ) -> Result<Result<(), ValidationError>, NoPriceDataError> {
        match order.side {
            Side::Buy => {
                let required = order.quantity * price + commission;
                let available = portfolio.buying_power(portfolio.margin_ratio(), t)?;
                if required > available + CASH_EPSILON {
                    return Ok(Err(ValidationError::InsufficientBuyingPower { required, available }));
                }
            }
            Side::Sell => {
                let held = portfolio.quantity(&order.symbol);
                if order.quantity > held + QTY_EPSILON {
                    return Ok(Err(ValidationError::InsufficientPosition {
                        requested: order.quantity,
                        held,
                    }));
                }
            }
        }
        Ok(Ok(()))
    }

    fn reject(&mut self, order: &OrderEvent, t: Nanos, reason: ValidationError, ctx: &mut Context<'_>) {
        self.stats.orders_rejected += 1;
        tracing::warn!(
            symbol = %order.symbol,
            side = ?order.side,
            qty = order.quantity,
            ts = %format_nanos(t),
            %reason,
            "order rejected"
        );
        ctx.report(t, DiagnosticKind::OrderRejected, reason.to_string(), Some(order.clone()));
    }
}

impl Subscriber for ExecutionEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::MarketData, Topic::Order]
    }

    fn on_event(&mut self, event: &Event, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        match event {
            Event::MarketData(bar) if !self.standing.is_empty() => self.on_bar(bar, ctx),
            Event::Order(order) => self.on_order(order, ctx),
            _ => Ok(()),
        }
    }

    fn on_finish(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        let now = ctx.now();
        match self.expiry {
            LimitOrderExpiry::ExpireAtEnd => {
                for order in self.standing.drain(..) {
                    tracing::warn!(
                        symbol = %order.symbol,
                        side = ?order.side,
                        limit = ?order.limit_price,
                        "limit order expired unfilled"
                    );
                    let msg = format!("limit order for {} {} expired", order.quantity, order.symbol);
                    ctx.report(now, DiagnosticKind::LimitOrderExpired, msg, Some(order.clone()));
                    self.stats.limit_orders_expired += 1;
                    self.expired.push(order);
                }
            }
            LimitOrderExpiry::PersistUnfilled => {
                for order in &self.standing {
                    let msg = format!("limit order for {} {} still open", order.quantity, order.symbol);
                    ctx.report(now, DiagnosticKind::LimitOrderOpen, msg, Some(order.clone()));
                }
            }
        }
        Ok(())
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "slippage": self.slippage.name(),
            "commission": self.commission.name(),
            "stats": self.stats,
            "open_orders": self.standing,
            "expired_orders": self.expired,
        }))
    }
}

impl Broker for ExecutionEngine {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_order() {
        assert!(check_order(&OrderEvent::market(0, "AAPL", Side::Buy, 1.0)).is_ok());
        assert_eq!(
            check_order(&OrderEvent::market(0, "AAPL", Side::Buy, 0.0)),
            Err(ValidationError::InvalidQuantity(0.0))
        );
        let mut limit = OrderEvent::limit(0, "AAPL", Side::Sell, 1.0, 10.0);
        assert!(check_order(&limit).is_ok());
        limit.limit_price = None;
        assert_eq!(check_order(&limit), Err(ValidationError::MissingLimitPrice));
        limit.limit_price = Some(-1.0);
        assert_eq!(check_order(&limit), Err(ValidationError::InvalidPrice(-1.0)));
    }

    #[test]
    fn test_crosses() {
        assert!(crosses(Side::Buy, 100.0, 99.0));
        assert!(crosses(Side::Buy, 100.0, 100.0));
        assert!(!crosses(Side::Buy, 100.0, 100.5));
        assert!(crosses(Side::Sell, 100.0, 101.0));
        assert!(!crosses(Side::Sell, 100.0, 99.0));
    }

    #[test]
    fn test_execution_config_defaults() {
        let cfg: ExecutionConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, ExecutionConfig::default());
        assert_eq!(cfg.limit_order_expiry, LimitOrderExpiry::ExpireAtEnd);
    }
}
