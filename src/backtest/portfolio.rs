//! Portfolio Ledger
//!
//! Cash, positions and realized P&L. The only mutation path is
//! [`Portfolio::apply_fill`], which is crate-private and invoked by the router
//! when it delivers a FILL event to the ledger route. Every other component
//! sees the portfolio through the read-only [`PortfolioView`].
//!
//! Positions are kept in a `BTreeMap` so valuation sums run in a fixed order
//! and are bit-for-bit reproducible.

use crate::backtest::clock::Nanos;
use crate::backtest::error::NoPriceDataError;
use crate::backtest::events::{FillEvent, PortfolioUpdateEvent, Price, Quantity, Side};
use crate::backtest::prices::PriceHistory;
use anyhow::ensure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Quantities below this are treated as flat.
pub const QTY_EPSILON: f64 = 1e-9;

/// Long position in one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Shares held; always > 0 while the entry exists.
    pub quantity: Quantity,
    /// Quantity-weighted average fill price.
    pub avg_cost: Price,
}

impl Position {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity: 0.0,
            avg_cost: 0.0,
        }
    }

    #[inline]
    pub fn cost_basis(&self) -> f64 {
        self.quantity * self.avg_cost
    }
}

/// Realized P&L record for one sell fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub timestamp: Nanos,
    pub symbol: String,
    pub quantity: Quantity,
    pub fill_price: Price,
    pub avg_cost: Price,
    pub commission: f64,
    /// `(fill_price - avg_cost) * quantity - commission`.
    pub pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    cash: f64,
    initial_cash: f64,
    margin_ratio: f64,
    positions: BTreeMap<String, Position>,
    /// Timestamp of the last applied fill.
    last_update: Option<Nanos>,
    realized_pnl: f64,
    total_commission: f64,
    total_slippage: f64,
    fill_count: u64,
    realized: Vec<RealizedPnl>,
}

impl Portfolio {
    pub fn new(initial_cash: f64, margin_ratio: f64) -> Self {
        Self {
            cash: initial_cash,
            initial_cash,
            margin_ratio,
            positions: BTreeMap::new(),
            last_update: None,
            realized_pnl: 0.0,
            total_commission: 0.0,
            total_slippage: 0.0,
            fill_count: 0,
            realized: Vec::new(),
        }
    }

    /// Apply one fill. Rejects fills the base model cannot represent (selling
    /// more than is held, non-positive quantity, non-finite price) without
    /// touching state.
    pub(crate) fn apply_fill(&mut self, fill: &FillEvent) -> anyhow::Result<PortfolioUpdateEvent> {
        ensure!(
            fill.quantity.is_finite() && fill.quantity > 0.0,
            "fill quantity must be positive, got {}",
            fill.quantity
        );
        ensure!(
            fill.fill_price.is_finite() && fill.fill_price > 0.0,
            "fill price must be positive, got {}",
            fill.fill_price
        );
        ensure!(
            fill.commission.is_finite() && fill.commission >= 0.0,
            "commission must be non-negative, got {}",
            fill.commission
        );

        let notional = fill.notional();
        match fill.side {
            Side::Buy => {
                let position = self
                    .positions
                    .entry(fill.symbol.clone())
                    .or_insert_with(|| Position::new(&fill.symbol));
                let new_qty = position.quantity + fill.quantity;
                position.avg_cost = (position.cost_basis() + notional) / new_qty;
                position.quantity = new_qty;
                self.cash -= notional + fill.commission;
            }
            Side::Sell => {
                let held = self.quantity(&fill.symbol);
                ensure!(
                    fill.quantity <= held + QTY_EPSILON,
                    "sell fill of {} {} exceeds held quantity {}",
                    fill.quantity,
                    fill.symbol,
                    held
                );
                let Some(position) = self.positions.get_mut(&fill.symbol) else {
                    anyhow::bail!("sell fill for {} with no position", fill.symbol);
                };
                let pnl = (fill.fill_price - position.avg_cost) * fill.quantity - fill.commission;
                self.realized.push(RealizedPnl {
                    timestamp: fill.timestamp,
                    symbol: fill.symbol.clone(),
                    quantity: fill.quantity,
                    fill_price: fill.fill_price,
                    avg_cost: position.avg_cost,
                    commission: fill.commission,
                    pnl,
                });
                self.realized_pnl += pnl;

                position.quantity -= fill.quantity;
                if position.quantity <= QTY_EPSILON {
                    self.positions.remove(&fill.symbol);
                }
                self.cash += notional - fill.commission;
            }
        }

        self.total_commission += fill.commission;
        self.total_slippage += fill.slippage_cost;
        self.fill_count += 1;
        self.last_update = Some(fill.timestamp);

        Ok(PortfolioUpdateEvent {
            timestamp: fill.timestamp,
            symbol: fill.symbol.clone(),
            cash: self.cash,
            position_quantity: self.quantity(&fill.symbol),
            realized_pnl: self.realized_pnl,
        })
    }

    #[inline]
    pub fn cash(&self) -> f64 {
        self.cash
    }

    #[inline]
    pub fn initial_cash(&self) -> f64 {
        self.initial_cash
    }

    #[inline]
    pub fn margin_ratio(&self) -> f64 {
        self.margin_ratio
    }

    #[inline]
    pub fn last_update(&self) -> Option<Nanos> {
        self.last_update
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Held quantity, 0 when flat.
    pub fn quantity(&self, symbol: &str) -> Quantity {
        self.positions.get(symbol).map_or(0.0, |p| p.quantity)
    }

    /// Open positions in symbol order.
    pub fn positions(&self) -> impl Iterator<Item = &Position> + '_ {
        self.positions.values()
    }

    #[inline]
    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    #[inline]
    pub fn total_commission(&self) -> f64 {
        self.total_commission
    }

    #[inline]
    pub fn total_slippage(&self) -> f64 {
        self.total_slippage
    }

    #[inline]
    pub fn fill_count(&self) -> u64 {
        self.fill_count
    }

    pub fn realized_trades(&self) -> &[RealizedPnl] {
        &self.realized
    }

    /// Market value of one position; 0 without a position (no lookup).
    pub fn position_value(&self, prices: &PriceHistory, symbol: &str, t: Nanos) -> Result<f64, NoPriceDataError> {
        match self.positions.get(symbol) {
            Some(p) => Ok(p.quantity * prices.price_at_or_after(symbol, t)?),
            None => Ok(0.0),
        }
    }

    /// Sum of position values. Fails on the first held symbol without a price.
    pub fn positions_value(&self, prices: &PriceHistory, t: Nanos) -> Result<f64, NoPriceDataError> {
        self.positions.values().try_fold(0.0, |acc, p| {
            Ok(acc + p.quantity * prices.price_at_or_after(&p.symbol, t)?)
        })
    }

    /// Sum of absolute position values.
    pub fn gross_exposure(&self, prices: &PriceHistory, t: Nanos) -> Result<f64, NoPriceDataError> {
        self.positions.values().try_fold(0.0, |acc, p| {
            Ok(acc + (p.quantity * prices.price_at_or_after(&p.symbol, t)?).abs())
        })
    }

    /// `cash + Σ quantity × price_at_or_after(symbol, t)`.
    pub fn portfolio_value(&self, prices: &PriceHistory, t: Nanos) -> Result<f64, NoPriceDataError> {
        Ok(self.cash + self.positions_value(prices, t)?)
    }

    /// `portfolio_value(t) × margin − Σ|position_value|`.
    pub fn buying_power(&self, prices: &PriceHistory, margin: f64, t: Nanos) -> Result<f64, NoPriceDataError> {
        Ok(self.portfolio_value(prices, t)? * margin - self.gross_exposure(prices, t)?)
    }
}

/// Read-only query surface handed to strategies, brokers and analyzers.
#[derive(Clone, Copy)]
pub struct PortfolioView<'a> {
    portfolio: &'a Portfolio,
    prices: &'a PriceHistory,
}

impl<'a> PortfolioView<'a> {
    pub fn new(portfolio: &'a Portfolio, prices: &'a PriceHistory) -> Self {
        Self { portfolio, prices }
    }

    pub fn cash(&self) -> f64 {
        self.portfolio.cash()
    }

    pub fn margin_ratio(&self) -> f64 {
        self.portfolio.margin_ratio()
    }

    pub fn position(&self, symbol: &str) -> Option<&'a Position> {
        self.portfolio.position(symbol)
    }

    pub fn quantity(&self, symbol: &str) -> Quantity {
        self.portfolio.quantity(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &'a Position> + 'a {
        self.portfolio.positions()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.portfolio.realized_pnl()
    }

    pub fn price_at_or_after(&self, symbol: &str, t: Nanos) -> Result<Price, NoPriceDataError> {
        self.prices.price_at_or_after(symbol, t)
    }

    pub fn position_value(&self, symbol: &str, t: Nanos) -> Result<f64, NoPriceDataError> {
        self.portfolio.position_value(self.prices, symbol, t)
    }

    pub fn positions_value(&self, t: Nanos) -> Result<f64, NoPriceDataError> {
        self.portfolio.positions_value(self.prices, t)
    }

    pub fn portfolio_value(&self, t: Nanos) -> Result<f64, NoPriceDataError> {
        self.portfolio.portfolio_value(self.prices, t)
    }

    pub fn buying_power(&self, margin: f64, t: Nanos) -> Result<f64, NoPriceDataError> {
        self.portfolio.buying_power(self.prices, margin, t)
    }

    /// The underlying snapshot, for reporting.
    pub fn snapshot(&self) -> &'a Portfolio {
        self.portfolio
    }
}
