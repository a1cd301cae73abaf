//! Commission policies.
//!
//! A policy is a pure function `commission(quantity, fill_price) -> cost`,
//! supplied to the execution engine at construction.

use crate::backtest::events::{Price, Quantity};
use serde::{Deserialize, Serialize};

pub trait CommissionModel {
    /// Cost of one fill. Never negative.
    fn commission(&self, quantity: Quantity, fill_price: Price) -> f64;

    /// Largest quantity whose notional plus commission at `fill_price` fits
    /// in `budget`. Never negative.
    fn affordable_quantity(&self, budget: f64, fill_price: Price) -> Quantity;

    fn name(&self) -> &'static str;
}

// =============================================================================
// POLICIES
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCommission;

impl CommissionModel for NoCommission {
    fn commission(&self, _quantity: Quantity, _fill_price: Price) -> f64 {
        0.0
    }

    fn affordable_quantity(&self, budget: f64, fill_price: Price) -> Quantity {
        (budget / fill_price).max(0.0)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Flat fee per fill.
#[derive(Debug, Clone, Copy)]
pub struct FixedCommission {
    pub amount: f64,
}

impl CommissionModel for FixedCommission {
    fn commission(&self, _quantity: Quantity, _fill_price: Price) -> f64 {
        self.amount
    }

    fn affordable_quantity(&self, budget: f64, fill_price: Price) -> Quantity {
        ((budget - self.amount) / fill_price).max(0.0)
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// `rate × quantity`.
#[derive(Debug, Clone, Copy)]
pub struct PerShareCommission {
    pub rate: f64,
}

impl CommissionModel for PerShareCommission {
    fn commission(&self, quantity: Quantity, _fill_price: Price) -> f64 {
        self.rate * quantity.abs()
    }

    fn affordable_quantity(&self, budget: f64, fill_price: Price) -> Quantity {
        (budget / (fill_price + self.rate.abs())).max(0.0)
    }

    fn name(&self) -> &'static str {
        "per_share"
    }
}

/// `rate × notional`.
#[derive(Debug, Clone, Copy)]
pub struct PercentageCommission {
    pub rate: f64,
}

impl CommissionModel for PercentageCommission {
    fn commission(&self, quantity: Quantity, fill_price: Price) -> f64 {
        self.rate * (quantity * fill_price).abs()
    }

    fn affordable_quantity(&self, budget: f64, fill_price: Price) -> Quantity {
        (budget / (fill_price * (1.0 + self.rate.abs()))).max(0.0)
    }

    fn name(&self) -> &'static str {
        "percentage"
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Serializable commission selection, e.g. `{ type = "per_share", rate = 0.01 }`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommissionConfig {
    #[default]
    None,
    Fixed { amount: f64 },
    PerShare { rate: f64 },
    Percentage { rate: f64 },
}

impl CommissionConfig {
    pub fn build(&self) -> Box<dyn CommissionModel> {
        match *self {
            CommissionConfig::None => Box::new(NoCommission),
            CommissionConfig::Fixed { amount } => Box::new(FixedCommission { amount }),
            CommissionConfig::PerShare { rate } => Box::new(PerShareCommission { rate }),
            CommissionConfig::Percentage { rate } => Box::new(PercentageCommission { rate }),
        }
    }

    /// The configured amount or rate; 0 for `None`.
    pub fn parameter(&self) -> f64 {
        match *self {
            CommissionConfig::None => 0.0,
            CommissionConfig::Fixed { amount } => amount,
            CommissionConfig::PerShare { rate } | CommissionConfig::Percentage { rate } => rate,
        }
    }
}
