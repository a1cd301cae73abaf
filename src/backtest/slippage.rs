//! Slippage policies.
//!
//! `adjust(side, base_price)` always moves the price against the trader:
//! up for buys, down for sells.

use crate::backtest::events::{Price, Side};
use serde::{Deserialize, Serialize};

pub trait SlippageModel {
    fn adjust(&self, side: Side, base_price: Price) -> Price;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoSlippage;

impl SlippageModel for NoSlippage {
    fn adjust(&self, _side: Side, base_price: Price) -> Price {
        base_price
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Fixed adverse move in basis points.
#[derive(Debug, Clone, Copy)]
pub struct FixedSlippage {
    pub bps: f64,
}

impl SlippageModel for FixedSlippage {
    fn adjust(&self, side: Side, base_price: Price) -> Price {
        base_price * (1.0 + side.sign() * self.bps.abs() / 10_000.0)
    }

    fn name(&self) -> &'static str {
        "fixed_bps"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlippageConfig {
    #[default]
    None,
    FixedBps { bps: f64 },
}

impl SlippageConfig {
    pub fn build(&self) -> Box<dyn SlippageModel> {
        match *self {
            SlippageConfig::None => Box::new(NoSlippage),
            SlippageConfig::FixedBps { bps } => Box::new(FixedSlippage { bps }),
        }
    }
}
