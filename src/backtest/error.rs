//! Error taxonomy.
//!
//! Only [`ValidationError`] is recoverable: the execution engine rejects the
//! order and the run continues. Every [`BacktestError`] aborts the run and
//! invalidates the ledger for reporting.

use crate::backtest::clock::{format_nanos, Nanos};
use crate::backtest::events::{Price, Quantity, Topic};
use thiserror::Error;

fn ts(t: &Nanos) -> String {
    format_nanos(*t)
}

/// Order-level validation failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("insufficient buying power: required {required:.4}, available {available:.4}")]
    InsufficientBuyingPower { required: f64, available: f64 },

    #[error("insufficient position: requested {requested}, held {held}")]
    InsufficientPosition { requested: Quantity, held: Quantity },

    #[error("invalid quantity {0}")]
    InvalidQuantity(Quantity),

    #[error("limit order without a limit price")]
    MissingLimitPrice,

    #[error("invalid price {0}")]
    InvalidPrice(Price),
}

/// No bar at or after `timestamp` exists for a symbol that needs a price.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("no price data for {symbol} at or after {}", ts(.timestamp))]
pub struct NoPriceDataError {
    pub symbol: String,
    pub timestamp: Nanos,
}

impl NoPriceDataError {
    pub fn new(symbol: impl Into<String>, timestamp: Nanos) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
        }
    }
}

/// Fatal run errors.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    NoPriceData(#[from] NoPriceDataError),

    /// A subscriber failed while handling an event.
    #[error("component '{component}' failed on {topic} event {event}: {source}")]
    Handler {
        component: String,
        topic: Topic,
        event: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A subscriber failed in its end-of-run hook.
    #[error("component '{component}' failed while finishing: {source}")]
    Finish {
        component: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Illegal wiring or configuration, detected before the loop starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A queued event was scheduled before the current logical time.
    #[error("event at {} queued after the clock reached {}", ts(.event_time), ts(.clock))]
    Causality { event_time: Nanos, clock: Nanos },

    /// The data feed failed to produce or stream bars.
    #[error("data feed failed for {symbol}: {source}")]
    DataFeed {
        symbol: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl BacktestError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        BacktestError::Configuration(msg.into())
    }

    pub fn data_feed(symbol: impl Into<String>, err: anyhow::Error) -> Self {
        BacktestError::DataFeed {
            symbol: symbol.into(),
            source: err.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, BacktestError::Configuration(_))
    }
}
