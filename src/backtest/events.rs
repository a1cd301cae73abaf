//! Event Model
//!
//! Immutable value records exchanged between components. Every event carries a
//! logical timestamp; routing is by [`Topic`], which is derived from the variant.
//! Ordering inside the queue is defined in `queue.rs`, not here.

use crate::backtest::clock::Nanos;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Price in quote currency.
pub type Price = f64;

/// Quantity of shares. Fractional quantities are allowed.
pub type Quantity = f64;

/// Ticker symbol.
pub type Symbol = String;

/// Routing class. Discriminants are the tie-break rank for equal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Topic {
    MarketData = 0,
    Order = 1,
    Fill = 2,
    PortfolioUpdate = 3,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::MarketData,
        Topic::Order,
        Topic::Fill,
        Topic::PortfolioUpdate,
    ];

    /// Tie-break rank: MARKET_DATA < ORDER < FILL < PORTFOLIO_UPDATE.
    #[inline]
    pub fn rank(self) -> u8 {
        self as u8
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::MarketData => "MARKET_DATA",
            Topic::Order => "ORDER",
            Topic::Fill => "FILL",
            Topic::PortfolioUpdate => "PORTFOLIO_UPDATE",
        };
        f.write_str(name)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Order kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataEvent {
    pub timestamp: Nanos,
    pub symbol: Symbol,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: f64,
}

impl MarketDataEvent {
    /// Bar with all four prices equal to `close`.
    pub fn flat(timestamp: Nanos, symbol: impl Into<String>, close: Price) -> Self {
        Self {
            timestamp,
            symbol: symbol.into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub timestamp: Nanos,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub kind: OrderKind,
    /// Required for `OrderKind::Limit`, ignored otherwise.
    pub limit_price: Option<Price>,
}

impl OrderEvent {
    pub fn market(timestamp: Nanos, symbol: impl Into<String>, side: Side, quantity: Quantity) -> Self {
        Self {
            timestamp,
            symbol: symbol.into(),
            side,
            quantity,
            kind: OrderKind::Market,
            limit_price: None,
        }
    }

    pub fn limit(
        timestamp: Nanos,
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        limit_price: Price,
    ) -> Self {
        Self {
            timestamp,
            symbol: symbol.into(),
            side,
            quantity,
            kind: OrderKind::Limit,
            limit_price: Some(limit_price),
        }
    }
}

/// Execution record. Price, commission and slippage are kept apart so the
/// ledger and analyzers can attribute costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub timestamp: Nanos,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub fill_price: Price,
    pub commission: f64,
    /// `|fill_price - base_price| * quantity`.
    pub slippage_cost: f64,
}

impl FillEvent {
    #[inline]
    pub fn notional(&self) -> f64 {
        self.quantity * self.fill_price
    }
}

/// Ledger state right after a fill was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioUpdateEvent {
    pub timestamp: Nanos,
    pub symbol: Symbol,
    pub cash: f64,
    /// Post-fill quantity of `symbol` (0 when the position was closed).
    pub position_quantity: Quantity,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    MarketData(MarketDataEvent),
    Order(OrderEvent),
    Fill(FillEvent),
    PortfolioUpdate(PortfolioUpdateEvent),
}

impl Event {
    #[inline]
    pub fn timestamp(&self) -> Nanos {
        match self {
            Event::MarketData(e) => e.timestamp,
            Event::Order(e) => e.timestamp,
            Event::Fill(e) => e.timestamp,
            Event::PortfolioUpdate(e) => e.timestamp,
        }
    }

    #[inline]
    pub fn topic(&self) -> Topic {
        match self {
            Event::MarketData(_) => Topic::MarketData,
            Event::Order(_) => Topic::Order,
            Event::Fill(_) => Topic::Fill,
            Event::PortfolioUpdate(_) => Topic::PortfolioUpdate,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Event::MarketData(e) => &e.symbol,
            Event::Order(e) => &e.symbol,
            Event::Fill(e) => &e.symbol,
            Event::PortfolioUpdate(e) => &e.symbol,
        }
    }
}

impl From<MarketDataEvent> for Event {
    fn from(e: MarketDataEvent) -> Self {
        Event::MarketData(e)
    }
}

impl From<OrderEvent> for Event {
    fn from(e: OrderEvent) -> Self {
        Event::Order(e)
    }
}

impl From<FillEvent> for Event {
    fn from(e: FillEvent) -> Self {
        Event::Fill(e)
    }
}

impl From<PortfolioUpdateEvent> for Event {
    fn from(e: PortfolioUpdateEvent) -> Self {
        Event::PortfolioUpdate(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_rank_ordering() {
        assert!(Topic::MarketData.rank() < Topic::Order.rank());
        assert!(Topic::Order.rank() < Topic::Fill.rank());
        assert!(Topic::Fill.rank() < Topic::PortfolioUpdate.rank());
    }

    #[test]
    fn test_event_topic_and_timestamp() {
        let md: Event = MarketDataEvent::flat(5, "AAPL", 100.0).into();
        assert_eq!(md.topic(), Topic::MarketData);
        assert_eq!(md.timestamp(), 5);

        let order: Event = OrderEvent::limit(7, "AAPL", Side::Sell, 3.0, 101.0).into();
        assert_eq!(order.topic(), Topic::Order);
        assert_eq!(order.symbol(), "AAPL");
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
    }
}
