//! Backtesting Kernel
//!
//! Deterministic, single-threaded discrete-event simulation for evaluating
//! trading strategies against historical bars.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Backtest                               │
//! │  (validates wiring, drives the loop, builds results)            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//! │ DataFeed    │        │  SimClock   │        │ PriceHistory│
//! │ (streams)   │        │ (nanos)     │        │ (closes)    │
//! └─────────────┘        └─────────────┘        └─────────────┘
//!        │ StreamMerger (k-way, lazy)
//!        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        EventQueue                               │
//! │  BinaryHeap<(timestamp, topic_rank, seq)> - deterministic       │
//! └─────────────────────────────────────────────────────────────────┘
//!                    │
//!                    ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        EventRouter                              │
//! │  MARKET_DATA ─▶ broker, strategies, analyzers                   │
//! │  ORDER       ─▶ broker                                          │
//! │  FILL        ─▶ ledger (Portfolio), analyzers                   │
//! │  PORTFOLIO_UPDATE ─▶ subscribers                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - **Clock**: Never calls system time; all time comes from event timestamps
//! - **EventQueue**: `(timestamp, topic_rank, insertion_seq)` ordering
//! - **Dispatch**: registration order within a topic, fixed before the run
//! - **Valuation**: positions iterate in symbol order

pub mod analyzer;
pub mod broker;
pub mod clock;
pub mod config;
pub mod csv_feed;
pub mod error;
pub mod events;
pub mod feed;
pub mod fees;
pub mod orchestrator;
pub mod portfolio;
pub mod prices;
pub mod queue;
pub mod router;
pub mod slippage;
pub mod strategy;

#[cfg(test)]
mod broker_tests;

pub use analyzer::{Analyzer, EquityCurveAnalyzer, PerformanceMetrics};
pub use broker::{Broker, ExecutionConfig, ExecutionEngine, LimitOrderExpiry, OrderState};
pub use clock::{
    format_nanos, parse_timestamp, Nanos, SimClock, NANOS_PER_DAY, NANOS_PER_MILLI, NANOS_PER_SEC,
};
pub use config::BacktestConfig;
pub use csv_feed::{CsvColumns, CsvFeed};
pub use error::{BacktestError, NoPriceDataError, ValidationError};
pub use events::{
    Event, FillEvent, MarketDataEvent, OrderEvent, OrderKind, PortfolioUpdateEvent, Price,
    Quantity, Side, Symbol, Topic,
};
pub use feed::{DataFeed, VecFeed};
pub use fees::{
    CommissionConfig, CommissionModel, FixedCommission, NoCommission, PerShareCommission,
    PercentageCommission,
};
pub use orchestrator::{Backtest, BacktestResults, EventCounts};
pub use portfolio::{Portfolio, PortfolioView, Position, RealizedPnl};
pub use prices::PriceHistory;
pub use queue::{BarStream, EventQueue, QueueKey, StreamMerger};
pub use router::{
    ComponentRole, ComponentSummary, Context, Diagnostic, DiagnosticKind, EventRouter,
    PublishMode, RunWindow, Subscriber,
};
pub use slippage::{FixedSlippage, NoSlippage, SlippageConfig, SlippageModel};
pub use strategy::{BuyAndHold, Strategy, StrategyConfig};
