//! AlphaFlow
//!
//! Deterministic event-driven backtesting kernel. See [`backtest`] for the
//! architecture; the `backtest_run` binary drives it from a TOML config and
//! CSV bars.

pub mod backtest;
