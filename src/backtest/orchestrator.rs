//! Backtest Orchestrator
//!
//! Wires the data feed, broker, strategies and analyzers onto an
//! [`EventRouter`] and runs the driver loop.
//!
//! # Driver loop
//!
//! 1. One lazy bar stream per universe symbol is merged by timestamp
//!    ([`StreamMerger`]); ties leave in universe order.
//! 2. The next bar is moved into the queue whenever it is not later than the
//!    queue head, so bars and queued events interleave by the queue's key.
//! 3. The queue head is popped, the clock advanced to its timestamp and the
//!    event dispatched immediately.
//! 4. The loop ends when both the queue and every stream are exhausted, then
//!    `on_finish` hooks run and anything they queued is drained.
//!
//! Time is purely logical; nothing here reads wall-clock time.

use crate::backtest::analyzer::{Analyzer, EquityCurveAnalyzer};
use crate::backtest::broker::{Broker, ExecutionEngine};
use crate::backtest::clock::{format_nanos, Nanos};
use crate::backtest::config::BacktestConfig;
use crate::backtest::error::{BacktestError, NoPriceDataError};
use crate::backtest::events::{Event, MarketDataEvent, OrderEvent, Topic};
use crate::backtest::feed::DataFeed;
use crate::backtest::portfolio::{Portfolio, PortfolioView};
use crate::backtest::prices::PriceHistory;
use crate::backtest::queue::StreamMerger;
use crate::backtest::router::{
    ComponentRole, ComponentSummary, Diagnostic, DiagnosticKind, EventRouter, RunWindow, Subscriber,
};
use crate::backtest::strategy::Strategy;
use serde::{Deserialize, Serialize};

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventCounts {
    /// Events popped from the queue (bars included).
    pub queue_events: u64,
    /// Every dispatch, nested immediate publishes included.
    pub dispatched: u64,
    pub market_data: u64,
    pub orders: u64,
    pub fills: u64,
    pub portfolio_updates: u64,
    pub rejections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResults {
    pub initial_cash: f64,
    /// Marked at `end` with the latest close at or before it.
    pub final_value: f64,
    pub total_return: f64,
    pub start: Option<Nanos>,
    pub end: Option<Nanos>,
    pub window: RunWindow,
    /// Stopped by `max_events` before the input was exhausted.
    pub truncated: bool,
    pub counts: EventCounts,
    pub portfolio: Portfolio,
    pub diagnostics: Vec<Diagnostic>,
    pub open_orders: Vec<OrderEvent>,
    pub expired_orders: Vec<OrderEvent>,
    pub components: Vec<ComponentSummary>,
    #[serde(skip)]
    pub prices: PriceHistory,
}

impl BacktestResults {
    /// Read-only view over the final ledger and the recorded prices.
    pub fn portfolio_view(&self) -> PortfolioView<'_> {
        PortfolioView::new(&self.portfolio, &self.prices)
    }

    pub fn rejections(&self) -> impl Iterator<Item = &Diagnostic> + '_ {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::OrderRejected)
    }

    pub fn component(&self, name: &str) -> Option<&ComponentSummary> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Mark to the latest close at or before `t`, falling back to the next one.
fn mark_to_market(portfolio: &Portfolio, prices: &PriceHistory, t: Nanos) -> Result<f64, NoPriceDataError> {
    portfolio.positions().try_fold(portfolio.cash(), |acc, p| {
        let price = match prices.price_at_or_before(&p.symbol, t) {
            Some(price) => price,
            None => prices.price_at_or_after(&p.symbol, t)?,
        };
        Ok(acc + p.quantity * price)
    })
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct Backtest {
    config: BacktestConfig,
    feed: Option<Box<dyn DataFeed>>,
    broker: Option<Box<dyn Subscriber>>,
    strategies: Vec<Box<dyn Subscriber>>,
    analyzers: Vec<Box<dyn Subscriber>>,
}

impl Backtest {
    pub fn new(config: BacktestConfig) -> Self {
        Self {
            config,
            feed: None,
            broker: None,
            strategies: Vec::new(),
            analyzers: Vec::new(),
        }
    }

    /// Engine with the broker, strategies and equity-curve analyzer described
    /// by the config. Only the data feed is left to set.
    pub fn from_config(config: BacktestConfig) -> Self {
        let mut backtest = Self::new(config);
        backtest.set_broker(ExecutionEngine::from_config(&backtest.config.execution));
        let execution = &backtest.config.execution;
        let strategies: Vec<_> = backtest
            .config
            .strategies
            .iter()
            .map(|s| s.build().with_costs(execution))
            .collect();
        for strategy in strategies {
            backtest.add_strategy(strategy);
        }
        let analyzer = match &backtest.config.benchmark {
            Some(benchmark) => EquityCurveAnalyzer::new().with_benchmark(benchmark.clone()),
            None => EquityCurveAnalyzer::new(),
        };
        backtest.add_analyzer(analyzer);
        backtest
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn set_data_feed<F: DataFeed + 'static>(&mut self, feed: F) -> &mut Self {
        self.feed = Some(Box::new(feed));
        self
    }

    pub fn set_broker<B: Broker + 'static>(&mut self, broker: B) -> &mut Self {
        self.broker = Some(Box::new(broker));
        self
    }

    pub fn add_strategy<S: Strategy + 'static>(&mut self, strategy: S) -> &mut Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn add_analyzer<A: Analyzer + 'static>(&mut self, analyzer: A) -> &mut Self {
        self.analyzers.push(Box::new(analyzer));
        self
    }

    pub fn run(self) -> Result<BacktestResults, BacktestError> {
        self.config.validate()?;
        let feed = self
            .feed
            .ok_or_else(|| BacktestError::configuration("no data feed set"))?;
        let broker = self
            .broker
            .ok_or_else(|| BacktestError::configuration("no broker registered"))?;
        if self.strategies.is_empty() {
            tracing::warn!("no strategies registered; the run only replays data");
        }

        let window = self.config.window()?;
        let universe = self.config.universe();
        let portfolio = Portfolio::new(self.config.initial_cash, self.config.margin_ratio);
        let mut router = EventRouter::new(portfolio, window);

        // Broker first so standing limit orders see each bar before strategies react.
        let topics = broker.topics();
        router.subscribe(broker, &topics, ComponentRole::Broker);
        for strategy in self.strategies {
            let topics = strategy.topics();
            router.subscribe(strategy, &topics, ComponentRole::Strategy);
        }
        for analyzer in self.analyzers {
            let topics = analyzer.topics();
            router.subscribe(analyzer, &topics, ComponentRole::Analyzer);
        }

        let mut merger = StreamMerger::new();
        for symbol in &universe {
            let stream = feed
                .stream(symbol, window.feed_start(), window.end)
                .map_err(|e| BacktestError::data_feed(symbol.clone(), e))?;
            merger.add_stream(symbol.clone(), stream);
        }

        tracing::info!(
            feed = feed.name(),
            symbols = ?universe,
            start = ?window.start.map(format_nanos),
            end = ?window.end.map(format_nanos),
            initial_cash = self.config.initial_cash,
            margin_ratio = self.config.margin_ratio,
            "backtest starting"
        );

        let mut driver = Driver {
            router,
            merger,
            max_events: self.config.max_events,
            queue_events: 0,
            first_event: None,
        };
        let truncated = driver.drive()?;
        driver.router.finish()?;
        if !truncated {
            driver.drain_queue()?;
        }
        let results = driver.into_results(self.config.initial_cash, truncated)?;

        tracing::info!(
            events = results.counts.queue_events,
            fills = results.counts.fills,
            rejections = results.counts.rejections,
            final_value = results.final_value,
            total_return = results.total_return,
            "backtest finished"
        );
        Ok(results)
    }
}

struct Driver {
    router: EventRouter,
    merger: StreamMerger,
    max_events: u64,
    queue_events: u64,
    first_event: Option<Nanos>,
}

impl Driver {
    /// Run until input is exhausted. Returns true if stopped by `max_events`.
    fn drive(&mut self) -> Result<bool, BacktestError> {
        self.pull_bar(true)?;
        loop {
            if self.max_events > 0 && self.queue_events >= self.max_events {
                tracing::warn!(max_events = self.max_events, "event limit reached; stopping early");
                return Ok(true);
            }
            let bar_due = match (self.merger.peek_time(), self.router.queue().peek_time()) {
                (Some(bar), Some(queued)) => bar <= queued,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if bar_due {
                self.pull_bar(false)?;
            }
            let Some(event) = self.router.queue_mut().pop_next() else {
                return Ok(false);
            };
            self.step(event)?;
        }
    }

    /// Dispatch what is left in the queue, ignoring the streams.
    fn drain_queue(&mut self) -> Result<(), BacktestError> {
        while let Some(event) = self.router.queue_mut().pop_next() {
            self.step(event)?;
        }
        Ok(())
    }

    /// Move the next merged bar into the queue. With `prime_only` the streams
    /// are only primed so the first bar of each is recorded.
    fn pull_bar(&mut self, prime_only: bool) -> Result<(), BacktestError> {
        let prices = self.router.prices_mut();
        let mut record = |bar: &MarketDataEvent| prices.record(bar);
        let pulled = if prime_only {
            self.merger.prime(&mut record).map(|_| None)
        } else {
            self.merger.next_bar(&mut record)
        };
        match pulled {
            Ok(Some(bar)) => {
                self.router.queue_mut().push(bar.into());
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(BacktestError::data_feed(e.label, e.error)),
        }
    }

    fn step(&mut self, event: Event) -> Result<(), BacktestError> {
        let t = event.timestamp();
        if !self.router.advance_clock(t) {
            tracing::warn!(
                ts = %format_nanos(t),
                clock = %format_nanos(self.router.now()),
                topic = %event.topic(),
                "event behind the clock; dispatching without moving time back"
            );
        }
        self.first_event.get_or_insert(t);
        self.queue_events += 1;
        self.router.dispatch(&event)
    }

    fn into_results(self, initial_cash: f64, truncated: bool) -> Result<BacktestResults, BacktestError> {
        let end = self.first_event.map(|_| self.router.now());
        let counts = EventCounts {
            queue_events: self.queue_events,
            dispatched: self.router.dispatched(),
            market_data: self.router.dispatched_for(Topic::MarketData),
            orders: self.router.dispatched_for(Topic::Order),
            fills: self.router.dispatched_for(Topic::Fill),
            portfolio_updates: self.router.dispatched_for(Topic::PortfolioUpdate),
            rejections: self
                .router
                .diagnostics()
                .iter()
                .filter(|d| d.kind == DiagnosticKind::OrderRejected)
                .count() as u64,
        };
        let components = self.router.summaries();
        let window = *self.router.window();
        let (portfolio, prices, diagnostics) = self.router.into_parts();

        let final_value = match end {
            Some(t) => mark_to_market(&portfolio, &prices, t)?,
            None => portfolio.cash(),
        };
        let orders_of = |kind: DiagnosticKind| -> Vec<OrderEvent> {
            diagnostics
                .iter()
                .filter(|d| d.kind == kind)
                .filter_map(|d| d.order.clone())
                .collect()
        };
        let open_orders = orders_of(DiagnosticKind::LimitOrderOpen);
        let expired_orders = orders_of(DiagnosticKind::LimitOrderExpired);

        Ok(BacktestResults {
            initial_cash,
            final_value,
            total_return: final_value / initial_cash - 1.0,
            start: self.first_event,
            end,
            window,
            truncated,
            counts,
            portfolio,
            diagnostics,
            open_orders,
            expired_orders,
            components,
            prices,
        })
    }
}
