//! Event Router
//!
//! Topic-keyed subscriber registry plus the state every handler may read:
//! the portfolio ledger, the price history, the simulation clock and the run
//! window. Components never hold references to each other; they only see a
//! [`Context`] for the duration of one handler call.
//!
//! # Dispatch
//!
//! - `Immediate` publish delivers to every subscriber of the event's topic,
//!   in registration order, before returning. Handlers may publish again;
//!   nested immediate publishes run depth-first.
//! - `Queued` publish pushes into the [`EventQueue`]; the driver loop
//!   dispatches it on a later iteration.
//!
//! A component is taken out of its slot while its handler runs. If a nested
//! publish reaches that same component, the event is parked on the
//! component's pending list and delivered right after its current handler
//! returns, still inside the outer publish.
//!
//! The ledger is not a boxed component: it is the first FILL route and its
//! reaction is built into the router. It applies the fill before any other
//! FILL subscriber runs, and the resulting PORTFOLIO_UPDATE is dispatched
//! once the FILL fan-out has finished. This keeps `Portfolio::apply_fill` the
//! single write path.

use crate::backtest::clock::{format_nanos, Nanos, SimClock};
use crate::backtest::error::{BacktestError, NoPriceDataError};
use crate::backtest::events::{Event, OrderEvent, PortfolioUpdateEvent, Topic};
use crate::backtest::portfolio::{Portfolio, PortfolioView};
use crate::backtest::prices::PriceHistory;
use crate::backtest::queue::EventQueue;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Component name used in errors raised by the ledger route.
pub const LEDGER_COMPONENT: &str = "ledger";

pub type ComponentId = usize;

/// How a published event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Synchronous, depth-first delivery before `publish` returns.
    Immediate,
    /// Deferred to the driver loop through the event queue.
    Queued,
}

/// Role a component was registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentRole {
    Strategy,
    Broker,
    Analyzer,
}

/// Event handler capability shared by strategies, brokers and analyzers.
pub trait Subscriber {
    fn name(&self) -> &str;

    /// Topics to register for. Registration happens once, before the run.
    fn topics(&self) -> Vec<Topic>;

    /// Handle one event. An error aborts the run.
    fn on_event(&mut self, event: &Event, ctx: &mut Context<'_>) -> anyhow::Result<()>;

    /// Called once after the input is exhausted, in registration order.
    fn on_finish(&mut self, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// JSON summary included in the run results.
    fn summary(&self) -> Option<serde_json::Value> {
        None
    }
}

// =============================================================================
// RUN WINDOW
// =============================================================================

/// Active window of the run. Components self-filter against it; the router
/// never drops events on their behalf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    /// First timestamp requested from the feed (warm-up included).
    pub data_start: Option<Nanos>,
    pub start: Option<Nanos>,
    pub end: Option<Nanos>,
}

impl RunWindow {
    pub fn contains(&self, t: Nanos) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t <= e)
    }

    /// Lower bound for feed requests.
    pub fn feed_start(&self) -> Option<Nanos> {
        self.data_start.or(self.start)
    }
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Order failed validation; no fill was emitted.
    OrderRejected,
    /// Standing limit order dropped at the end of the run.
    LimitOrderExpired,
    /// Standing limit order left open at the end of the run.
    LimitOrderOpen,
}

/// Non-fatal condition recorded during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub timestamp: Nanos,
    pub component: String,
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderEvent>,
}

/// Per-component entry of the run results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub name: String,
    pub role: ComponentRole,
    pub topics: Vec<Topic>,
    pub summary: Option<serde_json::Value>,
}

// =============================================================================
// ROUTER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Ledger,
    Component(ComponentId),
}

struct Slot {
    name: String,
    role: ComponentRole,
    topics: Vec<Topic>,
    /// `None` while the component's handler is on the stack.
    subscriber: Option<Box<dyn Subscriber>>,
    pending: VecDeque<Event>,
}

pub struct EventRouter {
    routes: [Vec<Route>; 4],
    slots: Vec<Slot>,
    queue: EventQueue,
    portfolio: Portfolio,
    prices: PriceHistory,
    clock: SimClock,
    window: RunWindow,
    diagnostics: Vec<Diagnostic>,
    dispatched: u64,
    dispatched_by_topic: [u64; 4],
}

impl EventRouter {
    pub fn new(portfolio: Portfolio, window: RunWindow) -> Self {
        let mut routes: [Vec<Route>; 4] = Default::default();
        routes[Topic::Fill.index()].push(Route::Ledger);
        Self {
            routes,
            slots: Vec::new(),
            queue: EventQueue::new(),
            portfolio,
            prices: PriceHistory::new(),
            clock: SimClock::default(),
            window,
            diagnostics: Vec::new(),
            dispatched: 0,
            dispatched_by_topic: [0; 4],
        }
    }

    /// Register a component for `topics`. Registration order is dispatch
    /// order within a topic; duplicate topics are ignored.
    pub fn subscribe(
        &mut self,
        subscriber: Box<dyn Subscriber>,
        topics: &[Topic],
        role: ComponentRole,
    ) -> ComponentId {
        let id = self.slots.len();
        let mut registered = Vec::with_capacity(topics.len());
        for &topic in topics {
            if registered.contains(&topic) {
                continue;
            }
            registered.push(topic);
            self.routes[topic.index()].push(Route::Component(id));
        }
        tracing::debug!(
            component = subscriber.name(),
            ?role,
            topics = ?registered,
            "subscribed"
        );
        self.slots.push(Slot {
            name: subscriber.name().to_string(),
            role,
            topics: registered,
            subscriber: Some(subscriber),
            pending: VecDeque::new(),
        });
        id
    }

    pub fn publish(&mut self, event: Event, mode: PublishMode) -> Result<(), BacktestError> {
        match mode {
            PublishMode::Immediate => self.dispatch(&event),
            PublishMode::Queued => self.enqueue(event),
        }
    }

    /// Queue an event for the driver loop. Scheduling into the past is a
    /// causality violation.
    pub fn enqueue(&mut self, event: Event) -> Result<(), BacktestError> {
        if self.clock.is_past(event.timestamp()) {
            return Err(BacktestError::Causality {
                event_time: event.timestamp(),
                clock: self.clock.now(),
            });
        }
        self.queue.push(event);
        Ok(())
    }

    /// Deliver to every subscriber of the event's topic.
    pub fn dispatch(&mut self, event: &Event) -> Result<(), BacktestError> {
        let topic = event.topic();
        self.dispatched += 1;
        self.dispatched_by_topic[topic.index()] += 1;
        tracing::debug!(
            topic = %topic,
            symbol = event.symbol(),
            ts = %format_nanos(event.timestamp()),
            "dispatch"
        );

        // Routes are fixed once the run starts.
        let mut update = None;
        let mut i = 0;
        while let Some(&route) = self.routes[topic.index()].get(i) {
            match route {
                Route::Ledger => update = self.apply_to_ledger(event)?,
                Route::Component(id) => self.deliver(id, event)?,
            }
            i += 1;
        }

        // Every FILL subscriber sees the fill before its PORTFOLIO_UPDATE.
        match update {
            Some(update) => self.dispatch(&Event::PortfolioUpdate(update)),
            None => Ok(()),
        }
    }

    fn apply_to_ledger(&mut self, event: &Event) -> Result<Option<PortfolioUpdateEvent>, BacktestError> {
        let Event::Fill(fill) = event else {
            return Ok(None);
        };
        let update = self
            .portfolio
            .apply_fill(fill)
            .map_err(|e| handler_error(LEDGER_COMPONENT, event, e))?;
        tracing::debug!(
            symbol = %fill.symbol,
            side = ?fill.side,
            qty = fill.quantity,
            price = fill.fill_price,
            cash = update.cash,
            "fill applied"
        );
        Ok(Some(update))
    }

    fn deliver(&mut self, id: ComponentId, event: &Event) -> Result<(), BacktestError> {
        let Some(mut subscriber) = self.slots[id].subscriber.take() else {
            self.slots[id].pending.push_back(event.clone());
            return Ok(());
        };

        let mut result = self.invoke(subscriber.as_mut(), id, event);
        while result.is_ok() {
            let Some(next) = self.slots[id].pending.pop_front() else {
                break;
            };
            result = self.invoke(subscriber.as_mut(), id, &next);
        }
        self.slots[id].subscriber = Some(subscriber);
        result
    }

    fn invoke(
        &mut self,
        subscriber: &mut dyn Subscriber,
        id: ComponentId,
        event: &Event,
    ) -> Result<(), BacktestError> {
        let mut ctx = Context {
            router: self,
            component: id,
        };
        subscriber
            .on_event(event, &mut ctx)
            .map_err(|e| handler_error(subscriber.name(), event, e))
    }

    /// Run every component's `on_finish` hook in registration order.
    pub fn finish(&mut self) -> Result<(), BacktestError> {
        for id in 0..self.slots.len() {
            let Some(mut subscriber) = self.slots[id].subscriber.take() else {
                continue;
            };
            let mut ctx = Context {
                router: self,
                component: id,
            };
            let mut result = subscriber.on_finish(&mut ctx).map_err(|e| finish_error(subscriber.name(), e));
            while result.is_ok() {
                let Some(next) = self.slots[id].pending.pop_front() else {
                    break;
                };
                result = self.invoke(subscriber.as_mut(), id, &next);
            }
            self.slots[id].subscriber = Some(subscriber);
            result?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Driver access
    // -------------------------------------------------------------------------

    pub(crate) fn queue_mut(&mut self) -> &mut EventQueue {
        &mut self.queue
    }

    pub(crate) fn prices_mut(&mut self) -> &mut PriceHistory {
        &mut self.prices
    }

    /// Advance logical time. Returns false if `t` is before the current time,
    /// in which case the clock is left unchanged.
    pub(crate) fn advance_clock(&mut self, t: Nanos) -> bool {
        self.clock.advance_to(t)
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn now(&self) -> Nanos {
        self.clock.now()
    }

    pub fn window(&self) -> &RunWindow {
        &self.window
    }

    pub fn prices(&self) -> &PriceHistory {
        &self.prices
    }

    pub fn portfolio(&self) -> PortfolioView<'_> {
        PortfolioView::new(&self.portfolio, &self.prices)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn dispatched_for(&self, topic: Topic) -> u64 {
        self.dispatched_by_topic[topic.index()]
    }

    pub fn summaries(&self) -> Vec<ComponentSummary> {
        self.slots
            .iter()
            .map(|slot| ComponentSummary {
                name: slot.name.clone(),
                role: slot.role,
                topics: slot.topics.clone(),
                summary: slot.subscriber.as_ref().and_then(|s| s.summary()),
            })
            .collect()
    }

    /// Consume the router, returning the final ledger and diagnostics.
    pub fn into_parts(self) -> (Portfolio, PriceHistory, Vec<Diagnostic>) {
        (self.portfolio, self.prices, self.diagnostics)
    }
}

fn handler_error(component: &str, event: &Event, err: anyhow::Error) -> BacktestError {
    match err.downcast::<BacktestError>() {
        // Raised by a nested immediate publish; already names the failing component.
        Ok(inner @ BacktestError::Handler { .. }) => inner,
        Ok(other) => BacktestError::Handler {
            component: component.to_string(),
            topic: event.topic(),
            event: format!("{:?}", event),
            source: Box::new(other),
        },
        Err(err) => BacktestError::Handler {
            component: component.to_string(),
            topic: event.topic(),
            event: format!("{:?}", event),
            source: into_source(err),
        },
    }
}

fn finish_error(component: &str, err: anyhow::Error) -> BacktestError {
    match err.downcast::<BacktestError>() {
        Ok(inner @ BacktestError::Handler { .. }) => inner,
        Ok(other) => BacktestError::Finish {
            component: component.to_string(),
            source: Box::new(other),
        },
        Err(err) => BacktestError::Finish {
            component: component.to_string(),
            source: into_source(err),
        },
    }
}

/// Unwraps the typed kernel error when a handler returned one as-is, so
/// callers can downcast the source.
fn into_source(err: anyhow::Error) -> Box<dyn std::error::Error + Send + Sync + 'static> {
    match err.downcast::<NoPriceDataError>() {
        Ok(e) => Box::new(e),
        Err(err) => err.into(),
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Handler-scoped access to the router: read-only state plus `publish`.
pub struct Context<'a> {
    router: &'a mut EventRouter,
    component: ComponentId,
}

impl<'a> Context<'a> {
    /// Current logical time.
    pub fn now(&self) -> Nanos {
        self.router.now()
    }

    pub fn portfolio(&self) -> PortfolioView<'_> {
        self.router.portfolio()
    }

    pub fn prices(&self) -> &PriceHistory {
        self.router.prices()
    }

    pub fn window(&self) -> &RunWindow {
        self.router.window()
    }

    pub fn publish(&mut self, event: impl Into<Event>, mode: PublishMode) -> anyhow::Result<()> {
        self.router.publish(event.into(), mode)?;
        Ok(())
    }

    /// Record a non-fatal diagnostic attributed to the calling component.
    pub fn report(
        &mut self,
        timestamp: Nanos,
        kind: DiagnosticKind,
        message: impl Into<String>,
        order: Option<OrderEvent>,
    ) {
        let component = self.router.slots[self.component].name.clone();
        self.router.diagnostics.push(Diagnostic {
            timestamp,
            component,
            kind,
            message: message.into(),
            order,
        });
    }
}
