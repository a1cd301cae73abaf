//! Execution engine tests: validation, pricing, commissions and limit orders,
//! run through the full driver with an in-memory feed.

use super::*;
use std::cell::RefCell;
use std::rc::Rc;

pub(super) const T1: Nanos = NANOS_PER_DAY;
pub(super) const T2: Nanos = 2 * NANOS_PER_DAY;
pub(super) const T3: Nanos = 3 * NANOS_PER_DAY;
pub(super) const T4: Nanos = 4 * NANOS_PER_DAY;

/// Publishes pre-set orders when a bar with the trigger timestamp arrives
/// (once per entry) and records every portfolio update it sees.
pub(super) struct Scripted {
    script: Vec<(Nanos, OrderEvent)>,
    mode: PublishMode,
    pub(super) updates: Rc<RefCell<Vec<PortfolioUpdateEvent>>>,
}

impl Scripted {
    pub(super) fn new(script: Vec<(Nanos, OrderEvent)>) -> Self {
        Self {
            script,
            mode: PublishMode::Immediate,
            updates: Rc::default(),
        }
    }

    pub(super) fn queued(mut self) -> Self {
        self.mode = PublishMode::Queued;
        self
    }
}

impl Subscriber for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::MarketData, Topic::PortfolioUpdate]
    }

    fn on_event(&mut self, event: &Event, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        match event {
            Event::MarketData(bar) => {
                let (due, rest): (Vec<_>, Vec<_>) =
                    self.script.drain(..).partition(|(t, _)| *t == bar.timestamp);
                self.script = rest;
                for (_, order) in due {
                    ctx.publish(order, self.mode)?;
                }
            }
            Event::PortfolioUpdate(update) => self.updates.borrow_mut().push(update.clone()),
            _ => {}
        }
        Ok(())
    }
}

impl Strategy for Scripted {}

/// Records every event of the subscribed topics.
pub(super) struct Recorder {
    topics: Vec<Topic>,
    pub(super) log: Rc<RefCell<Vec<Event>>>,
}

impl Recorder {
    pub(super) fn new(topics: &[Topic]) -> Self {
        Self {
            topics: topics.to_vec(),
            log: Rc::default(),
        }
    }
}

impl Subscriber for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn topics(&self) -> Vec<Topic> {
        self.topics.clone()
    }

    fn on_event(&mut self, event: &Event, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
        self.log.borrow_mut().push(event.clone());
        Ok(())
    }
}

impl Analyzer for Recorder {}

pub(super) fn config(symbols: &[&str]) -> BacktestConfig {
    BacktestConfig {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub(super) fn plain_broker() -> ExecutionEngine {
    ExecutionEngine::new(Box::new(NoSlippage), Box::new(NoCommission))
}

fn run(
    config: BacktestConfig,
    feed: VecFeed,
    script: Vec<(Nanos, OrderEvent)>,
    broker: ExecutionEngine,
) -> (Result<BacktestResults, BacktestError>, Rc<RefCell<Vec<Event>>>) {
    let recorder = Recorder::new(&[Topic::Fill]);
    let fills = recorder.log.clone();
    let mut backtest = Backtest::new(config);
    backtest
        .set_data_feed(feed)
        .set_broker(broker)
        .add_strategy(Scripted::new(script))
        .add_analyzer(recorder);
    (backtest.run(), fills)
}

fn fills_of(log: &Rc<RefCell<Vec<Event>>>) -> Vec<FillEvent> {
    log.borrow()
        .iter()
        .filter_map(|e| match e {
            Event::Fill(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

fn aapl(closes: &[(Nanos, Price)]) -> VecFeed {
    VecFeed::from_closes("AAPL", closes)
}

#[test]
fn test_buy_reduces_cash_by_exact_notional() {
    let (results, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0)]),
        vec![(T1, OrderEvent::market(T1, "AAPL", Side::Buy, 25.0))],
        plain_broker(),
    );
    let results = results.unwrap();

    assert_eq!(results.portfolio.cash(), 100_000.0 - 25.0 * 100.0);
    assert_eq!(results.portfolio.quantity("AAPL"), 25.0);
    assert_eq!(fills_of(&fills).len(), 1);
    assert_eq!(results.counts.fills, 1);
    assert_eq!(results.counts.rejections, 0);
}

#[test]
fn test_oversized_sell_is_rejected_without_side_effects() {
    let (results, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T2, 105.0)]),
        vec![
            (T1, OrderEvent::market(T1, "AAPL", Side::Buy, 10.0)),
            (T2, OrderEvent::market(T2, "AAPL", Side::Sell, 15.0)),
        ],
        plain_broker(),
    );
    let results = results.unwrap();

    assert_eq!(fills_of(&fills).len(), 1);
    assert_eq!(results.portfolio.cash(), 99_000.0);
    assert_eq!(results.portfolio.quantity("AAPL"), 10.0);
    assert_eq!(results.portfolio.realized_pnl(), 0.0);

    let rejections: Vec<&Diagnostic> = results.rejections().collect();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].component, "broker");
    assert_eq!(rejections[0].timestamp, T2);
    assert!(rejections[0].message.contains("insufficient position"));
    assert_eq!(rejections[0].order.as_ref().unwrap().quantity, 15.0);
}

#[test]
fn test_buying_power_boundary_with_unit_margin() {
    let (ok, _) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0)]),
        vec![(T1, OrderEvent::market(T1, "AAPL", Side::Buy, 1_000.0))],
        plain_broker(),
    );
    let ok = ok.unwrap();
    assert_eq!(ok.counts.fills, 1);
    assert_eq!(ok.portfolio.cash(), 0.0);

    let (over, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100_000.01)]),
        vec![(T1, OrderEvent::market(T1, "AAPL", Side::Buy, 1.0))],
        plain_broker(),
    );
    let over = over.unwrap();
    assert!(fills_of(&fills).is_empty());
    assert_eq!(over.portfolio.cash(), 100_000.0);
    let rejection = over.rejections().next().unwrap();
    assert!(rejection.message.contains("insufficient buying power"));
}

#[test]
fn test_commission_counts_against_buying_power() {
    let percentage = || ExecutionEngine::new(Box::new(NoSlippage), Box::new(PercentageCommission { rate: 0.001 }));

    // 99950 notional plus 99.95 commission exceeds the 100000 of cash.
    let (over, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0)]),
        vec![(T1, OrderEvent::market(T1, "AAPL", Side::Buy, 999.5))],
        percentage(),
    );
    let over = over.unwrap();
    assert!(fills_of(&fills).is_empty());
    assert_eq!(over.portfolio.cash(), 100_000.0);
    assert_eq!(over.portfolio.total_commission(), 0.0);
    let rejection = over.rejections().next().unwrap();
    assert!(rejection.message.contains("insufficient buying power"));

    // 99900 + 99.9 fits.
    let (ok, _) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0)]),
        vec![(T1, OrderEvent::market(T1, "AAPL", Side::Buy, 999.0))],
        percentage(),
    );
    let ok = ok.unwrap();
    assert_eq!(ok.counts.fills, 1);
    assert!((ok.portfolio.cash() - 0.1).abs() < 1e-6);

    // A flat fee alone tips an otherwise exact all-in buy over.
    let fixed = ExecutionEngine::new(Box::new(NoSlippage), Box::new(FixedCommission { amount: 1.0 }));
    let (flat, _) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0)]),
        vec![(T1, OrderEvent::market(T1, "AAPL", Side::Buy, 1_000.0))],
        fixed,
    );
    let flat = flat.unwrap();
    assert_eq!(flat.counts.fills, 0);
    assert_eq!(flat.counts.rejections, 1);
}

#[test]
fn test_margin_ratio_extends_buying_power() {
    let mut cfg = config(&["AAPL"]);
    cfg.margin_ratio = 2.0;
    // Buying power = 100000 * 2 - 0; a 150000 buy fits.
    let (results, _) = run(
        cfg,
        aapl(&[(T1, 100.0)]),
        vec![(T1, OrderEvent::market(T1, "AAPL", Side::Buy, 1_500.0))],
        plain_broker(),
    );
    let results = results.unwrap();
    assert_eq!(results.portfolio.cash(), -50_000.0);
    assert_eq!(results.portfolio.quantity("AAPL"), 1_500.0);
}

#[test]
fn test_per_share_commission_reflected_in_cash() {
    let broker = ExecutionEngine::new(Box::new(NoSlippage), Box::new(PerShareCommission { rate: 0.01 }));
    let (results, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 50.0)]),
        vec![(T1, OrderEvent::market(T1, "AAPL", Side::Buy, 100.0))],
        broker,
    );
    let results = results.unwrap();

    let fills = fills_of(&fills);
    assert_eq!(fills[0].commission, 1.0);
    assert_eq!(results.portfolio.cash(), 100_000.0 - 5_000.0 - 1.0);
    assert_eq!(results.portfolio.total_commission(), 1.0);
}

#[test]
fn test_fixed_slippage_moves_price_against_trader() {
    let broker = ExecutionEngine::new(Box::new(FixedSlippage { bps: 10.0 }), Box::new(NoCommission));
    let (results, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T2, 100.0)]),
        vec![
            (T1, OrderEvent::market(T1, "AAPL", Side::Buy, 10.0)),
            (T2, OrderEvent::market(T2, "AAPL", Side::Sell, 10.0)),
        ],
        broker,
    );
    let results = results.unwrap();
    let fills = fills_of(&fills);

    assert!((fills[0].fill_price - 100.1).abs() < 1e-9);
    assert!((fills[1].fill_price - 99.9).abs() < 1e-9);
    assert!((fills[0].slippage_cost - 1.0).abs() < 1e-9);
    assert!((fills[1].slippage_cost - 1.0).abs() < 1e-9);
    // Round trip loses both slippage legs.
    assert!((results.portfolio.cash() - (100_000.0 - 2.0)).abs() < 1e-6);
    assert!((results.portfolio.realized_pnl() + 2.0).abs() < 1e-6);
}

#[test]
fn test_market_order_priced_at_or_after_order_time() {
    // Order stamped between bars takes the next bar's close.
    let (results, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T3, 120.0)]),
        vec![(T1, OrderEvent::market(T2, "AAPL", Side::Buy, 1.0))],
        plain_broker(),
    );
    results.unwrap();
    assert_eq!(fills_of(&fills)[0].fill_price, 120.0);
}

#[test]
fn test_market_order_without_price_aborts_run() {
    let (results, _) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0)]),
        vec![(T1, OrderEvent::market(T1, "MSFT", Side::Buy, 1.0))],
        plain_broker(),
    );
    match results.unwrap_err() {
        BacktestError::Handler {
            component,
            topic,
            source,
            ..
        } => {
            assert_eq!(component, "broker");
            assert_eq!(topic, Topic::Order);
            let cause = source.downcast_ref::<NoPriceDataError>().unwrap();
            assert_eq!(cause.symbol, "MSFT");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_invalid_orders_are_rejected() {
    let mut missing_limit = OrderEvent::limit(T1, "AAPL", Side::Buy, 1.0, 90.0);
    missing_limit.limit_price = None;
    let (results, _) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0)]),
        vec![
            (T1, OrderEvent::market(T1, "AAPL", Side::Buy, 0.0)),
            (T1, OrderEvent::market(T1, "AAPL", Side::Buy, f64::NAN)),
            (T1, missing_limit),
        ],
        plain_broker(),
    );
    let results = results.unwrap();
    assert_eq!(results.counts.rejections, 3);
    assert_eq!(results.counts.fills, 0);
    assert!(results.expired_orders.is_empty());
}

#[test]
fn test_limit_buy_waits_for_cross_on_later_bar() {
    let (results, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T2, 97.0), (T3, 94.0), (T4, 99.0)]),
        vec![(T1, OrderEvent::limit(T1, "AAPL", Side::Buy, 10.0, 95.0))],
        plain_broker(),
    );
    let results = results.unwrap();
    let fills = fills_of(&fills);

    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].timestamp, T3);
    assert_eq!(fills[0].fill_price, 94.0);
    assert_eq!(results.portfolio.cash(), 100_000.0 - 940.0);
    assert!(results.open_orders.is_empty());
    assert!(results.expired_orders.is_empty());
}

#[test]
fn test_limit_order_never_fills_on_its_own_bar() {
    let (_, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T2, 100.0)]),
        vec![(T1, OrderEvent::limit(T1, "AAPL", Side::Buy, 1.0, 100.0))],
        plain_broker(),
    );
    let fills = fills_of(&fills);
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].timestamp, T2);
}

#[test]
fn test_limit_fill_never_worse_than_limit() {
    let broker = ExecutionEngine::new(Box::new(FixedSlippage { bps: 50.0 }), Box::new(NoCommission));
    let (results, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T2, 100.0)]),
        vec![
            (T1, OrderEvent::market(T1, "AAPL", Side::Buy, 10.0)),
            (T1, OrderEvent::limit(T1, "AAPL", Side::Sell, 10.0, 100.0)),
        ],
        broker,
    );
    results.unwrap();
    let fills = fills_of(&fills);
    assert_eq!(fills.len(), 2);
    // Slipped close would be 99.5; the limit caps it.
    assert_eq!(fills[1].side, Side::Sell);
    assert_eq!(fills[1].fill_price, 100.0);
    assert_eq!(fills[1].slippage_cost, 0.0);
}

#[test]
fn test_limit_revalidated_at_trigger() {
    // Sell limit placed before any position exists and never backed by one.
    let (results, fills) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T2, 110.0)]),
        vec![(T1, OrderEvent::limit(T1, "AAPL", Side::Sell, 5.0, 105.0))],
        plain_broker(),
    );
    let results = results.unwrap();
    assert!(fills_of(&fills).is_empty());
    let rejection = results.rejections().next().unwrap();
    assert_eq!(rejection.timestamp, T2);
}

#[test]
fn test_unfilled_limit_expires_at_end_by_default() {
    let (results, _) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T2, 101.0)]),
        vec![(T1, OrderEvent::limit(T1, "AAPL", Side::Buy, 1.0, 50.0))],
        plain_broker(),
    );
    let results = results.unwrap();
    assert_eq!(results.expired_orders.len(), 1);
    assert!(results.open_orders.is_empty());
    assert_eq!(results.expired_orders[0].limit_price, Some(50.0));

    let summary = results.component("broker").unwrap().summary.as_ref().unwrap();
    assert_eq!(summary["stats"]["limit_orders_expired"], 1);
}

#[test]
fn test_unfilled_limit_can_persist() {
    let (results, _) = run(
        config(&["AAPL"]),
        aapl(&[(T1, 100.0), (T2, 101.0)]),
        vec![(T1, OrderEvent::limit(T1, "AAPL", Side::Buy, 1.0, 50.0))],
        plain_broker().with_expiry(LimitOrderExpiry::PersistUnfilled),
    );
    let results = results.unwrap();
    assert!(results.expired_orders.is_empty());
    assert_eq!(results.open_orders.len(), 1);
}

/// Sends one market buy from inside the first portfolio update it sees.
struct Chaser {
    quantity: Quantity,
    sent: bool,
}

impl Subscriber for Chaser {
    fn name(&self) -> &str {
        "chaser"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::PortfolioUpdate]
    }

    fn on_event(&mut self, event: &Event, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        if let Event::PortfolioUpdate(update) = event {
            if !self.sent {
                self.sent = true;
                let order = OrderEvent::market(update.timestamp, update.symbol.clone(), Side::Buy, self.quantity);
                ctx.publish(order, PublishMode::Immediate)?;
            }
        }
        Ok(())
    }
}

impl Strategy for Chaser {}

#[test]
fn test_order_from_update_during_limit_fill_runs_after_broker_returns() {
    let recorder = Recorder::new(&[Topic::Order, Topic::Fill]);
    let log = recorder.log.clone();

    let mut backtest = Backtest::new(config(&["AAPL"]));
    backtest
        .set_data_feed(aapl(&[(T1, 100.0), (T2, 94.0)]))
        .set_broker(plain_broker())
        .add_strategy(Scripted::new(vec![(
            T1,
            OrderEvent::limit(T1, "AAPL", Side::Buy, 10.0, 95.0),
        )]))
        .add_strategy(Chaser {
            quantity: 5.0,
            sent: false,
        })
        .add_analyzer(recorder);
    let results = backtest.run().unwrap();

    // The broker is still inside the bar handler that filled the limit when
    // the new order arrives, so that order waits for the handler to return.
    let topics: Vec<Topic> = log.borrow().iter().map(Event::topic).collect();
    assert_eq!(topics, vec![Topic::Order, Topic::Fill, Topic::Order, Topic::Fill]);
    let fills = fills_of(&log);
    assert_eq!(fills[0].quantity, 10.0);
    assert_eq!(fills[0].fill_price, 94.0);
    assert_eq!(fills[1].quantity, 5.0);
    assert_eq!(fills[1].fill_price, 94.0);
    assert!(fills.iter().all(|f| f.timestamp == T2));

    assert_eq!(results.counts.fills, 2);
    assert_eq!(results.portfolio.quantity("AAPL"), 15.0);
    assert_eq!(results.portfolio.cash(), 100_000.0 - 15.0 * 94.0);
    assert!(results.open_orders.is_empty());
}
