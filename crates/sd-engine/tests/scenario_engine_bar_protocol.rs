//! Scenario: engine bar-processing protocol.
//!
//! Invariants under test:
//!
//! 1. Bars with `ts ≤ last_bar_ts` never alter engine state.
//! 2. The synthesized FSM walks init → armed → triggered → placed, with
//!    invalidate taking precedence over trigger.
//! 3. Entering the order state submits exactly one bracket (three order
//!    rows) and records the emission key.
//! 4. Replayed bars neither bump real-time counters nor double-submit.
//! 5. Terminal detection is topological; streaming gating is name-based.
//! 6. Gate rejection leaves the engine in its arming state.
//! 7. Entry timeout cancels open entries and exits.
//!
//! Everything runs in-process: memory repository + dry-run broker.

use std::sync::Arc;

use sd_broker_tws::{TwsBroker, TwsConfig};
use sd_db::{MemoryRepository, OrderRepository, Repository};
use sd_engine::{BarOptions, BarOutcome, EngineConfig, EngineStatus, StrategyEngine};
use sd_schemas::{Bar, OrderRole, PlanStatus, Timeframe};
use uuid::Uuid;

const PLAN_YAML: &str = r#"
meta: {name: breakout-test, symbol: TEST, timeframe: 5m}
rules:
  arm: "close > 100"
  trigger: "close > 105"
  invalidate: "close < 95"
order_plans:
  - side: buy
    entry_zone: ["close", "close + 0.5"]
    stop: "close - 2"
    targets: [{price: "close + 10"}]
execution: {entry_timeout_bars: 3, rth_only: false}
risk: {max_risk_per_trade: 100}
"#;

fn bar(ts: i64, close: f64) -> Bar {
    Bar {
        ts,
        open: close,
        high: close + 0.5,
        low: close - 0.5,
        close,
        volume: 1_000,
    }
}

const STEP: i64 = 300_000;
const T0: i64 = 1_700_000_000_000;

async fn new_engine() -> (StrategyEngine, Arc<MemoryRepository>, Arc<TwsBroker>, Uuid) {
    let repo = Arc::new(MemoryRepository::new());
    let broker = Arc::new(TwsBroker::new(TwsConfig::new("127.0.0.1", 0, 1, true)));
    broker.connect().await.unwrap();
    let ir = sd_plan::compile(PLAN_YAML).unwrap();
    let plan_id = Uuid::new_v4();
    let tf: Timeframe = "5m".parse().unwrap();
    let plan = sd_db::new_plan_record("u1", "TEST", tf, "breakout-test", PLAN_YAML, PlanStatus::Active);
    let plan = sd_schemas::PlanRecord { id: plan_id, ..plan };
    sd_db::PlanRepository::create_plan(repo.as_ref(), &plan).await.unwrap();

    let engine = StrategyEngine::new(
        plan_id,
        ir,
        repo.clone() as Arc<dyn Repository>,
        broker.clone(),
        EngineConfig::default(),
    );
    (engine, repo, broker, plan_id)
}

async fn feed(engine: &mut StrategyEngine, ts: i64, close: f64) -> BarOutcome {
    engine
        .process_bar(bar(ts, close), BarOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn arm_then_trigger_submits_one_bracket() {
    let (mut engine, repo, _broker, plan_id) = new_engine().await;

    assert_eq!(engine.current_state(), "init");
    feed(&mut engine, T0, 99.0).await;
    assert_eq!(engine.current_state(), "init");

    feed(&mut engine, T0 + STEP, 101.0).await;
    assert_eq!(engine.current_state(), "armed");

    let outcome = feed(&mut engine, T0 + 2 * STEP, 106.0).await;
    assert_eq!(engine.current_state(), "triggered");
    assert!(matches!(outcome, BarOutcome::Processed { transition: Some(_) }));

    let orders = repo.orders_for_plan(plan_id).await.unwrap();
    assert_eq!(orders.len(), 3, "bracket is exactly three legs");
    let roles: Vec<OrderRole> = orders.iter().map(|o| o.role).collect();
    assert!(roles.contains(&OrderRole::Entry));
    assert!(roles.contains(&OrderRole::TakeProfit));
    assert!(roles.contains(&OrderRole::StopLoss));
    for o in &orders {
        assert_eq!(o.signal_state.as_deref(), Some("triggered"));
        assert_eq!(o.signal_bar_ts, Some(T0 + 2 * STEP));
        assert!(o.broker_order_id.is_some());
    }
    // Bracket price invariant: stop < entry_low <= entry_high < target.
    let entry = orders.iter().find(|o| o.role == OrderRole::Entry).unwrap();
    let tp = orders.iter().find(|o| o.role == OrderRole::TakeProfit).unwrap();
    let sl = orders.iter().find(|o| o.role == OrderRole::StopLoss).unwrap();
    assert!(sl.stop_price.unwrap() < entry.limit_price.unwrap());
    assert!(entry.limit_price.unwrap() < tp.limit_price.unwrap());
}

#[tokio::test]
async fn stale_and_duplicate_bars_are_rejected() {
    let (mut engine, _repo, _broker, _plan_id) = new_engine().await;
    feed(&mut engine, T0, 101.0).await;
    assert_eq!(engine.current_state(), "armed");
    assert_eq!(engine.bar_count(), 1);

    // Same timestamp: duplicate, skipped.
    let outcome = feed(&mut engine, T0, 106.0).await;
    assert_eq!(outcome, BarOutcome::Stale);
    assert_eq!(engine.current_state(), "armed");
    assert_eq!(engine.bar_count(), 1);

    // Older timestamp: also skipped.
    let outcome = feed(&mut engine, T0 - STEP, 106.0).await;
    assert_eq!(outcome, BarOutcome::Stale);
    assert_eq!(engine.current_state(), "armed");
}

#[tokio::test]
async fn invalidate_precedes_trigger() {
    let (mut engine, _repo, _broker, _plan_id) = new_engine().await;
    feed(&mut engine, T0, 101.0).await;
    assert_eq!(engine.current_state(), "armed");
    // Below the invalidate level: armed → exited, not triggered.
    feed(&mut engine, T0 + STEP, 94.0).await;
    assert_eq!(engine.current_state(), "exited");
    assert_eq!(engine.status(), EngineStatus::Closed);
}

#[tokio::test]
async fn replay_does_not_double_submit() {
    let (mut engine, repo, broker, plan_id) = new_engine().await;
    feed(&mut engine, T0, 101.0).await;
    feed(&mut engine, T0 + STEP, 106.0).await;
    assert_eq!(repo.orders_for_plan(plan_id).await.unwrap().len(), 3);

    // Fresh engine (restart), rehydrated from persisted state + orders.
    let ir = sd_plan::compile(PLAN_YAML).unwrap();
    let mut restarted = StrategyEngine::new(
        plan_id,
        ir,
        repo.clone() as Arc<dyn Repository>,
        broker.clone(),
        EngineConfig::default(),
    );
    let orders = repo.orders_for_plan(plan_id).await.unwrap();
    restarted.rehydrate(Some("armed"), Some(T0), &orders);

    // Replaying the trigger bar commits the transition but must not
    // submit a second bracket, and must not count as a real-time bar.
    let outcome = restarted
        .process_bar(bar(T0 + STEP, 106.0), BarOptions { replay: true })
        .await
        .unwrap();
    assert!(matches!(outcome, BarOutcome::Processed { transition: Some(_) }));
    assert_eq!(restarted.current_state(), "triggered");
    assert_eq!(restarted.bar_count(), 0);
    assert_eq!(repo.orders_for_plan(plan_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn streaming_gating_follows_state_name() {
    let (mut engine, _repo, _broker, _plan_id) = new_engine().await;
    assert!(!engine.requires_streaming(), "init does not stream");
    feed(&mut engine, T0, 101.0).await;
    assert!(engine.requires_streaming(), "armed streams");
}

#[tokio::test]
async fn gate_rejection_keeps_engine_armed() {
    // Target barely above the zone: R:R far below 3, gate B rejects.
    let yaml = PLAN_YAML.replace("close + 10", "close + 1");
    let repo = Arc::new(MemoryRepository::new());
    let broker = Arc::new(TwsBroker::new(TwsConfig::new("127.0.0.1", 0, 1, true)));
    broker.connect().await.unwrap();
    let ir = sd_plan::compile(&yaml).unwrap();
    let plan_id = Uuid::new_v4();
    let mut engine = StrategyEngine::new(
        plan_id,
        ir,
        repo.clone() as Arc<dyn Repository>,
        broker,
        EngineConfig::default(),
    );

    engine.process_bar(bar(T0, 101.0), BarOptions::default()).await.unwrap();
    assert_eq!(engine.current_state(), "armed");
    let outcome = engine
        .process_bar(bar(T0 + STEP, 106.0), BarOptions::default())
        .await
        .unwrap();
    // Trigger fired but the bracket was rejected: no transition, no orders.
    assert_eq!(outcome, BarOutcome::Processed { transition: None });
    assert_eq!(engine.current_state(), "armed");
    assert!(repo.orders_for_plan(plan_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn entry_timeout_cancels_and_exits() {
    let (mut engine, repo, _broker, plan_id) = new_engine().await;
    feed(&mut engine, T0, 101.0).await;
    feed(&mut engine, T0 + STEP, 106.0).await; // triggered + bracket
    feed(&mut engine, T0 + 2 * STEP, 100.0).await; // → placed
    assert_eq!(engine.current_state(), "placed");

    // Dry-run entries never fill; burn through the 3-bar timeout.
    for i in 3..6 {
        feed(&mut engine, T0 + i * STEP, 100.0).await;
        assert_eq!(engine.current_state(), "placed");
    }
    feed(&mut engine, T0 + 6 * STEP, 100.0).await;
    assert_eq!(engine.current_state(), "exited");
    assert_eq!(engine.status(), EngineStatus::Closed);

    // All legs observed cancelled through the status sync.
    let open = repo.open_orders_for_plan(plan_id).await.unwrap();
    assert!(open.is_empty(), "no live orders after timeout cancel");
}
