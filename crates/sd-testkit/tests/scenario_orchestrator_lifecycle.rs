//! Scenario: orchestrator control loop end-to-end (in-process).
//!
//! A PENDING plan is picked up, compiled, activated, warmed up from the
//! cache, streamed live bars while its state requires streaming, and
//! closed once its FSM reaches a terminal state. A plan that does not
//! compile goes FAILED with a reason instead of looping forever.

use std::collections::HashMap;
use std::sync::Arc;

use sd_barcache::BarCache;
use sd_broker_tws::{TwsBroker, TwsConfig};
use sd_config::AppConfig;
use sd_db::{BarRepository, MemoryRepository, PlanRepository, Repository};
use sd_orchestrator::{AppContext, Orchestrator, RealtimeBarSource};
use sd_schemas::{Bar, PlanStatus, Timeframe};
use sd_testkit::ScriptedBarSource;

const PLAN_YAML: &str = r#"
meta: {name: lifecycle-test, symbol: TEST, timeframe: 1m}
rules:
  arm: "close > 100"
  trigger: "close > 105"
  invalidate: "close < 95"
order_plans:
  - side: buy
    entry_zone: ["close", "close + 0.5"]
    stop: "close - 2"
    targets: [{price: "close + 10"}]
execution: {entry_timeout_bars: 10, rth_only: false}
risk: {max_risk_per_trade: 100}
"#;

const T0: i64 = 1_700_000_000_000;
const STEP: i64 = 60_000;

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

fn tf() -> Timeframe {
    "1m".parse().unwrap()
}

struct Harness {
    orchestrator: Orchestrator,
    repo: Arc<MemoryRepository>,
    source: Arc<ScriptedBarSource>,
}

async fn harness() -> Harness {
    let repo = Arc::new(MemoryRepository::new());
    let repo_dyn: Arc<dyn Repository> = repo.clone();
    let cache = Arc::new(BarCache::new(
        repo.clone() as Arc<dyn BarRepository>,
        60_000,
    ));
    let broker = Arc::new(TwsBroker::new(TwsConfig::new("127.0.0.1", 0, 1, true)));
    broker.connect().await.unwrap();

    let config = AppConfig::from_map(&HashMap::new()).unwrap();
    let source = Arc::new(ScriptedBarSource::new());

    let ctx = AppContext {
        repo: repo_dyn,
        broker,
        cache,
        config,
    };
    let orchestrator = Orchestrator::new(ctx, source.clone() as Arc<dyn RealtimeBarSource>);
    Harness {
        orchestrator,
        repo,
        source,
    }
}

async fn add_pending_plan(repo: &MemoryRepository, yaml: &str) -> uuid::Uuid {
    let plan = sd_db::new_plan_record("default", "TEST", tf(), "lifecycle-test", yaml, PlanStatus::Pending);
    let id = plan.id;
    repo.create_plan(&plan).await.unwrap();
    id
}

#[tokio::test]
async fn pending_plan_activates_and_streams_when_armed() {
    let mut h = harness().await;

    // Warmup history ends above the arm level: replay leaves the FSM armed.
    let history: Vec<Bar> = vec![bar(T0, 99.0), bar(T0 + STEP, 99.5), bar(T0 + 2 * STEP, 101.0)];
    h.repo.upsert_bars("TEST", tf(), &history).await.unwrap();
    let plan_id = add_pending_plan(&h.repo, PLAN_YAML).await;

    h.orchestrator.tick().await;

    let plan = h.repo.get_plan(plan_id).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Active);
    assert!(plan.activated_at.is_some());
    assert_eq!(h.orchestrator.engine_count(), 1);
    assert_eq!(h.orchestrator.engine_state(plan_id).as_deref(), Some("armed"));

    // Armed requires streaming: exactly one subscription for (TEST, 1m).
    assert_eq!(h.orchestrator.streaming_keys().len(), 1);
    assert_eq!(h.source.subscriptions("TEST", tf()), 1);
}

#[tokio::test]
async fn live_invalidation_closes_the_plan() {
    let mut h = harness().await;
    let history: Vec<Bar> = vec![bar(T0, 99.0), bar(T0 + STEP, 101.0)];
    h.repo.upsert_bars("TEST", tf(), &history).await.unwrap();
    let plan_id = add_pending_plan(&h.repo, PLAN_YAML).await;

    h.orchestrator.tick().await;
    assert_eq!(h.orchestrator.engine_state(plan_id).as_deref(), Some("armed"));

    // Live bar under the invalidate level: armed → exited (terminal).
    h.source.push("TEST", tf(), bar(T0 + 2 * STEP, 94.0));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.orchestrator.pump_live().await;
    assert_eq!(h.orchestrator.engine_state(plan_id).as_deref(), Some("exited"));

    // Next tick reaps the terminal engine and closes the plan.
    h.orchestrator.tick().await;
    let plan = h.repo.get_plan(plan_id).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Closed);
    assert!(plan.closed_at.is_some());
    assert_eq!(h.orchestrator.engine_count(), 0);
    assert!(h.orchestrator.streaming_keys().is_empty());
    assert!(h.source.unsubscriptions("TEST", tf()) >= 1);
}

#[tokio::test]
async fn streamed_bars_are_persisted_through_the_cache() {
    let mut h = harness().await;
    let history: Vec<Bar> = vec![bar(T0, 99.0), bar(T0 + STEP, 101.0)];
    h.repo.upsert_bars("TEST", tf(), &history).await.unwrap();
    add_pending_plan(&h.repo, PLAN_YAML).await;
    h.orchestrator.tick().await;

    let live = bar(T0 + 2 * STEP, 102.0);
    h.source.push("TEST", tf(), live);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.orchestrator.pump_live().await;

    let stored = h.repo.fetch_bars("TEST", tf(), 0).await.unwrap();
    assert_eq!(stored.len(), 3, "live bar must be upserted");
    assert_eq!(stored.last().unwrap().ts, live.ts);
}

#[tokio::test]
async fn uncompilable_plan_goes_failed_with_reason() {
    let mut h = harness().await;
    let plan_id = add_pending_plan(&h.repo, "meta: {name: broken}").await;

    h.orchestrator.tick().await;

    let plan = h.repo.get_plan(plan_id).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Failed);
    assert!(plan.fail_reason.is_some());
    assert_eq!(h.orchestrator.engine_count(), 0);
}

#[tokio::test]
async fn capacity_cap_leaves_excess_plans_pending() {
    let mut h = harness().await;
    h.repo.upsert_bars("TEST", tf(), &[bar(T0, 99.0)]).await.unwrap();

    // Default cap is 10; create 12 pending plans.
    let mut ids = Vec::new();
    for i in 0..12 {
        let yaml = PLAN_YAML.replace("lifecycle-test", &format!("plan-{i}"));
        ids.push(add_pending_plan(&h.repo, &yaml).await);
    }

    h.orchestrator.tick().await;
    assert_eq!(h.orchestrator.engine_count(), 10);
    let still_pending = h
        .repo
        .list_plans("default", Some(PlanStatus::Pending))
        .await
        .unwrap();
    assert_eq!(still_pending.len(), 2, "excess plans stay queued");
}
