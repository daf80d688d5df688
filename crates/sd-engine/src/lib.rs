//! Per-plan strategy engine: the compiled FSM and its bar-processing
//! protocol.
//!
//! One engine owns one plan's `RuntimeState`; the orchestrator serializes
//! `process_bar` calls per engine, so nothing here needs interior locking.
//! Bar processing never fails because of persistence — repository errors
//! are logged and swallowed — but broker submission errors propagate and
//! park the engine in a non-terminal `error` state.

mod emit;
mod rth;

pub use emit::ActiveBracket;
pub use rth::is_rth;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use sd_broker_tws::{BrokerError, TwsBroker};
use sd_db::Repository;
use sd_plan::{state_requires_streaming, CompiledIr, Env, Value};
use sd_risk::SizingLimits;
use sd_schemas::{Bar, OrderRecord, OrderStatus};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct BarOptions {
    /// Replayed bars never count toward real-time counters and never
    /// double-submit orders.
    pub replay: bool,
}

/// What happened to one bar.
#[derive(Debug, Clone, PartialEq)]
pub enum BarOutcome {
    /// `ts ≤ last_bar_ts`: duplicate or out-of-order, skipped.
    Stale,
    /// OHLCV invariants violated; dropped at the boundary.
    Invalid,
    Processed { transition: Option<TakenTransition> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TakenTransition {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Running,
    /// Current state is terminal; the orchestrator will close the plan.
    Closed,
    /// Parked after a broker failure; operator action required.
    Errored,
}

#[derive(Debug)]
pub enum EngineError {
    Broker(BrokerError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Broker(e) => write!(f, "broker failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Sizing knobs shared with the proposer's gate defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rr_target: f64,
    pub max_entry_distance_pct: f64,
    pub limits: SizingLimits,
    pub allow_cancel_entries: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rr_target: 3.0,
            max_entry_distance_pct: 3.0,
            limits: SizingLimits::default(),
            allow_cancel_entries: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// The engine's name for the implicit error-parking state. Not part of any
/// plan topology; no transitions leave it, but it is never treated as
/// terminal (closing the plan is the orchestrator's decision, parking is
/// not closing).
pub const ERROR_STATE: &str = "error";

#[derive(Debug)]
pub struct RuntimeState {
    pub current_state: String,
    pub bar_count: u64,
    pub bars_in_state: u32,
    pub history: VecDeque<Bar>,
    pub features: HashMap<String, Option<f64>>,
    pub last_bar_ts: i64,
    /// `(state, bar_ts)` pairs that already emitted orders.
    pub emitted: HashSet<(String, i64)>,
    pub active_bracket: Option<ActiveBracket>,
}

pub struct StrategyEngine {
    plan_id: Uuid,
    ir: CompiledIr,
    state: RuntimeState,
    repo: Arc<dyn Repository>,
    broker: Arc<TwsBroker>,
    config: EngineConfig,
}

impl StrategyEngine {
    pub fn new(
        plan_id: Uuid,
        ir: CompiledIr,
        repo: Arc<dyn Repository>,
        broker: Arc<TwsBroker>,
        config: EngineConfig,
    ) -> Self {
        let initial = ir.initial_state().to_string();
        let capacity = ir.history_capacity();
        Self {
            plan_id,
            ir,
            state: RuntimeState {
                current_state: initial,
                bar_count: 0,
                bars_in_state: 0,
                history: VecDeque::with_capacity(capacity),
                features: HashMap::new(),
                last_bar_ts: i64::MIN,
                emitted: HashSet::new(),
                active_bracket: None,
            },
            repo,
            broker,
            config,
        }
    }

    /// Restore state after an orchestrator restart: last persisted FSM
    /// state, watermark, emission keys, and any live bracket.
    pub fn rehydrate(
        &mut self,
        current_state: Option<&str>,
        last_bar_ts: Option<i64>,
        orders: &[OrderRecord],
    ) {
        if let Some(state) = current_state {
            if self.ir.state(state).is_some() || state == ERROR_STATE {
                self.state.current_state = state.to_string();
            } else {
                warn!(plan_id = %self.plan_id, state, "unknown persisted state ignored");
            }
        }
        if let Some(ts) = last_bar_ts {
            self.state.last_bar_ts = ts;
        }
        for order in orders {
            if let (Some(state), Some(ts)) = (&order.signal_state, order.signal_bar_ts) {
                self.state.emitted.insert((state.clone(), ts));
            }
        }
        self.state.active_bracket = emit::rebuild_bracket(orders);
        info!(
            plan_id = %self.plan_id,
            state = %self.state.current_state,
            emitted = self.state.emitted.len(),
            "engine rehydrated"
        );
    }

    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn ir(&self) -> &CompiledIr {
        &self.ir
    }

    pub fn current_state(&self) -> &str {
        &self.state.current_state
    }

    pub fn last_bar_ts(&self) -> i64 {
        self.state.last_bar_ts
    }

    pub fn bar_count(&self) -> u64 {
        self.state.bar_count
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.state.features.get(name).copied().flatten()
    }

    /// Streaming requirement for the current state (name-based gating).
    pub fn requires_streaming(&self) -> bool {
        state_requires_streaming(&self.state.current_state)
    }

    pub fn status(&self) -> EngineStatus {
        if self.state.current_state == ERROR_STATE {
            return EngineStatus::Errored;
        }
        // Terminal by topology, and only for states the plan declares.
        if self.ir.state(&self.state.current_state).is_some()
            && self.ir.is_terminal(&self.state.current_state)
        {
            EngineStatus::Closed
        } else {
            EngineStatus::Running
        }
    }

    /// Process one bar. Deterministic for a given bar sequence; at most
    /// one transition per bar.
    pub async fn process_bar(
        &mut self,
        bar: Bar,
        opts: BarOptions,
    ) -> Result<BarOutcome, EngineError> {
        if let Err(e) = bar.validate() {
            warn!(plan_id = %self.plan_id, error = %e, "invalid bar dropped");
            return Ok(BarOutcome::Invalid);
        }
        if bar.ts <= self.state.last_bar_ts {
            debug!(plan_id = %self.plan_id, ts = bar.ts, "stale bar skipped");
            return Ok(BarOutcome::Stale);
        }

        if self.state.history.len() >= self.ir.history_capacity() {
            self.state.history.pop_front();
        }
        self.state.history.push_back(bar);
        self.state.last_bar_ts = bar.ts;
        if !opts.replay {
            self.state.bar_count += 1;
            self.state.bars_in_state = self.state.bars_in_state.saturating_add(1);
        }

        self.recompute_features();
        self.sync_bracket_fills().await;

        if !opts.replay {
            if let Some(outcome) = self.check_entry_timeout(bar.ts).await? {
                return Ok(outcome);
            }
        }

        let in_session = !self.ir.execution.rth_only || rth::is_rth(bar.ts);
        let env = self.build_env();

        // Evaluate in configuration order; first true wins.
        let candidates: Vec<(String, sd_plan::Expr)> = self
            .ir
            .transitions_from(&self.state.current_state)
            .map(|t| (t.to.clone(), t.when.clone()))
            .collect();
        let mut taken: Option<String> = None;
        for (to, when) in candidates {
            let fired = match when.eval(&env) {
                Ok(Value::Bool(b)) => b,
                Ok(Value::Num(_)) => {
                    debug!(plan_id = %self.plan_id, to = %to, "numeric condition treated as not met");
                    false
                }
                Err(e) => {
                    debug!(plan_id = %self.plan_id, to = %to, error = %e, "eval failed, condition not met");
                    false
                }
            };
            if fired {
                taken = Some(to);
                break;
            }
        }

        let Some(to) = taken else {
            return Ok(BarOutcome::Processed { transition: None });
        };

        let order_plan = self.ir.state(&to).and_then(|s| s.order_plan);
        if let Some(plan_idx) = order_plan {
            if !in_session {
                debug!(plan_id = %self.plan_id, to = %to, "outside RTH, order transition suppressed");
                return Ok(BarOutcome::Processed { transition: None });
            }
            match self.emit_orders(plan_idx, &to, bar, opts.replay).await {
                Ok(true) => {}
                Ok(false) => {
                    // Gate- or sizing-rejected: the engine stays where it
                    // is and the condition may re-fire on a later bar.
                    return Ok(BarOutcome::Processed { transition: None });
                }
                Err(e) => {
                    self.park_error(&e).await;
                    return Err(EngineError::Broker(e));
                }
            }
        }

        let from = std::mem::replace(&mut self.state.current_state, to.clone());
        self.state.bars_in_state = 0;
        self.persist_transition(&from, &to, bar.ts).await;
        Ok(BarOutcome::Processed {
            transition: Some(TakenTransition { from, to }),
        })
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn recompute_features(&mut self) {
        let bars: Vec<Bar> = self.state.history.iter().copied().collect();
        self.state.features.clear();
        for spec in &self.ir.features {
            self.state
                .features
                .insert(spec.env_name(), spec.compute(&bars));
        }
    }

    /// Features plus the runtime identifiers the compiler reserves.
    fn build_env(&self) -> Env {
        let mut env: Env = self
            .state
            .features
            .iter()
            .filter_map(|(k, v)| v.map(|val| (k.clone(), val)))
            .collect();

        let (entry_filled, bracket_done) = match &self.state.active_bracket {
            Some(bracket) => match self.broker.bracket_snapshot(bracket.parent_id) {
                Some(snap) => (
                    snap.entry.status == OrderStatus::Filled,
                    snap.is_done(),
                ),
                None => (false, false),
            },
            None => (false, false),
        };
        env.insert("entry_filled".into(), if entry_filled { 1.0 } else { 0.0 });
        env.insert("bracket_done".into(), if bracket_done { 1.0 } else { 0.0 });
        env.insert("bars_in_state".into(), f64::from(self.state.bars_in_state));
        env
    }

    /// Mirror broker fill state into the order rows (best effort).
    async fn sync_bracket_fills(&self) {
        let Some(bracket) = &self.state.active_bracket else {
            return;
        };
        for (local, broker_id) in bracket.legs() {
            if let Some(snap) = self.broker.order_snapshot(broker_id) {
                if let Err(e) = self
                    .repo
                    .update_order_status(local, snap.status, snap.filled_qty, snap.avg_fill_price)
                    .await
                {
                    warn!(plan_id = %self.plan_id, error = %e, "order status sync failed");
                }
            }
        }
    }

    /// Cancel unfilled entries once the timeout budget is spent.
    async fn check_entry_timeout(&mut self, bar_ts: i64) -> Result<Option<BarOutcome>, EngineError> {
        let timeout = self.ir.execution.entry_timeout_bars;
        if timeout == 0 || !self.config.allow_cancel_entries {
            return Ok(None);
        }
        let Some(bracket) = &self.state.active_bracket else {
            return Ok(None);
        };
        let entry_filled = self
            .broker
            .bracket_snapshot(bracket.parent_id)
            .map(|s| s.entry.status == OrderStatus::Filled)
            .unwrap_or(false);
        if entry_filled || self.state.bars_in_state <= timeout {
            return Ok(None);
        }

        info!(
            plan_id = %self.plan_id,
            bars_in_state = self.state.bars_in_state,
            timeout,
            "entry timeout, cancelling open entries"
        );
        let parent = bracket.parent_id;
        match self.broker.cancel_open_entries(&[parent.to_string()]).await {
            Ok(_) => {
                // Mirror the cancels into the order rows before dropping
                // the bracket from runtime state.
                self.sync_bracket_fills().await;
                self.state.active_bracket = None;
                if self.ir.state("exited").is_some() {
                    let from =
                        std::mem::replace(&mut self.state.current_state, "exited".to_string());
                    self.state.bars_in_state = 0;
                    self.persist_transition(&from, "exited", bar_ts).await;
                    return Ok(Some(BarOutcome::Processed {
                        transition: Some(TakenTransition {
                            from,
                            to: "exited".into(),
                        }),
                    }));
                }
                Ok(Some(BarOutcome::Processed { transition: None }))
            }
            Err(e) => {
                self.park_error(&e).await;
                Err(EngineError::Broker(e))
            }
        }
    }

    async fn park_error(&mut self, cause: &BrokerError) {
        warn!(plan_id = %self.plan_id, error = %cause, "engine parked in error state");
        let from = std::mem::replace(&mut self.state.current_state, ERROR_STATE.to_string());
        self.state.bars_in_state = 0;
        self.persist_transition(&from, ERROR_STATE, self.state.last_bar_ts)
            .await;
    }

    /// Persist state + audit. Failures are logged, never propagated: bar
    /// processing must not stall on the repository.
    async fn persist_transition(&self, from: &str, to: &str, bar_ts: i64) {
        info!(plan_id = %self.plan_id, from, to, bar_ts, "state transition");
        if let Err(e) = self.repo.set_plan_state(self.plan_id, to).await {
            warn!(plan_id = %self.plan_id, error = %e, "state persist failed");
        }
        let record = sd_schemas::AuditRecord {
            id: Uuid::new_v4(),
            plan_id: Some(self.plan_id),
            topic: "engine".into(),
            event_type: "state_change".into(),
            payload: serde_json::json!({ "from": from, "to": to, "bar_ts": bar_ts }),
            ts_utc: chrono::Utc::now(),
        };
        if let Err(e) = self.repo.append_audit(&record).await {
            warn!(plan_id = %self.plan_id, error = %e, "audit write failed");
        }
    }
}
