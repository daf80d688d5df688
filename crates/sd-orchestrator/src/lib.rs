//! Orchestrator: discovers plans, owns engines, routes bars, reaps
//! terminal states, and coordinates streaming subscriptions.
//!
//! All engines live on the orchestrator's single event loop, which is
//! what serializes `process_bar` per plan. The loop multiplexes three
//! inputs: the watch-interval ticker, live streamed bars, and the
//! shutdown channel.

mod stream;

pub use stream::{NullBarSource, RealtimeBarSource, StreamKey, StreamRouter};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use sd_barcache::BarCache;
use sd_broker_tws::TwsBroker;
use sd_config::AppConfig;
use sd_db::Repository;
use sd_engine::{BarOptions, EngineConfig, EngineStatus, StrategyEngine};
use sd_risk::SizingLimits;
use sd_schemas::{Bar, PlanRecord, PlanStatus};

/// Everything the orchestrator needs, passed explicitly (no process-wide
/// singletons).
pub struct AppContext {
    pub repo: Arc<dyn Repository>,
    pub broker: Arc<TwsBroker>,
    pub cache: Arc<BarCache>,
    pub config: AppConfig,
}

pub struct Orchestrator {
    ctx: AppContext,
    engines: HashMap<Uuid, StrategyEngine>,
    /// Last historical-fetch wall-clock per plan, ms.
    last_fetch_ms: HashMap<Uuid, i64>,
    router: StreamRouter,
    /// Taken out of the struct while `run` owns the select loop.
    live_rx: Option<mpsc::Receiver<(StreamKey, Bar)>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// How many bars one fetch pulls: enough to warm every indicator in a
/// fresh engine; incremental fetches discard already-seen bars anyway.
const FETCH_LIMIT: u32 = 200;

impl Orchestrator {
    pub fn new(ctx: AppContext, source: Arc<dyn RealtimeBarSource>) -> Self {
        let (live_tx, live_rx) = mpsc::channel(256);
        Self {
            engines: HashMap::new(),
            last_fetch_ms: HashMap::new(),
            router: StreamRouter::new(source, live_tx),
            live_rx: Some(live_rx),
            ctx,
        }
    }

    fn engine_config(&self) -> EngineConfig {
        let risk = &self.ctx.config.risk;
        EngineConfig {
            rr_target: 3.0,
            max_entry_distance_pct: 3.0,
            limits: SizingLimits {
                buying_power: None,
                buying_power_factor: risk.buying_power_factor,
                max_order_qty: risk.max_order_qty,
                max_notional_per_symbol: risk.max_notional_per_symbol,
            },
            allow_cancel_entries: self.ctx.config.broker.allow_cancel_entries,
        }
    }

    /// Run until the shutdown channel flips true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        // Restart recovery before anything trades: rebuild the broker id
        // map from persisted open orders so cancellation keeps working.
        match self.ctx.repo.recovery_pairs().await {
            Ok(pairs) if !pairs.is_empty() => self.ctx.broker.recover_order_map(&pairs),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "recovery pair load failed"),
        }

        let interval = self.ctx.config.orchestrator.watch_interval_ms;
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            user = %self.ctx.config.orchestrator.user_id,
            interval_ms = interval,
            "orchestrator running"
        );

        let mut live_rx = self.live_rx.take().expect("run called once at a time");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                Some((key, bar)) = live_rx.recv() => self.route_live_bar(key, bar).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.live_rx = Some(live_rx);

        self.shutdown_cleanup().await;
    }

    /// One control-loop pass. Public so tests drive it without timers.
    pub async fn tick(&mut self) {
        self.pickup_pending().await;
        self.rehydrate_active().await;
        self.feed_historical_bars().await;
        self.reap_terminals().await;
        self.sync_streaming();
    }

    /// Drain any queued live bars without the run loop (test seam; the
    /// run loop consumes the same channel via `select!`).
    pub async fn pump_live(&mut self) {
        loop {
            let next = match self.live_rx.as_mut() {
                Some(rx) => rx.try_recv().ok(),
                None => None,
            };
            let Some((key, bar)) = next else { break };
            self.route_live_bar(key, bar).await;
        }
    }

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    pub fn engine_state(&self, plan_id: Uuid) -> Option<String> {
        self.engines.get(&plan_id).map(|e| e.current_state().to_string())
    }

    pub fn streaming_keys(&self) -> Vec<StreamKey> {
        self.router.active_keys()
    }

    // -----------------------------------------------------------------
    // Control-loop stages
    // -----------------------------------------------------------------

    async fn pickup_pending(&mut self) {
        let user = self.ctx.config.orchestrator.user_id.clone();
        let pending = match self.ctx.repo.list_plans(&user, Some(PlanStatus::Pending)).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "pending plan query failed");
                return;
            }
        };

        let cap = self.ctx.config.orchestrator.max_concurrent_strategies;
        for plan in pending.into_iter().rev() {
            // Oldest first; excess stays queued for a later tick.
            if self.engines.len() >= cap {
                info!(cap, "strategy capacity reached, leaving plans queued");
                break;
            }
            self.activate_plan(plan).await;
        }
    }

    async fn activate_plan(&mut self, plan: PlanRecord) {
        let ir = match sd_plan::compile(&plan.yaml_content) {
            Ok(ir) => ir,
            Err(e) => {
                error!(plan_id = %plan.id, error = %e, "plan compile failed");
                if let Err(pe) = self
                    .ctx
                    .repo
                    .update_plan_status(plan.id, PlanStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    warn!(plan_id = %plan.id, error = %pe, "failed-status persist failed");
                }
                return;
            }
        };

        let mut engine = StrategyEngine::new(
            plan.id,
            ir,
            Arc::clone(&self.ctx.repo),
            Arc::clone(&self.ctx.broker),
            self.engine_config(),
        );
        self.warmup_replay(&mut engine).await;

        if let Err(e) = self
            .ctx
            .repo
            .update_plan_status(plan.id, PlanStatus::Active, None)
            .await
        {
            warn!(plan_id = %plan.id, error = %e, "active-status persist failed");
        }
        self.audit(plan.id, "plan_activated", serde_json::json!({ "name": plan.name }))
            .await;
        info!(plan_id = %plan.id, name = %plan.name, symbol = %plan.symbol, "plan activated");
        self.engines.insert(plan.id, engine);
    }

    /// Ensure every ACTIVE plan has an engine (restart rehydration).
    async fn rehydrate_active(&mut self) {
        let user = self.ctx.config.orchestrator.user_id.clone();
        let active = match self.ctx.repo.list_plans(&user, Some(PlanStatus::Active)).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "active plan query failed");
                return;
            }
        };

        for plan in active {
            if self.engines.contains_key(&plan.id) {
                continue;
            }
            if self.engines.len() >= self.ctx.config.orchestrator.max_concurrent_strategies {
                warn!(plan_id = %plan.id, "capacity reached, active plan not rehydrated");
                continue;
            }
            let ir = match sd_plan::compile(&plan.yaml_content) {
                Ok(ir) => ir,
                Err(e) => {
                    error!(plan_id = %plan.id, error = %e, "active plan no longer compiles");
                    if let Err(pe) = self
                        .ctx
                        .repo
                        .update_plan_status(plan.id, PlanStatus::Failed, Some(&e.to_string()))
                        .await
                    {
                        warn!(plan_id = %plan.id, error = %pe, "failed-status persist failed");
                    }
                    continue;
                }
            };

            let mut engine = StrategyEngine::new(
                plan.id,
                ir,
                Arc::clone(&self.ctx.repo),
                Arc::clone(&self.ctx.broker),
                self.engine_config(),
            );
            let orders = self
                .ctx
                .repo
                .orders_for_plan(plan.id)
                .await
                .unwrap_or_default();
            engine.rehydrate(plan.current_state.as_deref(), None, &orders);
            self.warmup_replay(&mut engine).await;
            info!(plan_id = %plan.id, state = %engine.current_state(), "plan rehydrated");
            self.engines.insert(plan.id, engine);
        }
    }

    /// Feed cached history through the replay path to warm indicators.
    async fn warmup_replay(&self, engine: &mut StrategyEngine) {
        let symbol = engine.ir().symbol.clone();
        let timeframe = engine.ir().timeframe;
        let bars = match self.ctx.cache.get_bars(&symbol, timeframe, FETCH_LIMIT).await {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol, error = %e, "warmup bar fetch failed");
                return;
            }
        };
        for bar in bars {
            if let Err(e) = engine.process_bar(bar, BarOptions { replay: true }).await {
                warn!(plan_id = %engine.plan_id(), error = %e, "warmup replay error");
                break;
            }
        }
    }

    /// Poll the cache per plan once per timeframe period.
    async fn feed_historical_bars(&mut self) {
        let now = now_ms();
        let ids: Vec<Uuid> = self.engines.keys().copied().collect();
        for id in ids {
            let (symbol, timeframe, timeframe_ms, last_ts) = {
                let engine = &self.engines[&id];
                (
                    engine.ir().symbol.clone(),
                    engine.ir().timeframe,
                    engine.ir().timeframe.millis(),
                    engine.last_bar_ts(),
                )
            };
            let due = self
                .last_fetch_ms
                .get(&id)
                .map_or(true, |last| now - last >= timeframe_ms);
            if !due {
                continue;
            }
            self.last_fetch_ms.insert(id, now);

            let bars = match self.ctx.cache.get_bars(&symbol, timeframe, FETCH_LIMIT).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(symbol, error = %e, "bar fetch failed");
                    continue;
                }
            };
            let engine = self.engines.get_mut(&id).expect("engine present");
            for bar in bars.into_iter().filter(|b| b.ts > last_ts) {
                if let Err(e) = engine.process_bar(bar, BarOptions::default()).await {
                    error!(plan_id = %id, error = %e, "engine error during bar feed");
                    break;
                }
            }
        }
    }

    /// Route one streamed bar: persist it, then run matching engines.
    async fn route_live_bar(&mut self, key: StreamKey, bar: Bar) {
        if let Err(e) = self
            .ctx
            .cache
            .insert_bars(&key.symbol, key.timeframe, &[bar])
            .await
        {
            warn!(symbol = %key.symbol, error = %e, "live bar persist failed");
        }

        let ids: Vec<Uuid> = self
            .engines
            .iter()
            .filter(|(_, e)| {
                e.ir().symbol == key.symbol
                    && e.ir().timeframe == key.timeframe
                    && e.requires_streaming()
            })
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let engine = self.engines.get_mut(&id).expect("engine present");
            if let Err(e) = engine.process_bar(bar, BarOptions::default()).await {
                error!(plan_id = %id, error = %e, "engine error on live bar");
            }
        }
        self.sync_streaming();
    }

    /// Close plans whose engines reached a terminal state.
    async fn reap_terminals(&mut self) {
        let done: Vec<Uuid> = self
            .engines
            .iter()
            .filter(|(_, e)| e.status() == EngineStatus::Closed)
            .map(|(id, _)| *id)
            .collect();

        for id in done {
            let engine = self.engines.remove(&id).expect("engine present");
            self.last_fetch_ms.remove(&id);
            info!(plan_id = %id, state = %engine.current_state(), "plan reached terminal state");
            if let Err(e) = self
                .ctx
                .repo
                .update_plan_status(id, PlanStatus::Closed, None)
                .await
            {
                warn!(plan_id = %id, error = %e, "closed-status persist failed");
            }
            self.audit(
                id,
                "plan_closed",
                serde_json::json!({ "terminal_state": engine.current_state() }),
            )
            .await;
        }
    }

    /// Subscriptions follow the engines that currently need streaming.
    fn sync_streaming(&mut self) {
        let wanted = self.engines.values().filter(|e| e.requires_streaming()).map(|e| StreamKey {
            symbol: e.ir().symbol.clone(),
            timeframe: e.ir().timeframe,
        });
        self.router.sync(wanted);
    }

    async fn shutdown_cleanup(&mut self) {
        info!("orchestrator shutting down");
        // Order matters: stop taking new work, stop streams, then drop
        // the broker session. Errors are logged, never rethrown.
        self.router.shutdown();
        self.ctx.broker.disconnect().await;
        info!("orchestrator stopped");
    }

    async fn audit(&self, plan_id: Uuid, event_type: &str, payload: serde_json::Value) {
        let record = sd_schemas::AuditRecord {
            id: Uuid::new_v4(),
            plan_id: Some(plan_id),
            topic: "orchestrator".into(),
            event_type: event_type.into(),
            payload,
            ts_utc: chrono::Utc::now(),
        };
        if let Err(e) = self.ctx.repo.append_audit(&record).await {
            warn!(plan_id = %plan_id, error = %e, "audit write failed");
        }
    }
}
