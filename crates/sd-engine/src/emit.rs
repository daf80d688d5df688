//! Order emission: evaluate the bracket template, run the gates, submit,
//! persist, and record the emission key.

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sd_broker_tws::{BracketIds, BrokerError};
use sd_plan::{Env, Expr, Value};
use sd_risk::{finalize, CandidateLevels, FinalizeError, GateConfig};
use sd_schemas::{
    Bar, BracketIntent, OrderKind, OrderRecord, OrderRole, OrderStatus, Side,
};

use crate::StrategyEngine;

/// The bracket the engine currently tracks: broker parent id plus the
/// local rows for each leg.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveBracket {
    pub parent_id: i64,
    pub entry_local: Uuid,
    pub take_profit_local: Uuid,
    pub stop_loss_local: Uuid,
    pub take_profit_id: i64,
    pub stop_loss_id: i64,
}

impl ActiveBracket {
    /// `(local id, broker id)` for every leg.
    pub fn legs(&self) -> [(Uuid, i64); 3] {
        [
            (self.entry_local, self.parent_id),
            (self.take_profit_local, self.take_profit_id),
            (self.stop_loss_local, self.stop_loss_id),
        ]
    }
}

/// Rebuild the active bracket from persisted orders on rehydrate: the
/// newest non-terminal entry leg and its sibling legs (same signal key).
pub(crate) fn rebuild_bracket(orders: &[OrderRecord]) -> Option<ActiveBracket> {
    let entry = orders
        .iter()
        .filter(|o| o.role == OrderRole::Entry && !o.status.is_terminal())
        .max_by_key(|o| o.created_at)?;
    let parent_id = entry.broker_order_id?;
    let sibling = |role: OrderRole| {
        orders.iter().find(|o| {
            o.role == role
                && o.signal_state == entry.signal_state
                && o.signal_bar_ts == entry.signal_bar_ts
        })
    };
    let tp = sibling(OrderRole::TakeProfit)?;
    let sl = sibling(OrderRole::StopLoss)?;
    Some(ActiveBracket {
        parent_id,
        entry_local: entry.id,
        take_profit_local: tp.id,
        stop_loss_local: sl.id,
        take_profit_id: tp.broker_order_id.unwrap_or(parent_id + 1),
        stop_loss_id: sl.broker_order_id.unwrap_or(parent_id + 2),
    })
}

fn eval_price(expr: &Expr, env: &Env, what: &str) -> Option<f64> {
    match expr.eval(env) {
        Ok(Value::Num(n)) if n.is_finite() => Some(n),
        Ok(other) => {
            debug!(what, value = ?other, "price expression not numeric");
            None
        }
        Err(e) => {
            debug!(what, error = %e, "price expression eval failed");
            None
        }
    }
}

impl StrategyEngine {
    /// Build, gate, submit, and persist the bracket for `plan_idx`.
    ///
    /// Returns `Ok(true)` when the transition may commit (orders submitted
    /// now, or already emitted for this `(state, bar_ts)` key),
    /// `Ok(false)` when gates or expression evaluation rejected the intent
    /// (the engine stays put), and `Err` on broker failure.
    pub(crate) async fn emit_orders(
        &mut self,
        plan_idx: usize,
        to_state: &str,
        bar: Bar,
        replay: bool,
    ) -> Result<bool, BrokerError> {
        let key = (to_state.to_string(), bar.ts);
        if self.state.emitted.contains(&key) {
            debug!(plan_id = %self.plan_id, state = to_state, bar_ts = bar.ts,
                   "orders already emitted for this transition, skipping submit");
            return Ok(true);
        }
        if replay {
            // A replayed bar may commit the transition but never submits a
            // bracket the live pass did not.
            self.state.emitted.insert(key);
            return Ok(true);
        }

        let env = self.build_env();
        let plan = &self.ir.order_plans[plan_idx];

        let Some(entry_low) = eval_price(&plan.entry_zone[0], &env, "entry_zone[0]") else {
            return Ok(false);
        };
        let Some(entry_high) = eval_price(&plan.entry_zone[1], &env, "entry_zone[1]") else {
            return Ok(false);
        };
        let Some(stop) = eval_price(&plan.stop, &env, "stop") else {
            return Ok(false);
        };
        // The bracket's take-profit leg uses the first (primary) target.
        let Some(target) = eval_price(&plan.targets[0].price, &env, "targets[0]") else {
            return Ok(false);
        };

        let levels = CandidateLevels {
            side: plan.side,
            entry_low,
            entry_high,
            stop,
            target,
        };
        let gates = GateConfig {
            current_price: bar.close,
            rr_target: self.config.rr_target,
            max_risk_per_trade: self.ir.risk.max_risk_per_trade,
            max_entry_distance_pct: self.config.max_entry_distance_pct,
        };

        let finalized = match finalize(levels, &gates, &self.config.limits, plan.qty) {
            Ok(f) => f,
            Err(FinalizeError::Gate(g)) => {
                info!(plan_id = %self.plan_id, state = to_state, reason = %g, "bracket gate-rejected");
                self.audit_reject("gate_rejected", &g.to_string()).await;
                return Ok(false);
            }
            Err(FinalizeError::Sizing(s)) => {
                info!(plan_id = %self.plan_id, state = to_state, reason = %s, "bracket sizing-rejected");
                self.audit_reject("sizing_rejected", &s.to_string()).await;
                return Ok(false);
            }
        };

        let intent = BracketIntent {
            plan_id: self.plan_id,
            symbol: self.ir.symbol.clone(),
            side: finalized.side,
            qty: finalized.qty,
            entry_low: finalized.entry_low,
            entry_high: finalized.entry_high,
            entry_price: finalized.entry_price,
            stop_price: finalized.stop,
            target_price: finalized.target,
        };

        let ids = self.broker.submit_bracket(&intent).await?;
        let bracket = self
            .persist_bracket(&intent, ids, to_state, bar.ts)
            .await;

        self.state.emitted.insert(key);
        self.state.active_bracket = Some(bracket);
        Ok(true)
    }

    /// Write the three legs, register local→broker ids, audit.
    /// Repository failures degrade to warnings: the broker already holds
    /// the orders, and losing a row must not stall the bar.
    async fn persist_bracket(
        &self,
        intent: &BracketIntent,
        ids: BracketIds,
        signal_state: &str,
        signal_bar_ts: i64,
    ) -> ActiveBracket {
        let now = Utc::now();
        let mk = |role: OrderRole, broker_id: i64, side: Side, kind: OrderKind,
                  limit: Option<f64>, stop: Option<f64>| OrderRecord {
            id: Uuid::new_v4(),
            plan_id: intent.plan_id,
            broker_order_id: Some(broker_id),
            symbol: intent.symbol.clone(),
            side,
            qty: intent.qty,
            kind,
            role,
            limit_price: limit,
            stop_price: stop,
            status: OrderStatus::Submitted,
            filled_qty: 0,
            avg_fill_price: None,
            signal_state: Some(signal_state.to_string()),
            signal_bar_ts: Some(signal_bar_ts),
            created_at: now,
            updated_at: now,
        };

        let exit = intent.side.opposite();
        let entry = mk(
            OrderRole::Entry,
            ids.parent,
            intent.side,
            OrderKind::Limit,
            Some(intent.entry_price),
            None,
        );
        let tp = mk(
            OrderRole::TakeProfit,
            ids.take_profit,
            exit,
            OrderKind::Limit,
            Some(intent.target_price),
            None,
        );
        let sl = mk(
            OrderRole::StopLoss,
            ids.stop_loss,
            exit,
            OrderKind::Stop,
            None,
            Some(intent.stop_price),
        );

        for record in [&entry, &tp, &sl] {
            if let Err(e) = self.repo.insert_order(record).await {
                warn!(plan_id = %self.plan_id, error = %e, "order persist failed");
            }
            if let Some(bid) = record.broker_order_id {
                self.broker.register_local_order(record.id, bid);
            }
        }

        let audit = sd_schemas::AuditRecord {
            id: Uuid::new_v4(),
            plan_id: Some(self.plan_id),
            topic: "engine".into(),
            event_type: "bracket_submitted".into(),
            payload: serde_json::json!({
                "symbol": intent.symbol,
                "side": intent.side.as_str(),
                "qty": intent.qty,
                "entry": intent.entry_price,
                "stop": intent.stop_price,
                "target": intent.target_price,
                "parent_broker_id": ids.parent,
            }),
            ts_utc: now,
        };
        if let Err(e) = self.repo.append_audit(&audit).await {
            warn!(plan_id = %self.plan_id, error = %e, "audit write failed");
        }

        info!(
            plan_id = %self.plan_id,
            parent = ids.parent,
            qty = intent.qty,
            "bracket persisted"
        );

        ActiveBracket {
            parent_id: ids.parent,
            entry_local: entry.id,
            take_profit_local: tp.id,
            stop_loss_local: sl.id,
            take_profit_id: ids.take_profit,
            stop_loss_id: ids.stop_loss,
        }
    }

    async fn audit_reject(&self, event_type: &str, reason: &str) {
        let record = sd_schemas::AuditRecord {
            id: Uuid::new_v4(),
            plan_id: Some(self.plan_id),
            topic: "engine".into(),
            event_type: event_type.into(),
            payload: serde_json::json!({ "reason": reason }),
            ts_utc: Utc::now(),
        };
        if let Err(e) = self.repo.append_audit(&record).await {
            warn!(plan_id = %self.plan_id, error = %e, "audit write failed");
        }
    }
}
