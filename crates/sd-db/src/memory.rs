//! In-memory repository for tests and the dry-run loop.
//!
//! Semantics match the PostgreSQL implementation exactly where the traits
//! promise behavior: upsert dedup on `(symbol, timeframe, ts)`, ascending
//! bar order, soft-deleted plans invisible, unique `broker_order_id`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use sd_schemas::{
    AuditRecord, Bar, OrderRecord, OrderStatus, PlanRecord, PlanStatus, Timeframe,
};

use crate::{
    stamp_record, AuditRepository, BarRepository, OrderRepository, PlanRepository, RepoError,
    RepoResult,
};

type BarKey = (String, String);

#[derive(Default)]
struct Inner {
    plans: HashMap<Uuid, PlanRecord>,
    /// ts → bar, so iteration is always ascending.
    bars: HashMap<BarKey, BTreeMap<i64, Bar>>,
    orders: HashMap<Uuid, OrderRecord>,
    audit: Vec<AuditRecord>,
}

#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn bar_key(symbol: &str, timeframe: Timeframe) -> BarKey {
        (symbol.to_string(), timeframe.to_string())
    }
}

#[async_trait]
impl PlanRepository for MemoryRepository {
    async fn create_plan(&self, plan: &PlanRecord) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        if inner.plans.contains_key(&plan.id) {
            return Err(RepoError::Conflict {
                what: format!("plan {}", plan.id),
            });
        }
        inner.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> RepoResult<PlanRecord> {
        self.inner
            .lock()
            .plans
            .get(&id)
            .filter(|p| p.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| RepoError::NotFound {
                what: format!("plan {id}"),
            })
    }

    async fn list_plans(
        &self,
        user_id: &str,
        status: Option<PlanStatus>,
    ) -> RepoResult<Vec<PlanRecord>> {
        let inner = self.inner.lock();
        let mut plans: Vec<PlanRecord> = inner
            .plans
            .values()
            .filter(|p| p.user_id == user_id && p.deleted_at.is_none())
            .filter(|p| status.map_or(true, |st| p.status == st))
            .cloned()
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(plans)
    }

    async fn update_plan_status(
        &self,
        id: Uuid,
        status: PlanStatus,
        reason: Option<&str>,
    ) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        let plan = inner
            .plans
            .get_mut(&id)
            .filter(|p| p.deleted_at.is_none())
            .ok_or_else(|| RepoError::NotFound {
                what: format!("plan {id}"),
            })?;
        stamp_record(plan, status, Utc::now());
        if let Some(reason) = reason {
            plan.fail_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn set_plan_state(&self, id: Uuid, state: &str) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        if let Some(plan) = inner.plans.get_mut(&id).filter(|p| p.deleted_at.is_none()) {
            plan.current_state = Some(state.to_string());
        }
        Ok(())
    }

    async fn delete_plan(&self, id: Uuid) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        if let Some(plan) = inner.plans.get_mut(&id).filter(|p| p.deleted_at.is_none()) {
            plan.deleted_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl BarRepository for MemoryRepository {
    async fn upsert_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> RepoResult<u64> {
        let mut inner = self.inner.lock();
        let store = inner
            .bars
            .entry(Self::bar_key(symbol, timeframe))
            .or_default();
        let mut inserted = 0u64;
        for bar in bars {
            if let std::collections::btree_map::Entry::Vacant(v) = store.entry(bar.ts) {
                v.insert(*bar);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> RepoResult<Vec<Bar>> {
        let inner = self.inner.lock();
        let Some(store) = inner.bars.get(&Self::bar_key(symbol, timeframe)) else {
            return Ok(Vec::new());
        };
        let all: Vec<Bar> = store.values().copied().collect();
        if limit == 0 || all.len() <= limit as usize {
            return Ok(all);
        }
        Ok(all[all.len() - limit as usize..].to_vec())
    }

    async fn fetch_bars_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> RepoResult<Vec<Bar>> {
        let inner = self.inner.lock();
        let Some(store) = inner.bars.get(&Self::bar_key(symbol, timeframe)) else {
            return Ok(Vec::new());
        };
        Ok(store.range(from_ts..=to_ts).map(|(_, b)| *b).collect())
    }

    async fn delete_old_bars(
        &self,
        symbol: Option<&str>,
        timeframe: Option<Timeframe>,
        cutoff_ts: i64,
    ) -> RepoResult<u64> {
        let mut inner = self.inner.lock();
        let tf = timeframe.map(|t| t.to_string());
        let mut deleted = 0u64;
        for ((sym, key_tf), store) in inner.bars.iter_mut() {
            if symbol.map_or(false, |s| s != sym) {
                continue;
            }
            if tf.as_deref().map_or(false, |t| t != key_tf) {
                continue;
            }
            let keep = store.split_off(&cutoff_ts);
            deleted += store.len() as u64;
            *store = keep;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl OrderRepository for MemoryRepository {
    async fn insert_order(&self, order: &OrderRecord) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        if let Some(bid) = order.broker_order_id {
            if inner
                .orders
                .values()
                .any(|o| o.broker_order_id == Some(bid))
            {
                return Err(RepoError::Conflict {
                    what: format!("order broker_order_id {bid}"),
                });
            }
        }
        inner.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> RepoResult<OrderRecord> {
        self.inner
            .lock()
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound {
                what: format!("order {id}"),
            })
    }

    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        filled_qty: i64,
        avg_fill_price: Option<f64>,
    ) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        if let Some(order) = inner.orders.get_mut(&id) {
            order.status = status;
            order.filled_qty = filled_qty;
            if avg_fill_price.is_some() {
                order.avg_fill_price = avg_fill_price;
            }
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_broker_order_id(&self, id: Uuid, broker_order_id: i64) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        if let Some(order) = inner.orders.get_mut(&id) {
            order.broker_order_id = Some(broker_order_id);
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn orders_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<OrderRecord>> {
        let inner = self.inner.lock();
        let mut orders: Vec<OrderRecord> = inner
            .orders
            .values()
            .filter(|o| o.plan_id == plan_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    async fn open_orders_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<OrderRecord>> {
        Ok(self
            .orders_for_plan(plan_id)
            .await?
            .into_iter()
            .filter(|o| !o.status.is_terminal())
            .collect())
    }

    async fn recovery_pairs(&self) -> RepoResult<Vec<(Uuid, i64)>> {
        let inner = self.inner.lock();
        Ok(inner
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter_map(|o| o.broker_order_id.map(|bid| (o.id, bid)))
            .collect())
    }
}

#[async_trait]
impl AuditRepository for MemoryRepository {
    async fn append_audit(&self, record: &AuditRecord) -> RepoResult<()> {
        self.inner.lock().audit.push(record.clone());
        Ok(())
    }

    async fn audit_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<AuditRecord>> {
        Ok(self
            .inner
            .lock()
            .audit
            .iter()
            .filter(|a| a.plan_id == Some(plan_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::new_plan_record;

    fn bar(ts: i64) -> Bar {
        Bar {
            ts,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1_000,
        }
    }

    fn tf() -> Timeframe {
        "5m".parse().unwrap()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let repo = MemoryRepository::new();
        let bars = vec![bar(1_000_000)];
        assert_eq!(repo.upsert_bars("TEST", tf(), &bars).await.unwrap(), 1);
        assert_eq!(repo.upsert_bars("TEST", tf(), &bars).await.unwrap(), 0);
        assert_eq!(repo.fetch_bars("TEST", tf(), 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn range_fetch_is_inclusive() {
        let repo = MemoryRepository::new();
        let bars: Vec<Bar> = [1_000_000i64, 2_000_000, 3_000_000].iter().map(|&t| bar(t)).collect();
        repo.upsert_bars("TEST", tf(), &bars).await.unwrap();
        let got = repo
            .fetch_bars_range("TEST", tf(), 1_500_000, 2_500_000)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].ts, 2_000_000);
    }

    #[tokio::test]
    async fn soft_delete_hides_plan() {
        let repo = MemoryRepository::new();
        let plan = new_plan_record("u1", "AAPL", tf(), "p", "yaml", PlanStatus::Pending);
        repo.create_plan(&plan).await.unwrap();
        repo.delete_plan(plan.id).await.unwrap();
        assert!(matches!(
            repo.get_plan(plan.id).await,
            Err(RepoError::NotFound { .. })
        ));
        assert!(repo.list_plans("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_transition_stamps_lifecycle() {
        let repo = MemoryRepository::new();
        let plan = new_plan_record("u1", "AAPL", tf(), "p", "yaml", PlanStatus::Pending);
        repo.create_plan(&plan).await.unwrap();
        repo.update_plan_status(plan.id, PlanStatus::Active, None)
            .await
            .unwrap();
        let got = repo.get_plan(plan.id).await.unwrap();
        assert_eq!(got.status, PlanStatus::Active);
        assert!(got.activated_at.is_some());
        assert!(got.closed_at.is_none());
    }
}
