//! PostgreSQL repository (sqlx, runtime-bound queries).

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use sd_schemas::{
    AuditRecord, Bar, OrderKind, OrderRecord, OrderRole, OrderStatus, PlanRecord, PlanStatus,
    Side, Timeframe,
};

use crate::{
    lifecycle_stamp, AuditRepository, BarRepository, OrderRepository, PlanRepository, RepoError,
    RepoResult, ENV_DB_URL,
};

/// Connect using `DATABASE_URL`.
pub async fn connect() -> RepoResult<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| RepoError::Db(format!("missing env var {ENV_DB_URL}")))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await?;
    Ok(pool)
}

/// Connectivity probe.
pub async fn status(pool: &PgPool) -> RepoResult<bool> {
    let (one,): (i32,) = sqlx::query_as("select 1").fetch_one(pool).await?;
    Ok(one == 1)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> RepoResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| RepoError::Db(e.to_string()))?;
    Ok(())
}

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_timeframe(raw: &str) -> RepoResult<Timeframe> {
    raw.parse()
        .map_err(|_| RepoError::Db(format!("corrupt timeframe column: {raw:?}")))
}

fn parse_status(raw: &str) -> RepoResult<PlanStatus> {
    PlanStatus::parse(raw).ok_or_else(|| RepoError::Db(format!("corrupt status column: {raw:?}")))
}

fn plan_from_row(row: &PgRow) -> RepoResult<PlanRecord> {
    Ok(PlanRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        timeframe: parse_timeframe(row.try_get::<&str, _>("timeframe")?)?,
        name: row.try_get("name")?,
        status: parse_status(row.try_get::<&str, _>("status")?)?,
        yaml_content: row.try_get("yaml_content")?,
        current_state: row.try_get("current_state")?,
        fail_reason: row.try_get("fail_reason")?,
        created_at: row.try_get("created_at")?,
        activated_at: row.try_get("activated_at")?,
        closed_at: row.try_get("closed_at")?,
        archived_at: row.try_get("archived_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn side_from_str(raw: &str) -> RepoResult<Side> {
    match raw {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(RepoError::Db(format!("corrupt side column: {other:?}"))),
    }
}

fn kind_from_str(raw: &str) -> RepoResult<OrderKind> {
    match raw {
        "limit" => Ok(OrderKind::Limit),
        "market" => Ok(OrderKind::Market),
        "stop" => Ok(OrderKind::Stop),
        other => Err(RepoError::Db(format!("corrupt kind column: {other:?}"))),
    }
}

fn kind_to_str(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Limit => "limit",
        OrderKind::Market => "market",
        OrderKind::Stop => "stop",
    }
}

fn role_from_str(raw: &str) -> RepoResult<OrderRole> {
    match raw {
        "entry" => Ok(OrderRole::Entry),
        "take_profit" => Ok(OrderRole::TakeProfit),
        "stop_loss" => Ok(OrderRole::StopLoss),
        other => Err(RepoError::Db(format!("corrupt role column: {other:?}"))),
    }
}

fn role_to_str(role: OrderRole) -> &'static str {
    match role {
        OrderRole::Entry => "entry",
        OrderRole::TakeProfit => "take_profit",
        OrderRole::StopLoss => "stop_loss",
    }
}

fn order_from_row(row: &PgRow) -> RepoResult<OrderRecord> {
    let status_raw: &str = row.try_get("status")?;
    Ok(OrderRecord {
        id: row.try_get("id")?,
        plan_id: row.try_get("plan_id")?,
        broker_order_id: row.try_get("broker_order_id")?,
        symbol: row.try_get("symbol")?,
        side: side_from_str(row.try_get::<&str, _>("side")?)?,
        qty: row.try_get("qty")?,
        kind: kind_from_str(row.try_get::<&str, _>("kind")?)?,
        role: role_from_str(row.try_get::<&str, _>("role")?)?,
        limit_price: row.try_get("limit_price")?,
        stop_price: row.try_get("stop_price")?,
        status: OrderStatus::parse(status_raw)
            .ok_or_else(|| RepoError::Db(format!("corrupt status column: {status_raw:?}")))?,
        filled_qty: row.try_get("filled_qty")?,
        avg_fill_price: row.try_get("avg_fill_price")?,
        signal_state: row.try_get("signal_state")?,
        signal_bar_ts: row.try_get("signal_bar_ts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bar_from_row(row: &PgRow) -> RepoResult<Bar> {
    Ok(Bar {
        ts: row.try_get("ts")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
    })
}

// ---------------------------------------------------------------------------
// PlanRepository
// ---------------------------------------------------------------------------

#[async_trait]
impl PlanRepository for PgRepository {
    async fn create_plan(&self, plan: &PlanRecord) -> RepoResult<()> {
        sqlx::query(
            r#"
            insert into plans (
              id, user_id, symbol, timeframe, name, status, yaml_content,
              current_state, fail_reason, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(plan.id)
        .bind(&plan.user_id)
        .bind(&plan.symbol)
        .bind(plan.timeframe.to_string())
        .bind(&plan.name)
        .bind(plan.status.as_str())
        .bind(&plan.yaml_content)
        .bind(&plan.current_state)
        .bind(&plan.fail_reason)
        .bind(plan.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> RepoResult<PlanRecord> {
        let row = sqlx::query("select * from plans where id = $1 and deleted_at is null")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound {
                what: format!("plan {id}"),
            })?;
        plan_from_row(&row)
    }

    async fn list_plans(
        &self,
        user_id: &str,
        status: Option<PlanStatus>,
    ) -> RepoResult<Vec<PlanRecord>> {
        let rows = match status {
            Some(st) => {
                sqlx::query(
                    r#"
                    select * from plans
                    where user_id = $1 and status = $2 and deleted_at is null
                    order by created_at desc
                    "#,
                )
                .bind(user_id)
                .bind(st.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    select * from plans
                    where user_id = $1 and deleted_at is null
                    order by created_at desc
                    "#,
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(plan_from_row).collect()
    }

    async fn update_plan_status(
        &self,
        id: Uuid,
        status: PlanStatus,
        reason: Option<&str>,
    ) -> RepoResult<()> {
        // Stamp the lifecycle column matching the new status, if there is one.
        let res = match lifecycle_stamp(status) {
            Some(col) => {
                let sql = format!(
                    "update plans set status = $1, fail_reason = coalesce($2, fail_reason), \
                     {col} = $3 where id = $4 and deleted_at is null"
                );
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .bind(reason)
                    .bind(Utc::now())
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "update plans set status = $1, fail_reason = coalesce($2, fail_reason) \
                     where id = $3 and deleted_at is null",
                )
                .bind(status.as_str())
                .bind(reason)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };
        if res.rows_affected() == 0 {
            return Err(RepoError::NotFound {
                what: format!("plan {id}"),
            });
        }
        Ok(())
    }

    async fn set_plan_state(&self, id: Uuid, state: &str) -> RepoResult<()> {
        sqlx::query("update plans set current_state = $1 where id = $2 and deleted_at is null")
            .bind(state)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_plan(&self, id: Uuid) -> RepoResult<()> {
        sqlx::query("update plans set deleted_at = $1 where id = $2 and deleted_at is null")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BarRepository
// ---------------------------------------------------------------------------

#[async_trait]
impl BarRepository for PgRepository {
    async fn upsert_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> RepoResult<u64> {
        let tf = timeframe.to_string();
        let mut inserted = 0u64;
        // One statement per bar keeps the on-conflict accounting exact;
        // batches here are small (a watch-loop fetch, not a bulk import).
        for bar in bars {
            let res = sqlx::query(
                r#"
                insert into bars (symbol, timeframe, ts, open, high, low, close, volume)
                values ($1, $2, $3, $4, $5, $6, $7, $8)
                on conflict (symbol, timeframe, ts) do nothing
                "#,
            )
            .bind(symbol)
            .bind(&tf)
            .bind(bar.ts)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&self.pool)
            .await?;
            inserted += res.rows_affected();
        }
        Ok(inserted)
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> RepoResult<Vec<Bar>> {
        // Newest `limit` rows, then flipped so callers always see ascending.
        let rows = if limit == 0 {
            sqlx::query(
                "select * from bars where symbol = $1 and timeframe = $2 order by ts asc",
            )
            .bind(symbol)
            .bind(timeframe.to_string())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                select * from (
                  select * from bars where symbol = $1 and timeframe = $2
                  order by ts desc limit $3
                ) recent order by ts asc
                "#,
            )
            .bind(symbol)
            .bind(timeframe.to_string())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(bar_from_row).collect()
    }

    async fn fetch_bars_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> RepoResult<Vec<Bar>> {
        let rows = sqlx::query(
            r#"
            select * from bars
            where symbol = $1 and timeframe = $2 and ts >= $3 and ts <= $4
            order by ts asc
            "#,
        )
        .bind(symbol)
        .bind(timeframe.to_string())
        .bind(from_ts)
        .bind(to_ts)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bar_from_row).collect()
    }

    async fn delete_old_bars(
        &self,
        symbol: Option<&str>,
        timeframe: Option<Timeframe>,
        cutoff_ts: i64,
    ) -> RepoResult<u64> {
        let res = sqlx::query(
            r#"
            delete from bars
            where ts < $1
              and ($2::text is null or symbol = $2)
              and ($3::text is null or timeframe = $3)
            "#,
        )
        .bind(cutoff_ts)
        .bind(symbol)
        .bind(timeframe.map(|tf| tf.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// OrderRepository
// ---------------------------------------------------------------------------

#[async_trait]
impl OrderRepository for PgRepository {
    async fn insert_order(&self, order: &OrderRecord) -> RepoResult<()> {
        sqlx::query(
            r#"
            insert into orders (
              id, plan_id, broker_order_id, symbol, side, qty, kind, role,
              limit_price, stop_price, status, filled_qty, avg_fill_price,
              signal_state, signal_bar_ts, created_at, updated_at
            ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            "#,
        )
        .bind(order.id)
        .bind(order.plan_id)
        .bind(order.broker_order_id)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.qty)
        .bind(kind_to_str(order.kind))
        .bind(role_to_str(order.role))
        .bind(order.limit_price)
        .bind(order.stop_price)
        .bind(order.status.as_str())
        .bind(order.filled_qty)
        .bind(order.avg_fill_price)
        .bind(&order.signal_state)
        .bind(order.signal_bar_ts)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Conflict {
                what: format!("order broker_order_id {:?}", order.broker_order_id),
            },
            other => other.into(),
        })?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> RepoResult<OrderRecord> {
        let row = sqlx::query("select * from orders where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound {
                what: format!("order {id}"),
            })?;
        order_from_row(&row)
    }

    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        filled_qty: i64,
        avg_fill_price: Option<f64>,
    ) -> RepoResult<()> {
        sqlx::query(
            r#"
            update orders
            set status = $1, filled_qty = $2,
                avg_fill_price = coalesce($3, avg_fill_price), updated_at = $4
            where id = $5
            "#,
        )
        .bind(status.as_str())
        .bind(filled_qty)
        .bind(avg_fill_price)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_broker_order_id(&self, id: Uuid, broker_order_id: i64) -> RepoResult<()> {
        sqlx::query("update orders set broker_order_id = $1, updated_at = $2 where id = $3")
            .bind(broker_order_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn orders_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<OrderRecord>> {
        let rows = sqlx::query("select * from orders where plan_id = $1 order by created_at asc")
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn open_orders_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<OrderRecord>> {
        let rows = sqlx::query(
            r#"
            select * from orders
            where plan_id = $1 and status not in ('filled', 'cancelled', 'rejected')
            order by created_at asc
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn recovery_pairs(&self) -> RepoResult<Vec<(Uuid, i64)>> {
        let rows = sqlx::query(
            r#"
            select id, broker_order_id from orders
            where broker_order_id is not null
              and status not in ('filled', 'cancelled', 'rejected')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push((row.try_get("id")?, row.try_get("broker_order_id")?));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// AuditRepository
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditRepository for PgRepository {
    async fn append_audit(&self, record: &AuditRecord) -> RepoResult<()> {
        sqlx::query(
            r#"
            insert into audit_events (id, plan_id, topic, event_type, payload, ts_utc)
            values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.plan_id)
        .bind(&record.topic)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.ts_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<AuditRecord>> {
        let rows = sqlx::query(
            "select * from audit_events where plan_id = $1 order by ts_utc asc",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(AuditRecord {
                    id: row.try_get("id")?,
                    plan_id: row.try_get("plan_id")?,
                    topic: row.try_get("topic")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    ts_utc: row.try_get("ts_utc")?,
                })
            })
            .collect()
    }
}
