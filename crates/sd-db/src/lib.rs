//! Repository interface and its PostgreSQL implementation.
//!
//! The traits here are the only persistence surface the rest of the
//! workspace sees. Production wires [`PgRepository`]; tests (and the
//! dry-run loop) use the in-memory implementation behind the `testkit`
//! feature. Timestamps are stored as `BIGINT` milliseconds for bars and
//! `TIMESTAMPTZ` for lifecycle columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sd_schemas::{AuditRecord, Bar, OrderRecord, OrderStatus, PlanRecord, PlanStatus, Timeframe};
use uuid::Uuid;

mod pg;
#[cfg(feature = "testkit")]
mod memory;

pub use pg::{connect, migrate, status, PgRepository};
#[cfg(feature = "testkit")]
pub use memory::MemoryRepository;

pub const ENV_DB_URL: &str = "DATABASE_URL";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Persistence failure. Bar processing logs and swallows these; everything
/// else propagates them.
#[derive(Debug)]
pub enum RepoError {
    NotFound { what: String },
    /// Unique-constraint conflicts that are NOT part of an upsert contract.
    Conflict { what: String },
    Db(String),
}

impl std::fmt::Display for RepoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepoError::NotFound { what } => write!(f, "not found: {what}"),
            RepoError::Conflict { what } => write!(f, "conflict: {what}"),
            RepoError::Db(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for RepoError {}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound {
                what: "row".to_string(),
            },
            other => RepoError::Db(other.to_string()),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Plan CRUD and lifecycle transitions. Soft-deleted plans are invisible.
#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn create_plan(&self, plan: &PlanRecord) -> RepoResult<()>;

    async fn get_plan(&self, id: Uuid) -> RepoResult<PlanRecord>;

    /// Plans for a user, newest first, optionally filtered by status.
    async fn list_plans(&self, user_id: &str, status: Option<PlanStatus>)
        -> RepoResult<Vec<PlanRecord>>;

    /// Transition status, stamping the matching lifecycle column.
    async fn update_plan_status(
        &self,
        id: Uuid,
        status: PlanStatus,
        reason: Option<&str>,
    ) -> RepoResult<()>;

    /// Persist the engine's current FSM state name.
    async fn set_plan_state(&self, id: Uuid, state: &str) -> RepoResult<()>;

    /// Soft delete via `deleted_at`.
    async fn delete_plan(&self, id: Uuid) -> RepoResult<()>;
}

/// Bar persistence with idempotent upsert.
#[async_trait]
pub trait BarRepository: Send + Sync {
    /// Upsert; duplicates on `(symbol, timeframe, ts)` are silently
    /// ignored. Returns rows actually inserted.
    async fn upsert_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> RepoResult<u64>;

    /// Most recent `limit` bars, ascending by ts (newest last). `limit` 0
    /// means no limit.
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> RepoResult<Vec<Bar>>;

    /// Bars with `from_ts ≤ ts ≤ to_ts`, ascending.
    async fn fetch_bars_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> RepoResult<Vec<Bar>>;

    /// Retention sweep; `None` filters mean "all". Returns rows deleted.
    async fn delete_old_bars(
        &self,
        symbol: Option<&str>,
        timeframe: Option<Timeframe>,
        cutoff_ts: i64,
    ) -> RepoResult<u64>;
}

/// Order persistence; unique on `broker_order_id`.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert_order(&self, order: &OrderRecord) -> RepoResult<()>;

    async fn get_order(&self, id: Uuid) -> RepoResult<OrderRecord>;

    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        filled_qty: i64,
        avg_fill_price: Option<f64>,
    ) -> RepoResult<()>;

    async fn set_broker_order_id(&self, id: Uuid, broker_order_id: i64) -> RepoResult<()>;

    async fn orders_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<OrderRecord>>;

    /// Non-terminal orders for a plan.
    async fn open_orders_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<OrderRecord>>;

    /// `(local id, broker id)` pairs for non-terminal orders — the input to
    /// broker-adapter restart recovery.
    async fn recovery_pairs(&self) -> RepoResult<Vec<(Uuid, i64)>>;
}

/// Relational audit trail (the file-backed log lives in sd-audit).
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append_audit(&self, record: &AuditRecord) -> RepoResult<()>;

    async fn audit_for_plan(&self, plan_id: Uuid) -> RepoResult<Vec<AuditRecord>>;
}

/// The full persistence surface, as one object-safe bundle.
pub trait Repository:
    PlanRepository + BarRepository + OrderRepository + AuditRepository
{
}

impl<T> Repository for T where
    T: PlanRepository + BarRepository + OrderRepository + AuditRepository
{
}

/// Construct a fresh PENDING plan record.
pub fn new_plan_record(
    user_id: &str,
    symbol: &str,
    timeframe: Timeframe,
    name: &str,
    yaml_content: &str,
    status: PlanStatus,
) -> PlanRecord {
    PlanRecord {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        symbol: symbol.to_string(),
        timeframe,
        name: name.to_string(),
        status,
        yaml_content: yaml_content.to_string(),
        current_state: None,
        fail_reason: None,
        created_at: Utc::now(),
        activated_at: None,
        closed_at: None,
        archived_at: None,
        deleted_at: None,
    }
}

/// Lifecycle column stamped by a status transition, if any.
pub(crate) fn lifecycle_stamp(status: PlanStatus) -> Option<&'static str> {
    match status {
        PlanStatus::Active => Some("activated_at"),
        PlanStatus::Closed => Some("closed_at"),
        PlanStatus::Archived => Some("archived_at"),
        _ => None,
    }
}

pub(crate) fn stamp_record(record: &mut PlanRecord, status: PlanStatus, now: DateTime<Utc>) {
    record.status = status;
    match status {
        PlanStatus::Active => record.activated_at = Some(now),
        PlanStatus::Closed => record.closed_at = Some(now),
        PlanStatus::Archived => record.archived_at = Some(now),
        _ => {}
    }
}
