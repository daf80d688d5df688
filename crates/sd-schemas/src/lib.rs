//! Shared domain types for the StratDeck workspace.
//!
//! Everything here is plain data: no I/O, no clocks, no broker handles.
//! Crates communicate through these types so that the engine, the cache,
//! the broker adapter, and the repository agree on one vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bar;
pub mod order;
pub mod plan;
pub mod timeframe;

pub use bar::{Bar, BarError};
pub use order::{
    BracketIntent, OrderIntent, OrderKind, OrderRecord, OrderRole, OrderStatus, Side,
};
pub use plan::{PlanRecord, PlanStatus};
pub use timeframe::{Timeframe, TimeframeError, TimeframeUnit};

/// Round a price to the minimum tick (one cent).
///
/// Every price that leaves the system toward the broker passes through this
/// exactly once, at bracket finalization.
pub fn round_to_cent(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

/// One audit event as persisted by the repository.
///
/// The file-backed audit log (`sd-audit`) carries a richer envelope with a
/// hash chain; this is the relational projection used for plan history
/// queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub plan_id: Option<Uuid>,
    pub topic: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub ts_utc: DateTime<Utc>,
}
