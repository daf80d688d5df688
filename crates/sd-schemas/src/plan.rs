//! Plan lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timeframe::Timeframe;

/// Lifecycle status of a plan.
///
/// Created DRAFT or PENDING → orchestrator picks up PENDING → ACTIVE →
/// CLOSED (manual or terminal FSM state) → optional ARCHIVED. Compile or
/// validation failures park the plan in FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanStatus {
    Draft,
    Pending,
    Active,
    Closed,
    Archived,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "DRAFT",
            PlanStatus::Pending => "PENDING",
            PlanStatus::Active => "ACTIVE",
            PlanStatus::Closed => "CLOSED",
            PlanStatus::Archived => "ARCHIVED",
            PlanStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(PlanStatus::Draft),
            "PENDING" => Some(PlanStatus::Pending),
            "ACTIVE" => Some(PlanStatus::Active),
            "CLOSED" => Some(PlanStatus::Closed),
            "ARCHIVED" => Some(PlanStatus::Archived),
            "FAILED" => Some(PlanStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plan as persisted by the repository.
///
/// `yaml_content` is the user-authored source of truth; the compiled IR is
/// derived and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: Uuid,
    pub user_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub name: String,
    pub status: PlanStatus,
    pub yaml_content: String,
    /// Last known FSM state name, persisted on every transition.
    pub current_state: Option<String>,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Soft delete marker; deleted plans are invisible to list/pickup.
    pub deleted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for st in [
            PlanStatus::Draft,
            PlanStatus::Pending,
            PlanStatus::Active,
            PlanStatus::Closed,
            PlanStatus::Archived,
            PlanStatus::Failed,
        ] {
            assert_eq!(PlanStatus::parse(st.as_str()), Some(st));
        }
        assert_eq!(PlanStatus::parse("bogus"), None);
    }
}
