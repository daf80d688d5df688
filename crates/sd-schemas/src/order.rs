//! Order intents, persisted orders, and bracket shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// The exit side for a position opened on this side.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
    Stop,
}

/// Which leg of a bracket an order is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Entry,
    TakeProfit,
    StopLoss,
}

/// Projected order lifecycle, shared by the adapter and the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "submitted" => Some(OrderStatus::Submitted),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// What an engine wants executed, before id assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub plan_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub kind: OrderKind,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

/// A sized, gate-validated bracket ready for submission.
///
/// All prices are already rounded to the minimum tick. Invariant for longs:
/// `stop < entry_low ≤ entry_high < target`; mirrored for shorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketIntent {
    pub plan_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub entry_low: f64,
    pub entry_high: f64,
    /// Limit price for the entry leg (mid of the zone, rounded).
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
}

/// An order as persisted after submission.
///
/// `signal_state` / `signal_bar_ts` record which FSM transition emitted the
/// order; the engine rehydrates its emission-key set from them so replayed
/// bars never double-submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub broker_order_id: Option<i64>,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub kind: OrderKind,
    pub role: OrderRole,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub avg_fill_price: Option<f64>,
    pub signal_state: Option<String>,
    pub signal_bar_ts: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
