//! Raw plan document shape, as deserialized from YAML.
//!
//! This mirrors what users write; the compiler validates it and lowers it
//! into [`crate::CompiledIr`]. Field names here ARE the config surface, so
//! renames are breaking changes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDoc {
    pub meta: MetaDoc,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub rules: RulesDoc,
    #[serde(default)]
    pub order_plans: Vec<OrderPlanDoc>,
    #[serde(default)]
    pub execution: ExecutionDoc,
    #[serde(default)]
    pub risk: RiskDoc,
    /// Explicit topology; when present it replaces the synthesized one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<StateDoc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitions: Option<Vec<TransitionDoc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaDoc {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub timeframe: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlanDoc {
    pub side: String,
    /// `[low_expr, high_expr]`.
    pub entry_zone: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<i64>,
    pub stop: String,
    pub targets: Vec<TargetDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDoc {
    pub price: String,
    #[serde(default = "default_ratio")]
    pub ratio_of_position: f64,
}

fn default_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDoc {
    #[serde(default = "default_entry_timeout")]
    pub entry_timeout_bars: u32,
    #[serde(default)]
    pub rth_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_levels_on: Option<String>,
}

fn default_entry_timeout() -> u32 {
    12
}

impl Default for ExecutionDoc {
    fn default() -> Self {
        Self {
            entry_timeout_bars: default_entry_timeout(),
            rth_only: false,
            freeze_levels_on: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskDoc {
    #[serde(default)]
    pub max_risk_per_trade: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDoc {
    pub name: String,
    /// Index into `order_plans` to submit on entering this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_plan: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDoc {
    pub from: String,
    pub to: String,
    pub when: String,
}
