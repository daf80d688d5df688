//! Compiled intermediate representation executed by the engine.

use sd_schemas::{Side, Timeframe};

use crate::expr::Expr;
use crate::features::FeatureSpec;

/// A fully validated, executable plan.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledIr {
    pub name: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub features: Vec<FeatureSpec>,
    pub states: Vec<StateSpec>,
    /// Evaluated in order; the first matching transition per bar wins.
    pub transitions: Vec<TransitionSpec>,
    pub order_plans: Vec<OrderPlanSpec>,
    pub execution: ExecutionSpec,
    pub risk: RiskSpec,
}

impl CompiledIr {
    /// A state is terminal iff it is no transition's `from`. Topology only;
    /// the state's name plays no part (see streaming gating for names).
    pub fn is_terminal(&self, state: &str) -> bool {
        !self.transitions.iter().any(|t| t.from == state)
    }

    pub fn state(&self, name: &str) -> Option<&StateSpec> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Transitions leaving `state`, in configuration order.
    pub fn transitions_from<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a TransitionSpec> {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    /// Name of the initial state (always the first declared).
    pub fn initial_state(&self) -> &str {
        self.states
            .first()
            .map(|s| s.name.as_str())
            .unwrap_or("init")
    }

    /// Largest history window any feature needs, plus slack for session
    /// features that scan a full day.
    pub fn history_capacity(&self) -> usize {
        let feature_max = self
            .features
            .iter()
            .map(|f| f.min_bars())
            .max()
            .unwrap_or(1);
        feature_max.max(64) * 2
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSpec {
    pub name: String,
    /// Index into `order_plans` submitted on entering this state.
    pub order_plan: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionSpec {
    pub from: String,
    pub to: String,
    pub when: Expr,
}

/// Bracket template with unevaluated price expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPlanSpec {
    pub side: Side,
    pub entry_zone: [Expr; 2],
    /// Fixed quantity override; `None` means risk-based sizing.
    pub qty: Option<i64>,
    pub stop: Expr,
    pub targets: Vec<TargetSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub price: Expr,
    pub ratio_of_position: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSpec {
    pub entry_timeout_bars: u32,
    pub rth_only: bool,
    pub freeze_levels_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskSpec {
    pub max_risk_per_trade: f64,
}

/// Streaming is gated purely on the state NAME (terminal detection is
/// purely topological; the two deliberately do not interact).
pub fn state_requires_streaming(state: &str) -> bool {
    const STREAMING_MARKERS: &[&str] = &[
        "armed",
        "managing",
        "placed",
        "trigger",
        "exited",
        "position_open",
        "position_monitoring",
    ];
    STREAMING_MARKERS.iter().any(|m| state.contains(m))
}
