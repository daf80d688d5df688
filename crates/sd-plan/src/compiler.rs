//! Plan compiler: YAML text → [`CompiledIr`].
//!
//! Everything that can be rejected statically is rejected here, so a plan
//! that compiles can only fail at runtime for market or broker reasons.

use std::collections::HashSet;
use std::fmt;

use sd_schemas::{Side, Timeframe};

use crate::doc::{PlanDoc, TransitionDoc};
use crate::expr::{Expr, ParseError};
use crate::features::FeatureSpec;
use crate::ir::{
    CompiledIr, ExecutionSpec, OrderPlanSpec, RiskSpec, StateSpec, TargetSpec, TransitionSpec,
};

/// Runtime identifiers the engine injects per bar, always legal in rules.
///
/// `entry_filled` — 1 when the bracket's entry leg is filled, else 0.
/// `bracket_done` — 1 when every leg of the bracket is terminal, else 0.
/// `bars_in_state` — bars processed since the last transition.
pub const RUNTIME_IDENTS: &[&str] = &["entry_filled", "bracket_done", "bars_in_state"];

/// OHLCV names are always available even when not declared as features.
const IMPLICIT_FEATURES: &[&str] = &["close", "open", "high", "low", "volume"];

#[derive(Debug)]
pub enum CompileError {
    /// Document does not parse as YAML at all.
    Yaml(serde_yaml::Error),
    /// A required `meta` field is missing or empty.
    MissingMeta { field: &'static str },
    InvalidTimeframe { input: String },
    UnknownFeature { name: String },
    /// An expression failed syntactic validation.
    BadExpression { context: String, source: ParseError },
    /// An expression references a name that is neither a declared feature,
    /// an implicit OHLCV field, nor a runtime identifier.
    UndeclaredIdentifier { context: String, name: String },
    /// `rules.trigger` present but no order plan to execute.
    TriggerWithoutOrderPlan,
    MissingRule { rule: &'static str },
    InvalidSide { value: String },
    /// `entry_zone` must be exactly `[low, high]`.
    BadEntryZone { len: usize },
    NoTargets,
    BadTargetRatio { value: f64 },
    NonPositiveRisk { value: f64 },
    /// Explicit topology names a state that is not declared.
    UnknownState { name: String },
    /// Explicit `states` section given without `transitions` or vice versa.
    PartialTopology,
    OrderPlanIndexOutOfRange { index: usize, len: usize },
    DuplicateState { name: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Yaml(e) => write!(f, "yaml parse failed: {e}"),
            CompileError::MissingMeta { field } => write!(f, "meta.{field} is required"),
            CompileError::InvalidTimeframe { input } => {
                write!(f, "invalid timeframe {input:?} (expected <integer><m|h|d>)")
            }
            CompileError::UnknownFeature { name } => write!(f, "unknown feature {name:?}"),
            CompileError::BadExpression { context, source } => {
                write!(f, "bad expression in {context}: {source}")
            }
            CompileError::UndeclaredIdentifier { context, name } => {
                write!(f, "{context} references undeclared feature {name:?}")
            }
            CompileError::TriggerWithoutOrderPlan => {
                write!(f, "rules.trigger requires at least one order plan")
            }
            CompileError::MissingRule { rule } => write!(f, "rules.{rule} is required"),
            CompileError::InvalidSide { value } => {
                write!(f, "order plan side must be buy or sell, got {value:?}")
            }
            CompileError::BadEntryZone { len } => {
                write!(f, "entry_zone must have exactly 2 expressions, got {len}")
            }
            CompileError::NoTargets => write!(f, "order plan needs at least one target"),
            CompileError::BadTargetRatio { value } => {
                write!(f, "target ratio_of_position must be in (0, 1], got {value}")
            }
            CompileError::NonPositiveRisk { value } => {
                write!(f, "risk.max_risk_per_trade must be positive, got {value}")
            }
            CompileError::UnknownState { name } => {
                write!(f, "transition references undeclared state {name:?}")
            }
            CompileError::PartialTopology => {
                write!(f, "states and transitions must be given together")
            }
            CompileError::OrderPlanIndexOutOfRange { index, len } => {
                write!(f, "state order_plan index {index} out of range ({len} plans)")
            }
            CompileError::DuplicateState { name } => write!(f, "duplicate state {name:?}"),
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Yaml(e) => Some(e),
            CompileError::BadExpression { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Compile plan YAML into executable IR.
pub fn compile(yaml: &str) -> Result<CompiledIr, CompileError> {
    let doc: PlanDoc = serde_yaml::from_str(yaml).map_err(CompileError::Yaml)?;

    for (field, value) in [
        ("name", &doc.meta.name),
        ("symbol", &doc.meta.symbol),
        ("timeframe", &doc.meta.timeframe),
    ] {
        if value.trim().is_empty() {
            return Err(CompileError::MissingMeta { field });
        }
    }

    let timeframe: Timeframe =
        doc.meta
            .timeframe
            .parse()
            .map_err(|_| CompileError::InvalidTimeframe {
                input: doc.meta.timeframe.clone(),
            })?;

    // Resolve declared features; implicit OHLCV fields are appended so the
    // engine always has price context in the environment.
    let mut features: Vec<FeatureSpec> = Vec::new();
    let mut declared: HashSet<String> = HashSet::new();
    for name in IMPLICIT_FEATURES {
        let spec = FeatureSpec::resolve(name).expect("implicit features always resolve");
        declared.insert(spec.env_name());
        features.push(spec);
    }
    for name in &doc.features {
        let spec = FeatureSpec::resolve(name).ok_or_else(|| CompileError::UnknownFeature {
            name: name.clone(),
        })?;
        let env_name = spec.env_name();
        if declared.insert(env_name) {
            features.push(spec);
        }
    }
    for ident in RUNTIME_IDENTS {
        declared.insert((*ident).to_string());
    }

    let parse_expr = |context: &str, src: &str| -> Result<Expr, CompileError> {
        let expr = Expr::parse(src).map_err(|source| CompileError::BadExpression {
            context: context.to_string(),
            source,
        })?;
        for ident in expr.identifiers() {
            if !declared.contains(ident) {
                return Err(CompileError::UndeclaredIdentifier {
                    context: context.to_string(),
                    name: ident.to_string(),
                });
            }
        }
        Ok(expr)
    };

    // Order plans.
    let mut order_plans = Vec::with_capacity(doc.order_plans.len());
    for (i, op) in doc.order_plans.iter().enumerate() {
        let side = match op.side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => {
                return Err(CompileError::InvalidSide {
                    value: other.to_string(),
                })
            }
        };
        if op.entry_zone.len() != 2 {
            return Err(CompileError::BadEntryZone {
                len: op.entry_zone.len(),
            });
        }
        if op.targets.is_empty() {
            return Err(CompileError::NoTargets);
        }
        let ctx = |part: &str| format!("order_plans[{i}].{part}");
        let entry_low = parse_expr(&ctx("entry_zone[0]"), &op.entry_zone[0])?;
        let entry_high = parse_expr(&ctx("entry_zone[1]"), &op.entry_zone[1])?;
        let stop = parse_expr(&ctx("stop"), &op.stop)?;
        let mut targets = Vec::with_capacity(op.targets.len());
        for (j, t) in op.targets.iter().enumerate() {
            if !(t.ratio_of_position > 0.0 && t.ratio_of_position <= 1.0) {
                return Err(CompileError::BadTargetRatio {
                    value: t.ratio_of_position,
                });
            }
            targets.push(TargetSpec {
                price: parse_expr(&ctx(&format!("targets[{j}].price")), &t.price)?,
                ratio_of_position: t.ratio_of_position,
            });
        }
        order_plans.push(OrderPlanSpec {
            side,
            entry_zone: [entry_low, entry_high],
            qty: op.qty,
            stop,
            targets,
        });
    }

    if !order_plans.is_empty() && doc.risk.max_risk_per_trade <= 0.0 {
        return Err(CompileError::NonPositiveRisk {
            value: doc.risk.max_risk_per_trade,
        });
    }

    // Topology: explicit when provided, synthesized from rules otherwise.
    let (states, transitions) = match (&doc.states, &doc.transitions) {
        (Some(states), Some(transitions)) => {
            explicit_topology(states, transitions, order_plans.len(), &parse_expr)?
        }
        (None, None) => synthesized_topology(&doc, order_plans.len(), &parse_expr)?,
        _ => return Err(CompileError::PartialTopology),
    };

    Ok(CompiledIr {
        name: doc.meta.name.clone(),
        symbol: doc.meta.symbol.clone(),
        timeframe,
        features,
        states,
        transitions,
        order_plans,
        execution: ExecutionSpec {
            entry_timeout_bars: doc.execution.entry_timeout_bars,
            rth_only: doc.execution.rth_only,
            freeze_levels_on: doc.execution.freeze_levels_on.clone(),
        },
        risk: RiskSpec {
            max_risk_per_trade: doc.risk.max_risk_per_trade,
        },
    })
}

fn explicit_topology(
    states: &[crate::doc::StateDoc],
    transitions: &[TransitionDoc],
    order_plan_count: usize,
    parse_expr: &impl Fn(&str, &str) -> Result<Expr, CompileError>,
) -> Result<(Vec<StateSpec>, Vec<TransitionSpec>), CompileError> {
    let mut out_states = Vec::with_capacity(states.len());
    let mut seen = HashSet::new();
    for s in states {
        if !seen.insert(s.name.clone()) {
            return Err(CompileError::DuplicateState {
                name: s.name.clone(),
            });
        }
        if let Some(idx) = s.order_plan {
            if idx >= order_plan_count {
                return Err(CompileError::OrderPlanIndexOutOfRange {
                    index: idx,
                    len: order_plan_count,
                });
            }
        }
        out_states.push(StateSpec {
            name: s.name.clone(),
            order_plan: s.order_plan,
        });
    }

    let mut out_transitions = Vec::with_capacity(transitions.len());
    for (i, t) in transitions.iter().enumerate() {
        for name in [&t.from, &t.to] {
            if !seen.contains(name.as_str()) {
                return Err(CompileError::UnknownState { name: name.clone() });
            }
        }
        out_transitions.push(TransitionSpec {
            from: t.from.clone(),
            to: t.to.clone(),
            when: parse_expr(&format!("transitions[{i}].when"), &t.when)?,
        });
    }
    Ok((out_states, out_transitions))
}

/// Default topology:
///
/// ```text
/// init ──arm──► armed ──trigger──► triggered ──(always)──► placed
///                 │invalidate                                │
///                 ▼                           invalidate ────┤
///               exited ◄── bracket_done ── managing ◄── entry_filled
/// ```
///
/// Invalidate transitions are emitted before trigger/fill transitions so
/// invalidation wins on a bar where both fire. `triggered` carries
/// `order_plans[0]`; `exited` has no outgoing transitions and is terminal.
fn synthesized_topology(
    doc: &PlanDoc,
    order_plan_count: usize,
    parse_expr: &impl Fn(&str, &str) -> Result<Expr, CompileError>,
) -> Result<(Vec<StateSpec>, Vec<TransitionSpec>), CompileError> {
    let arm_src = doc
        .rules
        .arm
        .as_deref()
        .ok_or(CompileError::MissingRule { rule: "arm" })?;
    let trigger_src = doc
        .rules
        .trigger
        .as_deref()
        .ok_or(CompileError::MissingRule { rule: "trigger" })?;
    if order_plan_count == 0 {
        return Err(CompileError::TriggerWithoutOrderPlan);
    }

    let arm = parse_expr("rules.arm", arm_src)?;
    let trigger = parse_expr("rules.trigger", trigger_src)?;
    let invalidate = doc
        .rules
        .invalidate
        .as_deref()
        .map(|src| parse_expr("rules.invalidate", src))
        .transpose()?;

    let state = |name: &str, order_plan: Option<usize>| StateSpec {
        name: name.to_string(),
        order_plan,
    };
    let states = vec![
        state("init", None),
        state("armed", None),
        state("triggered", Some(0)),
        state("placed", None),
        state("managing", None),
        state("exited", None),
    ];

    let t = |from: &str, to: &str, when: Expr| TransitionSpec {
        from: from.to_string(),
        to: to.to_string(),
        when,
    };
    let mut transitions = vec![t("init", "armed", arm)];
    if let Some(inv) = &invalidate {
        transitions.push(t("armed", "exited", inv.clone()));
    }
    transitions.push(t("armed", "triggered", trigger));
    transitions.push(t("triggered", "placed", Expr::Bool(true)));
    if let Some(inv) = &invalidate {
        transitions.push(t("placed", "exited", inv.clone()));
    }
    transitions.push(t(
        "placed",
        "managing",
        parse_expr("synthesized placed->managing", "entry_filled == 1")?,
    ));
    transitions.push(t(
        "managing",
        "exited",
        parse_expr("synthesized managing->exited", "bracket_done == 1")?,
    ));

    Ok((states, transitions))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub const VALID_PLAN: &str = r#"
meta:
  name: orb-breakout
  symbol: AAPL
  timeframe: 5m
features:
  - atr
  - vwap
  - range_high_20
  - adx
rules:
  arm: "close > vwap && adx >= 20"
  trigger: "close > range_high_20"
  invalidate: "close < vwap"
order_plans:
  - side: buy
    entry_zone: ["range_high_20", "range_high_20 + atr / 4"]
    stop: "range_high_20 - atr"
    targets:
      - price: "range_high_20 + 3 * atr"
        ratio_of_position: 1.0
execution:
  entry_timeout_bars: 6
  rth_only: true
risk:
  max_risk_per_trade: 100
"#;

    #[test]
    fn valid_plan_compiles() {
        let ir = compile(VALID_PLAN).unwrap();
        assert_eq!(ir.name, "orb-breakout");
        assert_eq!(ir.symbol, "AAPL");
        assert_eq!(ir.timeframe.millis(), 300_000);
        assert_eq!(ir.initial_state(), "init");
        assert_eq!(ir.order_plans.len(), 1);
        assert_eq!(ir.execution.entry_timeout_bars, 6);
        assert!(ir.execution.rth_only);
        // Implicit OHLCV + declared features, deduplicated.
        assert!(ir.features.iter().any(|f| f.env_name() == "close"));
        assert!(ir.features.iter().any(|f| f.env_name() == "atr"));
    }

    #[test]
    fn synthesized_topology_shape() {
        let ir = compile(VALID_PLAN).unwrap();
        assert!(!ir.is_terminal("init"));
        assert!(!ir.is_terminal("armed"));
        assert!(!ir.is_terminal("managing"));
        assert!(ir.is_terminal("exited"), "exited must be terminal");
        // Invalidate is evaluated before trigger out of `armed`.
        let from_armed: Vec<_> = ir.transitions_from("armed").collect();
        assert_eq!(from_armed[0].to, "exited");
        assert_eq!(from_armed[1].to, "triggered");
        // The order plan hangs off `triggered`.
        assert_eq!(ir.state("triggered").unwrap().order_plan, Some(0));
    }

    #[test]
    fn missing_meta_fields_rejected() {
        for field in ["name", "symbol", "timeframe"] {
            let yaml = VALID_PLAN.replace(&format!("{field}:"), "ignored:");
            let err = compile(&yaml).unwrap_err();
            assert!(
                matches!(err, CompileError::MissingMeta { field: f } if f == field),
                "expected MissingMeta({field}), got {err}"
            );
        }
    }

    #[test]
    fn invalid_timeframe_rejected() {
        let yaml = VALID_PLAN.replace("timeframe: 5m", "timeframe: 5x");
        assert!(matches!(
            compile(&yaml).unwrap_err(),
            CompileError::InvalidTimeframe { .. }
        ));
    }

    #[test]
    fn unknown_feature_rejected() {
        let yaml = VALID_PLAN.replace("- atr", "- macd");
        assert!(matches!(
            compile(&yaml).unwrap_err(),
            CompileError::UnknownFeature { .. }
        ));
    }

    #[test]
    fn undeclared_identifier_in_rule_rejected() {
        let yaml = VALID_PLAN.replace("close > vwap && adx >= 20", "close > ema20");
        assert!(matches!(
            compile(&yaml).unwrap_err(),
            CompileError::UndeclaredIdentifier { .. }
        ));
    }

    #[test]
    fn syntactically_broken_expression_rejected() {
        let yaml = VALID_PLAN.replace("close > range_high_20", "close > >");
        assert!(matches!(
            compile(&yaml).unwrap_err(),
            CompileError::BadExpression { .. }
        ));
    }

    #[test]
    fn zero_risk_rejected() {
        let yaml = VALID_PLAN.replace("max_risk_per_trade: 100", "max_risk_per_trade: 0");
        assert!(matches!(
            compile(&yaml).unwrap_err(),
            CompileError::NonPositiveRisk { .. }
        ));
    }

    #[test]
    fn explicit_topology_accepted() {
        let yaml = r#"
meta: {name: manual, symbol: SPY, timeframe: 15m}
features: [atr]
order_plans:
  - side: sell
    entry_zone: ["close", "close + atr / 10"]
    stop: "close + atr"
    targets: [{price: "close - 2 * atr"}]
risk: {max_risk_per_trade: 50}
states:
  - {name: init}
  - {name: short_armed, order_plan: 0}
  - {name: done}
transitions:
  - {from: init, to: short_armed, when: "atr > 0.5"}
  - {from: short_armed, to: done, when: "bracket_done == 1"}
"#;
        let ir = compile(yaml).unwrap();
        assert_eq!(ir.states.len(), 3);
        assert!(ir.is_terminal("done"));
        assert!(!ir.is_terminal("short_armed"));
    }

    #[test]
    fn explicit_topology_unknown_state_rejected() {
        let yaml = r#"
meta: {name: manual, symbol: SPY, timeframe: 15m}
states:
  - {name: init}
transitions:
  - {from: init, to: nowhere, when: "close > 0"}
"#;
        assert!(matches!(
            compile(yaml).unwrap_err(),
            CompileError::UnknownState { .. }
        ));
    }

    #[test]
    fn states_without_transitions_rejected() {
        let yaml = r#"
meta: {name: manual, symbol: SPY, timeframe: 15m}
states:
  - {name: init}
"#;
        assert!(matches!(
            compile(yaml).unwrap_err(),
            CompileError::PartialTopology
        ));
    }

    #[test]
    fn terminal_by_topology_not_name() {
        // A state named `exited` with an outgoing transition is NOT terminal.
        let yaml = r#"
meta: {name: loop, symbol: SPY, timeframe: 5m}
states:
  - {name: armed}
  - {name: exited}
transitions:
  - {from: armed, to: exited, when: "close < open"}
  - {from: exited, to: armed, when: "close > open"}
"#;
        let ir = compile(yaml).unwrap();
        assert!(!ir.is_terminal("exited"));
        assert!(!ir.is_terminal("armed"));
    }
}
