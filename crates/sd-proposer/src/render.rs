//! Render a winning candidate to plan YAML.
//!
//! The output goes through the same document structs the compiler parses,
//! so a rendered proposal always round-trips: `render_yaml` → `compile`.

use sd_plan::{ExecutionDoc, MetaDoc, OrderPlanDoc, PlanDoc, RiskDoc, RulesDoc, TargetDoc};

use crate::{Candidate, ProposerConfig};

pub fn render_yaml(symbol: &str, config: &ProposerConfig, candidate: &Candidate) -> String {
    let t = &candidate.template;
    let doc = PlanDoc {
        meta: MetaDoc {
            name: candidate.name.clone(),
            symbol: symbol.to_string(),
            timeframe: config.timeframe.to_string(),
        },
        features: t.features.iter().map(|f| f.to_string()).collect(),
        rules: RulesDoc {
            arm: Some(t.arm_expr.to_string()),
            trigger: Some(t.trigger_expr.to_string()),
            invalidate: Some(t.invalidate_expr.to_string()),
        },
        order_plans: vec![OrderPlanDoc {
            side: candidate.side.as_str().to_string(),
            entry_zone: vec![t.entry_low_expr.to_string(), t.entry_high_expr.to_string()],
            qty: None,
            stop: t.stop_expr.to_string(),
            targets: vec![TargetDoc {
                price: t.target_expr.to_string(),
                ratio_of_position: 1.0,
            }],
        }],
        execution: ExecutionDoc::default(),
        risk: RiskDoc {
            max_risk_per_trade: config.max_risk_per_trade,
        },
        states: None,
        transitions: None,
    };
    serde_yaml::to_string(&doc).expect("plan document always serializes")
}
