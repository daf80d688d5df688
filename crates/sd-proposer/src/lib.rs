//! Deterministic strategy proposer.
//!
//! Given a bar history, generate candidate plans across a fixed set of
//! setup families, finalize each through the hard gates (the same
//! [`sd_risk::finalize`] the engine re-runs at submission time), score the
//! survivors, and render the winner as a YAML plan the compiler accepts.
//!
//! Determinism contract: for a fixed bar sequence and configuration the
//! proposal is identical — candidate generation is a pure function of the
//! feature snapshot, and ranking uses a total order with a name tie-break.

mod families;
mod render;

pub use families::{FamilyTemplate, Snapshot};
pub use render::render_yaml;

use tracing::debug;

use sd_risk::{finalize, CandidateLevels, FinalizedBracket, GateConfig, SizingLimits};
use sd_schemas::{Bar, Side, Timeframe};

#[derive(Debug, Clone)]
pub struct ProposerConfig {
    pub timeframe: Timeframe,
    pub rr_target: f64,
    pub max_risk_per_trade: f64,
    pub max_entry_distance_pct: f64,
    pub limits: SizingLimits,
}

impl ProposerConfig {
    pub fn new(timeframe: Timeframe, max_risk_per_trade: f64) -> Self {
        Self {
            timeframe,
            rr_target: 3.0,
            max_risk_per_trade,
            max_entry_distance_pct: 3.0,
            limits: SizingLimits::default(),
        }
    }
}

/// A candidate that survived every gate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub family: String,
    pub side: Side,
    pub bracket: FinalizedBracket,
    pub score: f64,
    template: FamilyTemplate,
}

/// The winning candidate, rendered and ready to persist as a plan.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub name: String,
    pub family: String,
    pub side: Side,
    pub qty: i64,
    pub entry_low: f64,
    pub entry_high: f64,
    pub stop: f64,
    pub target: f64,
    pub rr_worst: f64,
    pub dollar_risk_worst: f64,
    pub score: f64,
    pub yaml: String,
}

/// Generate, gate, and rank candidates; empty when nothing survives.
pub fn propose_candidates(symbol: &str, bars: &[Bar], config: &ProposerConfig) -> Vec<Candidate> {
    let Some(snapshot) = Snapshot::compute(bars) else {
        debug!(symbol, "not enough history for a feature snapshot");
        return Vec::new();
    };

    let gates = GateConfig {
        current_price: snapshot.close,
        rr_target: config.rr_target,
        max_risk_per_trade: config.max_risk_per_trade,
        max_entry_distance_pct: config.max_entry_distance_pct,
    };

    let mut out = Vec::new();
    for template in families::generate(&snapshot) {
        let levels = CandidateLevels {
            side: template.side,
            entry_low: template.entry_low,
            entry_high: template.entry_high,
            stop: template.stop,
            target: template.target,
        };
        match finalize(levels, &gates, &config.limits, None) {
            Ok(bracket) => {
                let score = score(&bracket, &snapshot);
                out.push(Candidate {
                    name: format!("{}-{}", template.family, symbol.to_lowercase()),
                    family: template.family.to_string(),
                    side: template.side,
                    bracket,
                    score,
                    template,
                });
            }
            Err(e) => debug!(family = template.family, error = %e, "candidate gated out"),
        }
    }

    // Total order: score descending, then name ascending. Scores are pure
    // functions of the inputs, so this rank is reproducible.
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    out
}

/// The best candidate, rendered to plan YAML.
pub fn propose_best_strategy(
    symbol: &str,
    bars: &[Bar],
    config: &ProposerConfig,
) -> Option<Proposal> {
    let candidates = propose_candidates(symbol, bars, config);
    let best = candidates.into_iter().next()?;
    let yaml = render_yaml(symbol, config, &best);
    Some(Proposal {
        name: best.name.clone(),
        family: best.family.clone(),
        side: best.side,
        qty: best.bracket.qty,
        entry_low: best.bracket.entry_low,
        entry_high: best.bracket.entry_high,
        stop: best.bracket.stop,
        target: best.bracket.target,
        rr_worst: best.bracket.rr_worst,
        dollar_risk_worst: best.bracket.dollar_risk_worst,
        score: best.score,
        yaml,
    })
}

/// Higher worst-case R:R and nearer entries score better; a trending tape
/// (ADX) adds a small bonus.
fn score(bracket: &FinalizedBracket, snapshot: &Snapshot) -> f64 {
    bracket.rr_worst * 2.0 + snapshot.adx.unwrap_or(0.0) / 100.0 - bracket.entry_distance_pct
}
