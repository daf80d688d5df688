//! Hard gates and position sizing.
//!
//! The same gate pipeline runs twice: at proposal time (candidates that fail
//! are silently dropped) and again immediately before order submission (a
//! failure there is an error the engine must see). Both paths go through
//! [`finalize`]; there is deliberately no way to size a bracket without the
//! gates.
//!
//! Gate table (long side shown; shorts are mirrored):
//!
//! | Gate | Condition                                                      |
//! |------|----------------------------------------------------------------|
//! | A    | `stop < entry_low`                                             |
//! | B    | `(target − entry_high) / (entry_high − stop) ≥ rr_target`      |
//! | C    | `qty · (entry_high − stop) ≤ max_risk_per_trade`               |
//! | D    | `target > entry_high`                                          |
//! | E    | `|mid − current| / current · 100 ≤ max_entry_distance_pct`     |

use sd_schemas::{round_to_cent, Side};

/// Raw candidate levels before gating. Prices are un-rounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateLevels {
    pub side: Side,
    pub entry_low: f64,
    pub entry_high: f64,
    pub stop: f64,
    pub target: f64,
}

/// Gate thresholds and the reference price for the distance check.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub current_price: f64,
    pub rr_target: f64,
    pub max_risk_per_trade: f64,
    pub max_entry_distance_pct: f64,
}

/// Account-level clamps applied after risk-based sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizingLimits {
    /// `None` disables the buying-power clamp entirely.
    pub buying_power: Option<f64>,
    pub buying_power_factor: f64,
    pub max_order_qty: Option<i64>,
    pub max_notional_per_symbol: Option<f64>,
}

/// A bracket that has passed every gate, sized and tick-rounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalizedBracket {
    pub side: Side,
    pub qty: i64,
    pub entry_low: f64,
    pub entry_high: f64,
    /// Limit price for the entry leg: mid of the zone.
    pub entry_price: f64,
    pub stop: f64,
    pub target: f64,
    /// Reward-to-risk at the worst in-zone fill.
    pub rr_worst: f64,
    /// Dollar risk at the worst in-zone fill.
    pub dollar_risk_worst: f64,
    pub entry_distance_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateFailure {
    /// A: stop is on the wrong side of the entry zone.
    StopSide,
    /// B: worst-case R:R below target.
    RewardRisk { rr_worst: f64 },
    /// C: even one share exceeds the per-trade risk budget.
    RiskCap { dollar_risk: f64 },
    /// D: target does not clear the far edge of the entry zone.
    RewardDirection,
    /// E: entry zone too far from the current price.
    EntryDistance { pct: f64 },
    /// Degenerate levels (zero-width risk, inverted zone, non-finite).
    Degenerate,
}

impl std::fmt::Display for GateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateFailure::StopSide => write!(f, "stop on wrong side of entry zone"),
            GateFailure::RewardRisk { rr_worst } => {
                write!(f, "worst-case R:R {rr_worst:.2} below target")
            }
            GateFailure::RiskCap { dollar_risk } => {
                write!(f, "minimum position risks ${dollar_risk:.2}, over budget")
            }
            GateFailure::RewardDirection => write!(f, "target inside or behind entry zone"),
            GateFailure::EntryDistance { pct } => {
                write!(f, "entry {pct:.2}% away from current price")
            }
            GateFailure::Degenerate => write!(f, "degenerate candidate levels"),
        }
    }
}

impl std::error::Error for GateFailure {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingError {
    /// Clamps reduced the quantity below one share.
    InsufficientBuyingPower { clamped_qty: i64 },
}

impl std::fmt::Display for SizingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingError::InsufficientBuyingPower { clamped_qty } => {
                write!(f, "sizing clamped to {clamped_qty} shares (< 1)")
            }
        }
    }
}

impl std::error::Error for SizingError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FinalizeError {
    Gate(GateFailure),
    Sizing(SizingError),
}

impl std::fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalizeError::Gate(g) => write!(f, "gate failed: {g}"),
            FinalizeError::Sizing(s) => write!(f, "sizing failed: {s}"),
        }
    }
}

impl std::error::Error for FinalizeError {}

/// Run gates A–E, size the position, apply clamps, and round prices.
///
/// `qty_override` (a fixed quantity from the plan) still passes through the
/// risk cap and every clamp.
pub fn finalize(
    levels: CandidateLevels,
    gates: &GateConfig,
    limits: &SizingLimits,
    qty_override: Option<i64>,
) -> Result<FinalizedBracket, FinalizeError> {
    use FinalizeError::{Gate, Sizing};

    let l = levels;
    for v in [l.entry_low, l.entry_high, l.stop, l.target, gates.current_price] {
        if !v.is_finite() || v <= 0.0 {
            return Err(Gate(GateFailure::Degenerate));
        }
    }
    if l.entry_low > l.entry_high {
        return Err(Gate(GateFailure::Degenerate));
    }

    // Worst in-zone fill: the far edge of the zone for the chosen side.
    let (risk_per_share, reward_per_share) = match l.side {
        Side::Buy => (l.entry_high - l.stop, l.target - l.entry_high),
        Side::Sell => (l.stop - l.entry_low, l.entry_low - l.target),
    };

    // Gate A — stop side.
    let stop_ok = match l.side {
        Side::Buy => l.stop < l.entry_low,
        Side::Sell => l.stop > l.entry_high,
    };
    if !stop_ok {
        return Err(Gate(GateFailure::StopSide));
    }
    if risk_per_share <= 0.0 {
        return Err(Gate(GateFailure::Degenerate));
    }

    // Gate D — reward direction.
    if reward_per_share <= 0.0 {
        return Err(Gate(GateFailure::RewardDirection));
    }

    // Gate B — worst-case R:R.
    let rr_worst = reward_per_share / risk_per_share;
    if rr_worst < gates.rr_target {
        return Err(Gate(GateFailure::RewardRisk { rr_worst }));
    }

    // Gate E — entry distance.
    let mid = (l.entry_low + l.entry_high) / 2.0;
    let entry_distance_pct = ((mid - gates.current_price) / gates.current_price).abs() * 100.0;
    if entry_distance_pct > gates.max_entry_distance_pct {
        return Err(Gate(GateFailure::EntryDistance {
            pct: entry_distance_pct,
        }));
    }

    // Gate C — risk cap with risk-based sizing.
    let sized = (gates.max_risk_per_trade / risk_per_share).floor() as i64;
    let qty = qty_override.unwrap_or_else(|| sized.max(1));
    let dollar_risk = qty as f64 * risk_per_share;
    if dollar_risk > gates.max_risk_per_trade {
        return Err(Gate(GateFailure::RiskCap { dollar_risk }));
    }

    let entry_price = round_to_cent(mid);
    let qty = clamp_qty(qty, entry_price, limits).map_err(Sizing)?;

    Ok(FinalizedBracket {
        side: l.side,
        qty,
        entry_low: round_to_cent(l.entry_low),
        entry_high: round_to_cent(l.entry_high),
        entry_price,
        stop: round_to_cent(l.stop),
        target: round_to_cent(l.target),
        rr_worst,
        dollar_risk_worst: qty as f64 * risk_per_share,
        entry_distance_pct,
    })
}

/// Apply buying-power, absolute-qty, and notional clamps.
fn clamp_qty(qty: i64, entry_price: f64, limits: &SizingLimits) -> Result<i64, SizingError> {
    let mut q = qty;
    if let Some(bp) = limits.buying_power {
        q = q.min((bp * limits.buying_power_factor / entry_price).floor() as i64);
    }
    if let Some(max_qty) = limits.max_order_qty {
        q = q.min(max_qty);
    }
    if let Some(max_notional) = limits.max_notional_per_symbol {
        q = q.min((max_notional / entry_price).floor() as i64);
    }
    if q < 1 {
        return Err(SizingError::InsufficientBuyingPower { clamped_qty: q });
    }
    Ok(q)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(entry_low: f64, entry_high: f64, stop: f64, target: f64) -> CandidateLevels {
        CandidateLevels {
            side: Side::Buy,
            entry_low,
            entry_high,
            stop,
            target,
        }
    }

    fn gates() -> GateConfig {
        GateConfig {
            current_price: 100.0,
            rr_target: 3.0,
            max_risk_per_trade: 100.0,
            max_entry_distance_pct: 3.0,
        }
    }

    fn no_limits() -> SizingLimits {
        SizingLimits::default()
    }

    #[test]
    fn stop_on_wrong_side_rejected() {
        // Stop above the zone on a long: gate A.
        let err = finalize(long(101.0, 102.0, 103.0, 111.0), &gates(), &no_limits(), None)
            .unwrap_err();
        assert_eq!(err, FinalizeError::Gate(GateFailure::StopSide));
    }

    #[test]
    fn poor_reward_risk_rejected() {
        // (104 − 102) / (102 − 99) ≈ 0.67 < 3.
        let err = finalize(long(101.0, 102.0, 99.0, 104.0), &gates(), &no_limits(), None)
            .unwrap_err();
        match err {
            FinalizeError::Gate(GateFailure::RewardRisk { rr_worst }) => {
                assert!((rr_worst - 2.0 / 3.0).abs() < 1e-9)
            }
            other => panic!("expected RewardRisk, got {other:?}"),
        }
    }

    #[test]
    fn target_behind_zone_rejected() {
        let err = finalize(long(101.0, 102.0, 99.0, 101.5), &gates(), &no_limits(), None)
            .unwrap_err();
        assert_eq!(err, FinalizeError::Gate(GateFailure::RewardDirection));
    }

    #[test]
    fn distant_entry_rejected() {
        let mut g = gates();
        g.current_price = 90.0;
        let err = finalize(long(101.0, 102.0, 99.0, 111.0), &g, &no_limits(), None).unwrap_err();
        assert!(matches!(
            err,
            FinalizeError::Gate(GateFailure::EntryDistance { .. })
        ));
    }

    #[test]
    fn good_long_passes_and_sizes() {
        // Risk/share = 102 − 99 = 3; budget 100 → 33 shares, $99 worst risk.
        let b = finalize(long(101.0, 102.0, 99.0, 111.0), &gates(), &no_limits(), None).unwrap();
        assert_eq!(b.qty, 33);
        assert!(b.dollar_risk_worst <= 100.0);
        assert!(b.rr_worst >= 3.0);
        assert_eq!(b.entry_price, 101.5);
    }

    #[test]
    fn short_side_mirrors() {
        let levels = CandidateLevels {
            side: Side::Sell,
            entry_low: 98.0,
            entry_high: 99.0,
            stop: 101.0,
            target: 89.0,
        };
        // Risk/share = 101 − 98 = 3; reward = 98 − 89 = 9; rr = 3.
        let b = finalize(levels, &gates(), &no_limits(), None).unwrap();
        assert_eq!(b.qty, 33);
        assert!((b.rr_worst - 3.0).abs() < 1e-9);

        // Stop below the zone on a short: gate A.
        let bad = CandidateLevels {
            stop: 97.0,
            ..levels
        };
        assert_eq!(
            finalize(bad, &gates(), &no_limits(), None).unwrap_err(),
            FinalizeError::Gate(GateFailure::StopSide)
        );
    }

    #[test]
    fn qty_override_still_checked_against_risk_cap() {
        // 50 shares × $3 risk = $150 > $100 budget.
        let err = finalize(long(101.0, 102.0, 99.0, 111.0), &gates(), &no_limits(), Some(50))
            .unwrap_err();
        assert!(matches!(err, FinalizeError::Gate(GateFailure::RiskCap { .. })));
    }

    #[test]
    fn buying_power_clamp_applies() {
        let limits = SizingLimits {
            buying_power: Some(2_000.0),
            buying_power_factor: 0.75,
            ..SizingLimits::default()
        };
        // Unclamped 33; bp clamp: floor(1500 / 101.5) = 14.
        let b = finalize(long(101.0, 102.0, 99.0, 111.0), &gates(), &limits, None).unwrap();
        assert_eq!(b.qty, 14);
    }

    #[test]
    fn notional_and_max_qty_clamps_apply() {
        let limits = SizingLimits {
            max_order_qty: Some(10),
            max_notional_per_symbol: Some(500.0),
            ..SizingLimits::default()
        };
        // Notional clamp: floor(500 / 101.5) = 4 — tighter than max_qty.
        let b = finalize(long(101.0, 102.0, 99.0, 111.0), &gates(), &limits, None).unwrap();
        assert_eq!(b.qty, 4);
    }

    #[test]
    fn clamp_below_one_share_fails() {
        let limits = SizingLimits {
            buying_power: Some(100.0),
            buying_power_factor: 0.75,
            ..SizingLimits::default()
        };
        // floor(75 / 101.5) = 0.
        let err = finalize(long(101.0, 102.0, 99.0, 111.0), &gates(), &limits, None).unwrap_err();
        assert!(matches!(
            err,
            FinalizeError::Sizing(SizingError::InsufficientBuyingPower { .. })
        ));
    }

    #[test]
    fn prices_rounded_to_cents() {
        let b = finalize(
            long(101.004, 102.006, 99.001, 111.009),
            &gates(),
            &no_limits(),
            None,
        )
        .unwrap();
        assert_eq!(b.entry_low, 101.0);
        assert_eq!(b.entry_high, 102.01);
        assert_eq!(b.stop, 99.0);
        assert_eq!(b.target, 111.01);
    }
}
