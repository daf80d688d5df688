//! Setup families and the feature snapshot they are generated from.
//!
//! Long families are generated when the tape trends up (close above EMA),
//! short families when it trends down. Each family defines its levels as a
//! function of the snapshot AND the expression strings that reproduce
//! those levels at runtime, so the rendered plan re-derives the same
//! bracket from live features.

use sd_indicators as ind;
use sd_schemas::{Bar, Side};

/// Current feature values the generator works from.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub close: f64,
    pub ema20: f64,
    pub atr: f64,
    pub vwap: Option<f64>,
    pub adx: Option<f64>,
    pub range_high_20: f64,
    pub range_low_20: f64,
    pub hod: f64,
    pub lod: f64,
}

impl Snapshot {
    /// `None` when the history cannot support the core indicators.
    pub fn compute(bars: &[Bar]) -> Option<Snapshot> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let last = bars.last()?;
        let range = ind::rolling_range(bars, 20)?;
        let session = ind::session_high_low(bars)?;
        Some(Snapshot {
            close: last.close,
            ema20: ind::ema(&closes, 20)?,
            atr: ind::atr(bars, 14)?,
            vwap: ind::vwap(bars),
            adx: ind::adx(bars, 14),
            range_high_20: range.high,
            range_low_20: range.low,
            hod: session.hod,
            lod: session.lod,
        })
    }

    fn trending_up(&self) -> bool {
        self.close > self.ema20
    }
}

/// One generated candidate: concrete levels plus the runtime expressions
/// that reproduce them.
#[derive(Debug, Clone)]
pub struct FamilyTemplate {
    pub family: &'static str,
    pub side: Side,
    pub entry_low: f64,
    pub entry_high: f64,
    pub stop: f64,
    pub target: f64,
    /// Feature names the rendered plan must declare.
    pub features: &'static [&'static str],
    pub arm_expr: &'static str,
    pub trigger_expr: &'static str,
    pub invalidate_expr: &'static str,
    pub entry_low_expr: &'static str,
    pub entry_high_expr: &'static str,
    pub stop_expr: &'static str,
    pub target_expr: &'static str,
}

/// Generate every family that fits the current trend. Order is fixed;
/// determinism is part of the contract.
pub fn generate(s: &Snapshot) -> Vec<FamilyTemplate> {
    let atr = s.atr;
    let mut out = Vec::new();

    if s.trending_up() {
        out.push(FamilyTemplate {
            family: "breakout_range_high",
            side: Side::Buy,
            entry_low: s.range_high_20,
            entry_high: s.range_high_20 + 0.25 * atr,
            stop: s.range_high_20 - 0.5 * atr,
            target: s.range_high_20 + 0.25 * atr + 2.5 * atr,
            features: &["atr", "ema20", "adx", "range_high_20"],
            arm_expr: "close > ema20 && adx >= 18",
            trigger_expr: "close > range_high_20",
            invalidate_expr: "close < ema20",
            entry_low_expr: "range_high_20",
            entry_high_expr: "range_high_20 + atr * 0.25",
            stop_expr: "range_high_20 - atr * 0.5",
            target_expr: "range_high_20 + atr * 0.25 + atr * 2.5",
        });
        out.push(FamilyTemplate {
            family: "hod_reclaim",
            side: Side::Buy,
            entry_low: s.hod,
            entry_high: s.hod + 0.2 * atr,
            stop: s.hod - 0.6 * atr,
            target: s.hod + 0.2 * atr + 2.6 * atr,
            features: &["atr", "ema20", "hod"],
            arm_expr: "close > ema20",
            trigger_expr: "close >= hod",
            invalidate_expr: "close < ema20",
            entry_low_expr: "hod",
            entry_high_expr: "hod + atr * 0.2",
            stop_expr: "hod - atr * 0.6",
            target_expr: "hod + atr * 0.2 + atr * 2.6",
        });
        if let Some(vwap) = s.vwap {
            // Only a reclaim when price sits at or below vwap; chasing an
            // extended tape through vwap is a different trade.
            if s.close <= vwap + 0.1 * atr {
                out.push(FamilyTemplate {
                    family: "vwap_reclaim",
                    side: Side::Buy,
                    entry_low: vwap,
                    entry_high: vwap + 0.25 * atr,
                    stop: vwap - 0.5 * atr,
                    target: vwap + 0.25 * atr + 2.4 * atr,
                    features: &["atr", "ema20", "vwap"],
                    arm_expr: "close > ema20",
                    trigger_expr: "close > vwap",
                    invalidate_expr: "close < ema20",
                    entry_low_expr: "vwap",
                    entry_high_expr: "vwap + atr * 0.25",
                    stop_expr: "vwap - atr * 0.5",
                    target_expr: "vwap + atr * 0.25 + atr * 2.4",
                });
            }
        }
        // Mean reversion: buy a pullback into the bottom of the range
        // while the broader trend holds. The entry-distance gate drops
        // this family whenever price has not actually pulled back.
        out.push(FamilyTemplate {
            family: "range_fade_low",
            side: Side::Buy,
            entry_low: s.range_low_20,
            entry_high: s.range_low_20 + 0.25 * atr,
            stop: s.range_low_20 - 0.5 * atr,
            target: s.range_low_20 + 0.25 * atr + 2.5 * atr,
            features: &["atr", "ema20", "range_low_20"],
            arm_expr: "close > ema20",
            trigger_expr: "close <= range_low_20 + atr * 0.25",
            invalidate_expr: "close < ema20",
            entry_low_expr: "range_low_20",
            entry_high_expr: "range_low_20 + atr * 0.25",
            stop_expr: "range_low_20 - atr * 0.5",
            target_expr: "range_low_20 + atr * 0.25 + atr * 2.5",
        });
    } else {
        out.push(FamilyTemplate {
            family: "breakdown_range_low",
            side: Side::Sell,
            entry_low: s.range_low_20 - 0.25 * atr,
            entry_high: s.range_low_20,
            stop: s.range_low_20 + 0.5 * atr,
            target: s.range_low_20 - 0.25 * atr - 2.5 * atr,
            features: &["atr", "ema20", "adx", "range_low_20"],
            arm_expr: "close < ema20 && adx >= 18",
            trigger_expr: "close < range_low_20",
            invalidate_expr: "close > ema20",
            entry_low_expr: "range_low_20 - atr * 0.25",
            entry_high_expr: "range_low_20",
            stop_expr: "range_low_20 + atr * 0.5",
            target_expr: "range_low_20 - atr * 0.25 - atr * 2.5",
        });
        out.push(FamilyTemplate {
            family: "lod_breakdown",
            side: Side::Sell,
            entry_low: s.lod - 0.2 * atr,
            entry_high: s.lod,
            stop: s.lod + 0.6 * atr,
            target: s.lod - 0.2 * atr - 2.6 * atr,
            features: &["atr", "ema20", "lod"],
            arm_expr: "close < ema20",
            trigger_expr: "close <= lod",
            invalidate_expr: "close > ema20",
            entry_low_expr: "lod - atr * 0.2",
            entry_high_expr: "lod",
            stop_expr: "lod + atr * 0.6",
            target_expr: "lod - atr * 0.2 - atr * 2.6",
        });
        // Short mirror of the fade: sell a bounce into the top of the
        // range while the downtrend holds.
        out.push(FamilyTemplate {
            family: "range_fade_high",
            side: Side::Sell,
            entry_low: s.range_high_20 - 0.25 * atr,
            entry_high: s.range_high_20,
            stop: s.range_high_20 + 0.5 * atr,
            target: s.range_high_20 - 0.25 * atr - 2.5 * atr,
            features: &["atr", "ema20", "range_high_20"],
            arm_expr: "close < ema20",
            trigger_expr: "close >= range_high_20 - atr * 0.25",
            invalidate_expr: "close > ema20",
            entry_low_expr: "range_high_20 - atr * 0.25",
            entry_high_expr: "range_high_20",
            stop_expr: "range_high_20 + atr * 0.5",
            target_expr: "range_high_20 - atr * 0.25 - atr * 2.5",
        });
    }

    out
}
