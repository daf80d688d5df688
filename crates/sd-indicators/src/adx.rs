//! Average Directional Index — trend strength, direction-agnostic.
//!
//! Pipeline: per-bar +DM/−DM and TR → Wilder smoothing over `period` →
//! +DI/−DI → DX → ADX = Wilder-smoothed DX. Needs `2·period + 1` bars to
//! produce one value.

use sd_schemas::Bar;

/// Most recent ADX over `period` bars, or `None` on short history.
pub fn adx(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let transitions = bars.len() - 1;
    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for w in bars.windows(2) {
        let (prev, b) = (&w[0], &w[1]);
        let tr = (b.high - b.low)
            .max((b.high - prev.close).abs())
            .max((b.low - prev.close).abs());
        let up = b.high - prev.high;
        let down = prev.low - b.low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        tr_vals.push(tr);
    }

    let period_f = period as f64;
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = tr_vals[..period].iter().sum();

    let dx_at = |sp: f64, sm: f64, st: f64| -> Option<f64> {
        if st == 0.0 {
            return Some(0.0);
        }
        let plus_di = sp / st * 100.0;
        let minus_di = sm / st * 100.0;
        let denom = plus_di + minus_di;
        if denom == 0.0 {
            return Some(0.0);
        }
        let dx = (plus_di - minus_di).abs() / denom * 100.0;
        dx.is_finite().then_some(dx)
    };

    let mut dx_vals = Vec::with_capacity(transitions - period + 1);
    dx_vals.push(dx_at(sm_plus, sm_minus, sm_tr)?);

    for i in period..transitions {
        sm_plus = sm_plus - sm_plus / period_f + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period_f + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period_f + tr_vals[i];
        dx_vals.push(dx_at(sm_plus, sm_minus, sm_tr)?);
    }

    if dx_vals.len() < period {
        return None;
    }

    let mut value: f64 = dx_vals[..period].iter().sum::<f64>() / period_f;
    for dx in &dx_vals[period..] {
        value = (value * (period_f - 1.0) + dx) / period_f;
        if !value.is_finite() {
            return None;
        }
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ascending;

    #[test]
    fn needs_two_periods_plus_one() {
        let bars = ascending(2 * 14, 100.0, 0.1);
        assert_eq!(adx(&bars, 14), None);
        let bars = ascending(2 * 14 + 1, 100.0, 0.1);
        assert!(adx(&bars, 14).is_some());
    }

    #[test]
    fn strong_uptrend_scores_high() {
        // Monotonic rise: −DM stays zero, so DX pins near 100.
        let bars = ascending(60, 100.0, 0.5);
        let v = adx(&bars, 14).unwrap();
        assert!(v > 50.0, "uptrend should read as trending, got {v}");
    }

    #[test]
    fn value_bounded_0_100() {
        let bars = ascending(80, 100.0, 0.25);
        let v = adx(&bars, 14).unwrap();
        assert!((0.0..=100.0).contains(&v));
    }
}
