//! Volume-weighted average price over the supplied window.
//!
//! Callers pass session-scoped bars when they want a session VWAP; the
//! function itself is window-agnostic. Typical price = (H + L + C) / 3.

use sd_schemas::Bar;

/// VWAP of `bars`, or `None` when the window is empty or has zero total
/// volume (a zero-volume session would divide by zero).
pub fn vwap(bars: &[Bar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }

    let mut pv = 0.0;
    let mut vol = 0.0;
    for b in bars {
        let typical = (b.high + b.low + b.close) / 3.0;
        pv += typical * b.volume as f64;
        vol += b.volume as f64;
    }
    if vol <= 0.0 || !pv.is_finite() {
        return None;
    }
    Some(pv / vol)
}
