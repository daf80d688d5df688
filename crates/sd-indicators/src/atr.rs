//! Average True Range, Wilder's smoothing.
//!
//! TR = max(H − L, |H − prevClose|, |L − prevClose|); the first ATR is the
//! SMA of the first `period` TR values, then
//! `ATR_t = (ATR_{t-1} · (period − 1) + TR_t) / period`.

use sd_schemas::Bar;

/// Most recent ATR over `period` bars.
///
/// Needs `period + 1` bars (each TR requires a previous close). Returns
/// `None` on short history, zero period, or non-finite intermediates.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values = Vec::with_capacity(bars.len() - 1);
    for w in bars.windows(2) {
        let prev_close = w[0].close;
        let b = &w[1];
        let tr = (b.high - b.low)
            .max((b.high - prev_close).abs())
            .max((b.low - prev_close).abs());
        tr_values.push(tr);
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let mut value = seed;
    for tr in &tr_values[period..] {
        value = (value * (period as f64 - 1.0) + tr) / period as f64;
        if !value.is_finite() {
            return None;
        }
    }
    Some(value)
}
