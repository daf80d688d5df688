//! Rolling range: highest high / lowest low over the trailing N bars.

use sd_schemas::Bar;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollingRange {
    pub high: f64,
    pub low: f64,
    pub mid: f64,
}

/// Range of the trailing `period` bars, `None` on short history.
pub fn rolling_range(bars: &[Bar], period: usize) -> Option<RollingRange> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let window = &bars[bars.len() - period..];
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    for b in window {
        high = high.max(b.high);
        low = low.min(b.low);
    }
    if !high.is_finite() || !low.is_finite() {
        return None;
    }
    Some(RollingRange {
        high,
        low,
        mid: (high + low) / 2.0,
    })
}
