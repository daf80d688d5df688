//! Session extremes: high and low of the trading day the last bar belongs to.

use sd_schemas::Bar;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionExtremes {
    /// High of day.
    pub hod: f64,
    /// Low of day.
    pub lod: f64,
}

/// HOD/LOD across the bars sharing a UTC day with the last bar.
///
/// Day boundaries are UTC-midnight aligned; bars arrive timestamped by the
/// exchange feed so the same alignment holds for replay and live.
pub fn session_high_low(bars: &[Bar]) -> Option<SessionExtremes> {
    let last = bars.last()?;
    let day = last.ts.div_euclid(86_400_000);

    let mut hod = f64::MIN;
    let mut lod = f64::MAX;
    for b in bars.iter().rev() {
        if b.ts.div_euclid(86_400_000) != day {
            break;
        }
        hod = hod.max(b.high);
        lod = lod.min(b.low);
    }
    (hod.is_finite() && lod.is_finite()).then_some(SessionExtremes { hod, lod })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, high: f64, low: f64) -> Bar {
        Bar {
            ts,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 100,
        }
    }

    const DAY: i64 = 86_400_000;

    #[test]
    fn ignores_previous_day() {
        let bars = [
            bar(DAY - 60_000, 500.0, 1.0), // previous day, extreme values
            bar(DAY + 60_000, 101.0, 99.0),
            bar(DAY + 120_000, 103.0, 100.0),
        ];
        let s = session_high_low(&bars).unwrap();
        assert_eq!(s.hod, 103.0);
        assert_eq!(s.lod, 99.0);
    }

    #[test]
    fn empty_input_is_none() {
        assert_eq!(session_high_low(&[]), None);
    }
}
