//! OHLCV bar type and validation.

use serde::{Deserialize, Serialize};

/// Immutable OHLCV record for one timeframe period.
///
/// Unique by `(symbol, timeframe, ts)` in the repository; `ts` is the bar's
/// start timestamp in milliseconds since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Bar {
    /// Check the OHLC ordering and volume invariants.
    ///
    /// `low ≤ open, close ≤ high` and `volume ≥ 0`. Bars that fail are
    /// dropped at the ingestion boundary, never silently repaired.
    pub fn validate(&self) -> Result<(), BarError> {
        if !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite())
        {
            return Err(BarError::NonFinite { ts: self.ts });
        }
        if self.low > self.open || self.low > self.close {
            return Err(BarError::LowAboveBody { ts: self.ts });
        }
        if self.high < self.open || self.high < self.close {
            return Err(BarError::HighBelowBody { ts: self.ts });
        }
        if self.volume < 0 {
            return Err(BarError::NegativeVolume { ts: self.ts });
        }
        Ok(())
    }
}

/// A bar that violates the OHLCV invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarError {
    NonFinite { ts: i64 },
    LowAboveBody { ts: i64 },
    HighBelowBody { ts: i64 },
    NegativeVolume { ts: i64 },
}

impl std::fmt::Display for BarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarError::NonFinite { ts } => write!(f, "bar at ts={ts} has non-finite prices"),
            BarError::LowAboveBody { ts } => write!(f, "bar at ts={ts}: low above open/close"),
            BarError::HighBelowBody { ts } => write!(f, "bar at ts={ts}: high below open/close"),
            BarError::NegativeVolume { ts } => write!(f, "bar at ts={ts}: negative volume"),
        }
    }
}

impl std::error::Error for BarError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            ts: 1_000_000,
            open,
            high,
            low,
            close,
            volume: 10,
        }
    }

    #[test]
    fn valid_bar_passes() {
        assert!(bar(100.0, 101.0, 99.0, 100.5).validate().is_ok());
    }

    #[test]
    fn low_above_close_fails() {
        let err = bar(100.0, 101.0, 100.2, 100.1).validate().unwrap_err();
        assert_eq!(err, BarError::LowAboveBody { ts: 1_000_000 });
    }

    #[test]
    fn high_below_open_fails() {
        let err = bar(101.0, 100.5, 99.0, 100.0).validate().unwrap_err();
        assert_eq!(err, BarError::HighBelowBody { ts: 1_000_000 });
    }

    #[test]
    fn negative_volume_fails() {
        let mut b = bar(100.0, 101.0, 99.0, 100.5);
        b.volume = -1;
        assert!(matches!(b.validate(), Err(BarError::NegativeVolume { .. })));
    }
}
