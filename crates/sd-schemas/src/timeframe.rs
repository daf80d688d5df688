//! Timeframe parsing: `<integer><unit>` with `unit ∈ {m, h, d}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeframeUnit {
    Minute,
    Hour,
    Day,
}

/// A bar timeframe such as `5m`, `1h`, or `1d`.
///
/// Canonical text form round-trips through `Display`/`FromStr`. Invalid
/// input fails with [`TimeframeError`]; zero counts are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    pub count: u32,
    pub unit: TimeframeUnit,
}

impl Timeframe {
    pub fn minutes(count: u32) -> Self {
        Self {
            count,
            unit: TimeframeUnit::Minute,
        }
    }

    /// Period length in milliseconds.
    pub fn millis(&self) -> i64 {
        let unit_ms: i64 = match self.unit {
            TimeframeUnit::Minute => 60_000,
            TimeframeUnit::Hour => 3_600_000,
            TimeframeUnit::Day => 86_400_000,
        };
        unit_ms * i64::from(self.count)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let u = match self.unit {
            TimeframeUnit::Minute => 'm',
            TimeframeUnit::Hour => 'h',
            TimeframeUnit::Day => 'd',
        };
        write!(f, "{}{}", self.count, u)
    }
}

/// `InvalidTimeframe` in the error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeframeError {
    pub input: String,
}

impl fmt::Display for TimeframeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid timeframe {:?} (expected <integer><m|h|d>)",
            self.input
        )
    }
}

impl std::error::Error for TimeframeError {}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeframeError {
            input: s.to_string(),
        };
        if s.len() < 2 {
            return Err(err());
        }
        let (num, unit) = s.split_at(s.len() - 1);
        let count: u32 = num.parse().map_err(|_| err())?;
        if count == 0 {
            return Err(err());
        }
        let unit = match unit {
            "m" => TimeframeUnit::Minute,
            "h" => TimeframeUnit::Hour,
            "d" => TimeframeUnit::Day,
            _ => return Err(err()),
        };
        Ok(Timeframe { count, unit })
    }
}

impl TryFrom<String> for Timeframe {
    type Error = TimeframeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_forms() {
        assert_eq!("5m".parse::<Timeframe>().unwrap().millis(), 300_000);
        assert_eq!("1h".parse::<Timeframe>().unwrap().millis(), 3_600_000);
        assert_eq!("1d".parse::<Timeframe>().unwrap().millis(), 86_400_000);
    }

    #[test]
    fn display_round_trips() {
        for s in ["5m", "15m", "1h", "1d"] {
            assert_eq!(s.parse::<Timeframe>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn rejects_garbage() {
        for s in ["", "m", "5", "0m", "5x", "-5m", "5M"] {
            assert!(s.parse::<Timeframe>().is_err(), "should reject {s:?}");
        }
    }
}
