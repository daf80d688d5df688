//! The closed feature registry.
//!
//! Plans declare features by name; the compiler resolves each name to a
//! [`FeatureSpec`] or rejects the plan. The engine calls
//! [`FeatureSpec::compute`] per bar; `None` means insufficient history and
//! the feature stays out of the expression environment for that bar.

use sd_indicators as ind;
use sd_schemas::Bar;

/// A named indicator with its runtime parameters resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureSpec {
    Close,
    Open,
    High,
    Low,
    Volume,
    Ema { period: usize },
    Vwap,
    BbUpper,
    BbMiddle,
    BbLower,
    Adx { period: usize },
    RangeHigh { period: usize },
    RangeLow { period: usize },
    RangeMid { period: usize },
    Hod,
    Lod,
    Atr { period: usize },
    Rsi { period: usize },
}

impl FeatureSpec {
    /// Resolve a feature name from a plan document.
    ///
    /// The reserved vocabulary (`ema20`, `range_high_20`, ...) is fixed;
    /// `ema(n)` / `atr(n)` / `rsi(n)` / `adx(n)` additionally accept an
    /// explicit period.
    pub fn resolve(name: &str) -> Option<FeatureSpec> {
        let spec = match name {
            "close" => FeatureSpec::Close,
            "open" => FeatureSpec::Open,
            "high" => FeatureSpec::High,
            "low" => FeatureSpec::Low,
            "volume" => FeatureSpec::Volume,
            "ema20" => FeatureSpec::Ema { period: 20 },
            "vwap" => FeatureSpec::Vwap,
            "bb_upper" => FeatureSpec::BbUpper,
            "bb_middle" => FeatureSpec::BbMiddle,
            "bb_lower" => FeatureSpec::BbLower,
            "adx" => FeatureSpec::Adx { period: 14 },
            "range_high_20" => FeatureSpec::RangeHigh { period: 20 },
            "range_low_20" => FeatureSpec::RangeLow { period: 20 },
            "range_mid_20" => FeatureSpec::RangeMid { period: 20 },
            "range_high_40" => FeatureSpec::RangeHigh { period: 40 },
            "range_low_40" => FeatureSpec::RangeLow { period: 40 },
            "hod" => FeatureSpec::Hod,
            "lod" => FeatureSpec::Lod,
            "atr" => FeatureSpec::Atr { period: 14 },
            "rsi" => FeatureSpec::Rsi { period: 14 },
            other => return Self::resolve_parameterized(other),
        };
        Some(spec)
    }

    fn resolve_parameterized(name: &str) -> Option<FeatureSpec> {
        let open = name.find('(')?;
        if !name.ends_with(')') {
            return None;
        }
        let base = &name[..open];
        let period: usize = name[open + 1..name.len() - 1].parse().ok()?;
        if period == 0 {
            return None;
        }
        match base {
            "ema" => Some(FeatureSpec::Ema { period }),
            "atr" => Some(FeatureSpec::Atr { period }),
            "rsi" => Some(FeatureSpec::Rsi { period }),
            "adx" => Some(FeatureSpec::Adx { period }),
            _ => None,
        }
    }

    /// The identifier this feature binds in the expression environment.
    pub fn env_name(&self) -> String {
        match self {
            FeatureSpec::Close => "close".into(),
            FeatureSpec::Open => "open".into(),
            FeatureSpec::High => "high".into(),
            FeatureSpec::Low => "low".into(),
            FeatureSpec::Volume => "volume".into(),
            FeatureSpec::Ema { period: 20 } => "ema20".into(),
            FeatureSpec::Ema { period } => format!("ema{period}"),
            FeatureSpec::Vwap => "vwap".into(),
            FeatureSpec::BbUpper => "bb_upper".into(),
            FeatureSpec::BbMiddle => "bb_middle".into(),
            FeatureSpec::BbLower => "bb_lower".into(),
            FeatureSpec::Adx { period: 14 } => "adx".into(),
            FeatureSpec::Adx { period } => format!("adx{period}"),
            FeatureSpec::RangeHigh { period } => format!("range_high_{period}"),
            FeatureSpec::RangeLow { period } => format!("range_low_{period}"),
            FeatureSpec::RangeMid { period } => format!("range_mid_{period}"),
            FeatureSpec::Hod => "hod".into(),
            FeatureSpec::Lod => "lod".into(),
            FeatureSpec::Atr { period: 14 } => "atr".into(),
            FeatureSpec::Atr { period } => format!("atr{period}"),
            FeatureSpec::Rsi { period: 14 } => "rsi".into(),
            FeatureSpec::Rsi { period } => format!("rsi{period}"),
        }
    }

    /// Minimum history this feature needs before it produces a value.
    pub fn min_bars(&self) -> usize {
        match self {
            FeatureSpec::Close
            | FeatureSpec::Open
            | FeatureSpec::High
            | FeatureSpec::Low
            | FeatureSpec::Volume
            | FeatureSpec::Vwap
            | FeatureSpec::Hod
            | FeatureSpec::Lod => 1,
            FeatureSpec::Ema { period } => *period,
            FeatureSpec::BbUpper | FeatureSpec::BbMiddle | FeatureSpec::BbLower => 20,
            FeatureSpec::Adx { period } => 2 * period + 1,
            FeatureSpec::RangeHigh { period }
            | FeatureSpec::RangeLow { period }
            | FeatureSpec::RangeMid { period } => *period,
            FeatureSpec::Atr { period } | FeatureSpec::Rsi { period } => period + 1,
        }
    }

    /// Compute the current value from history (oldest first).
    pub fn compute(&self, bars: &[Bar]) -> Option<f64> {
        let last = bars.last()?;
        match self {
            FeatureSpec::Close => Some(last.close),
            FeatureSpec::Open => Some(last.open),
            FeatureSpec::High => Some(last.high),
            FeatureSpec::Low => Some(last.low),
            FeatureSpec::Volume => Some(last.volume as f64),
            FeatureSpec::Ema { period } => {
                let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
                ind::ema(&closes, *period)
            }
            FeatureSpec::Vwap => ind::vwap(session_slice(bars)),
            FeatureSpec::BbUpper => bb(bars).map(|b| b.upper),
            FeatureSpec::BbMiddle => bb(bars).map(|b| b.middle),
            FeatureSpec::BbLower => bb(bars).map(|b| b.lower),
            FeatureSpec::Adx { period } => ind::adx(bars, *period),
            FeatureSpec::RangeHigh { period } => ind::rolling_range(bars, *period).map(|r| r.high),
            FeatureSpec::RangeLow { period } => ind::rolling_range(bars, *period).map(|r| r.low),
            FeatureSpec::RangeMid { period } => ind::rolling_range(bars, *period).map(|r| r.mid),
            FeatureSpec::Hod => ind::session_high_low(bars).map(|s| s.hod),
            FeatureSpec::Lod => ind::session_high_low(bars).map(|s| s.lod),
            FeatureSpec::Atr { period } => ind::atr(bars, *period),
            FeatureSpec::Rsi { period } => {
                let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
                ind::rsi(&closes, *period)
            }
        }
    }
}

fn bb(bars: &[Bar]) -> Option<ind::BollingerBands> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    ind::bollinger(&closes, 20, 2.0)
}

/// The tail of `bars` sharing a UTC day with the last bar (VWAP scope).
fn session_slice(bars: &[Bar]) -> &[Bar] {
    let Some(last) = bars.last() else {
        return bars;
    };
    let day = last.ts.div_euclid(86_400_000);
    let start = bars
        .iter()
        .rposition(|b| b.ts.div_euclid(86_400_000) != day)
        .map(|i| i + 1)
        .unwrap_or(0);
    &bars[start..]
}
