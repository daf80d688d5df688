//! Pure indicator math over bar sequences.
//!
//! Every function takes bars oldest-first and returns `Option<f64>` (or a
//! small result struct): `None` means "not enough history", which the engine
//! surfaces as a null feature rather than an error. No I/O, no await points,
//! no interior mutability.

mod adx;
mod atr;
mod bollinger;
mod ema;
mod range;
mod rsi;
mod session;
mod vwap;

pub use adx::adx;
pub use atr::atr;
pub use bollinger::{bollinger, BollingerBands};
pub use ema::{ema, ema_series};
pub use range::{rolling_range, RollingRange};
pub use rsi::rsi;
pub use session::{session_high_low, SessionExtremes};
pub use vwap::vwap;
