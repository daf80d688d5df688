//! Broker protocol adapter for the legacy socket gateway (TWS-style).
//!
//! The adapter owns the socket and all per-order tracking; everything else
//! in the workspace submits through one shared [`TwsBroker`] handle.
//!
//! Lifecycle: `Disconnected → Connecting → Connected → Ready` (ready once
//! the gateway dictates the next valid order id). Brackets consume three
//! consecutive ids and activate atomically on the final `transmit = true`
//! leg; cancellation is two-phase (send everything, then confirm
//! everything). `LIVE=false` runs the whole surface in dry-run: intended
//! actions are logged and no socket is opened.

mod bracket;
mod cancel;
mod client;
mod error;
mod status;
pub mod wire;

pub use bracket::BracketIds;
pub use client::{
    BracketLegs, BracketSnapshot, ConnState, OrderSnapshot, TwsBroker, TwsConfig,
};
pub use error::{BrokerError, CancelFailure, CancellationReport, LegRejection};
pub use status::{is_rejection_code, map_broker_status, REJECTION_CODES};
