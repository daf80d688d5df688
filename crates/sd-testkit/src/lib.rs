//! Test harness for the workspace: a scriptable mock broker gateway that
//! speaks the real wire protocol over loopback TCP, plus a scripted
//! real-time bar source for orchestrator scenarios.
//!
//! Scenario integration tests live in `tests/scenario_*.rs`.

mod bar_source;
mod mock_gateway;

pub use bar_source::ScriptedBarSource;
pub use mock_gateway::{MockGateway, MockScript};
