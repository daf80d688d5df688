//! Broker adapter error taxonomy.

use std::fmt;

/// One rejected bracket leg, as reported by validation.
#[derive(Debug, Clone, PartialEq)]
pub struct LegRejection {
    pub order_id: i64,
    /// Projected status at validation time (`rejected`, `cancelled`).
    pub status: String,
    pub code: Option<i32>,
    pub message: Option<String>,
}

/// A cancel that could not be completed, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of a two-phase cancellation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancellationReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<CancelFailure>,
}

#[derive(Debug)]
pub enum BrokerError {
    /// The gateway refused the TCP connection.
    Unavailable(String),
    /// Connect did not complete within the 10 s budget.
    ConnectionTimeout,
    /// Connected but no `NextValidId` within the ready budget.
    NotReady,
    /// Operation attempted without a live session.
    NotConnected,
    /// Post-submit validation found rejected/cancelled legs; the bracket
    /// was rolled back.
    BracketValidationFailed { legs: Vec<LegRejection> },
    /// Phase B could not confirm every requested cancel.
    CancellationIncomplete(CancellationReport),
    Io(String),
    Protocol(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Unavailable(msg) => write!(f, "broker unavailable: {msg}"),
            BrokerError::ConnectionTimeout => write!(f, "broker connect timed out"),
            BrokerError::NotReady => write!(f, "broker session not ready (no next valid id)"),
            BrokerError::NotConnected => write!(f, "broker not connected"),
            BrokerError::BracketValidationFailed { legs } => {
                write!(f, "bracket validation failed: ")?;
                for (i, leg) in legs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "order {} {}", leg.order_id, leg.status)?;
                    if let Some(code) = leg.code {
                        write!(f, " (code {code})")?;
                    }
                }
                Ok(())
            }
            BrokerError::CancellationIncomplete(report) => {
                write!(
                    f,
                    "cancellation incomplete: {} succeeded, {} failed",
                    report.succeeded.len(),
                    report.failed.len()
                )
            }
            BrokerError::Io(msg) => write!(f, "broker io error: {msg}"),
            BrokerError::Protocol(msg) => write!(f, "broker protocol error: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}
