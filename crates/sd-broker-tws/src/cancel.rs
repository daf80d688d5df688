//! Two-phase cancellation: send every cancel first, then confirm each one
//! against the broker's own `Cancelled` reports.
//!
//! Phase A never short-circuits — an individual failure is accumulated and
//! the remaining cancels are still attempted, so one bad id cannot leave
//! later orders working. Phase B shares one confirmation deadline across
//! all targets; a leg the broker never confirms is a verification failure
//! that requires manual intervention, which is exactly what
//! [`BrokerError::CancellationIncomplete`] reports.

use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use sd_schemas::OrderStatus;

use crate::client::TwsBroker;
use crate::error::{BrokerError, CancelFailure, CancellationReport};
use crate::wire::Request;

struct SentCancel {
    target: String,
    /// Legs whose `Cancelled` report phase B must observe.
    legs: Vec<i64>,
}

impl TwsBroker {
    /// Cancel the given orders. Each target is either a numeric broker id
    /// or a local order id (UUID) resolved through the id map; a bracket
    /// parent cancels all three legs.
    pub async fn cancel_open_entries(
        &self,
        targets: &[String],
    ) -> Result<CancellationReport, BrokerError> {
        let mut report = CancellationReport::default();
        let mut sent: Vec<SentCancel> = Vec::new();

        // Phase A: resolve and send every cancel.
        for target in targets {
            let broker_id = match self.resolve_target(target) {
                Some(id) => id,
                None => {
                    report.failed.push(CancelFailure {
                        id: target.clone(),
                        reason: "unknown broker id".into(),
                    });
                    continue;
                }
            };

            let legs: Vec<i64> = match self.bracket_legs(broker_id) {
                Some(bracket) => bracket.ids().to_vec(),
                None => vec![broker_id],
            };

            let mut send_failed = None;
            for leg in &legs {
                if let Err(e) = self.send(Request::CancelOrder { order_id: *leg }).await {
                    warn!(order_id = leg, error = %e, "cancel send failed");
                    send_failed.get_or_insert_with(|| e.to_string());
                }
                if self.is_dry_run() {
                    self.shared.apply_status(*leg, OrderStatus::Cancelled);
                }
            }

            match send_failed {
                Some(reason) => report.failed.push(CancelFailure {
                    id: target.clone(),
                    reason: format!("cancel send failed: {reason}"),
                }),
                None => sent.push(SentCancel {
                    target: target.clone(),
                    legs,
                }),
            }
        }

        // Phase B: confirm every sent cancel within one shared window.
        let deadline = Instant::now() + self.config.cancel_confirm_timeout;
        for cancel in sent {
            let mut unconfirmed = None;
            for leg in &cancel.legs {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !self
                    .wait_for_status(*leg, OrderStatus::Cancelled, remaining)
                    .await
                {
                    unconfirmed = Some(*leg);
                    break;
                }
            }
            match unconfirmed {
                None => {
                    report.succeeded.push(cancel.target);
                    // Confirmed brackets are finished; drop the tracking.
                    let mut s = self.shared.session.lock();
                    if let Some(first) = cancel.legs.first() {
                        s.brackets.remove(first);
                    }
                    for leg in &cancel.legs {
                        s.pending.remove(leg);
                    }
                }
                Some(leg) => report.failed.push(CancelFailure {
                    id: cancel.target,
                    reason: format!("leg {leg} not confirmed cancelled"),
                }),
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "cancellation pass complete"
        );

        if report.failed.is_empty() {
            Ok(report)
        } else {
            Err(BrokerError::CancellationIncomplete(report))
        }
    }

    /// Numeric targets are broker ids; anything else goes through the
    /// local-id map. No guessing: unresolvable targets are failures.
    fn resolve_target(&self, target: &str) -> Option<i64> {
        if let Ok(direct) = target.parse::<i64>() {
            return Some(direct);
        }
        let local: Uuid = target.parse().ok()?;
        self.shared.session.lock().id_map.get(&local).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TwsConfig;

    fn dry_broker() -> TwsBroker {
        TwsBroker::new(TwsConfig::new("127.0.0.1", 0, 1, true))
    }

    #[tokio::test]
    async fn unknown_target_fails_without_stopping_the_rest() {
        let broker = dry_broker();
        broker.connect().await.unwrap();
        let intent = sd_schemas::BracketIntent {
            plan_id: Uuid::new_v4(),
            symbol: "AAPL".into(),
            side: sd_schemas::Side::Buy,
            qty: 10,
            entry_low: 100.0,
            entry_high: 101.0,
            entry_price: 100.5,
            stop_price: 98.0,
            target_price: 110.0,
        };
        let ids = broker.submit_bracket(&intent).await.unwrap();

        let targets = vec!["not-an-id-or-uuid".to_string(), ids.parent.to_string()];
        let err = broker.cancel_open_entries(&targets).await.unwrap_err();
        match err {
            BrokerError::CancellationIncomplete(report) => {
                assert_eq!(report.succeeded, vec![ids.parent.to_string()]);
                assert_eq!(report.failed.len(), 1);
                assert_eq!(report.failed[0].reason, "unknown broker id");
            }
            other => panic!("expected CancellationIncomplete, got {other}"),
        }
    }

    #[tokio::test]
    async fn local_uuid_resolves_through_id_map() {
        let broker = dry_broker();
        broker.connect().await.unwrap();
        let intent = sd_schemas::BracketIntent {
            plan_id: Uuid::new_v4(),
            symbol: "SPY".into(),
            side: sd_schemas::Side::Buy,
            qty: 5,
            entry_low: 500.0,
            entry_high: 501.0,
            entry_price: 500.5,
            stop_price: 495.0,
            target_price: 520.0,
        };
        let ids = broker.submit_bracket(&intent).await.unwrap();
        let local = Uuid::new_v4();
        broker.register_local_order(local, ids.parent);

        let report = broker
            .cancel_open_entries(&[local.to_string()])
            .await
            .unwrap();
        assert_eq!(report.succeeded, vec![local.to_string()]);
        // All three legs observed cancelled, bracket tracking dropped.
        assert_eq!(broker.order_status(ids.stop_loss), Some(OrderStatus::Cancelled));
        assert!(broker.bracket_legs(ids.parent).is_none());
    }
}
