//! Bracket submission: three linked orders, atomic activation, and the
//! post-submit validation pass with rollback.

use tracing::{info, warn};

use sd_schemas::{BracketIntent, OrderStatus, Side};

use crate::client::{BracketLegs, PendingOrder, TwsBroker};
use crate::error::{BrokerError, LegRejection};
use crate::wire::{Request, WireOrder};

/// Broker ids assigned to a submitted bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketIds {
    pub parent: i64,
    pub take_profit: i64,
    pub stop_loss: i64,
}

fn wire_side(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

impl TwsBroker {
    /// Submit an entry + take-profit + stop-loss bracket.
    ///
    /// The three legs are sent parent-first with `transmit = false` until
    /// the stop-loss, whose `transmit = true` activates the whole chain
    /// atomically on the gateway side. After the configured validation
    /// delay each leg is inspected; any rejected or cancelled leg rolls
    /// the bracket back (remaining legs cancelled, tracking dropped) and
    /// the call fails with [`BrokerError::BracketValidationFailed`].
    pub async fn submit_bracket(&self, bracket: &BracketIntent) -> Result<BracketIds, BrokerError> {
        self.wait_ready().await?;

        let parent = self.allocate_ids(3)?;
        let ids = BracketIds {
            parent,
            take_profit: parent + 1,
            stop_loss: parent + 2,
        };

        let entry_side = wire_side(bracket.side);
        let exit_side = wire_side(bracket.side.opposite());

        let legs = [
            WireOrder {
                order_id: ids.parent,
                symbol: bracket.symbol.clone(),
                side: entry_side.into(),
                qty: bracket.qty,
                kind: "LMT".into(),
                limit_price: Some(bracket.entry_price),
                aux_price: None,
                parent_id: 0,
                transmit: false,
            },
            WireOrder {
                order_id: ids.take_profit,
                symbol: bracket.symbol.clone(),
                side: exit_side.into(),
                qty: bracket.qty,
                kind: "LMT".into(),
                limit_price: Some(bracket.target_price),
                aux_price: None,
                parent_id: ids.parent,
                transmit: false,
            },
            WireOrder {
                order_id: ids.stop_loss,
                symbol: bracket.symbol.clone(),
                side: exit_side.into(),
                qty: bracket.qty,
                kind: "STP".into(),
                limit_price: None,
                aux_price: Some(bracket.stop_price),
                parent_id: ids.parent,
                transmit: true,
            },
        ];

        // Register tracking before the wire send so events racing the
        // submit always find their order.
        {
            let mut s = self.shared.session.lock();
            for leg in &legs {
                s.pending.insert(
                    leg.order_id,
                    PendingOrder {
                        symbol: leg.symbol.clone(),
                        qty: leg.qty,
                    },
                );
            }
            s.brackets.insert(
                ids.parent,
                BracketLegs {
                    parent_id: ids.parent,
                    take_profit_id: ids.take_profit,
                    stop_loss_id: ids.stop_loss,
                    symbol: bracket.symbol.clone(),
                },
            );
        }

        info!(
            symbol = %bracket.symbol,
            side = entry_side,
            qty = bracket.qty,
            entry = bracket.entry_price,
            stop = bracket.stop_price,
            target = bracket.target_price,
            parent = ids.parent,
            "submitting bracket"
        );

        for leg in legs {
            self.send(Request::PlaceOrder(leg)).await?;
        }

        if self.is_dry_run() {
            // Nothing was sent; mark the legs working so downstream state
            // reads the same shape as a live accept.
            for id in [ids.parent, ids.take_profit, ids.stop_loss] {
                self.shared.apply_status(id, OrderStatus::Submitted);
            }
            return Ok(ids);
        }

        tokio::time::sleep(self.config.validation_delay).await;
        self.validate_bracket(ids).await?;
        Ok(ids)
    }

    /// Inspect each leg after the validation delay; roll back on failure.
    async fn validate_bracket(&self, ids: BracketIds) -> Result<(), BrokerError> {
        let mut rejected: Vec<LegRejection> = Vec::new();
        let mut live: Vec<i64> = Vec::new();

        {
            let s = self.shared.session.lock();
            for id in [ids.parent, ids.take_profit, ids.stop_loss] {
                let status = s.statuses.get(&id).copied();
                let rejection = s.rejections.get(&id);
                match (status, rejection) {
                    (Some(OrderStatus::Rejected), rej) | (_, rej @ Some(_)) => {
                        rejected.push(LegRejection {
                            order_id: id,
                            status: "rejected".into(),
                            code: rej.map(|(c, _)| *c),
                            message: rej.map(|(_, m)| m.clone()),
                        });
                    }
                    (Some(OrderStatus::Cancelled), _) => {
                        rejected.push(LegRejection {
                            order_id: id,
                            status: "cancelled".into(),
                            code: None,
                            message: None,
                        });
                    }
                    _ => live.push(id),
                }
            }
        }

        if rejected.is_empty() {
            return Ok(());
        }

        warn!(
            parent = ids.parent,
            rejected = rejected.len(),
            "bracket validation failed, rolling back"
        );

        // Cancel the legs the broker did accept. Failures here are logged,
        // not propagated: validation failure is already the outcome.
        for id in live {
            if let Err(e) = self.send(Request::CancelOrder { order_id: id }).await {
                warn!(order_id = id, error = %e, "rollback cancel send failed");
            }
        }

        {
            let mut s = self.shared.session.lock();
            for id in [ids.parent, ids.take_profit, ids.stop_loss] {
                s.pending.remove(&id);
            }
            s.brackets.remove(&ids.parent);
        }

        Err(BrokerError::BracketValidationFailed { legs: rejected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TwsConfig;
    use uuid::Uuid;

    fn bracket() -> BracketIntent {
        BracketIntent {
            plan_id: Uuid::new_v4(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            qty: 33,
            entry_low: 101.0,
            entry_high: 102.0,
            entry_price: 101.5,
            stop_price: 99.0,
            target_price: 111.0,
        }
    }

    #[tokio::test]
    async fn dry_run_submits_without_socket() {
        let broker = TwsBroker::new(TwsConfig::new("127.0.0.1", 0, 1, true));
        broker.connect().await.unwrap();
        let ids = broker.submit_bracket(&bracket()).await.unwrap();
        assert_eq!(ids.take_profit, ids.parent + 1);
        assert_eq!(ids.stop_loss, ids.parent + 2);
        assert_eq!(broker.order_status(ids.parent), Some(OrderStatus::Submitted));
        let snap = broker.bracket_snapshot(ids.parent).unwrap();
        assert!(!snap.is_done());
    }

    #[tokio::test]
    async fn brackets_consume_three_consecutive_ids() {
        let broker = TwsBroker::new(TwsConfig::new("127.0.0.1", 0, 1, true));
        broker.connect().await.unwrap();
        let a = broker.submit_bracket(&bracket()).await.unwrap();
        let b = broker.submit_bracket(&bracket()).await.unwrap();
        assert_eq!(b.parent, a.parent + 3);
    }
}
