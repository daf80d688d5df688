//! Scenario: bracket validation failure rolls the bracket back.
//!
//! The mock gateway accepts the parent and take-profit legs but rejects
//! the stop-loss with code 201 before the validation delay expires.
//! `submit_bracket` must fail with `BracketValidationFailed`, the two
//! accepted legs must be observed `Cancelled`, and the adapter must stop
//! tracking all three ids.

use std::collections::HashMap;
use std::time::Duration;

use sd_broker_tws::{BrokerError, TwsBroker, TwsConfig};
use sd_schemas::{BracketIntent, OrderStatus, Side};
use sd_testkit::{MockGateway, MockScript};
use uuid::Uuid;

fn intent() -> BracketIntent {
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

fn fast_config(host: String, port: u16) -> TwsConfig {
    let mut config = TwsConfig::new(host, port, 7, false);
    config.validation_delay = Duration::from_millis(250);
    config.cancel_confirm_timeout = Duration::from_millis(500);
    config
}

#[tokio::test]
async fn stop_loss_rejection_rolls_back_the_bracket() {
    let mock = MockGateway::spawn(MockScript {
        // Third arrival is the stop-loss leg.
        reject_nth_order: HashMap::from([(2usize, 201)]),
        ..MockScript::default()
    })
    .await;

    let broker = TwsBroker::new(fast_config(mock.host(), mock.port()));
    broker.connect().await.unwrap();
    broker.wait_ready().await.unwrap();

    let err = broker.submit_bracket(&intent()).await.unwrap_err();
    let legs = match err {
        BrokerError::BracketValidationFailed { legs } => legs,
        other => panic!("expected BracketValidationFailed, got {other}"),
    };
    assert_eq!(legs.len(), 1);
    assert_eq!(legs[0].code, Some(201));

    // The parent and take-profit were the accepted legs; rollback must
    // have cancelled exactly those.
    let placed = mock.placed_orders();
    assert_eq!(placed.len(), 3);
    let parent_id = placed[0].order_id;
    let tp_id = placed[1].order_id;
    let sl_id = placed[2].order_id;
    assert_eq!(legs[0].order_id, sl_id);

    // Confirmation events arrive from the mock; wait for them.
    assert!(
        broker
            .wait_for_status(parent_id, OrderStatus::Cancelled, Duration::from_secs(1))
            .await
    );
    assert!(
        broker
            .wait_for_status(tp_id, OrderStatus::Cancelled, Duration::from_secs(1))
            .await
    );

    let cancels = mock.cancels_received();
    assert!(cancels.contains(&parent_id));
    assert!(cancels.contains(&tp_id));
    assert!(!cancels.contains(&sl_id), "rejected leg needs no cancel");

    // Tracking dropped for every leg of the failed bracket.
    for id in [parent_id, tp_id, sl_id] {
        assert!(!broker.is_pending(id), "order {id} still tracked");
    }
    assert!(broker.bracket_legs(parent_id).is_none());
}

#[tokio::test]
async fn clean_bracket_passes_validation() {
    let mock = MockGateway::spawn(MockScript::default()).await;
    let broker = TwsBroker::new(fast_config(mock.host(), mock.port()));
    broker.connect().await.unwrap();
    broker.wait_ready().await.unwrap();

    let ids = broker.submit_bracket(&intent()).await.unwrap();
    assert_eq!(broker.order_status(ids.parent), Some(OrderStatus::Submitted));
    assert_eq!(
        broker.order_status(ids.stop_loss),
        Some(OrderStatus::Submitted)
    );
    assert!(broker.is_pending(ids.parent));

    // Wire ordering: parent, then take-profit, then stop-loss; the last
    // leg carries the transmit flag that activates the chain.
    let placed = mock.placed_orders();
    assert_eq!(placed.len(), 3);
    assert_eq!(placed[0].parent_id, 0);
    assert_eq!(placed[1].parent_id, placed[0].order_id);
    assert_eq!(placed[2].parent_id, placed[0].order_id);
    assert!(!placed[0].transmit);
    assert!(!placed[1].transmit);
    assert!(placed[2].transmit, "final leg must transmit the bracket");
}
