//! Scenario: two-phase cancellation with a partial failure.
//!
//! Three brackets are live. The mock acknowledges cancels for the first
//! and third brackets but silently drops every cancel for the second.
//! `cancel_open_entries` must attempt all three, return the first and
//! third as succeeded, report the second as failed, and then surface
//! `CancellationIncomplete`.

use std::collections::HashSet;
use std::time::Duration;

use sd_broker_tws::{BrokerError, TwsBroker, TwsConfig};
use sd_schemas::{BracketIntent, OrderStatus, Side};
use sd_testkit::{MockGateway, MockScript};
use uuid::Uuid;

fn intent(symbol: &str) -> BracketIntent {
    BracketIntent {
        plan_id: Uuid::new_v4(),
        symbol: symbol.into(),
        side: Side::Buy,
        qty: 10,
        entry_low: 100.0,
        entry_high: 101.0,
        entry_price: 100.5,
        stop_price: 98.0,
        target_price: 110.0,
    }
}

#[tokio::test]
async fn partial_cancel_failure_is_reported_after_attempting_all() {
    let mock = MockGateway::spawn(MockScript {
        ignore_cancel_for_bracket: HashSet::from([1usize]),
        ..MockScript::default()
    })
    .await;

    let mut config = TwsConfig::new(mock.host(), mock.port(), 7, false);
    config.validation_delay = Duration::from_millis(150);
    config.cancel_confirm_timeout = Duration::from_millis(500);
    let broker = TwsBroker::new(config);
    broker.connect().await.unwrap();
    broker.wait_ready().await.unwrap();

    let b1 = broker.submit_bracket(&intent("AAA")).await.unwrap();
    let b2 = broker.submit_bracket(&intent("BBB")).await.unwrap();
    let b3 = broker.submit_bracket(&intent("CCC")).await.unwrap();

    let targets = vec![
        b1.parent.to_string(),
        b2.parent.to_string(),
        b3.parent.to_string(),
    ];
    let err = broker.cancel_open_entries(&targets).await.unwrap_err();
    let report = match err {
        BrokerError::CancellationIncomplete(report) => report,
        other => panic!("expected CancellationIncomplete, got {other}"),
    };

    assert_eq!(
        report.succeeded,
        vec![b1.parent.to_string(), b3.parent.to_string()]
    );
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, b2.parent.to_string());
    assert!(report.failed[0].reason.contains("not confirmed"));

    // Every requested cancel was attempted before the error surfaced:
    // all nine legs got a cancel message.
    let cancels = mock.cancels_received();
    for ids in [b1, b2, b3] {
        for id in [ids.parent, ids.take_profit, ids.stop_loss] {
            assert!(cancels.contains(&id), "cancel for {id} never sent");
        }
    }

    // Confirmed brackets report every leg cancelled.
    for ids in [b1, b3] {
        for id in [ids.parent, ids.take_profit, ids.stop_loss] {
            assert_eq!(broker.order_status(id), Some(OrderStatus::Cancelled));
        }
    }
    // The stuck bracket's legs never reached Cancelled.
    assert_ne!(broker.order_status(b2.parent), Some(OrderStatus::Cancelled));
}

#[tokio::test]
async fn full_cancel_success_returns_clean_report() {
    let mock = MockGateway::spawn(MockScript::default()).await;
    let mut config = TwsConfig::new(mock.host(), mock.port(), 7, false);
    config.validation_delay = Duration::from_millis(150);
    config.cancel_confirm_timeout = Duration::from_millis(500);
    let broker = TwsBroker::new(config);
    broker.connect().await.unwrap();
    broker.wait_ready().await.unwrap();

    let ids = broker.submit_bracket(&intent("AAA")).await.unwrap();
    let report = broker
        .cancel_open_entries(&[ids.parent.to_string()])
        .await
        .unwrap();
    assert_eq!(report.succeeded, vec![ids.parent.to_string()]);
    assert!(report.failed.is_empty());
    // Confirmed bracket is no longer tracked.
    assert!(broker.bracket_legs(ids.parent).is_none());
}
