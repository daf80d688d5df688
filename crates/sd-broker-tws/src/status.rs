//! Broker status vocabulary → local order status, and the rejection codes.

use sd_schemas::OrderStatus;

/// Error codes the gateway uses for order rejections. An `Error` event
/// with one of these codes against a live order id marks that order
/// rejected.
pub const REJECTION_CODES: &[i32] = &[201, 202, 104, 110, 103, 105, 161, 162, 200, 203, 399];

pub fn is_rejection_code(code: i32) -> bool {
    REJECTION_CODES.contains(&code)
}

/// Fixed projection from the gateway's status vocabulary.
///
/// `Inactive` maps to rejected: the gateway parked the order and it will
/// never work without operator action.
pub fn map_broker_status(raw: &str) -> Option<OrderStatus> {
    match raw {
        "PendingSubmit" | "PendingCancel" | "PreSubmitted" => Some(OrderStatus::Pending),
        "Submitted" | "ApiPending" => Some(OrderStatus::Submitted),
        "Filled" => Some(OrderStatus::Filled),
        "Cancelled" | "ApiCancelled" => Some(OrderStatus::Cancelled),
        "Inactive" => Some(OrderStatus::Rejected),
        _ => None,
    }
}
