use crate::lightning::client::LnTransaction;

pub const PAYMENT_RECEIVED_EVENT: &str = "payment_received";
pub const PAYMENT_SENT_EVENT: &str = "payment_sent";
pub const PAYMENT_FAILED_EVENT: &str = "payment_failed";
pub const PERMISSION_DENIED_EVENT: &str = "permission_denied";

pub const INSUFFICIENT_BALANCE_ERROR_CODE: &str = "INSUFFICIENT_BALANCE";
pub const QUOTA_EXCEEDED_ERROR_CODE: &str = "QUOTA_EXCEEDED";

/// An event emitted by the transaction service for downstream subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: &'static str,
    pub properties: serde_json::Value,
}

/// Fire-and-forget event sink. Implementations must not block and must be
/// safe to call from concurrent request tasks.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// Asynchronous notifications pushed by the node client.
#[derive(Debug, Clone)]
pub enum LnClientEvent {
    PaymentReceived(LnTransaction),
    PaymentSent(LnTransaction),
    PaymentFailed {
        transaction: LnTransaction,
        reason: String,
    },
}
