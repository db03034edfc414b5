use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lightning::tlv::TlvRecord;
use crate::payments::TransactionType;

#[derive(Debug, Error)]
pub enum LnClientError {
    /// The node did not answer in time. The payment may still settle; the
    /// caller must not treat this as a failure.
    #[error("timed out waiting for the node to respond")]
    Timeout,

    #[error("lightning node failure: {0}")]
    Failure(String),
}

/// Node-side view of a payment, returned by invoice creation and lookup and
/// carried by asynchronous settlement notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnTransaction {
    pub transaction_type: TransactionType,
    pub invoice: String,
    pub description: String,
    pub description_hash: String,
    /// Hex preimage; empty when the node does not reveal it.
    pub preimage: String,
    pub payment_hash: String,
    pub amount_msat: u64,
    pub fees_paid_msat: u64,
    pub expires_at: Option<u64>,
    pub settled_at: Option<u64>,
    pub custom_records: Vec<TlvRecord>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PayInvoiceResponse {
    pub preimage: String,
    pub fee_msat: u64,
}

#[derive(Debug, Clone)]
pub struct PayKeysendResponse {
    pub fee_msat: u64,
}

/// Contract the transaction service consumes. Implementations wrap a concrete
/// node backend and must be safe to share across request tasks.
#[async_trait]
pub trait LnClient: Send + Sync {
    async fn make_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        description_hash: &str,
        expiry_secs: u64,
    ) -> Result<LnTransaction, LnClientError>;

    async fn send_payment_sync(&self, pay_req: &str) -> Result<PayInvoiceResponse, LnClientError>;

    async fn send_keysend(
        &self,
        amount_msat: u64,
        destination: &str,
        custom_records: &[TlvRecord],
        preimage: &str,
    ) -> Result<PayKeysendResponse, LnClientError>;

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<LnTransaction, LnClientError>;

    /// Our own node pubkey, lowercase hex.
    fn pubkey(&self) -> String;

    /// Notification kinds the backend pushes on its own. A backend that lists
    /// `payment_received` here does not need ledger reconciliation.
    fn supported_notification_types(&self) -> Vec<String>;
}
