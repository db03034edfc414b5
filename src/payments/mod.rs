pub mod consumer;
pub mod error;
pub mod service;
pub mod store;

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

pub use error::PaymentError;

/// Upper bound on serialized invoice/payment metadata, in bytes.
pub const INVOICE_METADATA_MAX_LENGTH: usize = 2048;

/// Permission scope required for an app to spend.
pub const PAY_INVOICE_SCOPE: &str = "pay_invoice";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Incoming,
    Outgoing,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Incoming => "incoming",
            TransactionType::Outgoing => "outgoing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Settled,
    Failed,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Settled => "settled",
            TransactionState::Failed => "failed",
        }
    }
}

/// A ledger row. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub app_id: Option<u64>,
    pub request_event_id: Option<u64>,
    pub transaction_type: TransactionType,
    pub state: TransactionState,
    pub amount_msat: u64,
    pub fee_msat: u64,
    pub fee_reserve_msat: u64,
    pub payment_request: String,
    pub payment_hash: String,
    pub preimage: Option<String>,
    pub description: String,
    pub description_hash: String,
    pub expires_at: Option<u64>,
    pub settled_at: Option<u64>,
    pub failure_reason: Option<String>,
    pub self_payment: bool,
    pub metadata: Option<serde_json::Value>,
    pub boostagram: Option<serde_json::Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Insert shape for a new ledger row. Rows are always created `pending`.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub app_id: Option<u64>,
    pub request_event_id: Option<u64>,
    pub transaction_type: TransactionType,
    pub amount_msat: u64,
    pub fee_reserve_msat: u64,
    pub payment_request: String,
    pub payment_hash: String,
    pub preimage: Option<String>,
    pub description: String,
    pub description_hash: String,
    pub expires_at: Option<u64>,
    pub self_payment: bool,
    pub metadata: Option<serde_json::Value>,
    pub boostagram: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: u64,
    pub name: String,
    pub isolated: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPermission {
    pub id: u64,
    pub app_id: u64,
    pub scope: String,
    pub max_amount_sat: u64,
    pub budget_renewal: BudgetRenewal,
    pub created_at: u64,
}

/// Renewal period of an app's spending budget. The budget window is rolling:
/// it extends the period length back from the current instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetRenewal {
    Never,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl BudgetRenewal {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetRenewal::Never => "never",
            BudgetRenewal::Daily => "daily",
            BudgetRenewal::Weekly => "weekly",
            BudgetRenewal::Monthly => "monthly",
            BudgetRenewal::Yearly => "yearly",
        }
    }

    /// Start of the current budget window, unix seconds.
    pub fn window_start(self, now: u64) -> u64 {
        const DAY: u64 = 24 * 60 * 60;
        match self {
            BudgetRenewal::Never => 0,
            BudgetRenewal::Daily => now.saturating_sub(DAY),
            BudgetRenewal::Weekly => now.saturating_sub(7 * DAY),
            BudgetRenewal::Monthly => now.saturating_sub(30 * DAY),
            BudgetRenewal::Yearly => now.saturating_sub(365 * DAY),
        }
    }
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_window_start() {
        let now = 10_000_000;
        assert_eq!(BudgetRenewal::Never.window_start(now), 0);
        assert_eq!(BudgetRenewal::Daily.window_start(now), now - 86_400);
        assert_eq!(BudgetRenewal::Weekly.window_start(now), now - 7 * 86_400);
        assert_eq!(BudgetRenewal::Monthly.window_start(now), now - 30 * 86_400);
        assert_eq!(BudgetRenewal::Yearly.window_start(now), now - 365 * 86_400);
    }

    #[test]
    fn budget_window_start_saturates() {
        assert_eq!(BudgetRenewal::Yearly.window_start(100), 0);
    }
}
