use thiserror::Error;

use crate::lightning::client::LnClientError;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("the transaction requested was not found")]
    NotFound,

    #[error("insufficient balance remaining to make the requested payment")]
    InsufficientBalance,

    #[error("the app does not have enough budget remaining to make this payment")]
    QuotaExceeded,

    #[error("this invoice has already been paid")]
    AlreadyPaid,

    #[error("encoded metadata is too large: limit {limit} bytes, received {actual}")]
    MetadataTooLarge { limit: usize, actual: usize },

    #[error("app does not have pay_invoice scope")]
    MissingPermission,

    #[error("preimage must be a hex-encoded 32 byte value")]
    InvalidPreimage,

    #[error("no preimage available to settle the payment")]
    MissingPreimage,

    #[error("invalid bolt11 invoice: {0}")]
    InvalidInvoice(String),

    #[error(transparent)]
    LnClient(#[from] LnClientError),

    #[error("ledger failure: {0}")]
    Ledger(#[from] anyhow::Error),
}

impl PaymentError {
    /// True when the node timed out and the payment may still settle later.
    pub fn is_ln_timeout(&self) -> bool {
        matches!(self, PaymentError::LnClient(LnClientError::Timeout))
    }
}
