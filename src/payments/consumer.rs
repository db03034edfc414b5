use crate::events::LnClientEvent;
use crate::lightning::client::LnTransaction;
use crate::lightning::tlv;
use crate::payments::error::PaymentError;
use crate::payments::service::TransactionsService;
use crate::payments::{NewTransaction, TransactionType};

/// Inbound notifications from the node client. Handling is idempotent under
/// redelivery; failures are logged and swallowed so the bus can retry.
impl TransactionsService {
    pub async fn consume_event(&self, event: &LnClientEvent) {
        match event {
            LnClientEvent::PaymentReceived(ln_transaction) => {
                if let Err(err) = self.handle_payment_received(ln_transaction) {
                    tracing::error!(
                        payment_hash = %ln_transaction.payment_hash,
                        error = %err,
                        "failed to process received payment"
                    );
                }
            }
            LnClientEvent::PaymentSent(ln_transaction) => {
                if let Err(err) = self.handle_payment_sent(ln_transaction) {
                    tracing::error!(
                        payment_hash = %ln_transaction.payment_hash,
                        error = %err,
                        "failed to process sent payment"
                    );
                }
            }
            LnClientEvent::PaymentFailed {
                transaction: ln_transaction,
                reason,
            } => {
                if let Err(err) = self.handle_payment_failed(ln_transaction, reason) {
                    tracing::error!(
                        payment_hash = %ln_transaction.payment_hash,
                        error = %err,
                        "failed to process failed payment"
                    );
                }
            }
        }
    }

    fn handle_payment_received(&self, ln_transaction: &LnTransaction) -> Result<(), PaymentError> {
        let mut store = self.store_lock();

        let existing = store
            .find_latest_by_type_and_hash(TransactionType::Incoming, &ln_transaction.payment_hash)?;

        let transaction = match existing {
            Some(transaction) => transaction,
            None => {
                // a payment we never issued an invoice row for; adopt it from
                // the node event
                let extracted = tlv::description_from_records(&ln_transaction.custom_records);
                let description = if extracted.is_empty() {
                    ln_transaction.description.clone()
                } else {
                    extracted
                };
                let boostagram = tlv::boostagram_from_records(&ln_transaction.custom_records);
                let app_id = self.resolve_recipient_app_id(&store, &ln_transaction.custom_records);

                store.create_transaction(&NewTransaction {
                    app_id,
                    request_event_id: None,
                    transaction_type: TransactionType::Incoming,
                    amount_msat: ln_transaction.amount_msat,
                    fee_reserve_msat: 0,
                    payment_request: ln_transaction.invoice.clone(),
                    payment_hash: ln_transaction.payment_hash.clone(),
                    preimage: None,
                    description,
                    description_hash: ln_transaction.description_hash.clone(),
                    expires_at: ln_transaction.expires_at,
                    self_payment: false,
                    metadata: ln_transaction.metadata.clone(),
                    boostagram,
                })?
            }
        };

        self.mark_transaction_settled_locked(
            &mut store,
            &transaction,
            &ln_transaction.preimage,
            ln_transaction.fees_paid_msat,
            false,
        )?;
        Ok(())
    }

    fn handle_payment_sent(&self, ln_transaction: &LnTransaction) -> Result<(), PaymentError> {
        let mut store = self.store_lock();

        let Some(transaction) = store
            .find_latest_by_type_and_hash(TransactionType::Outgoing, &ln_transaction.payment_hash)?
        else {
            // payments made from outside the service are not adopted
            tracing::error!(
                payment_hash = %ln_transaction.payment_hash,
                "sent payment not found in the ledger"
            );
            return Ok(());
        };

        self.mark_transaction_settled_locked(
            &mut store,
            &transaction,
            &ln_transaction.preimage,
            ln_transaction.fees_paid_msat,
            false,
        )?;
        Ok(())
    }

    fn handle_payment_failed(
        &self,
        ln_transaction: &LnTransaction,
        reason: &str,
    ) -> Result<(), PaymentError> {
        let mut store = self.store_lock();

        let Some(transaction) = store
            .find_latest_by_type_and_hash(TransactionType::Outgoing, &ln_transaction.payment_hash)?
        else {
            tracing::error!(
                payment_hash = %ln_transaction.payment_hash,
                "failed payment not found in the ledger"
            );
            return Ok(());
        };

        self.mark_payment_failed_locked(&mut store, &transaction, reason)?;
        Ok(())
    }
}
