use std::sync::{Arc, Mutex};

use rand::RngCore as _;
use serde_json::json;

use crate::events::{
    Event, EventPublisher, INSUFFICIENT_BALANCE_ERROR_CODE, PAYMENT_FAILED_EVENT,
    PAYMENT_RECEIVED_EVENT, PAYMENT_SENT_EVENT, PERMISSION_DENIED_EVENT,
    QUOTA_EXCEEDED_ERROR_CODE,
};
use crate::lightning::client::{LnClient, PayInvoiceResponse};
use crate::lightning::invoice::{decode_bolt11, payment_hash_for_preimage};
use crate::lightning::tlv::{self, TlvRecord};
use crate::payments::error::PaymentError;
use crate::payments::store::{LedgerStore, ListFilter};
use crate::payments::{
    INVOICE_METADATA_MAX_LENGTH, NewTransaction, PAY_INVOICE_SCOPE, Transaction, TransactionState,
    TransactionType, now_unix,
};

/// Pending rows older than this are left to manual recovery instead of being
/// re-checked against the node on every list call.
const RECONCILE_WINDOW_SECS: u64 = 24 * 60 * 60;

pub struct TransactionsService {
    store: Arc<Mutex<LedgerStore>>,
    ln: Arc<dyn LnClient>,
    event_publisher: Arc<dyn EventPublisher>,
}

#[derive(Debug, Clone)]
pub struct MakeInvoiceParams {
    pub amount_msat: u64,
    pub description: String,
    pub description_hash: String,
    pub expiry_secs: u64,
    pub metadata: Option<serde_json::Value>,
    pub app_id: Option<u64>,
    pub request_event_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SendKeysendParams {
    pub amount_msat: u64,
    pub destination: String,
    pub custom_records: Vec<TlvRecord>,
    /// Hex-encoded 32 byte preimage; generated when absent.
    pub preimage: Option<String>,
    pub app_id: Option<u64>,
    pub request_event_id: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ListTransactionsParams {
    pub from: u64,
    pub until: u64,
    pub limit: u64,
    pub offset: u64,
    pub unpaid_outgoing: bool,
    pub unpaid_incoming: bool,
    pub transaction_type: Option<TransactionType>,
    pub app_id: Option<u64>,
}

/// Routing-fee headroom reserved on every in-flight outgoing payment:
/// 1% of the amount or 10 sats, whichever is greater.
pub fn fee_reserve_msat(amount_msat: u64) -> u64 {
    amount_msat.div_ceil(100).max(10_000)
}

impl TransactionsService {
    pub fn new(
        store: Arc<Mutex<LedgerStore>>,
        ln: Arc<dyn LnClient>,
        event_publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            ln,
            event_publisher,
        }
    }

    pub(crate) fn store_lock(&self) -> std::sync::MutexGuard<'_, LedgerStore> {
        self.store.lock().expect("store mutex poisoned")
    }

    pub async fn make_invoice(
        &self,
        params: MakeInvoiceParams,
    ) -> Result<Transaction, PaymentError> {
        check_metadata_size(params.metadata.as_ref())?;

        let ln_transaction = self
            .ln
            .make_invoice(
                params.amount_msat,
                &params.description,
                &params.description_hash,
                params.expiry_secs,
            )
            .await
            .inspect_err(|err| tracing::error!(error = %err, "failed to create invoice"))?;

        let preimage = (!ln_transaction.preimage.is_empty()).then(|| ln_transaction.preimage.clone());

        let transaction = {
            let mut store = self.store_lock();
            store.create_transaction(&NewTransaction {
                app_id: params.app_id,
                request_event_id: params.request_event_id,
                transaction_type: ln_transaction.transaction_type,
                amount_msat: ln_transaction.amount_msat,
                fee_reserve_msat: 0,
                payment_request: ln_transaction.invoice,
                payment_hash: ln_transaction.payment_hash,
                preimage,
                description: params.description,
                description_hash: params.description_hash,
                expires_at: ln_transaction.expires_at,
                self_payment: false,
                metadata: params.metadata,
                boostagram: None,
            })?
        };

        tracing::info!(
            payment_hash = %transaction.payment_hash,
            amount_msat = transaction.amount_msat,
            "created invoice"
        );
        Ok(transaction)
    }

    pub async fn send_payment_sync(
        &self,
        pay_req: &str,
        metadata: Option<serde_json::Value>,
        app_id: Option<u64>,
        request_event_id: Option<u64>,
    ) -> Result<Transaction, PaymentError> {
        check_metadata_size(metadata.as_ref())?;

        let pay_req = pay_req.to_lowercase();
        let details = decode_bolt11(&pay_req).map_err(|err| {
            tracing::error!(bolt11 = %pay_req, error = %err, "failed to decode bolt11 invoice");
            PaymentError::InvalidInvoice(err.to_string())
        })?;

        let self_payment =
            !details.payee_pubkey.is_empty() && details.payee_pubkey == self.ln.pubkey();

        let transaction = {
            let mut store = self.store_lock();

            if store
                .find_settled(TransactionType::Outgoing, &details.payment_hash)?
                .is_some()
            {
                tracing::info!(
                    payment_hash = %details.payment_hash,
                    "this invoice has already been paid"
                );
                return Err(PaymentError::AlreadyPaid);
            }

            self.validate_can_pay(&mut store, app_id, details.amount_msat, &details.description)?;

            store.create_transaction(&NewTransaction {
                app_id,
                request_event_id,
                transaction_type: TransactionType::Outgoing,
                amount_msat: details.amount_msat,
                fee_reserve_msat: fee_reserve_msat(details.amount_msat),
                payment_request: pay_req.clone(),
                payment_hash: details.payment_hash.clone(),
                preimage: None,
                description: details.description.clone(),
                description_hash: details.description_hash.clone(),
                expires_at: details.expires_at,
                self_payment,
                metadata,
                boostagram: None,
            })?
        };

        let response = if self_payment {
            self.intercept_self_payment(&transaction.payment_hash)
        } else {
            self.ln
                .send_payment_sync(&pay_req)
                .await
                .map_err(PaymentError::from)
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => return Err(self.handle_dispatch_failure(&transaction, err)),
        };

        self.mark_transaction_settled(&transaction, &response.preimage, response.fee_msat, self_payment)
    }

    pub async fn send_keysend(
        &self,
        params: SendKeysendParams,
    ) -> Result<Transaction, PaymentError> {
        let preimage = match params.preimage {
            Some(preimage) => {
                let bytes = hex::decode(&preimage).map_err(|_| PaymentError::InvalidPreimage)?;
                if bytes.len() != 32 {
                    return Err(PaymentError::InvalidPreimage);
                }
                preimage
            }
            None => make_preimage_hex(),
        };
        let preimage_bytes = hex::decode(&preimage).expect("preimage validated as hex");
        let payment_hash = payment_hash_for_preimage(&preimage_bytes);

        let metadata = json!({
            "destination": params.destination,
            "tlv_records": params.custom_records,
        });
        let boostagram = tlv::boostagram_from_records(&params.custom_records);
        let description = tlv::description_from_records(&params.custom_records);

        let self_payment = params.destination == self.ln.pubkey();

        let transaction = {
            let mut store = self.store_lock();
            self.validate_can_pay(&mut store, params.app_id, params.amount_msat, "")?;
            store.create_transaction(&NewTransaction {
                app_id: params.app_id,
                request_event_id: params.request_event_id,
                transaction_type: TransactionType::Outgoing,
                amount_msat: params.amount_msat,
                fee_reserve_msat: fee_reserve_msat(params.amount_msat),
                payment_request: String::new(),
                payment_hash: payment_hash.clone(),
                preimage: Some(preimage.clone()),
                description: description.clone(),
                description_hash: String::new(),
                expires_at: None,
                self_payment,
                metadata: Some(metadata.clone()),
                boostagram: boostagram.clone(),
            })?
        };

        let response = if self_payment {
            // the recipient side does not exist yet for keysend; create it and
            // settle both legs inside one store critical section
            let mut store = self.store_lock();
            let recipient_app_id = self.resolve_recipient_app_id(&store, &params.custom_records);
            store
                .create_transaction(&NewTransaction {
                    app_id: recipient_app_id,
                    // related to this request but owned by a different app
                    request_event_id: None,
                    transaction_type: TransactionType::Incoming,
                    amount_msat: params.amount_msat,
                    fee_reserve_msat: 0,
                    payment_request: String::new(),
                    payment_hash: payment_hash.clone(),
                    preimage: Some(preimage.clone()),
                    description: description.clone(),
                    description_hash: String::new(),
                    expires_at: None,
                    self_payment: true,
                    metadata: Some(metadata),
                    boostagram,
                })
                .map_err(PaymentError::from)
                .and_then(|_| self.intercept_self_payment_locked(&mut store, &payment_hash))
        } else {
            self.ln
                .send_keysend(
                    params.amount_msat,
                    &params.destination,
                    &params.custom_records,
                    &preimage,
                )
                .await
                .map(|response| PayInvoiceResponse {
                    preimage: preimage.clone(),
                    fee_msat: response.fee_msat,
                })
                .map_err(PaymentError::from)
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => return Err(self.handle_dispatch_failure(&transaction, err)),
        };

        self.mark_transaction_settled(&transaction, &response.preimage, response.fee_msat, self_payment)
    }

    pub async fn lookup_transaction(
        &self,
        payment_hash: &str,
        transaction_type: Option<TransactionType>,
        app_id: Option<u64>,
    ) -> Result<Transaction, PaymentError> {
        let isolated_app_id = self.isolated_app_filter(app_id)?;

        let transaction = {
            let store = self.store_lock();
            store.lookup_by_hash(payment_hash, transaction_type, isolated_app_id)?
        };
        let Some(transaction) = transaction else {
            tracing::error!(payment_hash, app_id = ?app_id, "transaction not found");
            return Err(PaymentError::NotFound);
        };

        if transaction.state == TransactionState::Pending {
            self.check_unsettled_transaction(&transaction).await;
            let store = self.store_lock();
            if let Some(updated) = store.get_transaction(transaction.id)? {
                return Ok(updated);
            }
        }

        Ok(transaction)
    }

    pub async fn list_transactions(
        &self,
        params: ListTransactionsParams,
    ) -> Result<Vec<Transaction>, PaymentError> {
        self.check_unsettled_transactions().await;

        let isolated_app_id = self.isolated_app_filter(params.app_id)?;

        let store = self.store_lock();
        let transactions = store.list(&ListFilter {
            from: params.from,
            until: params.until,
            limit: params.limit,
            offset: params.offset,
            unpaid_outgoing: params.unpaid_outgoing,
            unpaid_incoming: params.unpaid_incoming,
            transaction_type: params.transaction_type,
            app_id: isolated_app_id,
        })?;
        Ok(transactions)
    }

    /// Resolve the app-scope filter: only isolated apps are restricted to
    /// their own rows. An unknown app id is an error.
    fn isolated_app_filter(&self, app_id: Option<u64>) -> Result<Option<u64>, PaymentError> {
        let Some(app_id) = app_id else {
            return Ok(None);
        };
        let store = self.store_lock();
        let app = store.get_app(app_id)?.ok_or(PaymentError::NotFound)?;
        Ok(app.isolated.then_some(app_id))
    }

    /// Quota and balance checks for an outgoing payment. Must run while the
    /// caller holds the store lock so the read stays consistent with the
    /// pending-row insert that follows.
    fn validate_can_pay(
        &self,
        store: &mut LedgerStore,
        app_id: Option<u64>,
        amount_msat: u64,
        description: &str,
    ) -> Result<(), PaymentError> {
        let amount_with_reserve = amount_msat + fee_reserve_msat(amount_msat);

        let Some(app_id) = app_id else {
            return Ok(());
        };
        let app = store.get_app(app_id)?.ok_or(PaymentError::NotFound)?;
        let permission = store
            .get_app_permission(app_id, PAY_INVOICE_SCOPE)?
            .ok_or(PaymentError::MissingPermission)?;

        if app.isolated {
            let balance = store.isolated_balance_msat(app_id)?;
            if i128::from(amount_with_reserve) > i128::from(balance) {
                let err = PaymentError::InsufficientBalance;
                self.publish_permission_denied(
                    &app.name,
                    INSUFFICIENT_BALANCE_ERROR_CODE,
                    &err,
                    description,
                );
                return Err(err);
            }
        }

        if permission.max_amount_sat > 0 {
            let since = permission.budget_renewal.window_start(now_unix());
            let budget_usage_sat = store.budget_usage_msat(app_id, since)? / 1000;
            if amount_with_reserve / 1000 + budget_usage_sat > permission.max_amount_sat {
                let err = PaymentError::QuotaExceeded;
                self.publish_permission_denied(
                    &app.name,
                    QUOTA_EXCEEDED_ERROR_CODE,
                    &err,
                    description,
                );
                return Err(err);
            }
        }

        Ok(())
    }

    fn publish_permission_denied(
        &self,
        app_name: &str,
        code: &str,
        err: &PaymentError,
        description: &str,
    ) {
        let mut message = err.to_string();
        if !description.is_empty() {
            message.push(' ');
            message.push_str(description);
        }
        self.event_publisher.publish(Event {
            name: PERMISSION_DENIED_EVENT,
            properties: json!({
                "app_name": app_name,
                "code": code,
                "message": message,
            }),
        });
    }

    /// Settle a payment to ourselves against the already-prepared incoming
    /// row, without touching the node.
    fn intercept_self_payment(
        &self,
        payment_hash: &str,
    ) -> Result<PayInvoiceResponse, PaymentError> {
        let mut store = self.store_lock();
        self.intercept_self_payment_locked(&mut store, payment_hash)
    }

    fn intercept_self_payment_locked(
        &self,
        store: &mut LedgerStore,
        payment_hash: &str,
    ) -> Result<PayInvoiceResponse, PaymentError> {
        tracing::debug!(payment_hash, "intercepting self payment");

        let incoming = store
            .find_pending_incoming(payment_hash)?
            .ok_or(PaymentError::NotFound)?;
        let Some(preimage) = incoming.preimage.clone() else {
            tracing::error!(
                payment_hash,
                "preimage is not set on the incoming transaction; self payments unsupported"
            );
            return Err(PaymentError::MissingPreimage);
        };

        self.mark_transaction_settled_locked(store, &incoming, &preimage, 0, true)?;

        Ok(PayInvoiceResponse {
            preimage,
            fee_msat: 0,
        })
    }

    /// Classify a dispatch error: timeouts leave the row pending for the
    /// reconciler, anything else is a definite failure.
    fn handle_dispatch_failure(
        &self,
        transaction: &Transaction,
        err: PaymentError,
    ) -> PaymentError {
        tracing::error!(
            payment_hash = %transaction.payment_hash,
            error = %err,
            "failed to send payment"
        );

        if err.is_ln_timeout() {
            tracing::warn!(
                payment_hash = %transaction.payment_hash,
                "timed out waiting for the payment; it may still succeed, leaving it pending"
            );
            return err;
        }

        if let Err(mark_err) = self.mark_payment_failed(transaction, &err.to_string()) {
            tracing::error!(
                payment_hash = %transaction.payment_hash,
                error = %mark_err,
                "failed to mark payment as failed"
            );
        }
        err
    }

    pub(crate) fn mark_transaction_settled(
        &self,
        transaction: &Transaction,
        preimage: &str,
        fee_msat: u64,
        self_payment: bool,
    ) -> Result<Transaction, PaymentError> {
        let mut store = self.store_lock();
        self.mark_transaction_settled_locked(&mut store, transaction, preimage, fee_msat, self_payment)
    }

    /// pending -> settled. Idempotent: an existing settled row for the same
    /// direction and hash is returned untouched and no event is re-emitted.
    pub(crate) fn mark_transaction_settled_locked(
        &self,
        store: &mut LedgerStore,
        transaction: &Transaction,
        preimage: &str,
        fee_msat: u64,
        self_payment: bool,
    ) -> Result<Transaction, PaymentError> {
        if let Some(existing) =
            store.find_settled(transaction.transaction_type, &transaction.payment_hash)?
        {
            tracing::info!(
                payment_hash = %transaction.payment_hash,
                "payment already marked as settled"
            );
            return Ok(existing);
        }

        let current = store
            .get_transaction(transaction.id)?
            .ok_or(PaymentError::NotFound)?;
        if current.state == TransactionState::Failed {
            tracing::warn!(
                payment_hash = %transaction.payment_hash,
                "refusing to settle a failed transaction"
            );
            return Ok(current);
        }

        if preimage.is_empty() {
            return Err(PaymentError::MissingPreimage);
        }

        let settled = store.mark_settled(transaction.id, preimage, fee_msat, self_payment)?;
        tracing::info!(
            payment_hash = %settled.payment_hash,
            transaction_type = settled.transaction_type.as_str(),
            "marked transaction as settled"
        );

        let event_name = match settled.transaction_type {
            TransactionType::Incoming => PAYMENT_RECEIVED_EVENT,
            TransactionType::Outgoing => PAYMENT_SENT_EVENT,
        };
        self.publish_transaction_event(event_name, &settled);

        Ok(settled)
    }

    pub(crate) fn mark_payment_failed(
        &self,
        transaction: &Transaction,
        reason: &str,
    ) -> Result<Transaction, PaymentError> {
        let mut store = self.store_lock();
        self.mark_payment_failed_locked(&mut store, transaction, reason)
    }

    /// pending -> failed. Idempotent: a row already failed is left untouched
    /// and no event is re-emitted. Settled rows are terminal and never fail.
    pub(crate) fn mark_payment_failed_locked(
        &self,
        store: &mut LedgerStore,
        transaction: &Transaction,
        reason: &str,
    ) -> Result<Transaction, PaymentError> {
        let current = store
            .get_transaction(transaction.id)?
            .ok_or(PaymentError::NotFound)?;

        match current.state {
            TransactionState::Failed => {
                tracing::info!(
                    payment_hash = %current.payment_hash,
                    "payment already marked as failed"
                );
                return Ok(current);
            }
            TransactionState::Settled => {
                tracing::warn!(
                    payment_hash = %current.payment_hash,
                    "refusing to fail a settled transaction"
                );
                return Ok(current);
            }
            TransactionState::Pending => {}
        }

        let failed = store.mark_failed(transaction.id, reason)?;
        tracing::info!(
            payment_hash = %failed.payment_hash,
            reason,
            "marked transaction as failed"
        );
        self.publish_transaction_event(PAYMENT_FAILED_EVENT, &failed);

        Ok(failed)
    }

    fn publish_transaction_event(&self, name: &'static str, transaction: &Transaction) {
        match serde_json::to_value(transaction) {
            Ok(properties) => self.event_publisher.publish(Event { name, properties }),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize transaction event");
            }
        }
    }

    /// TLV app-id hints only count when the app actually exists.
    pub(crate) fn resolve_recipient_app_id(
        &self,
        store: &LedgerStore,
        custom_records: &[TlvRecord],
    ) -> Option<u64> {
        let app_id = tlv::app_id_from_records(custom_records)?;
        match store.get_app(app_id) {
            Ok(Some(app)) => Some(app.id),
            Ok(None) => {
                tracing::warn!(app_id, "custom key TLV record refers to an unknown app");
                None
            }
            Err(err) => {
                tracing::error!(app_id, error = %err, "failed to resolve app from TLV record");
                None
            }
        }
    }

    fn supports_async_payment_events(&self) -> bool {
        self.ln
            .supported_notification_types()
            .iter()
            .any(|t| t == PAYMENT_RECEIVED_EVENT)
    }

    /// Batch reconciliation for nodes that do not push settlement events:
    /// re-check every recent pending row against the node.
    pub(crate) async fn check_unsettled_transactions(&self) {
        if self.supports_async_payment_events() {
            return;
        }

        let pending = {
            let store = self.store_lock();
            match store.list_pending_since(now_unix().saturating_sub(RECONCILE_WINDOW_SECS)) {
                Ok(pending) => pending,
                Err(err) => {
                    tracing::error!(error = %err, "failed to list pending transactions");
                    return;
                }
            }
        };

        for transaction in pending {
            self.check_unsettled_transaction(&transaction).await;
        }
    }

    pub(crate) async fn check_unsettled_transaction(&self, transaction: &Transaction) {
        if self.supports_async_payment_events() {
            return;
        }

        // keysend rows have no invoice to look up; the node errors and we skip
        let ln_transaction = match self.ln.lookup_invoice(&transaction.payment_hash).await {
            Ok(ln_transaction) => ln_transaction,
            Err(err) => {
                tracing::warn!(
                    payment_hash = %transaction.payment_hash,
                    error = %err,
                    "failed to check unsettled transaction"
                );
                return;
            }
        };

        if ln_transaction.settled_at.is_some()
            && let Err(err) = self.mark_transaction_settled(
                transaction,
                &ln_transaction.preimage,
                ln_transaction.fees_paid_msat,
                false,
            )
        {
            tracing::error!(
                payment_hash = %transaction.payment_hash,
                error = %err,
                "failed to settle transaction while reconciling"
            );
        }
    }
}

fn check_metadata_size(metadata: Option<&serde_json::Value>) -> Result<(), PaymentError> {
    let Some(metadata) = metadata else {
        return Ok(());
    };
    let encoded = serde_json::to_vec(metadata)
        .map_err(|e| PaymentError::Ledger(anyhow::anyhow!("serialize metadata: {e}")))?;
    if encoded.len() > INVOICE_METADATA_MAX_LENGTH {
        return Err(PaymentError::MetadataTooLarge {
            limit: INVOICE_METADATA_MAX_LENGTH,
            actual: encoded.len(),
        });
    }
    Ok(())
}

fn make_preimage_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
