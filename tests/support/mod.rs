use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

use ln_payments::events::{Event, EventPublisher};
use ln_payments::lightning::client::{
    LnClient, LnClientError, LnTransaction, PayInvoiceResponse, PayKeysendResponse,
};
use ln_payments::payments::TransactionType;
use ln_payments::payments::service::TransactionsService;
use ln_payments::payments::store::LedgerStore;

pub const NODE_SECRET: [u8; 32] = [0x42; 32];
pub const REMOTE_SECRET: [u8; 32] = [0x99; 32];

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

pub fn pubkey_hex(secret: [u8; 32]) -> String {
    let secp = Secp256k1::new();
    let secret_key = SecretKey::from_slice(&secret).expect("valid secret key");
    PublicKey::from_secret_key(&secp, &secret_key).to_string()
}

pub fn payment_hash_hex(preimage: [u8; 32]) -> String {
    hex::encode(sha256::Hash::hash(&preimage).to_byte_array())
}

/// Build a real signed bolt11 so the service exercises genuine offline
/// decoding. Returns the invoice string and the payment hash hex.
pub fn sign_invoice(
    payee_secret: [u8; 32],
    preimage: [u8; 32],
    amount_msat: u64,
    description: &str,
) -> Result<(String, String)> {
    let secp = Secp256k1::new();
    let secret_key = SecretKey::from_slice(&payee_secret).context("payee secret key")?;
    let payment_hash = sha256::Hash::hash(&preimage);

    let invoice = InvoiceBuilder::new(Currency::Bitcoin)
        .description(description.to_string())
        .payment_hash(payment_hash)
        .payment_secret(PaymentSecret([21; 32]))
        .amount_milli_satoshis(amount_msat)
        .duration_since_epoch(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .context("system time before epoch")?,
        )
        .expiry_time(Duration::from_secs(3600))
        .min_final_cltv_expiry_delta(18)
        .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &secret_key))
        .map_err(|e| anyhow::anyhow!("sign invoice: {e:?}"))?;

    Ok((invoice.to_string(), payment_hash.to_string()))
}

/// Scriptable node client. Invoices it creates are genuinely signed with the
/// node key so self-payment classification works end to end.
pub struct MockLnClient {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
    pub notification_types: Vec<String>,
    pub pay_results: Mutex<VecDeque<Result<PayInvoiceResponse, LnClientError>>>,
    pub keysend_results: Mutex<VecDeque<Result<PayKeysendResponse, LnClientError>>>,
    pub lookup_results: Mutex<HashMap<String, LnTransaction>>,
    pub pay_calls: Mutex<Vec<String>>,
    pub keysend_calls: Mutex<Vec<String>>,
    pub lookup_calls: Mutex<Vec<String>>,
    invoice_counter: Mutex<u8>,
}

impl MockLnClient {
    pub fn new(notification_types: Vec<String>) -> Self {
        Self {
            secp: Secp256k1::new(),
            secret_key: SecretKey::from_slice(&NODE_SECRET).expect("valid secret key"),
            notification_types,
            pay_results: Mutex::new(VecDeque::new()),
            keysend_results: Mutex::new(VecDeque::new()),
            lookup_results: Mutex::new(HashMap::new()),
            pay_calls: Mutex::new(Vec::new()),
            keysend_calls: Mutex::new(Vec::new()),
            lookup_calls: Mutex::new(Vec::new()),
            invoice_counter: Mutex::new(0),
        }
    }

    pub fn script_pay(&self, result: Result<PayInvoiceResponse, LnClientError>) {
        self.pay_results.lock().unwrap().push_back(result);
    }

    pub fn script_keysend(&self, result: Result<PayKeysendResponse, LnClientError>) {
        self.keysend_results.lock().unwrap().push_back(result);
    }

    pub fn script_lookup(&self, payment_hash: &str, transaction: LnTransaction) {
        self.lookup_results
            .lock()
            .unwrap()
            .insert(payment_hash.to_string(), transaction);
    }
}

#[async_trait]
impl LnClient for MockLnClient {
    async fn make_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        description_hash: &str,
        expiry_secs: u64,
    ) -> Result<LnTransaction, LnClientError> {
        let preimage = {
            let mut counter = self.invoice_counter.lock().unwrap();
            *counter += 1;
            [*counter; 32]
        };
        let payment_hash = sha256::Hash::hash(&preimage);

        let invoice = InvoiceBuilder::new(Currency::Bitcoin)
            .description(description.to_string())
            .payment_hash(payment_hash)
            .payment_secret(PaymentSecret([7; 32]))
            .amount_milli_satoshis(amount_msat)
            .duration_since_epoch(
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0)),
            )
            .expiry_time(Duration::from_secs(expiry_secs.max(1)))
            .min_final_cltv_expiry_delta(18)
            .build_signed(|hash| self.secp.sign_ecdsa_recoverable(hash, &self.secret_key))
            .map_err(|e| LnClientError::Failure(format!("sign invoice: {e:?}")))?;

        Ok(LnTransaction {
            transaction_type: TransactionType::Incoming,
            invoice: invoice.to_string(),
            description: description.to_string(),
            description_hash: description_hash.to_string(),
            preimage: hex::encode(preimage),
            payment_hash: payment_hash.to_string(),
            amount_msat,
            fees_paid_msat: 0,
            expires_at: Some(now_unix() + expiry_secs),
            settled_at: None,
            custom_records: Vec::new(),
            metadata: None,
        })
    }

    async fn send_payment_sync(&self, pay_req: &str) -> Result<PayInvoiceResponse, LnClientError> {
        self.pay_calls.lock().unwrap().push(pay_req.to_string());
        self.pay_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LnClientError::Failure("no scripted pay response".into())))
    }

    async fn send_keysend(
        &self,
        _amount_msat: u64,
        destination: &str,
        _custom_records: &[ln_payments::lightning::tlv::TlvRecord],
        _preimage: &str,
    ) -> Result<PayKeysendResponse, LnClientError> {
        self.keysend_calls
            .lock()
            .unwrap()
            .push(destination.to_string());
        self.keysend_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LnClientError::Failure("no scripted keysend response".into())))
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<LnTransaction, LnClientError> {
        self.lookup_calls
            .lock()
            .unwrap()
            .push(payment_hash.to_string());
        self.lookup_results
            .lock()
            .unwrap()
            .get(payment_hash)
            .cloned()
            .ok_or_else(|| LnClientError::Failure("invoice not found".into()))
    }

    fn pubkey(&self) -> String {
        PublicKey::from_secret_key(&self.secp, &self.secret_key).to_string()
    }

    fn supported_notification_types(&self) -> Vec<String> {
        self.notification_types.clone()
    }
}

#[derive(Default)]
pub struct CapturingPublisher {
    pub events: Mutex<Vec<Event>>,
}

impl CapturingPublisher {
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .count()
    }

    pub fn last(&self, name: &str) -> Option<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.name == name)
            .cloned()
    }
}

impl EventPublisher for CapturingPublisher {
    fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct TestEnv {
    pub service: TransactionsService,
    pub store: Arc<Mutex<LedgerStore>>,
    pub ln: Arc<MockLnClient>,
    pub events: Arc<CapturingPublisher>,
}

pub fn test_env(notification_types: Vec<String>) -> Result<TestEnv> {
    let _ = ln_payments::logging::init();

    let store = Arc::new(Mutex::new(
        LedgerStore::open_in_memory().context("open in-memory ledger")?,
    ));
    let ln = Arc::new(MockLnClient::new(notification_types));
    let events = Arc::new(CapturingPublisher::default());
    let service = TransactionsService::new(store.clone(), ln.clone(), events.clone());
    Ok(TestEnv {
        service,
        store,
        ln,
        events,
    })
}
