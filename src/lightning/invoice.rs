use std::str::FromStr as _;

use anyhow::Result;
use bitcoin::hashes::{Hash as _, sha256};
use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescriptionRef};

/// Fields the service needs from a bolt11 invoice, extracted offline.
#[derive(Debug, Clone)]
pub struct Bolt11Details {
    pub amount_msat: u64,
    pub payment_hash: String,
    pub payee_pubkey: String,
    pub description: String,
    pub description_hash: String,
    pub expires_at: Option<u64>,
}

pub fn decode_bolt11(invoice: &str) -> Result<Bolt11Details> {
    let parsed = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;

    let (description, description_hash) = match parsed.description() {
        Bolt11InvoiceDescriptionRef::Direct(d) => (d.to_string(), String::new()),
        Bolt11InvoiceDescriptionRef::Hash(h) => (String::new(), h.0.to_string()),
    };

    Ok(Bolt11Details {
        // amountless invoices are valid and decode to zero
        amount_msat: parsed.amount_milli_satoshis().unwrap_or(0),
        payment_hash: hex::encode(parsed.payment_hash().to_byte_array()),
        payee_pubkey: parsed.recover_payee_pub_key().to_string(),
        description,
        description_hash,
        expires_at: parsed.expires_at().map(|d| d.as_secs()),
    })
}

pub fn payment_hash_for_preimage(preimage: &[u8]) -> String {
    hex::encode(sha256::Hash::hash(preimage).to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preimage_hashes_to_payment_hash() {
        let preimage = [7u8; 32];
        let hash = payment_hash_for_preimage(&preimage);
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            hex::encode(sha256::Hash::hash(&preimage).to_byte_array())
        );
    }
}
