use anyhow::{anyhow, Result};
use ferrochain_crypto::{canonical_json, sha256_hex, sign, verify};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

pub const COINBASE_SENDER: &str = "coinbase";

/// A transaction is either a signed transfer between two wallets or the
/// unsigned coinbase that mints a block's reward. The `type` tag and field
/// layout below are the wire/hash-preimage shape; changing field order here
/// does not change the hash, since hashing goes through `canonical_json`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Transaction {
    #[serde(rename = "payment")]
    Payment {
        sender: String,
        receiver: String,
        amount: f64,
        timestamp: f64,
        id: String,
        signature: String,
    },
    #[serde(rename = "coinbase")]
    Coinbase {
        sender: String,
        receiver: String,
        amount: f64,
        timestamp: f64,
        id: String,
    },
}

impl Transaction {
    pub fn id(&self) -> &str {
        match self {
            Transaction::Payment { id, .. } => id,
            Transaction::Coinbase { id, .. } => id,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Transaction::Payment { sender, .. } => sender,
            Transaction::Coinbase { sender, .. } => sender,
        }
    }

    pub fn receiver(&self) -> &str {
        match self {
            Transaction::Payment { receiver, .. } => receiver,
            Transaction::Coinbase { receiver, .. } => receiver,
        }
    }

    pub fn amount(&self) -> f64 {
        match self {
            Transaction::Payment { amount, .. } => *amount,
            Transaction::Coinbase { amount, .. } => *amount,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase { .. })
    }

    /// Builds the signed `payment` transaction: hashes and signs the
    /// unsigned body, then appends `id`/`signature`.
    pub fn new_payment(
        private_key_hex: &str,
        sender_public_key: &str,
        receiver: &str,
        amount: f64,
    ) -> Result<Transaction> {
        if amount <= 0.0 {
            return Err(anyhow!("payment amount must be positive"));
        }
        let timestamp = now_unix_seconds();
        let unsigned = json!({
            "type": "payment",
            "sender": sender_public_key,
            "receiver": receiver,
            "amount": amount,
            "timestamp": timestamp,
        });
        let preimage = serde_json::to_vec(&unsigned)?;
        let id = sha256_hex(&preimage);
        let signature = sign(private_key_hex, &preimage)?;
        Ok(Transaction::Payment {
            sender: sender_public_key.to_string(),
            receiver: receiver.to_string(),
            amount,
            timestamp,
            id,
            signature,
        })
    }

    pub fn new_coinbase(receiver: &str, amount: f64) -> Transaction {
        let timestamp = now_unix_seconds();
        let unsigned = json!({
            "type": "coinbase",
            "sender": COINBASE_SENDER,
            "receiver": receiver,
            "amount": amount,
            "timestamp": timestamp,
        });
        let preimage = serde_json::to_vec(&unsigned).expect("coinbase body always serialises");
        let id = sha256_hex(&preimage);
        Transaction::Coinbase {
            sender: COINBASE_SENDER.to_string(),
            receiver: receiver.to_string(),
            amount,
            timestamp,
            id,
        }
    }

    /// Recomputes the unsigned-body bytes for a payment transaction (the
    /// subject of both the id hash and the signature).
    fn payment_preimage(&self) -> Option<Vec<u8>> {
        match self {
            Transaction::Payment {
                sender,
                receiver,
                amount,
                timestamp,
                ..
            } => {
                let unsigned = json!({
                    "type": "payment",
                    "sender": sender,
                    "receiver": receiver,
                    "amount": amount,
                    "timestamp": timestamp,
                });
                Some(serde_json::to_vec(&unsigned).expect("payment body always serialises"))
            }
            Transaction::Coinbase { .. } => None,
        }
    }

    /// `id` recomputes correctly and, for payments, the signature verifies
    /// under `sender`. Coinbase well-formedness (exactly one, at index 0,
    /// correct reward) is checked in block-transaction validation instead.
    pub fn validate_signature_and_id(&self) -> bool {
        match self {
            Transaction::Payment {
                sender,
                id,
                signature,
                ..
            } => {
                let preimage = match self.payment_preimage() {
                    Some(bytes) => bytes,
                    None => return false,
                };
                if sha256_hex(&preimage) != *id {
                    return false;
                }
                verify(sender, &preimage, signature)
            }
            Transaction::Coinbase { .. } => true,
        }
    }

    /// Round-trips through the same canonical form used to compute `id`,
    /// used by tests and by anything re-deriving the hash preimage.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self)
    }
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}
