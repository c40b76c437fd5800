use crate::transaction::Transaction;
use ferrochain_crypto::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const GENESIS_TARGET: &str =
    "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

pub const HALVING_INTERVAL: u64 = 100_000;
pub const INITIAL_REWARD: f64 = 5.0;

/// Block reward after `height / HALVING_INTERVAL` halvings. Deterministic
/// across every peer since it's a pure function of height.
pub fn block_reward(height: u64) -> f64 {
    let halvings = height / HALVING_INTERVAL;
    INITIAL_REWARD / 2f64.powi(halvings as i32)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub height: u64,
    pub time: f64,
    pub blockchain_id: String,
    pub transactions: Vec<Transaction>,
    pub previous_hash: Option<String>,
    pub target: String,
    pub nonce: String,
    pub hash: String,
}

impl Block {
    /// `sha256(canonical_json(self \ {hash}))`, recomputed fresh every call
    /// so it can be compared against the stored `hash` during validation.
    pub fn compute_hash(&self) -> String {
        let mut value = serde_json::to_value(self).expect("block always serialises");
        if let Value::Object(ref mut map) = value {
            map.remove("hash");
        }
        let preimage = serde_json::to_vec(&value).expect("stripped block always serialises");
        sha256_hex(&preimage)
    }

    /// `int(hash, 16) < int(target, 16)`, both treated as 256-bit big-endian
    /// hex integers. Hex comparison of equal-length, zero-padded strings is
    /// lexicographic and agrees with the numeric comparison.
    pub fn meets_target(&self) -> bool {
        hex_less_than(&self.hash, &self.target)
    }
}

fn hex_less_than(a: &str, b: &str) -> bool {
    let pad = a.len().max(b.len());
    let a_padded = format!("{:0>width$}", a, width = pad);
    let b_padded = format!("{:0>width$}", b, width = pad);
    a_padded < b_padded
}
