use crate::block::{block_reward, Block, GENESIS_TARGET};
use crate::mempool::validate_transaction;
use crate::transaction::Transaction;
use ferrochain_crypto::random_hex_u64;
use num_bigint::BigUint;
use num_traits::{FromPrimitive, ToPrimitive};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

const RETARGET_INTERVAL: u64 = 40;
const RETARGET_BLOCK_SECONDS: f64 = 60.0;

/// The node's linear chain of blocks, mirrored to `path` as a canonical-JSON
/// array. Mutated only through `add`/`clear`, each of which leaves every
/// reader an all-or-nothing view — a block never becomes visible half
/// validated.
pub struct Chain {
    pub blockchain_id: String,
    pub target: String,
    blocks: Vec<Block>,
    hash_index: HashMap<String, usize>,
    path: PathBuf,
    pub autosave: bool,
}

impl Chain {
    pub fn new(blockchain_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut chain = Chain {
            blockchain_id: blockchain_id.into(),
            target: GENESIS_TARGET.to_string(),
            blocks: Vec::new(),
            hash_index: HashMap::new(),
            path: path.into(),
            autosave: true,
        };
        chain.push_block(chain.make_genesis_block());
        chain
    }

    /// A chain with no genesis block — used for the shadow chain built
    /// while evaluating whether to adopt a peer's fork.
    pub fn new_empty(blockchain_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Chain {
            blockchain_id: blockchain_id.into(),
            target: GENESIS_TARGET.to_string(),
            blocks: Vec::new(),
            hash_index: HashMap::new(),
            path: path.into(),
            autosave: true,
        }
    }

    fn make_genesis_block(&self) -> Block {
        let mut block = Block {
            height: 0,
            time: now_unix_seconds(),
            blockchain_id: self.blockchain_id.clone(),
            transactions: vec![],
            previous_hash: None,
            target: self.target.clone(),
            nonce: random_hex_u64(),
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    fn push_block(&mut self, block: Block) {
        self.hash_index.insert(block.hash.clone(), self.blocks.len());
        self.blocks.push(block);
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn height(&self) -> Option<u64> {
        self.tip().map(|b| b.height)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn previous_hash(&self) -> Option<String> {
        self.tip().map(|b| b.hash.clone())
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.hash_index.contains_key(hash)
    }

    pub fn get_block_from_hash(&self, hash: &str) -> Option<&Block> {
        self.hash_index.get(hash).map(|&idx| &self.blocks[idx])
    }

    pub fn block_inv(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.hash.clone()).collect()
    }

    pub fn transaction_inv(&self) -> HashSet<String> {
        self.blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .map(|t| t.id().to_string())
            .collect()
    }

    pub fn get_balance(&self, public_key: &str) -> f64 {
        let mut balance = 0.0;
        for block in &self.blocks {
            for tx in &block.transactions {
                if tx.receiver() == public_key {
                    balance += tx.amount();
                }
                if tx.sender() == public_key {
                    balance -= tx.amount();
                }
            }
        }
        balance
    }

    /// Sums a block's transactions up to and including `stop_at_txid` (or
    /// the whole block, if `None`) — used to evaluate whether a payment
    /// deeper in the same block would overspend given the block's own
    /// preceding transactions.
    pub fn get_balance_from_block(block: &Block, public_key: &str, stop_at_txid: Option<&str>) -> f64 {
        let mut balance = 0.0;
        for tx in &block.transactions {
            if tx.receiver() == public_key {
                balance += tx.amount();
            }
            if tx.sender() == public_key {
                balance -= tx.amount();
            }
            if Some(tx.id()) == stop_at_txid {
                return balance;
            }
        }
        balance
    }

    fn check_for_overspent_transactions(&self, block: &Block) -> bool {
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            let balance = self.get_balance(tx.sender())
                + Self::get_balance_from_block(block, tx.sender(), Some(tx.id()));
            if balance < 0.0 {
                return false;
            }
        }
        true
    }

    pub fn validate_block_transactions(&self, block: &Block) -> bool {
        if block.transactions.is_empty() {
            return false;
        }
        if !block.transactions[0].is_coinbase() {
            return false;
        }
        if block.transactions[1..].iter().any(Transaction::is_coinbase) {
            return false;
        }
        if block.transactions[0].amount() != block_reward(block.height) {
            return false;
        }
        if !self.check_for_overspent_transactions(block) {
            return false;
        }
        for tx in &block.transactions[1..] {
            if !validate_transaction(self, tx) {
                return false;
            }
        }
        true
    }

    /// Builds the next candidate block: coinbase at index 0 followed by
    /// `pending` (already filtered against the confirmed inventory by the
    /// caller's mempool).
    pub fn make_block(&self, miner_public_key: &str, pending: Vec<Transaction>) -> anyhow::Result<Block> {
        let tip = self
            .tip()
            .ok_or_else(|| anyhow::anyhow!("cannot mine before genesis exists"))?;
        let height = tip.height + 1;
        let mut transactions = vec![Transaction::new_coinbase(miner_public_key, block_reward(height))];
        transactions.extend(pending);
        let mut block = Block {
            height,
            time: now_unix_seconds(),
            blockchain_id: self.blockchain_id.clone(),
            transactions,
            previous_hash: Some(tip.hash.clone()),
            target: self.target.clone(),
            nonce: random_hex_u64(),
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        Ok(block)
    }

    /// Lazily retargets difficulty every `RETARGET_INTERVAL` blocks. A
    /// no-op if the tip already carries the freshly retargeted value.
    pub fn calculate_target(&mut self) -> bool {
        let height = match self.height() {
            Some(h) => h,
            None => return false,
        };
        if self.target != self.tip().unwrap().target {
            return false;
        }
        if height == 0 || height % RETARGET_INTERVAL != 0 {
            return false;
        }
        let last_time = self.blocks[self.blocks.len() - 1].time;
        let interval_ago_time = self.blocks[self.blocks.len() - 1 - RETARGET_INTERVAL as usize].time;
        let actual_timespan = last_time - interval_ago_time;
        let expected_timespan = RETARGET_BLOCK_SECONDS * RETARGET_INTERVAL as f64;
        let ratio = actual_timespan / expected_timespan;

        let current = BigUint::parse_bytes(self.target.as_bytes(), 16).unwrap_or_default();
        let current_f64 = current.to_f64().unwrap_or(f64::MAX);
        let new_target_f64 = (current_f64 * ratio).floor().max(0.0);
        let new_target = BigUint::from_f64(new_target_f64).unwrap_or(current);
        self.target = format!("{:0>64}", new_target.to_str_radix(16));
        true
    }

    /// Steps §4.2 of the validation contract, in order; any failure returns
    /// `false`. Genesis blocks (height 0) are accepted outright once the
    /// chain is empty and rejected otherwise — there are no transactions,
    /// hash, or PoW checks to run against an empty predecessor.
    pub fn validate(&mut self, block: &Block, verbose: bool) -> bool {
        self.calculate_target();

        if block.blockchain_id != self.blockchain_id {
            if verbose {
                warn!(height = block.height, "block is from a different blockchain");
            }
            return false;
        }
        if self.contains_hash(&block.hash) {
            if verbose {
                warn!(height = block.height, "block already in chain");
            }
            return false;
        }
        if block.previous_hash != self.previous_hash() {
            if verbose {
                warn!(height = block.height, "previous hash is incorrect");
            }
            return false;
        }
        if block.height == 0 {
            if self.is_empty() {
                return true;
            }
            if verbose {
                warn!("genesis block rejected: chain already has a genesis block");
            }
            return false;
        }
        if Some(block.height) != self.height().map(|h| h + 1) {
            if verbose {
                warn!(height = block.height, "height is not tip + 1");
            }
            return false;
        }
        if !self.validate_block_transactions(block) {
            if verbose {
                warn!(height = block.height, "invalid transactions in block");
            }
            return false;
        }
        if let Some(tip) = self.tip() {
            if block.time < tip.time {
                if verbose {
                    warn!(height = block.height, "timestamp is in the past");
                }
                return false;
            }
        }
        if block.time > now_unix_seconds() {
            if verbose {
                warn!(height = block.height, "timestamp is in the future");
            }
            return false;
        }
        if block.compute_hash() != block.hash {
            if verbose {
                warn!(height = block.height, "hash does not match contents");
            }
            return false;
        }
        if !block.meets_target() {
            if verbose {
                warn!(height = block.height, "proof of work does not meet target");
            }
            return false;
        }
        true
    }

    /// Validates and, if valid, appends. Does not touch the mempool — the
    /// caller (`Ledger`) runs `TransactionPool::update_pool` under the same
    /// write lock immediately afterwards.
    pub fn add(&mut self, block: Block, verbose: bool) -> bool {
        if !self.validate(&block, verbose) {
            return false;
        }
        self.push_block(block);
        if self.autosave {
            if let Err(err) = self.save() {
                warn!(error = %err, "failed to persist chain after append");
            }
        }
        true
    }

    pub fn clear(&mut self, create_genesis: bool) {
        self.blocks.clear();
        self.hash_index.clear();
        self.target = GENESIS_TARGET.to_string();
        if create_genesis {
            let genesis = self.make_genesis_block();
            self.push_block(genesis);
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&self.blocks)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Loads from `path` only if it holds a chain longer than what's
    /// already in memory; a missing or corrupt file is tolerated and the
    /// in-memory chain is kept.
    pub fn load(&mut self) -> bool {
        self.load_from(&self.path.clone())
    }

    pub fn load_from(&mut self, path: &Path) -> bool {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let loaded: Vec<Block> = match serde_json::from_slice(&bytes) {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!(error = %err, "could not parse persisted chain, keeping in-memory chain");
                return false;
            }
        };
        if loaded.len() <= self.blocks.len() {
            return false;
        }
        self.blocks.clear();
        self.hash_index.clear();
        for block in loaded {
            self.push_block(block);
        }
        if let Some(tip) = self.tip() {
            self.target = tip.target.clone();
        }
        self.calculate_target();
        true
    }
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrochain_crypto::generate_keypair;
    use tempfile::tempdir;

    fn new_test_chain() -> Chain {
        let dir = tempdir().unwrap();
        Chain::new("test-chain", dir.path().join("blockchain.json"))
    }

    #[test]
    fn genesis_block_has_height_zero_and_no_previous_hash() {
        let chain = new_test_chain();
        let tip = chain.tip().unwrap();
        assert_eq!(tip.height, 0);
        assert_eq!(tip.previous_hash, None);
        assert!(tip.transactions.is_empty());
    }

    #[test]
    fn mining_and_adding_one_block_pays_reward_and_advances_height() {
        let mut chain = new_test_chain();
        let kp = generate_keypair();
        let block = chain.make_block(&kp.public_key, vec![]).unwrap();
        let mut mined = block.clone();
        while !mined.meets_target() {
            mined = chain.make_block(&kp.public_key, vec![]).unwrap();
        }
        assert!(chain.add(mined, true));
        assert_eq!(chain.height(), Some(1));
        assert_eq!(chain.get_balance(&kp.public_key), 5.0);
    }

    #[test]
    fn adding_the_same_block_twice_is_rejected_the_second_time() {
        let mut chain = new_test_chain();
        let kp = generate_keypair();
        let mut block = chain.make_block(&kp.public_key, vec![]).unwrap();
        while !block.meets_target() {
            block = chain.make_block(&kp.public_key, vec![]).unwrap();
        }
        assert!(chain.add(block.clone(), true));
        assert!(!chain.add(block, true));
        assert_eq!(chain.height(), Some(1));
    }

    #[test]
    fn block_with_time_in_the_past_is_rejected() {
        let mut chain = new_test_chain();
        let kp = generate_keypair();
        let mut block = chain.make_block(&kp.public_key, vec![]).unwrap();
        block.time = chain.tip().unwrap().time - 1000.0;
        block.hash = block.compute_hash();
        while !block.meets_target() {
            block.nonce = random_hex_u64();
            block.hash = block.compute_hash();
        }
        assert!(!chain.validate(&block, false));
    }

    #[test]
    fn block_with_time_in_the_future_is_rejected() {
        let mut chain = new_test_chain();
        let kp = generate_keypair();
        let mut block = chain.make_block(&kp.public_key, vec![]).unwrap();
        block.time = now_unix_seconds() + 100_000.0;
        block.hash = block.compute_hash();
        while !block.meets_target() {
            block.nonce = random_hex_u64();
            block.hash = block.compute_hash();
        }
        assert!(!chain.validate(&block, false));
    }

    #[test]
    fn overspending_block_is_rejected() {
        let mut chain = new_test_chain();
        let miner = generate_keypair();
        let block = chain.make_block(&miner.public_key, vec![]).unwrap();
        let mut mined = block;
        while !mined.meets_target() {
            mined = chain.make_block(&miner.public_key, vec![]).unwrap();
        }
        chain.add(mined, true);

        let overspender = generate_keypair();
        // overspender has balance 0 but tries to send 1.0
        let tx = Transaction::new_payment(&overspender.private_key, &overspender.public_key, &miner.public_key, 1.0).unwrap();
        let mut block2 = chain.make_block(&miner.public_key, vec![tx]).unwrap();
        while !block2.meets_target() {
            block2.nonce = random_hex_u64();
            block2.hash = block2.compute_hash();
        }
        assert!(!chain.validate(&block2, false));
    }

    #[test]
    fn retarget_unchanged_when_actual_equals_expected() {
        let dir = tempdir().unwrap();
        let mut chain = Chain::new("t", dir.path().join("b.json"));
        let original_target = chain.target.clone();
        synthesize_chain_of_blocks(&mut chain, 40, 60.0);
        assert_eq!(chain.target, original_target);
    }

    #[test]
    fn retarget_halves_target_when_blocks_came_twice_as_fast() {
        let dir = tempdir().unwrap();
        let mut chain = Chain::new("t", dir.path().join("b.json"));
        let original = BigUint::parse_bytes(chain.target.as_bytes(), 16).unwrap();
        synthesize_chain_of_blocks(&mut chain, 40, 30.0);
        let new_target = BigUint::parse_bytes(chain.target.as_bytes(), 16).unwrap();
        assert_eq!(new_target, original / 2u32);
    }

    /// Directly appends `count` blocks with `spacing_seconds` between each,
    /// bypassing PoW (tests the retarget arithmetic, not mining) by pushing
    /// straight onto the block vector.
    fn synthesize_chain_of_blocks(chain: &mut Chain, count: u64, spacing_seconds: f64) {
        let miner = generate_keypair();
        for _ in 0..count {
            let tip = chain.tip().unwrap();
            let height = tip.height + 1;
            let mut block = Block {
                height,
                time: tip.time + spacing_seconds,
                blockchain_id: chain.blockchain_id.clone(),
                transactions: vec![Transaction::new_coinbase(&miner.public_key, block_reward(height))],
                previous_hash: Some(tip.hash.clone()),
                target: chain.target.clone(),
                nonce: random_hex_u64(),
                hash: String::new(),
            };
            block.hash = block.compute_hash();
            chain.push_block(block);
            chain.calculate_target();
        }
    }
}
