use crate::chain::Chain;
use crate::transaction::Transaction;
use std::collections::HashMap;
use tracing::warn;

/// A transaction's validity can depend on the sender's spendable balance,
/// which depends on the chain, so validation lives here rather than on
/// `Transaction` itself.
pub fn validate_transaction(chain: &Chain, tx: &Transaction) -> bool {
    if tx.is_coinbase() {
        return false;
    }
    if !tx.validate_signature_and_id() {
        return false;
    }
    if tx.amount() <= 0.0 {
        return false;
    }
    if chain.get_balance(tx.sender()) < tx.amount() {
        return false;
    }
    true
}

/// Unconfirmed transactions, split into `pool` (never yet included in a
/// block) and `unconfirmed_pool` (included but not yet buried under enough
/// confirmations to drop from the local view). Keyed by transaction id so
/// duplicates can't accumulate.
#[derive(Default)]
pub struct TransactionPool {
    pool: HashMap<String, Transaction>,
    unconfirmed_pool: HashMap<String, Transaction>,
}

const CONFIRMATIONS_TO_BURY: u64 = 5;

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds to `pool` if the transaction validates against `chain` and
    /// isn't already known in either pool.
    pub fn add(&mut self, chain: &Chain, tx: Transaction) -> bool {
        if self.pool.contains_key(tx.id()) || self.unconfirmed_pool.contains_key(tx.id()) {
            return false;
        }
        if chain.transaction_inv().contains(tx.id()) {
            return false;
        }
        if !validate_transaction(chain, &tx) {
            return false;
        }
        if self.check_for_overspending(chain, &tx) {
            warn!(id = tx.id(), "rejecting transaction that would overspend against the pending pool");
            return false;
        }
        self.pool.insert(tx.id().to_string(), tx);
        true
    }

    /// True if accepting `tx` would push the sender's balance negative once
    /// every other pending-pool transaction from that sender is also
    /// applied — `get_balance` alone can't see same-pool double-spends.
    fn check_for_overspending(&self, chain: &Chain, tx: &Transaction) -> bool {
        let mut balance = chain.get_balance(tx.sender());
        for pending in self.pool.values() {
            if pending.sender() == tx.sender() {
                balance -= pending.amount();
            }
        }
        balance - tx.amount() < 0.0
    }

    pub fn get_pending(&self) -> Vec<Transaction> {
        self.pool.values().cloned().collect()
    }

    pub fn get_unconfirmed(&self) -> Vec<Transaction> {
        self.unconfirmed_pool.values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pool.contains_key(id) || self.unconfirmed_pool.contains_key(id)
    }

    /// Called after a block is appended: anything in that block moves from
    /// `pool` into `unconfirmed_pool`, and anything buried under
    /// `CONFIRMATIONS_TO_BURY` confirmations is dropped entirely.
    pub fn update_pool(&mut self, chain: &Chain) {
        if let Some(tip) = chain.tip() {
            for tx in &tip.transactions {
                self.pool.remove(tx.id());
                if !tx.is_coinbase() {
                    self.unconfirmed_pool.insert(tx.id().to_string(), tx.clone());
                }
            }
        }

        let height = match chain.height() {
            Some(h) => h,
            None => return,
        };
        let bury_below = height.saturating_sub(CONFIRMATIONS_TO_BURY);
        let confirmed_ids = chain.transaction_inv();
        self.unconfirmed_pool.retain(|id, _| {
            if !confirmed_ids.contains(id) {
                return true;
            }
            let block_height = chain
                .blocks()
                .iter()
                .find(|b| b.transactions.iter().any(|t| t.id() == id))
                .map(|b| b.height);
            match block_height {
                Some(h) => h > bury_below,
                None => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_reward;
    use ferrochain_crypto::generate_keypair;
    use tempfile::tempdir;

    fn new_test_chain() -> Chain {
        let dir = tempdir().unwrap();
        Chain::new("test-chain", dir.path().join("blockchain.json"))
    }

    fn mine_one_block(chain: &mut Chain, miner_pk: &str, pending: Vec<Transaction>) {
        let mut block = chain.make_block(miner_pk, pending.clone()).unwrap();
        while !block.meets_target() {
            block = chain.make_block(miner_pk, pending.clone()).unwrap();
        }
        assert!(chain.add(block, true));
    }

    #[test]
    fn valid_transaction_is_accepted_into_pool() {
        let mut chain = new_test_chain();
        let miner = generate_keypair();
        mine_one_block(&mut chain, &miner.public_key, vec![]);

        let mut pool = TransactionPool::new();
        let receiver = generate_keypair();
        let tx = Transaction::new_payment(&miner.private_key, &miner.public_key, &receiver.public_key, 2.0).unwrap();
        assert!(pool.add(&chain, tx));
        assert_eq!(pool.get_pending().len(), 1);
    }

    #[test]
    fn overspending_transaction_is_rejected() {
        let chain = new_test_chain();
        let mut pool = TransactionPool::new();
        let poor = generate_keypair();
        let tx = Transaction::new_payment(&poor.private_key, &poor.public_key, "someone-else", 1.0).unwrap();
        assert!(!pool.add(&chain, tx));
        assert!(pool.get_pending().is_empty());
    }

    #[test]
    fn duplicate_same_sender_transactions_cannot_both_overspend_the_pool() {
        let mut chain = new_test_chain();
        let miner = generate_keypair();
        mine_one_block(&mut chain, &miner.public_key, vec![]);
        assert_eq!(chain.get_balance(&miner.public_key), block_reward(1));

        let mut pool = TransactionPool::new();
        let receiver = generate_keypair();
        let first = Transaction::new_payment(&miner.private_key, &miner.public_key, &receiver.public_key, 4.0).unwrap();
        let second = Transaction::new_payment(&miner.private_key, &miner.public_key, &receiver.public_key, 4.0).unwrap();
        assert!(pool.add(&chain, first));
        assert!(!pool.add(&chain, second));
    }

    #[test]
    fn update_pool_moves_mined_transaction_to_unconfirmed_and_clears_it_from_pool() {
        let mut chain = new_test_chain();
        let miner = generate_keypair();
        mine_one_block(&mut chain, &miner.public_key, vec![]);

        let mut pool = TransactionPool::new();
        let receiver = generate_keypair();
        let tx = Transaction::new_payment(&miner.private_key, &miner.public_key, &receiver.public_key, 1.0).unwrap();
        let id = tx.id().to_string();
        pool.add(&chain, tx.clone());

        mine_one_block(&mut chain, &miner.public_key, vec![tx]);
        pool.update_pool(&chain);

        assert!(!pool.pool.contains_key(&id));
        assert!(pool.contains(&id));
    }
}
