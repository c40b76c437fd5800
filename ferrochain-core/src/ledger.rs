use crate::block::Block;
use crate::chain::Chain;
use crate::mempool::TransactionPool;
use crate::transaction::Transaction;

/// Owns `Chain` and `TransactionPool` together so a caller holding one
/// `parking_lot::RwLock<Ledger>` write guard can append a block and update
/// the mempool as a single atomic step — the two structures are never
/// visible to a reader in a state where one reflects the new tip and the
/// other doesn't.
pub struct Ledger {
    pub chain: Chain,
    pub pool: TransactionPool,
}

impl Ledger {
    pub fn new(chain: Chain) -> Self {
        Ledger {
            chain,
            pool: TransactionPool::new(),
        }
    }

    /// Validates and appends `block`, then folds it into the mempool.
    /// Returns whether the block was accepted.
    pub fn add_block(&mut self, block: Block, verbose: bool) -> bool {
        if !self.chain.add(block, verbose) {
            return false;
        }
        self.pool.update_pool(&self.chain);
        true
    }

    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        self.pool.add(&self.chain, tx)
    }

    /// Replaces the chain outright (fork adoption) and rebuilds the
    /// mempool view against it.
    pub fn replace_chain(&mut self, chain: Chain) {
        self.chain = chain;
        self.pool.update_pool(&self.chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrochain_crypto::generate_keypair;
    use tempfile::tempdir;

    #[test]
    fn add_block_updates_both_chain_and_pool_together() {
        let dir = tempdir().unwrap();
        let chain = Chain::new("test-chain", dir.path().join("blockchain.json"));
        let mut ledger = Ledger::new(chain);
        let miner = generate_keypair();
        let receiver = generate_keypair();

        let mut block = ledger.chain.make_block(&miner.public_key, vec![]).unwrap();
        while !block.meets_target() {
            block = ledger.chain.make_block(&miner.public_key, vec![]).unwrap();
        }
        assert!(ledger.add_block(block, true));

        let tx = Transaction::new_payment(&miner.private_key, &miner.public_key, &receiver.public_key, 1.0).unwrap();
        let id = tx.id().to_string();
        assert!(ledger.add_transaction(tx.clone()));

        let mut block2 = ledger.chain.make_block(&miner.public_key, vec![tx]).unwrap();
        while !block2.meets_target() {
            block2 = ledger.chain.make_block(&miner.public_key, vec![ledger.pool.get_pending()[0].clone()]).unwrap();
        }
        assert!(ledger.add_block(block2, true));
        assert!(ledger.pool.contains(&id));
        assert!(ledger.pool.get_pending().is_empty());
    }
}
