pub mod block;
pub mod chain;
pub mod ledger;
pub mod mempool;
pub mod transaction;

pub use block::{block_reward, Block, GENESIS_TARGET, HALVING_INTERVAL, INITIAL_REWARD};
pub use chain::Chain;
pub use ledger::Ledger;
pub use mempool::{validate_transaction, TransactionPool};
pub use transaction::{Transaction, COINBASE_SENDER};
