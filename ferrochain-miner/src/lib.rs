use ferrochain_consensus::{SharedPeerPool, SyncStatus};
use ferrochain_core::{Block, Ledger};
use ferrochain_wallet::Wallet;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const ACCEPTANCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct MinerConfig {
    pub fullnode: bool,
}

/// One worker searches for a valid-PoW block by repeatedly rebuilding a
/// candidate (fresh nonce and timestamp each attempt) until it meets the
/// chain's target, a longer chain supersedes it mid-search, or a resync
/// starts. `available_parallelism` workers run this loop concurrently;
/// whichever block is accepted into the chain first wins, and the losers
/// simply see their own `add` fail and restart.
pub struct Miner {
    ledger: Arc<RwLock<Ledger>>,
    peers: SharedPeerPool,
    sync_status: Arc<RwLock<SyncStatus>>,
    wallet: Wallet,
    config: MinerConfig,
    client: reqwest::Client,
}

impl Miner {
    pub fn new(
        ledger: Arc<RwLock<Ledger>>,
        peers: SharedPeerPool,
        sync_status: Arc<RwLock<SyncStatus>>,
        wallet: Wallet,
        config: MinerConfig,
    ) -> Self {
        Miner {
            ledger,
            peers,
            sync_status,
            wallet,
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Spawns `worker_count` (typically `available_parallelism`) mining
    /// tasks, each running `mine_forever` independently.
    pub fn spawn_workers(self: Arc<Self>, worker_count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..worker_count.max(1))
            .map(|_| {
                let miner = self.clone();
                tokio::spawn(async move { miner.mine_forever().await })
            })
            .collect()
    }

    pub async fn mine_forever(&self) {
        info!("mining started");
        loop {
            if self.sync_status.read().syncing {
                while self.sync_status.read().syncing {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                info!("sync completed, resuming mining");
            }

            let Some(block) = self.mine_one_block().await else {
                continue;
            };

            self.submit_and_await_acceptance(block).await;
        }
    }

    /// Rebuilds a candidate block until it meets the target. Gives up
    /// early (returning `None`) if the chain advances past the height
    /// this attempt targeted, since that means someone else already won.
    async fn mine_one_block(&self) -> Option<Block> {
        let target_height = self.ledger.read().chain.height()? + 1;
        loop {
            let candidate = {
                let ledger = self.ledger.read();
                let pending = ledger.pool.get_pending();
                ledger.chain.make_block(&self.wallet.public_key, pending).ok()?
            };
            if candidate.meets_target() {
                return Some(candidate);
            }
            if self.ledger.read().chain.height().unwrap_or(0) >= target_height {
                return None;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Fullnodes add directly under the ledger lock; light nodes rely on
    /// the network to relay the block back. Either way, wait up to
    /// `ACCEPTANCE_TIMEOUT` for the block's hash to show up in the chain
    /// before concluding someone else's block won the height instead.
    async fn submit_and_await_acceptance(&self, block: Block) {
        let height = block.height;
        let hash = block.hash.clone();

        if self.config.fullnode {
            self.ledger.write().add_block(block, false);
        } else {
            self.broadcast_block(&block).await;
        }

        let deadline = Instant::now() + ACCEPTANCE_TIMEOUT;
        loop {
            if self.ledger.read().chain.contains_hash(&hash) {
                info!(height, hash, "mined block accepted");
                return;
            }
            if Instant::now() >= deadline || self.ledger.read().chain.height().unwrap_or(0) > height {
                info!(height, "mined block not accepted");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn broadcast_block(&self, block: &Block) {
        let tip_hash = self.ledger.read().chain.previous_hash();
        let targets = match tip_hash {
            Some(hash) => self.peers.read().await.get_peers_with_blockhash(&hash, 20).await,
            None => self.peers.write().await.get_alive_peers(20).await,
        };
        let payload = serde_json::to_value(block).unwrap_or(serde_json::Value::Null);
        for peer in targets {
            let _ = self.client.post(format!("{peer}/block-recv")).json(&payload).send().await;
        }
    }
}
