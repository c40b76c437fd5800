use ferrochain_core::{Block, Chain, Ledger};
use ferrochain_network::PeerPool;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock as PeerLock;
use tracing::{debug, info, warn};

const BLOCK_BATCH_SIZE: usize = 50;
const ALIVE_PEER_SAMPLE: usize = 20;

/// `PeerPool` methods make network calls, so the pool is shared behind
/// `tokio::sync::RwLock` (a guard that's safe to hold across `.await`)
/// rather than the `parking_lot::RwLock` used for `Ledger`, where every
/// critical section is synchronous.
pub type SharedPeerPool = Arc<PeerLock<PeerPool>>;

/// Live view of an in-progress resync, shared with the miner so it knows
/// when to stand down rather than race a chain that's about to be
/// replaced wholesale.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub syncing: bool,
    pub progress: (u64, u64),
    pub download_node: Option<String>,
    pub process: Option<String>,
    pub speed_blocks_per_sec: f64,
}

impl SyncStatus {
    fn reset(&mut self) {
        *self = SyncStatus::default();
    }
}

pub struct ChainConsensus {
    ledger: Arc<RwLock<Ledger>>,
    peers: SharedPeerPool,
    sync_status: Arc<RwLock<SyncStatus>>,
    client: reqwest::Client,
}

impl ChainConsensus {
    pub fn new(ledger: Arc<RwLock<Ledger>>, peers: SharedPeerPool, sync_status: Arc<RwLock<SyncStatus>>) -> Self {
        ChainConsensus {
            ledger,
            peers,
            sync_status,
            client: reqwest::Client::new(),
        }
    }

    pub fn sync_status(&self) -> Arc<RwLock<SyncStatus>> {
        self.sync_status.clone()
    }

    async fn get_json(&self, node: &str, path: &str) -> Option<serde_json::Value> {
        let response = self
            .client
            .get(format!("{node}{path}"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .ok()?;
        response.json::<serde_json::Value>().await.ok()
    }

    /// Downloads `blockinv` from `node` into `chain` in batches, each batch
    /// fetched concurrently. Returns `false` (and leaves `chain` at
    /// whatever prefix it managed) the moment a block can't be fetched or
    /// fails validation.
    async fn sync_blockchain(&self, chain: &mut Chain, blockinv: &[String], node: &str) -> bool {
        chain.autosave = false;
        let node_block_height = blockinv.len().saturating_sub(1) as u64;

        {
            let mut status = self.sync_status.write();
            status.syncing = true;
            status.download_node = Some(node.to_string());
            status.progress.1 = node_block_height;
            status.process = Some("batching block inventory".to_string());
        }

        for (batch_index, batch) in blockinv.chunks(BLOCK_BATCH_SIZE).enumerate() {
            let missing: Vec<&String> = batch.iter().filter(|hash| !chain.contains_hash(hash)).collect();
            if missing.is_empty() {
                continue;
            }

            self.sync_status.write().process = Some("downloading blocks".to_string());

            let start = Instant::now();
            let mut tasks = tokio::task::JoinSet::new();
            for hash in missing.iter().map(|s| (*s).clone()) {
                let consensus_client = self.client.clone();
                let node = node.to_string();
                tasks.spawn(async move { fetch_block(&consensus_client, &node, &hash).await });
            }

            let mut blocks = Vec::with_capacity(batch.len());
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(Some(block)) => blocks.push(block),
                    _ => {
                        self.sync_status.write().reset();
                        return false;
                    }
                }
            }
            blocks.sort_by_key(|b| b.height);

            let elapsed = start.elapsed().as_secs_f64();
            self.sync_status.write().speed_blocks_per_sec = if elapsed > 0.0 {
                blocks.len() as f64 / elapsed
            } else {
                0.0
            };

            for block in blocks {
                self.sync_status.write().progress.0 = block.height + 1;
                if !chain.add(block, true) {
                    self.sync_status.write().reset();
                    return false;
                }
            }

            if batch_index % 10 == 1 {
                if let Err(err) = chain.save() {
                    warn!(error = %err, "failed to checkpoint chain mid-sync");
                }
            }
        }

        self.sync_status.write().reset();
        chain.autosave = true;
        true
    }

    async fn download_missing_blocks(&self, node: &str, blockinv: &[String]) {
        let mut ledger = self.ledger.write();
        let mut chain = std::mem::replace(
            &mut ledger.chain,
            Chain::new_empty("placeholder", std::path::PathBuf::new()),
        );
        drop(ledger);

        self.sync_blockchain(&mut chain, blockinv, node).await;

        let mut ledger = self.ledger.write();
        ledger.replace_chain(chain);
    }

    /// Builds a fresh shadow chain against `node`'s inventory and, if it
    /// ends up strictly taller than the local chain, replaces the local
    /// chain with it outright.
    async fn download_new_blockchain(&self, node: &str, blockinv: &[String]) -> bool {
        let (blockchain_id, local_height, path) = {
            let ledger = self.ledger.read();
            (ledger.chain.blockchain_id.clone(), ledger.chain.height().unwrap_or(0), std::path::PathBuf::new())
        };

        let mut shadow = Chain::new_empty(blockchain_id, path);
        if !self.sync_blockchain(&mut shadow, blockinv, node).await {
            return false;
        }

        let shadow_height = match shadow.height() {
            Some(h) => h,
            None => return false,
        };

        if shadow_height <= local_height {
            debug!(shadow_height, local_height, "shadow chain was not longer, discarding");
            return false;
        }

        self.sync_status.write().process = Some("adding blocks to blockchain".to_string());
        let mut replacement = Chain::new_empty(shadow.blockchain_id.clone(), std::path::PathBuf::new());
        for block in shadow.blocks().iter().cloned() {
            if !replacement.add(block, true) {
                warn!("shadow chain contained a fraudulent block, discarding resync");
                return false;
            }
        }

        let mut ledger = self.ledger.write();
        ledger.replace_chain(replacement);
        info!(new_height = shadow_height, "adopted longer chain from peer");
        true
    }

    async fn download_latest_block(&self, node: &str) -> bool {
        let Some(value) = self.get_json(node, "/latest-block").await else {
            return false;
        };
        let Ok(block) = serde_json::from_value::<Block>(value) else {
            return false;
        };
        let mut ledger = self.ledger.write();
        ledger.add_block(block, false)
    }

    /// Polls every alive peer's `/info` and returns whichever reports the
    /// tallest chain.
    async fn get_longest_chain_node(&self) -> Option<(String, u64)> {
        let peers = self.peers.write().await.get_alive_peers(ALIVE_PEER_SAMPLE).await;
        let mut best: Option<(String, u64)> = None;
        for peer in peers {
            let Some(value) = self.get_json(&peer, "/info").await else {
                continue;
            };
            let Some(height) = value.get("block_height").and_then(|h| h.as_u64()) else {
                continue;
            };
            if best.as_ref().map(|(_, h)| height > *h).unwrap_or(true) {
                best = Some((peer, height));
            }
        }
        best
    }

    /// The node's permanent background sync loop: find the peer with the
    /// tallest chain, then either fast-path a single new block or fall
    /// back to inventory comparison and a full (re)sync.
    pub async fn run(self: Arc<Self>) {
        loop {
            let Some((node, node_height)) = self.get_longest_chain_node().await else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            let local_height = self.ledger.read().chain.height().unwrap_or(0);
            if node_height.saturating_sub(local_height) == 1 && self.download_latest_block(&node).await {
                continue;
            }

            self.sync_status.write().process = Some("downloading block inventory".to_string());
            let Some(value) = self.get_json(&node, "/blockinv").await else {
                continue;
            };
            let Ok(blockinv) = serde_json::from_value::<Vec<String>>(value) else {
                continue;
            };
            if (blockinv.len() as u64) < node_height {
                continue;
            }

            let (genesis_matches, tip_known) = {
                let ledger = self.ledger.read();
                let genesis_matches = ledger
                    .chain
                    .blocks()
                    .first()
                    .map(|b| blockinv.first() == Some(&b.hash))
                    .unwrap_or(false);
                let tip_known = ledger
                    .chain
                    .tip()
                    .map(|tip| blockinv.contains(&tip.hash))
                    .unwrap_or(false);
                (genesis_matches, tip_known)
            };

            if genesis_matches && tip_known {
                self.download_missing_blocks(&node, &blockinv).await;
            } else {
                self.download_new_blockchain(&node, &blockinv).await;
            }
        }
    }
}

async fn fetch_block(client: &reqwest::Client, node: &str, hash: &str) -> Option<Block> {
    for _ in 0..2 {
        let Ok(response) = client
            .get(format!("{node}/block/{hash}"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        else {
            continue;
        };
        if let Ok(block) = response.json::<Block>().await {
            return Some(block);
        }
    }
    None
}

/// Pulls pending transactions from every peer sharing the local tip and
/// folds valid ones into the mempool. Runs forever as a background task.
pub struct TransactionConsensus {
    ledger: Arc<RwLock<Ledger>>,
    peers: SharedPeerPool,
    client: reqwest::Client,
}

impl TransactionConsensus {
    pub fn new(ledger: Arc<RwLock<Ledger>>, peers: SharedPeerPool) -> Self {
        TransactionConsensus {
            ledger,
            peers,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            let peers = self.peers.write().await.get_alive_peers(ALIVE_PEER_SAMPLE).await;
            let local_tip_hash = self.ledger.read().chain.tip().map(|b| b.hash.clone());

            for peer in peers {
                let Some(value) = self
                    .client
                    .get(format!("{peer}/latest-block"))
                    .timeout(Duration::from_secs(2))
                    .send()
                    .await
                    .ok()
                else {
                    continue;
                };
                let Ok(latest) = value.json::<serde_json::Value>().await else {
                    continue;
                };
                if latest.get("hash").and_then(|h| h.as_str()) != local_tip_hash.as_deref() {
                    continue;
                }

                let Ok(response) = self
                    .client
                    .get(format!("{peer}/pending-transactions"))
                    .timeout(Duration::from_secs(2))
                    .send()
                    .await
                else {
                    continue;
                };
                let Ok(pending) = response.json::<Vec<ferrochain_core::Transaction>>().await else {
                    continue;
                };

                let mut ledger = self.ledger.write();
                for tx in pending {
                    ledger.add_transaction(tx);
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrochain_core::Chain;
    use ferrochain_crypto::generate_keypair;
    use ferrochain_network::PeerPoolConfig;
    use tempfile::tempdir;

    fn new_test_ledger() -> (Arc<RwLock<Ledger>>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let chain = Chain::new("test-chain", dir.path().join("blockchain.json"));
        (Arc::new(RwLock::new(Ledger::new(chain))), dir)
    }

    #[test]
    fn sync_status_starts_idle() {
        let status = SyncStatus::default();
        assert!(!status.syncing);
        assert_eq!(status.progress, (0, 0));
    }

    #[tokio::test]
    async fn download_latest_block_rejects_malformed_json() {
        let (ledger, _dir) = new_test_ledger();
        let peers = Arc::new(PeerLock::new(PeerPool::new(PeerPoolConfig::new("test-chain", "local", 2227, false))));
        let sync_status = Arc::new(RwLock::new(SyncStatus::default()));
        let consensus = ChainConsensus::new(ledger.clone(), peers, sync_status);
        assert!(!consensus.download_latest_block("http://127.0.0.1:1").await);
        assert_eq!(ledger.read().chain.height(), Some(0));
    }

    #[test]
    fn generate_keypair_smoke() {
        // sanity check that ferrochain-crypto is reachable from this crate's tests
        let kp = generate_keypair();
        assert_eq!(kp.public_key.len(), 64);
    }

    /// Mines `count` real blocks onto `chain` (genuine PoW search, same
    /// style as ferrochain-core's own mining tests).
    fn mine_blocks(chain: &mut Chain, count: u64) {
        let miner = generate_keypair();
        for _ in 0..count {
            let mut block = chain.make_block(&miner.public_key, vec![]).unwrap();
            while !block.meets_target() {
                block = chain.make_block(&miner.public_key, vec![]).unwrap();
            }
            assert!(chain.add(block, true));
        }
    }

    /// Serves only `/block/:blockhash`, the one route `sync_blockchain`
    /// actually calls — `download_new_blockchain` is handed the peer's
    /// blockinv directly rather than fetching it itself.
    async fn serve_chain_fixture(chain: Chain) -> String {
        use axum::extract::Path as AxumPath;
        use axum::routing::get;
        use axum::{Json, Router};

        let chain = Arc::new(chain);
        let app = Router::new().route(
            "/block/:blockhash",
            get(move |AxumPath(hash): AxumPath<String>| {
                let chain = chain.clone();
                async move { Json(chain.get_block_from_hash(&hash).cloned()) }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn download_new_blockchain_adopts_a_strictly_longer_peer_chain() {
        let (ledger, _local_dir) = new_test_ledger();
        mine_blocks(&mut ledger.write().chain, 2);

        let peer_dir = tempdir().unwrap();
        let mut peer_chain = Chain::new("test-chain", peer_dir.path().join("peer.json"));
        mine_blocks(&mut peer_chain, 5);
        let peer_blockinv = peer_chain.block_inv();
        let peer_addr = serve_chain_fixture(peer_chain).await;

        let peers = Arc::new(PeerLock::new(PeerPool::new(PeerPoolConfig::new("test-chain", "local", 2227, false))));
        let sync_status = Arc::new(RwLock::new(SyncStatus::default()));
        let consensus = ChainConsensus::new(ledger.clone(), peers, sync_status);

        assert!(consensus.download_new_blockchain(&peer_addr, &peer_blockinv).await);
        assert_eq!(ledger.read().chain.height(), Some(5));
    }

    #[tokio::test]
    async fn download_new_blockchain_rejects_a_chain_no_longer_than_local() {
        let (ledger, _local_dir) = new_test_ledger();
        mine_blocks(&mut ledger.write().chain, 3);

        let peer_dir = tempdir().unwrap();
        let mut peer_chain = Chain::new("test-chain", peer_dir.path().join("peer.json"));
        mine_blocks(&mut peer_chain, 3);
        let peer_blockinv = peer_chain.block_inv();
        let peer_addr = serve_chain_fixture(peer_chain).await;

        let peers = Arc::new(PeerLock::new(PeerPool::new(PeerPoolConfig::new("test-chain", "local", 2227, false))));
        let sync_status = Arc::new(RwLock::new(SyncStatus::default()));
        let consensus = ChainConsensus::new(ledger.clone(), peers, sync_status);

        assert!(!consensus.download_new_blockchain(&peer_addr, &peer_blockinv).await);
        assert_eq!(ledger.read().chain.height(), Some(3));
    }
}
