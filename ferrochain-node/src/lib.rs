use anyhow::Result;
use ferrochain_config::NodeConfig;
use ferrochain_consensus::{ChainConsensus, SyncStatus, TransactionConsensus};
use ferrochain_core::{Chain, Ledger};
use ferrochain_miner::{Miner, MinerConfig};
use ferrochain_network::{PeerPool, PeerPoolConfig};
use ferrochain_rpc::RpcState;
use ferrochain_wallet::Wallet;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialises the global `tracing` subscriber once, honouring
/// `RUST_LOG` and defaulting to `info` otherwise.
pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn data_path(data_dir: &Path, filename: &str) -> PathBuf {
    data_dir.join(filename)
}

/// Wires up the whole node: loads config and wallet, bootstraps (or
/// resumes) the chain, spawns the peer-discovery, consensus, and miner
/// background tasks, and serves the HTTP surface. Returns only if the
/// HTTP server itself stops, normally meaning the process is shutting
/// down.
pub async fn run_node(config_path: &Path, data_dir: &Path) -> Result<()> {
    let config = NodeConfig::load(config_path)?;
    std::fs::create_dir_all(data_dir)?;

    info!(blockchain_id = %config.blockchain_id, "starting ferrochain node");

    let wallet = Wallet::load_or_create(&data_path(data_dir, "wallet.json"))?;

    let mut chain = Chain::new(config.blockchain_id.clone(), data_path(data_dir, "blockchain.json"));
    chain.load();
    let ledger = Arc::new(RwLock::new(Ledger::new(chain)));

    let node_id = ferrochain_crypto::random_hex_u64();
    let peer_pool_config = PeerPoolConfig::new(
        config.blockchain_id.clone(),
        node_id.clone(),
        config.listen_port,
        config.fullnode,
    )
    .with_multiport_mode(config.multiport_mode);
    let peers = Arc::new(tokio::sync::RwLock::new(PeerPool::new(peer_pool_config)));
    peers.write().await.add_seed_nodes(&config.seed_nodes).await;

    let sync_status = Arc::new(RwLock::new(SyncStatus::default()));

    let chain_consensus = Arc::new(ChainConsensus::new(ledger.clone(), peers.clone(), sync_status.clone()));
    tokio::spawn(chain_consensus.clone().run());

    let tx_consensus = Arc::new(TransactionConsensus::new(ledger.clone(), peers.clone()));
    tokio::spawn(tx_consensus.run());

    tokio::spawn(ferrochain_network::run_discovery_loop(peers.clone()));

    let miner = Arc::new(Miner::new(
        ledger.clone(),
        peers.clone(),
        sync_status.clone(),
        wallet.clone(),
        MinerConfig { fullnode: config.fullnode },
    ));
    let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    miner.spawn_workers(worker_count);

    let rpc_state = RpcState {
        ledger,
        peers,
        node_id,
        blockchain_id: config.blockchain_id.clone(),
    };
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    ferrochain_rpc::serve(addr, rpc_state).await
}
