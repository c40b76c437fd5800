use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use ferrochain_consensus::SharedPeerPool;
use ferrochain_core::{Ledger, Transaction};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Handed to every route. Cheap to clone — everything behind it is an
/// `Arc`. `ledger` uses a synchronous lock since its critical sections
/// never cross an `.await`; `peers` uses an async-aware lock since
/// admitting or health-checking a peer does network I/O while held.
#[derive(Clone)]
pub struct RpcState {
    pub ledger: Arc<RwLock<Ledger>>,
    pub peers: SharedPeerPool,
    pub node_id: String,
    pub blockchain_id: String,
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/info", get(info))
        .route("/blockchain", get(blockchain))
        .route("/latest-block", get(latest_block))
        .route("/blockinv", get(blockinv))
        .route("/block/:blockhash", get(block_by_hash))
        .route("/peers", get(peers))
        .route("/pending-transactions", get(pending_transactions))
        .route("/unconfirmed-transactions", get(unconfirmed_transactions))
        .route("/block-recv", post(block_recv))
        .route("/tx-recv", post(tx_recv))
        .route("/ping", post(ping))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: RpcState) -> anyhow::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "rpc listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn home() -> &'static str {
    "ferrochain node"
}

#[derive(Serialize)]
struct InfoResponse {
    protocol_version: &'static str,
    networking_version: &'static str,
    block_height: u64,
    node_id: String,
    blockchain_id: String,
}

async fn info(State(state): State<RpcState>) -> Json<InfoResponse> {
    let ledger = state.ledger.read();
    Json(InfoResponse {
        protocol_version: ferrochain_network::PROTOCOL_VERSION,
        networking_version: ferrochain_network::NETWORKING_VERSION,
        block_height: ledger.chain.height().unwrap_or(0),
        node_id: state.node_id.clone(),
        blockchain_id: state.blockchain_id.clone(),
    })
}

async fn blockchain(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let ledger = state.ledger.read();
    Json(serde_json::to_value(ledger.chain.blocks()).unwrap_or(serde_json::Value::Null))
}

async fn latest_block(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let ledger = state.ledger.read();
    Json(serde_json::to_value(ledger.chain.tip()).unwrap_or(serde_json::Value::Null))
}

async fn blockinv(State(state): State<RpcState>) -> Json<Vec<String>> {
    Json(state.ledger.read().chain.block_inv())
}

async fn block_by_hash(State(state): State<RpcState>, Path(blockhash): Path<String>) -> Result<Json<serde_json::Value>, StatusCode> {
    let ledger = state.ledger.read();
    match ledger.chain.get_block_from_hash(&blockhash) {
        Some(block) => Ok(Json(serde_json::to_value(block).unwrap_or(serde_json::Value::Null))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn peers(State(state): State<RpcState>) -> Json<Vec<String>> {
    Json(state.peers.read().await.active_peers())
}

async fn pending_transactions(State(state): State<RpcState>) -> Json<Vec<Transaction>> {
    Json(state.ledger.read().pool.get_pending())
}

async fn unconfirmed_transactions(State(state): State<RpcState>) -> Json<Vec<Transaction>> {
    Json(state.ledger.read().pool.get_unconfirmed())
}

async fn block_recv(State(state): State<RpcState>, Json(block): Json<ferrochain_core::Block>) -> &'static str {
    let accepted = state.ledger.write().add_block(block, false);
    if accepted {
        "Received"
    } else {
        "Invalid block"
    }
}

async fn tx_recv(State(state): State<RpcState>, Json(tx): Json<Transaction>) -> &'static str {
    let accepted = state.ledger.write().add_transaction(tx);
    if accepted {
        "received"
    } else {
        "Invalid transaction"
    }
}

#[derive(serde::Deserialize)]
struct PingBody {
    port: u16,
}

async fn ping(
    State(state): State<RpcState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(body): Json<PingBody>,
) -> &'static str {
    let addr = format!("{}:{}", remote.ip(), body.port);
    state.peers.write().await.add(&addr).await;
    "pong"
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrochain_core::Chain;
    use ferrochain_crypto::generate_keypair;
    use ferrochain_network::{PeerPool, PeerPoolConfig};
    use tempfile::tempdir;

    fn new_test_state() -> RpcState {
        let dir = tempdir().unwrap();
        let chain = Chain::new("test-chain", dir.path().join("blockchain.json"));
        let ledger = Arc::new(RwLock::new(Ledger::new(chain)));
        let peers = Arc::new(tokio::sync::RwLock::new(PeerPool::new(PeerPoolConfig::new("test-chain", "node-id", 2227, false))));
        RpcState {
            ledger,
            peers,
            node_id: "node-id".to_string(),
            blockchain_id: "test-chain".to_string(),
        }
    }

    #[tokio::test]
    async fn info_reports_genesis_height() {
        let state = new_test_state();
        let Json(response) = info(State(state)).await;
        assert_eq!(response.block_height, 0);
        assert_eq!(response.blockchain_id, "test-chain");
    }

    #[tokio::test]
    async fn block_recv_rejects_a_block_with_bad_previous_hash() {
        let state = new_test_state();
        let kp = generate_keypair();
        let mut bad_block = state.ledger.read().chain.make_block(&kp.public_key, vec![]).unwrap();
        bad_block.previous_hash = Some("not-the-real-tip".to_string());
        bad_block.hash = bad_block.compute_hash();
        let response = block_recv(State(state), Json(bad_block)).await;
        assert_eq!(response, "Invalid block");
    }

    #[tokio::test]
    async fn tx_recv_rejects_an_overspending_transaction() {
        let state = new_test_state();
        let poor = generate_keypair();
        let tx = Transaction::new_payment(&poor.private_key, &poor.public_key, "someone-else", 1.0).unwrap();
        let response = tx_recv(State(state), Json(tx)).await;
        assert_eq!(response, "Invalid transaction");
    }

    #[tokio::test]
    async fn blockinv_starts_with_just_the_genesis_hash() {
        let state = new_test_state();
        let inv = blockinv(State(state.clone())).await;
        assert_eq!(inv.0.len(), 1);
        assert_eq!(inv.0[0], state.ledger.read().chain.tip().unwrap().hash);
    }
}
