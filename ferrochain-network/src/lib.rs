use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Distinguishes why a peer's `/info` couldn't be used for admission, so
/// the caller can log the two cases differently even though both just
/// result in a rejected `add`.
#[derive(Debug, Error)]
enum PeerError {
    #[error("peer did not respond")]
    Unreachable,
    #[error("peer response was not valid NodeInfo")]
    Malformed,
}

pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const NETWORKING_VERSION: &str = "1.0.0";

/// The body every peer returns from `GET /info`, used both to gate
/// admission and to compare block heights during consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub protocol_version: String,
    pub networking_version: String,
    pub block_height: u64,
    pub node_id: String,
    pub blockchain_id: String,
}

/// The port assumed for a peer address that names no port of its own,
/// when `multiport_mode` is enabled.
const DEFAULT_PORT: u16 = 2227;

#[derive(Debug, Clone)]
pub struct PeerPoolConfig {
    pub blockchain_id: String,
    pub node_id: String,
    pub server_port: u16,
    pub fullnode: bool,
    pub max_connections: usize,
    pub multiport_mode: bool,
}

impl PeerPoolConfig {
    pub fn new(blockchain_id: impl Into<String>, node_id: impl Into<String>, server_port: u16, fullnode: bool) -> Self {
        PeerPoolConfig {
            blockchain_id: blockchain_id.into(),
            node_id: node_id.into(),
            server_port,
            fullnode,
            max_connections: 20,
            multiport_mode: false,
        }
    }

    pub fn with_multiport_mode(mut self, multiport_mode: bool) -> Self {
        self.multiport_mode = multiport_mode;
        self
    }
}

/// Mirrors a peer's `base_url + route` request/response HTTP surface.
/// Swapped out in tests for a fake so `PeerPool` logic can be exercised
/// without a live network.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    async fn get_json(&self, url: &str, timeout: Duration) -> Option<serde_json::Value>;
    async fn post_json(&self, url: &str, body: serde_json::Value) -> bool;
}

pub struct ReqwestPeerClient {
    client: reqwest::Client,
}

impl Default for ReqwestPeerClient {
    fn default() -> Self {
        ReqwestPeerClient {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl PeerClient for ReqwestPeerClient {
    async fn get_json(&self, url: &str, timeout: Duration) -> Option<serde_json::Value> {
        let response = self.client.get(url).timeout(timeout).send().await.ok()?;
        response.json::<serde_json::Value>().await.ok()
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> bool {
        self.client.post(url).json(&body).send().await.is_ok()
    }
}

/// Discovered peers, split into `active` (recently responsive) and
/// `inactive` (failed a health check, kept around so it can be retried
/// rather than forgotten outright). Order-preserving so `get_alive_peers`
/// sampling is deterministic for a given pool state.
pub struct PeerPool<C: PeerClient = ReqwestPeerClient> {
    active: IndexSet<String>,
    inactive: IndexSet<String>,
    config: PeerPoolConfig,
    client: C,
}

impl PeerPool<ReqwestPeerClient> {
    pub fn new(config: PeerPoolConfig) -> Self {
        PeerPool {
            active: IndexSet::new(),
            inactive: IndexSet::new(),
            config,
            client: ReqwestPeerClient::default(),
        }
    }
}

impl<C: PeerClient> PeerPool<C> {
    pub fn with_client(config: PeerPoolConfig, client: C) -> Self {
        PeerPool {
            active: IndexSet::new(),
            inactive: IndexSet::new(),
            config,
            client,
        }
    }

    pub fn active_peers(&self) -> Vec<String> {
        self.active.iter().cloned().collect()
    }

    /// Prefixes a scheme if missing, then normalises the port per
    /// `multiport_mode`: appends `DEFAULT_PORT` when a peer address names
    /// none and multiport mode is on, or strips any named port when it's
    /// off (single-port deployments address every peer by host alone).
    pub fn normalize_addr(&self, addr: &str) -> String {
        let addr = if addr.starts_with("http") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };

        let scheme_end = addr.find("://").map(|i| i + 3).unwrap_or(0);
        let (scheme, host) = addr.split_at(scheme_end);
        let has_port = host.contains(':');

        if self.config.multiport_mode && !has_port {
            format!("{scheme}{host}:{DEFAULT_PORT}")
        } else if !self.config.multiport_mode && has_port {
            let bare_host = host.split(':').next().unwrap_or(host);
            format!("{scheme}{bare_host}")
        } else {
            addr
        }
    }

    /// Admits `addr` if the pool has room, it isn't already known, and the
    /// peer's own `/info` passes version/blockchain gating (spec §4.4).
    pub async fn add(&mut self, addr: &str) -> bool {
        let addr = self.normalize_addr(addr);
        if self.active.len() >= self.config.max_connections {
            return false;
        }
        if self.active.contains(&addr) {
            return false;
        }

        let info = match self.fetch_info(&addr).await {
            Ok(info) => info,
            Err(err) => {
                debug!(%addr, %err, "peer admission failed");
                return false;
            }
        };

        if info.node_id == self.config.node_id {
            return false;
        }
        if !major_minor_match(&info.protocol_version, PROTOCOL_VERSION) {
            return false;
        }
        if !major_minor_match(&info.networking_version, NETWORKING_VERSION) {
            return false;
        }
        if info.blockchain_id != self.config.blockchain_id {
            return false;
        }

        self.active.insert(addr.clone());

        if self.config.fullnode {
            let ping_body = serde_json::json!({ "port": self.config.server_port });
            self.client.post_json(&format!("{addr}/ping"), ping_body).await;
        }

        true
    }

    async fn fetch_info(&self, addr: &str) -> Result<NodeInfo, PeerError> {
        let value = self
            .client
            .get_json(&format!("{addr}/info"), Duration::from_secs(2))
            .await
            .ok_or(PeerError::Unreachable)?;
        serde_json::from_value(value).map_err(|_| PeerError::Malformed)
    }

    pub fn remove(&mut self, addr: &str) {
        self.active.shift_remove(addr);
    }

    /// Moves responsive peers out of `inactive` and unresponsive peers out
    /// of `active`, mirroring a connection pool's health sweep.
    pub async fn update_pool(&mut self) {
        for peer in self.inactive.clone() {
            if self.active.contains(&peer) {
                self.active.shift_remove(&peer);
            }
            if self.client.get_json(&peer, Duration::from_secs(2)).await.is_some() && self.add(&peer).await {
                self.inactive.shift_remove(&peer);
            }
        }

        for peer in self.active.clone() {
            self.inactive.shift_remove(&peer);
            if self.client.get_json(&peer, Duration::from_secs(1)).await.is_none() {
                self.active.shift_remove(&peer);
                self.inactive.insert(peer);
            }
        }
    }

    pub async fn get_alive_peers(&mut self, amount: usize) -> Vec<String> {
        self.update_pool().await;
        self.active.iter().take(amount).cloned().collect()
    }

    /// Asks each known peer for its latest block and collects those whose
    /// hash matches, up to `amount` — used to target a reorg-safe subset of
    /// peers when broadcasting a freshly mined block.
    pub async fn get_peers_with_blockhash(&self, hash: &str, amount: usize) -> Vec<String> {
        let mut matches = Vec::new();
        for peer in self.active.iter() {
            if matches.len() == amount {
                break;
            }
            let Some(value) = self.client.get_json(&format!("{peer}/latest-block"), Duration::from_secs(2)).await else {
                continue;
            };
            if value.get("hash").and_then(|h| h.as_str()) == Some(hash) {
                matches.push(peer.clone());
            }
        }
        matches
    }

    pub async fn broadcast(&mut self, route: &str, payload: &serde_json::Value, send_to_all: bool) {
        let targets = if send_to_all {
            self.active.iter().cloned().collect::<Vec<_>>()
        } else {
            self.get_alive_peers(20).await
        };
        for peer in targets {
            self.client.post_json(&format!("{peer}{route}"), payload.clone()).await;
        }
    }

    /// One discovery pass: asks every known peer for its own peer list and
    /// tries to admit anything new. Does nothing if the pool is already
    /// full. Takes `&mut self` only for the duration of the sweep — the
    /// long-lived loop lives in `run_discovery_loop`, which re-acquires the
    /// lock per sweep instead of holding it forever.
    pub async fn discovery_sweep(&mut self) {
        if self.active.len() >= self.config.max_connections {
            return;
        }

        for peer in self.active.clone() {
            if self.active.len() >= self.config.max_connections {
                break;
            }
            let Some(value) = self.client.get_json(&format!("{peer}/peers"), Duration::from_secs(2)).await else {
                self.active.shift_remove(&peer);
                continue;
            };
            let Some(candidates) = value.as_array() else { continue };
            for candidate in candidates {
                if let Some(addr) = candidate.as_str() {
                    self.add(addr).await;
                }
            }
        }
    }

    pub async fn add_seed_nodes(&mut self, seed_nodes: &[String]) {
        for node in seed_nodes {
            if !self.add(node).await {
                debug!(node, "seed node could not be admitted");
            }
        }
        self.update_pool().await;
    }
}

/// Long-lived discovery task: re-acquires the pool's lock once per sweep
/// (dropping it across the 30-second sleep) rather than holding a single
/// guard for the task's entire life, which would starve every other
/// consumer of the pool forever.
pub async fn run_discovery_loop<C>(pool: Arc<RwLock<PeerPool<C>>>)
where
    C: PeerClient + 'static,
{
    loop {
        let start = Instant::now();
        pool.write().await.discovery_sweep().await;

        let elapsed = start.elapsed();
        let remaining = Duration::from_secs(30).saturating_sub(elapsed);
        tokio::time::sleep(remaining).await;
    }
}

fn major_minor_match(a: &str, b: &str) -> bool {
    let a_parts: Vec<&str> = a.split('.').collect();
    let b_parts: Vec<&str> = b.split('.').collect();
    match (a_parts.get(0..2), b_parts.get(0..2)) {
        (Some(a), Some(b)) => a == b,
        _ => {
            warn!(a, b, "malformed version string during peer admission");
            false
        }
    }
}
