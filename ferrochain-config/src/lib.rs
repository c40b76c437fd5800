use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A node's startup configuration, loaded from `config.json`. Missing or
/// malformed configuration is a fatal error — there is no sensible
/// default for `blockchain_id` or `seed_nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub blockchain_id: String,
    pub fullnode: bool,
    pub multiport_mode: bool,
    pub seed_nodes: Vec<String>,
    pub listen_port: u16,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_networking_version")]
    pub networking_version: String,
    #[serde(default)]
    pub data_dir: Option<String>,
}

fn default_protocol_version() -> String {
    ferrochain_network::PROTOCOL_VERSION.to_string()
}

fn default_networking_version() -> String {
    ferrochain_network::NETWORKING_VERSION.to_string()
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .add_source(config::Environment::with_prefix("FERROCHAIN").separator("__"));
        let cfg = builder
            .build()
            .with_context(|| format!("could not load configuration from '{}'", path.display()))?;
        cfg.try_deserialize()
            .context("configuration file is malformed")
    }

    pub fn example() -> Self {
        NodeConfig {
            blockchain_id: "ferrochain-mainnet".to_string(),
            fullnode: true,
            multiport_mode: true,
            seed_nodes: vec![],
            listen_port: 2227,
            protocol_version: default_protocol_version(),
            networking_version: default_networking_version(),
            data_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_a_well_formed_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"blockchain_id":"test-chain","fullnode":true,"multiport_mode":false,"seed_nodes":["http://seed:2227"],"listen_port":2227}"#,
        )
        .unwrap();
        let cfg = NodeConfig::load(&path).unwrap();
        assert_eq!(cfg.blockchain_id, "test-chain");
        assert_eq!(cfg.seed_nodes, vec!["http://seed:2227".to_string()]);
        assert_eq!(cfg.protocol_version, ferrochain_network::PROTOCOL_VERSION);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        assert!(NodeConfig::load(&path).is_err());
    }
}
