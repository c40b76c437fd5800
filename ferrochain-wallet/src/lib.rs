use anyhow::{anyhow, Context, Result};
use ferrochain_crypto::generate_keypair;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// A plaintext hex keypair, written and read as `wallet.json`. No
/// encryption layer — wallet file persistence sits outside the node's
/// core and this crate stays a thin collaborator at that boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Wallet {
    pub public_key: String,
    pub private_key: String,
}

impl Wallet {
    fn generate() -> Self {
        let kp = generate_keypair();
        Wallet {
            public_key: kp.public_key,
            private_key: kp.private_key,
        }
    }

    /// Loads `path` if it holds a well-formed wallet. If the file is
    /// missing, a fresh wallet is generated and written to `path`. If the
    /// file exists but is non-empty and unreadable, this is a fatal
    /// configuration error — mirroring the original's refusal to overwrite
    /// a file that might hold keys it can't parse.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).with_context(|| {
                    format!(
                        "could not load wallet from '{}': file is non-empty but not a valid wallet",
                        path.display()
                    )
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let wallet = Wallet::generate();
                wallet.save(path)?;
                info!("new wallet created");
                warn!(
                    path = %path.display(),
                    "back up this wallet file; losing it means losing the keys"
                );
                Ok(wallet)
            }
            Err(err) => Err(anyhow!(err).context(format!("could not read wallet file '{}'", path.display()))),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}
