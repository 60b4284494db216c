//! Wallet file persistence.
//!
//! A wallet file is JSON: a magic/version header, the network, the encrypted
//! seed and the owned address book. The seed is never written in plaintext;
//! addresses and cached balances are public data and stay readable.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tern_core::address::Network;
use tern_transport::BackendApi;
use tern_wallet::keys::EncryptedSeed;
use tern_wallet::{WalletAddress, WalletEngine, WalletOptions, WalletSeed};

/// Magic string identifying tern wallet files.
pub const WALLET_MAGIC: &str = "TNWL";

/// Current wallet file format version.
pub const WALLET_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletFile {
    pub magic: String,
    pub version: u32,
    pub network: Network,
    pub seed: EncryptedSeed,
    #[serde(default)]
    pub addresses: Vec<WalletAddress>,
}

impl WalletFile {
    pub fn new(network: Network, seed: EncryptedSeed, addresses: Vec<WalletAddress>) -> Self {
        Self {
            magic: WALLET_MAGIC.to_string(),
            version: WALLET_VERSION,
            network,
            seed,
            addresses,
        }
    }

    /// Snapshot an engine for saving. Fails if its seed is not encrypted.
    pub async fn capture<B: BackendApi + ?Sized>(engine: &WalletEngine<B>) -> Result<Self> {
        let seed = engine
            .vault()
            .export_encrypted()
            .await
            .context("Refusing to save an unencrypted seed")?;
        Ok(Self::new(engine.network(), seed, engine.addresses().entries().to_vec()))
    }

    /// Engine over this file's seed and addresses.
    pub fn into_engine<B: BackendApi + ?Sized>(self, backend: Arc<B>, mut options: WalletOptions) -> WalletEngine<B> {
        options.network = self.network;
        let mut engine = WalletEngine::from_seed(WalletSeed::from_encrypted(self.seed), backend, options);
        engine.load_addresses(self.addresses);
        engine
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("Failed to read wallet file: {}", path.display()))?;
        let file: WalletFile = serde_json::from_slice(&data)
            .with_context(|| format!("Corrupted wallet file: {}", path.display()))?;
        if file.magic != WALLET_MAGIC {
            bail!("Not a tern wallet file: {}", path.display());
        }
        if file.version != WALLET_VERSION {
            bail!("Unsupported wallet file version: {}", file.version);
        }
        Ok(file)
    }

    /// Write atomically: a sibling temp file is renamed over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let data = serde_json::to_vec_pretty(self).context("Failed to serialize wallet")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data).with_context(|| format!("Failed to write {}", tmp.display()))?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
