//! Serialized access to the wallet seed.
//!
//! One [`SeedVault`] guards one [`WalletSeed`]. Unlocking takes the vault's
//! async mutex, decrypts on the blocking pool and returns an [`UnlockedRoot`]
//! guard. The root key lives only inside that guard and is zeroized when it
//! drops, whether the caller finished, failed or was cancelled.

use std::ops::Deref;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use zeroize::Zeroizing;

use crate::encryption::KdfParams;
use crate::error::WalletError;
use crate::keys::{self, EncryptedSeed, ExtendedKey, SeedScheme, WalletSeed};

/// Owner of the wallet seed.
#[derive(Debug)]
pub struct SeedVault {
    seed: Mutex<WalletSeed>,
    kdf: KdfParams,
}

/// Decrypted root key plus the vault lock. Other unlocks wait until it drops.
pub struct UnlockedRoot<'a> {
    root: ExtendedKey,
    _guard: MutexGuard<'a, WalletSeed>,
}

impl Deref for UnlockedRoot<'_> {
    type Target = ExtendedKey;

    fn deref(&self) -> &ExtendedKey {
        &self.root
    }
}

fn secret(password: Option<&[u8]>) -> Option<Zeroizing<Vec<u8>>> {
    password.map(|p| Zeroizing::new(p.to_vec()))
}

fn join_error(e: tokio::task::JoinError) -> WalletError {
    WalletError::KeyDerivation(format!("seed task failed: {e}"))
}

impl SeedVault {
    /// Vault with the given KDF cost for future password changes.
    pub fn new(seed: WalletSeed, kdf: KdfParams) -> Self {
        Self {
            seed: Mutex::new(seed),
            kdf,
        }
    }

    /// Decrypt the seed and derive the root key.
    ///
    /// A wrong or missing password for an encrypted seed is
    /// [`WalletError::Decryption`]. If this future is dropped while the
    /// derivation runs, the blocking task still completes and its result is
    /// zeroized on drop; the stored seed is never modified.
    pub async fn unlock(&self, password: Option<&[u8]>) -> Result<UnlockedRoot<'_>, WalletError> {
        let guard = self.seed.lock().await;
        let seed = guard.clone();
        let password = secret(password);
        let root = tokio::task::spawn_blocking(move || {
            keys::derive_root(&seed, password.as_deref().map(Vec::as_slice))
        })
        .await
        .map_err(join_error)??;
        debug!("wallet root unlocked");
        Ok(UnlockedRoot { root, _guard: guard })
    }

    /// Re-encrypt under `new`, or store in plaintext if `new` is None.
    /// The stored seed is replaced only if the whole change succeeds.
    pub async fn change_password(&self, old: Option<&[u8]>, new: Option<&[u8]>) -> Result<(), WalletError> {
        let mut guard = self.seed.lock().await;
        let mut updated = guard.clone();
        let (old, new, kdf) = (secret(old), secret(new), self.kdf);
        let updated = tokio::task::spawn_blocking(move || {
            updated.change_password(
                old.as_deref().map(Vec::as_slice),
                new.as_deref().map(Vec::as_slice),
                kdf,
            )?;
            Ok::<_, WalletError>(updated)
        })
        .await
        .map_err(join_error)??;
        *guard = updated;
        debug!(encrypted = guard.is_encrypted(), "wallet password changed");
        Ok(())
    }

    pub async fn scheme(&self) -> SeedScheme {
        self.seed.lock().await.scheme()
    }

    pub async fn is_encrypted(&self) -> bool {
        self.seed.lock().await.is_encrypted()
    }

    /// The persisted form of an encrypted seed.
    pub async fn export_encrypted(&self) -> Option<EncryptedSeed> {
        self.seed.lock().await.as_encrypted().cloned()
    }
}
