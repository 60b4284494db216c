//! Address ownership recovery.
//!
//! Every wallet address carries an encrypted derivation payload: its
//! `(account, chain, index)` triple sealed with AES-256-GCM under a key only
//! the wallet's root can produce. A [`Checker`] decides ownership by opening
//! that payload and re-deriving the key hash at the recovered path, so
//! classification costs one decryption and one derivation per candidate
//! instead of an index search.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use zeroize::Zeroizing;

use tern_core::address::{Address, AddressKind};
use tern_core::constants::{ACCOUNT_INDEX, COIN_TYPE, HARDENED_OFFSET, PURPOSE};
use tern_core::types::Hash256;

use crate::error::WalletError;
use crate::keys::{Chain, DerivationPath, ExtendedKey};

const PAYLOAD_KEY_CONTEXT: &str = "tern-address-payload-v1";
const PAYLOAD_NONCE_CONTEXT: &str = "tern-address-nonce-v1";

/// `account || chain || index`, little-endian u32 each.
const TRIPLE_LEN: usize = 12;

/// Symmetric key that seals derivation paths into addresses.
#[derive(Clone)]
pub struct PayloadKey {
    key: Zeroizing<[u8; 32]>,
}

impl PayloadKey {
    /// Derive the payload key from the root's public key and chain code.
    pub fn from_root(root: &ExtendedKey) -> Self {
        let mut material = Zeroizing::new([0u8; 64]);
        material[..32].copy_from_slice(&root.public_key().to_bytes());
        material[32..].copy_from_slice(root.chain_code());
        Self {
            key: Zeroizing::new(blake3::derive_key(PAYLOAD_KEY_CONTEXT, material.as_ref())),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, WalletError> {
        Aes256Gcm::new_from_slice(self.key.as_ref()).map_err(|e| WalletError::Encryption(e.to_string()))
    }

    fn nonce(key_hash: &Hash256) -> [u8; 12] {
        let digest = blake3::derive_key(PAYLOAD_NONCE_CONTEXT, key_hash.as_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest[..12]);
        nonce
    }

    /// Encrypt `path` for the address with `key_hash`.
    pub fn seal(&self, key_hash: &Hash256, path: &DerivationPath) -> Result<Vec<u8>, WalletError> {
        let mut plain = [0u8; TRIPLE_LEN];
        plain[..4].copy_from_slice(&path.account.to_le_bytes());
        plain[4..8].copy_from_slice(&path.chain.index().to_le_bytes());
        plain[8..].copy_from_slice(&path.index.to_le_bytes());

        let nonce = Self::nonce(key_hash);
        self.cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plain,
                    aad: key_hash.as_bytes(),
                },
            )
            .map_err(|e| WalletError::Encryption(e.to_string()))
    }

    /// Decrypt a payload to its raw `(account, chain, index)` triple.
    /// Any failure is `None`.
    pub fn open(&self, key_hash: &Hash256, payload: &[u8]) -> Option<(u32, u32, u32)> {
        let nonce = Self::nonce(key_hash);
        let plain = self
            .cipher()
            .ok()?
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: payload,
                    aad: key_hash.as_bytes(),
                },
            )
            .ok()?;
        if plain.len() != TRIPLE_LEN {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([plain[i], plain[i + 1], plain[i + 2], plain[i + 3]]);
        Some((word(0), word(4), word(8)))
    }
}

/// An owned address with its derivation path and cached state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub address: Address,
    pub path: DerivationPath,
    pub used: bool,
    pub balance: u64,
}

impl WalletAddress {
    pub fn new(address: Address, path: DerivationPath) -> Self {
        Self {
            address,
            path,
            used: false,
            balance: 0,
        }
    }
}

/// Ownership test for candidate addresses, built once per recovery session.
#[derive(Clone)]
pub struct Checker {
    account: u32,
    account_key: ExtendedKey,
    payload_key: PayloadKey,
}

impl Checker {
    /// Checker for the wallet account below `root`.
    pub fn new(root: &ExtendedKey) -> Result<Self, WalletError> {
        Ok(Self {
            account: ACCOUNT_INDEX,
            account_key: root.derive_path(&[PURPOSE, COIN_TYPE, ACCOUNT_INDEX])?,
            payload_key: PayloadKey::from_root(root),
        })
    }

    /// Path of `address` if this wallet generated it.
    pub fn owns(&self, address: &Address) -> Option<DerivationPath> {
        if address.kind() != AddressKind::Standard {
            return None;
        }
        let key_hash = address.key_hash();
        let (account, chain, index) = self.payload_key.open(&key_hash, address.payload()?)?;

        let chain = Chain::from_index(chain)?;
        if account != self.account || index >= HARDENED_OFFSET {
            return None;
        }

        let derived = self.account_key.derive_path(&[chain.index(), index]).ok()?;
        if derived.public_key().key_hash() != key_hash {
            return None;
        }
        Some(DerivationPath::new(account, chain, index))
    }

    /// Owned subset of `candidates`, in candidate order, each reported once.
    pub fn classify(&self, candidates: &[Address]) -> Vec<WalletAddress> {
        let mut seen = HashSet::new();
        let owned: Vec<WalletAddress> = candidates
            .iter()
            .filter(|a| seen.insert(*a))
            .filter_map(|a| self.owns(a).map(|path| WalletAddress::new(a.clone(), path)))
            .collect();
        debug!(candidates = candidates.len(), owned = owned.len(), "classified candidate addresses");
        owned
    }

    /// Like [`classify`](Self::classify) for text addresses. Strings that do
    /// not decode are not owned.
    pub fn recover_str(&self, candidates: &[String]) -> Vec<WalletAddress> {
        let decoded: Vec<Address> = candidates
            .iter()
            .filter_map(|s| Address::decode(s).ok())
            .collect();
        self.classify(&decoded)
    }
}

/// The wallet's owned addresses. Each address appears once.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: Vec<WalletAddress>,
    by_address: HashMap<Address, usize>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address. Returns false if it was already present.
    pub fn insert(&mut self, entry: WalletAddress) -> bool {
        if self.by_address.contains_key(&entry.address) {
            return false;
        }
        self.by_address.insert(entry.address.clone(), self.entries.len());
        self.entries.push(entry);
        true
    }

    /// Add every entry; returns how many were new.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = WalletAddress>) -> usize {
        entries.into_iter().filter(|e| self.insert(e.clone())).count()
    }

    pub fn get(&self, address: &Address) -> Option<&WalletAddress> {
        self.by_address.get(address).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.by_address.contains_key(address)
    }

    /// First unused index on `chain`.
    pub fn next_index(&self, chain: Chain) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.path.chain == chain)
            .map(|e| e.path.index + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn mark_used(&mut self, address: &Address) {
        if let Some(&i) = self.by_address.get(address) {
            self.entries[i].used = true;
        }
    }

    pub fn set_balance(&mut self, address: &Address, balance: u64) {
        if let Some(&i) = self.by_address.get(address) {
            self.entries[i].balance = balance;
        }
    }

    pub fn entries(&self) -> &[WalletAddress] {
        &self.entries
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries.iter().map(|e| e.address.clone()).collect()
    }

    pub fn on_chain(&self, chain: Chain) -> impl Iterator<Item = &WalletAddress> {
        self.entries.iter().filter(move |e| e.path.chain == chain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
