//! Seeds and hierarchical key derivation.
//!
//! Keys follow SLIP-0010 for Ed25519: the master key is
//! `HMAC-SHA512("ed25519 seed", seed)` and every child is hardened,
//! `HMAC-SHA512(chain_code, 0x00 || secret || ser32(i | 2^31))`. Wallet keys
//! live at `m/44'/1815'/account'/chain'/index'`.
//!
//! A seed comes from one of two schemes:
//! - **Modern**: the 64-byte BIP-39 seed (PBKDF2-HMAC-SHA512, empty passphrase).
//! - **Legacy**: BLAKE2b-256 of the mnemonic entropy.
//!
//! The same phrase yields unrelated roots under the two schemes.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::collections::HashMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use tern_core::address::{Address, Network};
use tern_core::constants::{ACCOUNT_INDEX, COIN_TYPE, HARDENED_OFFSET, PURPOSE};
use tern_core::crypto::{KeyPair, PublicKey};
use tern_core::types::Hash256;

use crate::encryption::{self, KdfParams};
use crate::error::WalletError;
use crate::mnemonic::{self, ParsedMnemonic, WordCount};
use crate::recovery::PayloadKey;

type HmacSha512 = Hmac<Sha512>;

/// HMAC key for the SLIP-0010 Ed25519 master node.
const ED25519_SEED_KEY: &[u8] = b"ed25519 seed";

/// Secret seed bytes. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: Vec<u8>,
}

impl Seed {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Derive the seed for a validated mnemonic under `scheme`.
    pub fn from_mnemonic(parsed: &ParsedMnemonic, scheme: SeedScheme) -> Result<Self, WalletError> {
        match scheme {
            SeedScheme::Modern => {
                if parsed.word_count() == WordCount::Nine {
                    return Err(WalletError::InvalidMnemonic(
                        "nine-word phrases only support the legacy scheme".into(),
                    ));
                }
                let m = bip39::Mnemonic::parse_in_normalized(bip39::Language::English, parsed.phrase())
                    .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
                let seed = Zeroizing::new(m.to_seed_normalized(""));
                Ok(Self::from_bytes(seed.to_vec()))
            }
            SeedScheme::Legacy => {
                let hash = blake2b_simd::Params::new()
                    .hash_length(32)
                    .hash(parsed.entropy());
                Ok(Self::from_bytes(hash.as_bytes().to_vec()))
            }
        }
    }

    /// Get the raw seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// How a seed was produced from its mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedScheme {
    Modern,
    Legacy,
}

/// A password-encrypted seed, safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSeed {
    pub scheme: SeedScheme,
    pub kdf: KdfParams,
    /// `salt || nonce || ciphertext+tag`, hex in serialized form.
    #[serde(with = "hex_bytes")]
    pub blob: Vec<u8>,
}

impl EncryptedSeed {
    pub fn seal(seed: &Seed, scheme: SeedScheme, password: &[u8], kdf: KdfParams) -> Result<Self, WalletError> {
        Ok(Self {
            scheme,
            kdf,
            blob: encryption::encrypt(seed.as_bytes(), password, &kdf)?,
        })
    }

    /// Decrypt. Wrong password yields [`WalletError::Decryption`].
    pub fn open(&self, password: &[u8]) -> Result<Seed, WalletError> {
        let plain = encryption::decrypt(&self.blob, password, &self.kdf)?;
        Ok(Seed::from_bytes(plain.to_vec()))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone)]
enum SeedStorage {
    Plain(Seed),
    Encrypted(EncryptedSeed),
}

/// The wallet's seed, either in memory or encrypted under a password.
#[derive(Clone)]
pub struct WalletSeed {
    scheme: SeedScheme,
    storage: SeedStorage,
}

impl WalletSeed {
    /// Unencrypted seed.
    pub fn plain(seed: Seed, scheme: SeedScheme) -> Self {
        Self {
            scheme,
            storage: SeedStorage::Plain(seed),
        }
    }

    /// Seed encrypted under `password`.
    pub fn encrypted(seed: &Seed, scheme: SeedScheme, password: &[u8], kdf: KdfParams) -> Result<Self, WalletError> {
        Ok(Self::from_encrypted(EncryptedSeed::seal(seed, scheme, password, kdf)?))
    }

    pub fn from_encrypted(encrypted: EncryptedSeed) -> Self {
        Self {
            scheme: encrypted.scheme,
            storage: SeedStorage::Encrypted(encrypted),
        }
    }

    /// Validate `phrase` and derive its seed, encrypting it if a password is given.
    pub fn from_mnemonic(
        phrase: &str,
        word_count: WordCount,
        scheme: SeedScheme,
        password: Option<&[u8]>,
        kdf: KdfParams,
    ) -> Result<Self, WalletError> {
        let parsed = mnemonic::validate(phrase, word_count)?;
        let seed = Seed::from_mnemonic(&parsed, scheme)?;
        match password {
            Some(pw) => Self::encrypted(&seed, scheme, pw, kdf),
            None => Ok(Self::plain(seed, scheme)),
        }
    }

    pub fn scheme(&self) -> SeedScheme {
        self.scheme
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.storage, SeedStorage::Encrypted(_))
    }

    /// The encrypted form, if the seed is encrypted.
    pub fn as_encrypted(&self) -> Option<&EncryptedSeed> {
        match &self.storage {
            SeedStorage::Encrypted(e) => Some(e),
            SeedStorage::Plain(_) => None,
        }
    }

    /// Recover the plaintext seed. An encrypted seed requires the password;
    /// a plain seed ignores it.
    pub fn unlock(&self, password: Option<&[u8]>) -> Result<Seed, WalletError> {
        match (&self.storage, password) {
            (SeedStorage::Plain(seed), _) => Ok(seed.clone()),
            (SeedStorage::Encrypted(enc), Some(pw)) => enc.open(pw),
            (SeedStorage::Encrypted(_), None) => Err(WalletError::Decryption),
        }
    }

    /// Re-encrypt under `new` (fresh salt), or store in plaintext if `new` is None.
    pub fn change_password(
        &mut self,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
        kdf: KdfParams,
    ) -> Result<(), WalletError> {
        let seed = self.unlock(old)?;
        *self = match new {
            Some(pw) => Self::encrypted(&seed, self.scheme, pw, kdf)?,
            None => Self::plain(seed, self.scheme),
        };
        Ok(())
    }
}

impl fmt::Debug for WalletSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSeed")
            .field("scheme", &self.scheme)
            .field("encrypted", &self.is_encrypted())
            .finish_non_exhaustive()
    }
}

/// External (receiving) or internal (change) address chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    pub fn index(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Chain::External),
            1 => Some(Chain::Internal),
            _ => None,
        }
    }
}

/// `(account, chain, index)` below `m/44'/1815'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DerivationPath {
    pub account: u32,
    pub chain: Chain,
    pub index: u32,
}

impl DerivationPath {
    pub fn new(account: u32, chain: Chain, index: u32) -> Self {
        Self {
            account,
            chain,
            index,
        }
    }

    /// Path in the wallet's single account.
    pub fn wallet(chain: Chain, index: u32) -> Self {
        Self::new(ACCOUNT_INDEX, chain, index)
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/{PURPOSE}'/{COIN_TYPE}'/{}'/{}'/{}'",
            self.account,
            self.chain.index(),
            self.index
        )
    }
}

/// Ed25519 secret and chain code. Zeroized on drop, never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedKey {
    secret: [u8; 32],
    chain_code: [u8; 32],
}

impl ExtendedKey {
    /// SLIP-0010 master node for `seed`.
    pub fn master(seed: &Seed) -> Result<Self, WalletError> {
        hmac_split(ED25519_SEED_KEY, &[seed.as_bytes()])
    }

    /// Hardened child at `index` (the hardened bit is added here).
    pub fn derive_hardened(&self, index: u32) -> Result<Self, WalletError> {
        if index >= HARDENED_OFFSET {
            return Err(WalletError::KeyDerivation(format!(
                "index {index} already has the hardened bit set"
            )));
        }
        let ser = (index | HARDENED_OFFSET).to_be_bytes();
        hmac_split(&self.chain_code, &[&[0u8], &self.secret, &ser])
    }

    /// Walk a sequence of hardened indices.
    pub fn derive_path(&self, indices: &[u32]) -> Result<Self, WalletError> {
        let mut key = self.clone();
        for &index in indices {
            key = key.derive_hardened(index)?;
        }
        Ok(key)
    }

    pub fn keypair(&self) -> KeyPair {
        KeyPair::from_secret_bytes(&self.secret)
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair().public_key()
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

fn hmac_split(key: &[u8], parts: &[&[u8]]) -> Result<ExtendedKey, WalletError> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| WalletError::KeyDerivation(format!("HMAC error: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = mac.finalize().into_bytes();

    let mut key = ExtendedKey {
        secret: [0u8; 32],
        chain_code: [0u8; 32],
    };
    key.secret.copy_from_slice(&out[..32]);
    key.chain_code.copy_from_slice(&out[32..]);
    out.as_mut_slice().zeroize();
    Ok(key)
}

/// Root key for a wallet seed, decrypting it first if needed.
pub fn derive_root(seed: &WalletSeed, password: Option<&[u8]>) -> Result<ExtendedKey, WalletError> {
    let plain = seed.unlock(password)?;
    ExtendedKey::master(&plain)
}

/// Key at `m/44'/1815'/account'/chain'/index'` below `root`.
pub fn derive_child(root: &ExtendedKey, account: u32, chain: Chain, index: u32) -> Result<ExtendedKey, WalletError> {
    root.derive_path(&[PURPOSE, COIN_TYPE, account, chain.index(), index])
}

/// Derived keys and addresses for one account, with reverse lookup by key hash.
pub struct KeyChain {
    account_key: ExtendedKey,
    account: u32,
    network: Network,
    payload_key: PayloadKey,
    /// Cache of derived keypairs by path.
    keypairs: HashMap<DerivationPath, KeyPair>,
    /// Reverse lookup: key hash -> path.
    key_hash_to_path: HashMap<Hash256, DerivationPath>,
}

impl KeyChain {
    /// Keychain for the wallet's account below `root`.
    pub fn new(root: &ExtendedKey, network: Network) -> Result<Self, WalletError> {
        Self::for_account(root, ACCOUNT_INDEX, network)
    }

    pub fn for_account(root: &ExtendedKey, account: u32, network: Network) -> Result<Self, WalletError> {
        Ok(Self {
            account_key: root.derive_path(&[PURPOSE, COIN_TYPE, account])?,
            account,
            network,
            payload_key: PayloadKey::from_root(root),
            keypairs: HashMap::new(),
            key_hash_to_path: HashMap::new(),
        })
    }

    fn check_path(&self, path: &DerivationPath) -> Result<(), WalletError> {
        if path.account != self.account {
            return Err(WalletError::KeyDerivation(format!(
                "path account {} does not match keychain account {}",
                path.account, self.account
            )));
        }
        Ok(())
    }

    /// Derive (or fetch from cache) the keypair at `path`.
    pub fn derive_keypair(&mut self, path: DerivationPath) -> Result<&KeyPair, WalletError> {
        self.check_path(&path)?;
        if !self.keypairs.contains_key(&path) {
            let key = self.account_key.derive_path(&[path.chain.index(), path.index])?;
            let kp = key.keypair();
            self.key_hash_to_path.insert(kp.public_key().key_hash(), path);
            self.keypairs.insert(path, kp);
        }
        self.keypairs
            .get(&path)
            .ok_or_else(|| WalletError::KeyNotFound(path.to_string()))
    }

    /// Address at `path`, carrying its encrypted derivation payload.
    pub fn address_at(&mut self, path: DerivationPath) -> Result<Address, WalletError> {
        let key_hash = self.derive_keypair(path)?.public_key().key_hash();
        let payload = self.payload_key.seal(&key_hash, &path)?;
        Address::from_key_hash(key_hash, self.network)
            .with_payload(payload)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))
    }

    /// Look up the keypair that owns a key hash among derived keys.
    pub fn keypair_for_key_hash(&self, hash: &Hash256) -> Option<&KeyPair> {
        self.key_hash_to_path
            .get(hash)
            .and_then(|path| self.keypairs.get(path))
    }

    pub fn path_for_key_hash(&self, hash: &Hash256) -> Option<DerivationPath> {
        self.key_hash_to_path.get(hash).copied()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn account(&self) -> u32 {
        self.account
    }
}

impl fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyChain")
            .field("account", &self.account)
            .field("network", &self.network)
            .field("cached_keys", &self.keypairs.len())
            .finish()
    }
}
