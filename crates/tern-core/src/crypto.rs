//! Ed25519 operations for the wallet engine.
//!
//! Key pairs, key hashing, and per-input signing. The signing hash for an
//! input commits to the version, every input outpoint, every output, the
//! metadata and the index of the input being signed. Witnesses are excluded
//! so inputs can be signed independently and in any order.

use ed25519_dalek::{Signer, Verifier};
use std::fmt;

use crate::error::CryptoError;
use crate::types::{Hash256, Transaction, TxWitness};

/// Domain separator prepended to every signing hash preimage.
const SIGHASH_DOMAIN: &[u8] = b"tern-sighash-v1";

/// Ed25519 key pair. The secret half is zeroized on drop by ed25519-dalek.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Random key pair from the OS RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Key pair from 32 bytes of secret key material.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Raw 64-byte Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key: vk })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// BLAKE3 hash committed to by addresses.
    pub fn key_hash(&self) -> Hash256 {
        key_hash(&self.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// BLAKE3 key hash from raw public key bytes.
pub fn key_hash(pubkey_bytes: &[u8; 32]) -> Hash256 {
    Hash256(blake3::hash(pubkey_bytes).into())
}

/// Signing hash for one input of `tx`.
///
/// Layout (all integers little-endian):
/// `domain || version || n_inputs || (txid || index)* || n_outputs ||
/// (address_bytes_len || address_bytes || amount)* || metadata_len || metadata || input_index`
pub fn signing_hash(tx: &Transaction, input_index: usize) -> Result<Hash256, CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(SIGHASH_DOMAIN);
    hasher.update(&tx.version.to_le_bytes());

    hasher.update(&(tx.inputs.len() as u64).to_le_bytes());
    for input in &tx.inputs {
        hasher.update(input.txid.as_bytes());
        hasher.update(&input.index.to_le_bytes());
    }

    hasher.update(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        let addr = output.address.to_bytes();
        hasher.update(&(addr.len() as u64).to_le_bytes());
        hasher.update(&addr);
        hasher.update(&output.amount.to_le_bytes());
    }

    hasher.update(&(tx.metadata.len() as u64).to_le_bytes());
    hasher.update(&tx.metadata);

    hasher.update(&(input_index as u64).to_le_bytes());

    Ok(Hash256(hasher.finalize().into()))
}

/// Produce the witness for `sighash` with `keypair`.
pub fn sign_hash(sighash: &Hash256, keypair: &KeyPair) -> TxWitness {
    TxWitness {
        public_key: keypair.public_key().to_bytes(),
        signature: keypair.sign(sighash.as_bytes()).to_vec(),
    }
}

/// Check a witness for input `input_index` against the owner's key hash.
///
/// 1. The witness public key hashes to `expected_key_hash`.
/// 2. The signature is 64 bytes and verifies over the input's signing hash.
pub fn verify_witness(
    tx: &Transaction,
    input_index: usize,
    witness: &TxWitness,
    expected_key_hash: &Hash256,
) -> Result<(), CryptoError> {
    let sighash = signing_hash(tx, input_index)?;
    let pk = PublicKey::from_bytes(&witness.public_key)?;
    if pk.key_hash() != *expected_key_hash {
        return Err(CryptoError::KeyHashMismatch);
    }
    let sig: [u8; 64] = witness
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    pk.verify(sighash.as_bytes(), &sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Network};
    use crate::types::{OutPoint, TxOutput};

    fn tx_with_inputs(n: u8) -> Transaction {
        let inputs = (0..n)
            .map(|i| OutPoint { txid: Hash256([i; 32]), index: i as u32 })
            .collect();
        Transaction::new(
            inputs,
            vec![TxOutput {
                address: Address::from_key_hash(Hash256([0xEE; 32]), Network::Testnet),
                amount: 1_000,
            }],
        )
    }

    #[test]
    fn key_hash_matches_public_key() {
        let kp = KeyPair::from_secret_bytes(&[7; 32]);
        let pk = kp.public_key();
        assert_eq!(pk.key_hash(), key_hash(&pk.to_bytes()));
    }

    #[test]
    fn deterministic_from_secret() {
        let a = KeyPair::from_secret_bytes(&[9; 32]);
        let b = KeyPair::from_secret_bytes(&[9; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn debug_hides_secret() {
        let kp = KeyPair::from_secret_bytes(&[0x11; 32]);
        let dbg = format!("{kp:?}");
        assert!(dbg.contains("public_key"));
        assert!(!dbg.contains(&hex::encode([0x11; 32])));
    }

    #[test]
    fn sighash_differs_per_input() {
        let tx = tx_with_inputs(2);
        assert_ne!(signing_hash(&tx, 0).unwrap(), signing_hash(&tx, 1).unwrap());
    }

    #[test]
    fn sighash_commits_to_metadata() {
        let tx = tx_with_inputs(1);
        let mut with_meta = tx.clone();
        with_meta.metadata = b"memo".to_vec();
        assert_ne!(signing_hash(&tx, 0).unwrap(), signing_hash(&with_meta, 0).unwrap());
    }

    #[test]
    fn sighash_index_out_of_bounds() {
        let tx = tx_with_inputs(1);
        assert_eq!(
            signing_hash(&tx, 1).unwrap_err(),
            CryptoError::InputIndexOutOfBounds { index: 1, len: 1 }
        );
    }

    #[test]
    fn sign_and_verify() {
        let tx = tx_with_inputs(2);
        let kp = KeyPair::generate();
        let owner = kp.public_key().key_hash();
        let witness = sign_hash(&signing_hash(&tx, 1).unwrap(), &kp);
        verify_witness(&tx, 1, &witness, &owner).unwrap();
        // Same witness is not valid for another input.
        assert_eq!(
            verify_witness(&tx, 0, &witness, &owner).unwrap_err(),
            CryptoError::VerificationFailed
        );
    }

    #[test]
    fn verify_rejects_wrong_owner() {
        let tx = tx_with_inputs(1);
        let kp = KeyPair::generate();
        let witness = sign_hash(&signing_hash(&tx, 0).unwrap(), &kp);
        assert_eq!(
            verify_witness(&tx, 0, &witness, &Hash256([0; 32])).unwrap_err(),
            CryptoError::KeyHashMismatch
        );
    }

    #[test]
    fn verify_rejects_truncated_signature() {
        let tx = tx_with_inputs(1);
        let kp = KeyPair::generate();
        let mut witness = sign_hash(&signing_hash(&tx, 0).unwrap(), &kp);
        witness.signature.truncate(10);
        assert_eq!(
            verify_witness(&tx, 0, &witness, &kp.public_key().key_hash()).unwrap_err(),
            CryptoError::InvalidSignature
        );
    }

    #[test]
    fn verify_rejects_tampered_tx() {
        let tx = tx_with_inputs(1);
        let kp = KeyPair::generate();
        let witness = sign_hash(&signing_hash(&tx, 0).unwrap(), &kp);
        let mut tampered = tx.clone();
        tampered.outputs[0].amount += 1;
        assert_eq!(
            verify_witness(&tampered, 0, &witness, &kp.public_key().key_hash()).unwrap_err(),
            CryptoError::VerificationFailed
        );
    }
}
