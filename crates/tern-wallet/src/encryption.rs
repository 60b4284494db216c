//! AES-256-GCM seed encryption under an Argon2id password key.
//!
//! # Wire format
//! ```text
//! salt (32 bytes) || nonce (12 bytes) || ciphertext + auth_tag
//! ```
//! The Argon2id cost parameters are stored next to the blob (see
//! [`KdfParams`]) so that old blobs stay readable if the defaults change.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::WalletError;

/// Salt length in bytes.
const SALT_LEN: usize = 32;

/// 96-bit GCM nonce.
const NONCE_LEN: usize = 12;

const TAG_LEN: usize = 16;

/// An empty plaintext still carries salt, nonce and tag.
const MIN_ENCRYPTED_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// 19 MiB, 2 passes, 1 lane.
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Derive a 256-bit key from a password and salt with Argon2id.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, WalletError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| WalletError::Encryption(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password, salt, key.as_mut())
        .map_err(|e| WalletError::Encryption(format!("argon2: {e}")))?;
    Ok(key)
}

fn cipher(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<Aes256Gcm, WalletError> {
    let key = derive_key(password, salt, params)?;
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref())))
}

/// Seal `plaintext` under `password` with a fresh random salt and nonce.
pub fn encrypt(
    plaintext: &[u8],
    password: &[u8],
    params: &KdfParams,
) -> Result<Vec<u8>, WalletError> {
    let mut header = [0u8; SALT_LEN + NONCE_LEN];
    OsRng.fill_bytes(&mut header);
    let (salt, nonce) = header.split_at(SALT_LEN);

    let sealed = cipher(password, salt, params)?
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| WalletError::Encryption("aes-gcm seal failed".into()))?;
    Ok([header.as_slice(), &sealed].concat())
}

/// Open a blob produced by [`encrypt`].
///
/// A wrong password and a tampered blob are indistinguishable; both yield
/// [`WalletError::Decryption`].
pub fn decrypt(
    blob: &[u8],
    password: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<Vec<u8>>, WalletError> {
    if blob.len() < MIN_ENCRYPTED_LEN {
        return Err(WalletError::CorruptedData(format!(
            "sealed seed is {} bytes, need at least {MIN_ENCRYPTED_LEN}",
            blob.len()
        )));
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);

    cipher(password, salt, params)?
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map(Zeroizing::new)
        .map_err(|_| WalletError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cheap parameters so the tests stay fast.
    const FAST: KdfParams = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };

    #[test]
    fn sealed_seed_opens_with_its_password() {
        let seed = [7u8; 64];
        let blob = encrypt(&seed, b"tern", &FAST).unwrap();
        assert_eq!(blob.len(), MIN_ENCRYPTED_LEN + seed.len());
        assert_eq!(decrypt(&blob, b"tern", &FAST).unwrap().as_slice(), seed);
    }

    #[test]
    fn empty_plaintext_is_header_and_tag() {
        let blob = encrypt(b"", b"pw", &FAST).unwrap();
        assert_eq!(blob.len(), MIN_ENCRYPTED_LEN);
        assert!(decrypt(&blob, b"pw", &FAST).unwrap().is_empty());
    }

    #[test]
    fn wrong_password_is_decryption_error() {
        let blob = encrypt(b"secret", b"correct", &FAST).unwrap();
        assert_eq!(decrypt(&blob, b"wrong", &FAST).unwrap_err(), WalletError::Decryption);
    }

    #[test]
    fn different_params_fail() {
        let encrypted = encrypt(b"secret", b"pw", &FAST).unwrap();
        let other = KdfParams {
            iterations: 2,
            ..FAST
        };
        assert_eq!(decrypt(&encrypted, b"pw", &other).unwrap_err(), WalletError::Decryption);
    }

    #[test]
    fn short_blob_is_corrupted() {
        let err = decrypt(&[0u8; MIN_ENCRYPTED_LEN - 1], b"pw", &FAST).unwrap_err();
        assert!(matches!(err, WalletError::CorruptedData(_)));
    }

    #[test]
    fn flipped_bit_anywhere_is_rejected() {
        let blob = encrypt(b"secret data", b"pw", &FAST).unwrap();
        for i in [0, SALT_LEN, SALT_LEN + NONCE_LEN, blob.len() - 1] {
            let mut bad = blob.clone();
            bad[i] ^= 0x01;
            assert_eq!(decrypt(&bad, b"pw", &FAST).unwrap_err(), WalletError::Decryption, "byte {i}");
        }
    }

    #[test]
    fn fresh_salt_and_nonce_each_time() {
        let a = encrypt(b"same", b"pw", &FAST).unwrap();
        let b = encrypt(b"same", b"pw", &FAST).unwrap();
        assert_ne!(a[..SALT_LEN], b[..SALT_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn same_salt_same_key() {
        let k1 = derive_key(b"pw", &[1u8; SALT_LEN], &FAST).unwrap();
        let k2 = derive_key(b"pw", &[1u8; SALT_LEN], &FAST).unwrap();
        let k3 = derive_key(b"pw", &[2u8; SALT_LEN], &FAST).unwrap();
        assert_eq!(*k1, *k2);
        assert_ne!(*k1, *k3);
    }

    #[test]
    fn invalid_params_rejected() {
        let bad = KdfParams {
            memory_kib: 1,
            iterations: 0,
            parallelism: 0,
        };
        assert!(matches!(
            encrypt(b"x", b"pw", &bad),
            Err(WalletError::Encryption(_))
        ));
    }
}
