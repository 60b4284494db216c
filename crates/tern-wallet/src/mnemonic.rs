//! BIP-39 mnemonic validation and generation.
//!
//! Twelve to twenty-four word phrases go through the `bip39` crate. Nine-word
//! redemption phrases use the same English wordlist and checksum rule
//! (96 bits of entropy, 3 checksum bits) but are below the crate's minimum
//! length, so they are decoded here.

use bip39::{Language, Mnemonic};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::WalletError;

/// Entropy size of a freshly generated wallet phrase (twelve words).
const GENERATED_ENTROPY_LEN: usize = 16;

/// Supported phrase lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WordCount {
    /// Redemption phrases.
    Nine,
    /// Wallet default.
    #[default]
    Twelve,
    Fifteen,
    Eighteen,
    TwentyOne,
    TwentyFour,
}

impl WordCount {
    pub fn words(self) -> usize {
        match self {
            WordCount::Nine => 9,
            WordCount::Twelve => 12,
            WordCount::Fifteen => 15,
            WordCount::Eighteen => 18,
            WordCount::TwentyOne => 21,
            WordCount::TwentyFour => 24,
        }
    }

    pub fn from_words(n: usize) -> Option<Self> {
        match n {
            9 => Some(WordCount::Nine),
            12 => Some(WordCount::Twelve),
            15 => Some(WordCount::Fifteen),
            18 => Some(WordCount::Eighteen),
            21 => Some(WordCount::TwentyOne),
            24 => Some(WordCount::TwentyFour),
            _ => None,
        }
    }

    /// Entropy length in bytes.
    pub fn entropy_len(self) -> usize {
        self.words() * 11 * 32 / 33 / 8
    }
}

impl fmt::Display for WordCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.words())
    }
}

/// A validated phrase and its entropy. Both are zeroized on drop.
pub struct ParsedMnemonic {
    phrase: Zeroizing<String>,
    entropy: Zeroizing<Vec<u8>>,
    word_count: WordCount,
}

impl ParsedMnemonic {
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn entropy(&self) -> &[u8] {
        &self.entropy
    }

    pub fn word_count(&self) -> WordCount {
        self.word_count
    }
}

impl fmt::Debug for ParsedMnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedMnemonic")
            .field("word_count", &self.word_count)
            .field("phrase", &"[REDACTED]")
            .finish()
    }
}

/// Collapse whitespace and lowercase.
pub fn normalize(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Validate `phrase` as a mnemonic of exactly `expected` words.
pub fn validate(phrase: &str, expected: WordCount) -> Result<ParsedMnemonic, WalletError> {
    let normalized = Zeroizing::new(normalize(phrase));
    let found = normalized.split(' ').filter(|w| !w.is_empty()).count();
    if found != expected.words() {
        return Err(WalletError::InvalidMnemonic(format!(
            "expected {expected} words, got {found}"
        )));
    }

    let entropy = match expected {
        WordCount::Nine => decode_short(&normalized)?,
        _ => {
            let m = Mnemonic::parse_in_normalized(Language::English, &normalized)
                .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
            Zeroizing::new(m.to_entropy())
        }
    };

    Ok(ParsedMnemonic {
        phrase: normalized,
        entropy,
        word_count: expected,
    })
}

/// Whether `phrase` is a valid mnemonic of `expected` words.
pub fn is_valid(phrase: &str, expected: WordCount) -> bool {
    validate(phrase, expected).is_ok()
}

/// Generate a new twelve-word wallet phrase from OS randomness.
pub fn generate() -> Result<String, WalletError> {
    use rand::RngCore;
    let mut entropy = Zeroizing::new([0u8; GENERATED_ENTROPY_LEN]);
    rand::rngs::OsRng.fill_bytes(entropy.as_mut());
    let m = Mnemonic::from_entropy_in(Language::English, entropy.as_ref())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    Ok(m.to_string())
}

/// Decode a phrase shorter than the `bip39` crate accepts.
///
/// Each word contributes 11 bits; the trailing `bits / 33` bits are the
/// leading bits of SHA-256 over the entropy.
fn decode_short(normalized: &str) -> Result<Zeroizing<Vec<u8>>, WalletError> {
    let words: Vec<&str> = normalized.split(' ').collect();
    let total_bits = words.len() * 11;
    let checksum_bits = total_bits / 33;
    let entropy_bits = total_bits - checksum_bits;

    let mut bits = Zeroizing::new(Vec::with_capacity(total_bits));
    for word in &words {
        let index = Language::English
            .find_word(word)
            .ok_or_else(|| WalletError::InvalidMnemonic(format!("unknown word {word:?}")))?;
        for shift in (0..11).rev() {
            bits.push((index >> shift) & 1 == 1);
        }
    }

    let mut entropy = Zeroizing::new(vec![0u8; entropy_bits / 8]);
    for (i, bit) in bits[..entropy_bits].iter().enumerate() {
        if *bit {
            entropy[i / 8] |= 0x80 >> (i % 8);
        }
    }

    let digest = Sha256::digest(entropy.as_slice());
    for i in 0..checksum_bits {
        let expected = digest[i / 8] & (0x80 >> (i % 8)) != 0;
        if bits[entropy_bits + i] != expected {
            return Err(WalletError::InvalidMnemonic("checksum mismatch".into()));
        }
    }

    Ok(entropy)
}
