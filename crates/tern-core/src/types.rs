//! Core wallet types: hashes, UTXOs, transactions and their lifecycle.
//!
//! All monetary values are in base units (1 coin = 10^6 units) held as u64.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::address::Address;
use crate::constants::{MAX_TX_SIZE, TX_VERSION};
use crate::error::{StatusError, TransactionError};

/// A 32-byte hash value.
///
/// Used for transaction IDs, signing hashes and address key hashes (all BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// An unspent output owned by one of the wallet's addresses.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Utxo {
    /// Transaction that created the output.
    pub tx_hash: Hash256,
    /// Position of the output within that transaction.
    pub output_index: u32,
    /// Address the output is locked to.
    pub owner: Address,
    /// Value in base units. Always non-zero.
    pub amount: u64,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.tx_hash,
            index: self.output_index,
        }
    }
}

/// A transaction output paying `amount` to `address`.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    pub address: Address,
    pub amount: u64,
}

/// Unsigned transaction body.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Format version.
    pub version: u32,
    /// Outputs being spent.
    pub inputs: Vec<OutPoint>,
    /// New outputs. Change, when present, is the last entry.
    pub outputs: Vec<TxOutput>,
    /// Opaque metadata attached to the transaction.
    pub metadata: Vec<u8>,
}

impl Transaction {
    pub fn new(inputs: Vec<OutPoint>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: TX_VERSION,
            inputs,
            outputs,
            metadata: Vec::new(),
        }
    }

    /// Canonical encoding of the body (bincode, standard config).
    pub fn encode(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    /// Transaction ID: BLAKE3 of the canonical body encoding.
    ///
    /// Witnesses are excluded, so the ID is known before signing.
    pub fn txid(&self) -> Result<Hash256, TransactionError> {
        Ok(Hash256(blake3::hash(&self.encode()?).into()))
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    /// Structural checks that do not need the spent outputs.
    pub fn validate_structure(&self) -> Result<(), TransactionError> {
        if self.inputs.is_empty() {
            return Err(TransactionError::EmptyInputs);
        }
        if self.outputs.is_empty() {
            return Err(TransactionError::EmptyOutputs);
        }
        if let Some(i) = self.outputs.iter().position(|o| o.amount == 0) {
            return Err(TransactionError::ZeroValueOutput(i));
        }
        self.total_output_value()
            .ok_or(TransactionError::ValueOverflow)?;
        Ok(())
    }
}

/// Witness for one input: the owner's public key and its signature over the
/// input's signing hash.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxWitness {
    /// Ed25519 public key (32 bytes).
    pub public_key: [u8; 32],
    /// Ed25519 signature (64 bytes).
    pub signature: Vec<u8>,
}

/// A transaction body with one witness per input, ready for broadcast.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub witnesses: Vec<TxWitness>,
}

impl SignedTransaction {
    pub fn new(tx: Transaction, witnesses: Vec<TxWitness>) -> Result<Self, TransactionError> {
        if tx.inputs.len() != witnesses.len() {
            return Err(TransactionError::WitnessCountMismatch {
                inputs: tx.inputs.len(),
                witnesses: witnesses.len(),
            });
        }
        Ok(Self { tx, witnesses })
    }

    pub fn txid(&self) -> Result<Hash256, TransactionError> {
        self.tx.txid()
    }

    /// Wire encoding: bincode (standard config) of body and witnesses.
    pub fn to_wire(&self) -> Result<Vec<u8>, TransactionError> {
        let bytes = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_TX_SIZE {
            return Err(TransactionError::Oversized {
                size: bytes.len(),
                max: MAX_TX_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Hex form of [`SignedTransaction::to_wire`], as submitted to the backend.
    pub fn to_hex(&self) -> Result<String, TransactionError> {
        Ok(hex::encode(self.to_wire()?))
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, TransactionError> {
        if bytes.len() > MAX_TX_SIZE {
            return Err(TransactionError::Oversized {
                size: bytes.len(),
                max: MAX_TX_SIZE,
            });
        }
        let (signed, read): (Self, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| TransactionError::Serialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(TransactionError::Serialization(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Self::new(signed.tx, signed.witnesses)
    }
}

/// Lifecycle of a transaction built by this engine.
///
/// ```text
/// Draft -> Signed -> Broadcast -> { Confirmed | Failed | Pending }
/// Pending -> { Confirmed | Failed }
/// ```
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxStatus {
    Draft,
    Signed,
    Broadcast,
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Draft, Signed)
                | (Signed, Broadcast)
                | (Broadcast, Confirmed | Failed | Pending)
                | (Pending, Confirmed | Failed)
        )
    }

    /// Move to `next`, or fail if the edge does not exist.
    pub fn transition(&mut self, next: TxStatus) -> Result<(), StatusError> {
        if !self.can_transition_to(next) {
            return Err(StatusError { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }

    /// Confirmed and Failed are terminal.
    pub fn is_final(self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Draft => "draft",
            TxStatus::Signed => "signed",
            TxStatus::Broadcast => "broadcast",
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}
