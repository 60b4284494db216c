//! Error types for the core data model.
use thiserror::Error;

use crate::types::TxStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58 encoding")] InvalidEncoding,
    #[error("invalid length: {0}")] InvalidLength(usize),
    #[error("invalid checksum")] InvalidChecksum,
    #[error("unknown address kind: {0}")] UnknownKind(u8),
    #[error("unknown network tag: {0}")] UnknownNetwork(u8),
    #[error("payload too large: {0} bytes")] PayloadTooLarge(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("key hash does not match expected")] KeyHashMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("empty inputs")] EmptyInputs,
    #[error("empty outputs")] EmptyOutputs,
    #[error("zero-value output at index {0}")] ZeroValueOutput(usize),
    #[error("value overflow")] ValueOverflow,
    #[error("witness count {witnesses} does not match input count {inputs}")] WitnessCountMismatch { inputs: usize, witnesses: usize },
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid status transition: {from:?} -> {to:?}")]
pub struct StatusError {
    pub from: TxStatus,
    pub to: TxStatus,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Status(#[from] StatusError),
}
