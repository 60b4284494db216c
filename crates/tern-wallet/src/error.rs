//! Wallet error types.

use std::fmt;
use tern_core::error::{CryptoError, StatusError, TransactionError};
use tern_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Wrong word count, unknown word or checksum mismatch.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Wrong password, or the encrypted seed was tampered with.
    #[error("decryption failed")]
    Decryption,

    /// More addresses than one backend call accepts.
    #[error("batch of {size} addresses exceeds limit of {max}")]
    BatchTooLarge {
        /// Number of addresses submitted.
        size: usize,
        /// Per-call limit.
        max: usize,
    },

    /// The backend could not provide UTXO data.
    #[error("utxo fetch failed: {0}")]
    UtxoFetch(String),

    /// Spendable funds do not cover the amount being sent.
    #[error("not enough money: have {available}, need {required}")]
    NotEnoughMoney {
        /// Spendable balance in base units.
        available: u64,
        /// Amount requested.
        required: u64,
    },

    /// Funds cover the amount but not the amount plus fee.
    #[error("insufficient funds for fee: have {available}, need {required}")]
    InsufficientFundsForFee {
        /// Spendable balance in base units.
        available: u64,
        /// Amount plus fee.
        required: u64,
    },

    /// Covering the payment needs more inputs than fit in one transaction.
    #[error("transaction of {size} bytes exceeds limit of {max}")]
    TransactionTooLarge {
        /// Estimated size of the smallest covering transaction.
        size: u64,
        /// Largest encodable transaction.
        max: u64,
    },

    /// Only funds already held by the receiver could cover the payment.
    #[error("all spendable funds are already at the receiver address")]
    AllFundsAlreadyAtReceiver,

    /// The only sending address is the receiver.
    #[error("sender and receiver are the same address")]
    SameAddress,

    /// Funds cannot be sent to a redemption address.
    #[error("cannot send to a redemption address")]
    RedeemAddress,

    /// A transaction needs at least one input.
    #[error("transaction has no inputs")]
    EmptyInputSet,

    /// The backend certificate failed validation or pinning. Fatal for the session.
    #[error("backend certificate rejected")]
    CertificateValidation,

    /// A backend call exceeded its timeout.
    #[error("backend request timed out")]
    TransportTimeout,

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend rejected a transaction witness.
    #[error("backend rejected transaction witness")]
    InvalidWitness,

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid address string.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Key derivation failure.
    #[error("key derivation: {0}")]
    KeyDerivation(String),

    /// Encryption failure.
    #[error("encryption: {0}")]
    Encryption(String),

    /// Stored data is corrupted or has an invalid format.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// No signing key for an input owner.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Transaction lifecycle violation.
    #[error(transparent)]
    InvalidTransition(#[from] StatusError),

    /// Serialization error.
    #[error("serialization: {0}")]
    Serialization(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Cryptographic error from tern-core.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Transaction validation error from tern-core.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl WalletError {
    /// Transport failures are safe to retry with backoff. Everything else is
    /// deterministic or, for certificate errors, fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::UtxoFetch(_) | WalletError::TransportTimeout | WalletError::Backend(_)
        )
    }

    /// Map a transport error raised while fetching UTXO data.
    pub fn from_utxo_fetch(err: TransportError) -> Self {
        match err {
            TransportError::CertificateValidation(_)
            | TransportError::Timeout(_)
            | TransportError::Cancelled
            | TransportError::BatchTooLarge { .. } => err.into(),
            other => WalletError::UtxoFetch(other.to_string()),
        }
    }

    /// The user-facing category for this error.
    pub fn category(&self) -> ErrorCategory {
        use WalletError::*;
        match self {
            InvalidMnemonic(_) => ErrorCategory::InvalidRecoveryPhrase,
            Decryption => ErrorCategory::WrongPassword,
            NotEnoughMoney { .. } | InsufficientFundsForFee { .. } | AllFundsAlreadyAtReceiver => {
                ErrorCategory::NotEnoughFunds
            }
            SameAddress | RedeemAddress | InvalidAddress(_) => ErrorCategory::InvalidReceiver,
            InvalidAmount(_) => ErrorCategory::InvalidAmount,
            EmptyInputSet
            | TransactionTooLarge { .. }
            | InvalidWitness
            | InvalidTransition(_)
            | Crypto(_)
            | Transaction(_) => ErrorCategory::TransactionRejected,
            CertificateValidation => ErrorCategory::ConnectionUntrusted,
            UtxoFetch(_) | TransportTimeout | Backend(_) => ErrorCategory::NetworkUnavailable,
            Cancelled => ErrorCategory::Cancelled,
            BatchTooLarge { .. }
            | KeyDerivation(_)
            | Encryption(_)
            | CorruptedData(_)
            | KeyNotFound(_)
            | Serialization(_) => ErrorCategory::Internal,
        }
    }

    /// Fixed human-readable message for the error's category. Never contains
    /// backend-supplied text.
    pub fn user_message(&self) -> &'static str {
        self.category().message()
    }
}

impl From<TransportError> for WalletError {
    fn from(err: TransportError) -> Self {
        if err.is_invalid_witness() {
            return WalletError::InvalidWitness;
        }
        match err {
            TransportError::CertificateValidation(_) => WalletError::CertificateValidation,
            TransportError::Timeout(_) => WalletError::TransportTimeout,
            TransportError::Cancelled => WalletError::Cancelled,
            TransportError::BatchTooLarge { size, max } => WalletError::BatchTooLarge { size, max },
            other => WalletError::Backend(other.to_string()),
        }
    }
}

/// User-visible grouping of wallet errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    InvalidRecoveryPhrase,
    WrongPassword,
    NotEnoughFunds,
    InvalidReceiver,
    InvalidAmount,
    TransactionRejected,
    ConnectionUntrusted,
    NetworkUnavailable,
    Cancelled,
    Internal,
}

impl ErrorCategory {
    pub fn message(self) -> &'static str {
        match self {
            ErrorCategory::InvalidRecoveryPhrase => "invalid recovery phrase",
            ErrorCategory::WrongPassword => "wrong password",
            ErrorCategory::NotEnoughFunds => "not enough funds",
            ErrorCategory::InvalidReceiver => "invalid receiver address",
            ErrorCategory::InvalidAmount => "invalid amount",
            ErrorCategory::TransactionRejected => "transaction could not be completed",
            ErrorCategory::ConnectionUntrusted => "connection untrusted",
            ErrorCategory::NetworkUnavailable => "network unavailable, try again later",
            ErrorCategory::Cancelled => "operation cancelled",
            ErrorCategory::Internal => "internal wallet error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
