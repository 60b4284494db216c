//! # tern-core
//! Foundation types for the Tern wallet engine: addresses with encrypted
//! derivation payloads, UTXOs, transactions and their signing hashes.

pub mod address;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod types;
