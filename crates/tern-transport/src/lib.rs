//! # tern-transport
//! HTTPS transport to the wallet backend. Every connection is validated
//! against the WebPKI roots and then against two pinned SHA-256
//! fingerprints (leaf public key and full leaf certificate) before any
//! request bytes leave the client.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod pinning;

pub use api::{BackendApi, BackendClient, HistoryEntry};
pub use client::{Method, RequestOptions, SecureTransport};
pub use config::TransportConfig;
pub use error::TransportError;
pub use pinning::{Fingerprint, PinSet};
