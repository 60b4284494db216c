//! Transport configuration.
//!
//! Built once and injected into [`SecureTransport`](crate::SecureTransport);
//! there is no process-wide transport state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::TransportError;
use crate::pinning::{Fingerprint, PinSet};

/// Default backend.
pub const DEFAULT_BACKEND_URL: &str = "https://localhost:8080";

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default TCP+TLS connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Backend connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL of the backend. Must be `https`.
    pub backend_url: String,
    /// Hex SHA-256 fingerprints of the accepted leaf SubjectPublicKeyInfo.
    pub public_key_pins: Vec<String>,
    /// Hex SHA-256 fingerprint of the full leaf certificate.
    pub certificate_pin: String,
    /// Upper bound for a whole request, connect through body.
    pub request_timeout_secs: u64,
    /// Upper bound for establishing the connection.
    pub connect_timeout_secs: u64,
    /// Optional PEM bundle of additional trust anchors (private backend CA).
    pub extra_ca_pem: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            public_key_pins: Vec::new(),
            certificate_pin: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            extra_ca_pem: None,
        }
    }
}

impl TransportConfig {
    /// Config for `backend_url` with the given pins and default timeouts.
    pub fn new(backend_url: &str, public_key_pin: &str, certificate_pin: &str) -> Self {
        Self {
            backend_url: backend_url.to_string(),
            public_key_pins: vec![public_key_pin.to_string()],
            certificate_pin: certificate_pin.to_string(),
            ..Self::default()
        }
    }

    /// Parsed and checked backend URL.
    pub fn base_url(&self) -> Result<Url, TransportError> {
        let url = Url::parse(&self.backend_url)
            .map_err(|e| TransportError::Config(format!("backend_url: {e}")))?;
        if url.scheme() != "https" {
            return Err(TransportError::Config(format!(
                "backend_url must use https, got {}",
                url.scheme()
            )));
        }
        Ok(url)
    }

    /// Parsed pin set. At least one public-key pin and a certificate pin are required.
    pub fn pins(&self) -> Result<PinSet, TransportError> {
        if self.public_key_pins.is_empty() {
            return Err(TransportError::Config("no public key pins configured".into()));
        }
        let public_keys = self
            .public_key_pins
            .iter()
            .map(|p| p.parse::<Fingerprint>())
            .collect::<Result<Vec<_>, _>>()?;
        let certificate = self.certificate_pin.parse()?;
        Ok(PinSet {
            public_keys,
            certificate,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reject configurations that cannot produce a working transport.
    pub fn validate(&self) -> Result<(), TransportError> {
        self.base_url()?;
        self.pins()?;
        if self.request_timeout_secs == 0 {
            return Err(TransportError::Config("request_timeout_secs must be > 0".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(TransportError::Config("connect_timeout_secs must be > 0".into()));
        }
        Ok(())
    }
}
