//! Transport error types.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server certificate failed chain validation or did not match the pins.
    /// The detail is for logs only and must not be shown to users.
    #[error("certificate validation failed: {0}")]
    CertificateValidation(String),

    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// TCP/TLS connection could not be established for a reason other than
    /// certificate validation.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response body was not the expected JSON shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// More addresses than a single backend call accepts.
    #[error("batch of {size} addresses exceeds limit of {max}")]
    BatchTooLarge {
        /// Number of addresses submitted.
        size: usize,
        /// Maximum accepted per call.
        max: usize,
    },

    /// Invalid transport configuration.
    #[error("invalid transport config: {0}")]
    Config(String),

    /// Any other request failure.
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Whether the backend rejected a transaction witness.
    pub fn is_invalid_witness(&self) -> bool {
        matches!(self, TransportError::Status { body, .. } if body.contains("Invalid witness"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            TransportError::BatchTooLarge { size: 25, max: 20 }.to_string(),
            "batch of 25 addresses exceeds limit of 20"
        );
        assert_eq!(TransportError::Cancelled.to_string(), "request cancelled");
        assert_eq!(
            TransportError::Status { status: 503, body: "down".into() }.to_string(),
            "backend returned status 503: down"
        );
    }

    #[test]
    fn invalid_witness_detection() {
        let err = TransportError::Status {
            status: 400,
            body: "Invalid witness for input 0".into(),
        };
        assert!(err.is_invalid_witness());
        assert!(!TransportError::Status { status: 400, body: "bad".into() }.is_invalid_witness());
        assert!(!TransportError::Cancelled.is_invalid_witness());
    }
}
