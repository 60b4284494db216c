//! Pinned HTTPS client.
//!
//! Each call is one asynchronous task: connect (with pin validation on new
//! sessions), write the JSON body, read the JSON response. The only
//! suspension points are the network I/O. Every call is bounded by a timeout
//! and may be cancelled through a [`CancellationToken`].

use rustls::pki_types::CertificateDer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error as StdError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::pinning::{load_pem_certs, pinned_client_config};

pub use reqwest::Method;

/// Longest response body excerpt kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Replaces the configured request timeout.
    pub timeout: Option<Duration>,
    /// Aborts the call when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel: Some(cancel),
        }
    }
}

/// HTTPS client bound to one backend and one pin set.
#[derive(Clone, Debug)]
pub struct SecureTransport {
    client: reqwest::Client,
    base: Url,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl SecureTransport {
    /// Build from config, loading `extra_ca_pem` if set.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let extra = match &config.extra_ca_pem {
            Some(path) => load_pem_certs(path)?,
            None => Vec::new(),
        };
        Self::with_extra_roots(config, &extra)
    }

    /// Build from config with additional trust anchors supplied directly.
    pub fn with_extra_roots(
        config: &TransportConfig,
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let tls = pinned_client_config(config.pins()?, extra_roots)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .https_only(true)
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| TransportError::Config(format!("building HTTP client: {e}")))?;

        Ok(Self {
            client,
            base: config.base_url()?,
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Send a request with the configured timeout and no cancellation.
    pub async fn send<B, R>(
        &self,
        path: &str,
        method: Method,
        body: Option<&B>,
    ) -> Result<R, TransportError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send_with(path, method, body, &RequestOptions::default())
            .await
    }

    /// Send a request, honouring the per-call options.
    pub async fn send_with<B, R>(
        &self,
        path: &str,
        method: Method,
        body: Option<&B>,
        options: &RequestOptions,
    ) -> Result<R, TransportError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self
            .base
            .join(path)
            .map_err(|e| TransportError::Config(format!("path {path:?}: {e}")))?;
        let timeout = options.timeout.unwrap_or(self.request_timeout);
        debug!(%method, %url, ?timeout, "backend request");

        let timed = tokio::time::timeout(timeout, self.execute(url, method, body));
        let outcome = match &options.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(path, "backend request cancelled");
                    return Err(TransportError::Cancelled);
                }
                outcome = timed => outcome,
            },
            None => timed.await,
        };

        let bytes = outcome.map_err(|_| {
            warn!(path, ?timeout, "backend request timed out");
            TransportError::Timeout(timeout)
        })??;

        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(path, error = %e, "malformed backend response");
            TransportError::MalformedResponse(e.to_string())
        })
    }

    async fn execute<B>(
        &self,
        url: Url,
        method: Method,
        body: Option<&B>,
    ) -> Result<Vec<u8>, TransportError>
    where
        B: Serialize + ?Sized,
    {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            let body: String = text.chars().take(MAX_ERROR_BODY).collect();
            warn!(status = status.as_u16(), "backend returned error status");
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(bytes.to_vec())
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if let Some(tls) = find_rustls_error(&err) {
            return match tls {
                rustls::Error::InvalidCertificate(_)
                | rustls::Error::NoCertificatesPresented
                | rustls::Error::UnsupportedNameType => {
                    warn!(error = %tls, "backend certificate rejected");
                    TransportError::CertificateValidation(tls.to_string())
                }
                other => TransportError::Connect(other.to_string()),
            };
        }
        if err.is_timeout() {
            return TransportError::Timeout(self.connect_timeout);
        }
        if err.is_connect() {
            return TransportError::Connect(error_chain(&err));
        }
        if err.is_decode() || err.is_body() {
            return TransportError::MalformedResponse(err.to_string());
        }
        TransportError::Request(error_chain(&err))
    }
}

/// Find a rustls error anywhere in the source chain, including inside
/// `io::Error` wrappers (whose `source()` skips the wrapped error).
fn find_rustls_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        if let Some(inner) = e.downcast_ref::<std::io::Error>().and_then(|io| io.get_ref()) {
            current = Some(inner as &(dyn StdError + 'static));
            continue;
        }
        current = e.source();
    }
    None
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        out.push_str(": ");
        out.push_str(&e.to_string());
        source = e.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug)]
    struct Wrapper(Box<dyn StdError + Send + Sync>);

    impl std::fmt::Display for Wrapper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("wrapper")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(self.0.as_ref())
        }
    }

    fn pinned_config() -> TransportConfig {
        TransportConfig::new("https://localhost:1", &"11".repeat(32), &"22".repeat(32))
    }

    #[test]
    fn finds_rustls_error_inside_io_error() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        let io = io::Error::new(io::ErrorKind::InvalidData, tls.clone());
        let wrapped = Wrapper(Box::new(io));
        assert_eq!(find_rustls_error(&wrapped), Some(&tls));
    }

    #[test]
    fn no_rustls_error_in_plain_chain() {
        let io = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let wrapped = Wrapper(Box::new(io));
        assert_eq!(find_rustls_error(&wrapped), None);
    }

    #[test]
    fn error_chain_joins_sources() {
        let wrapped = Wrapper(Box::new(io::Error::other("inner")));
        assert_eq!(error_chain(&wrapped), "wrapper: inner");
    }

    #[test]
    fn transport_requires_valid_config() {
        let mut config = pinned_config();
        config.public_key_pins.clear();
        assert!(matches!(
            SecureTransport::new(&config),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn transport_builds_from_valid_config() {
        let transport = SecureTransport::new(&pinned_config()).unwrap();
        assert_eq!(transport.base_url().as_str(), "https://localhost:1/");
    }

    #[tokio::test]
    async fn cancelled_before_send() {
        let transport = SecureTransport::new(&pinned_config()).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<serde_json::Value, _> = transport
            .send_with::<(), _>(
                "/api/txs/utxoForAddresses",
                Method::POST,
                None,
                &RequestOptions::with_cancel(token),
            )
            .await;
        assert_eq!(result.unwrap_err(), TransportError::Cancelled);
    }
}
