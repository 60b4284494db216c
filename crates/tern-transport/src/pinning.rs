//! Certificate pinning on top of WebPKI chain validation.
//!
//! [`PinnedCertVerifier`] first runs the standard WebPKI verifier (chain,
//! validity period, hostname). Only if that succeeds does it compare the leaf
//! certificate against the configured pins:
//!
//! 1. SHA-256 of the leaf SubjectPublicKeyInfo must be one of the public-key pins.
//! 2. SHA-256 of the full leaf DER must equal the certificate pin.
//!
//! rustls calls the verifier on full handshakes only; resumed sessions reuse
//! the result of the handshake that created them.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::TransportError;

/// A SHA-256 fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// SHA-256 of arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl FromStr for Fingerprint {
    type Err = TransportError;

    /// Accepts 64 hex digits, optionally separated by colons
    /// (`AB:CD:...` as printed by openssl).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.trim().chars().filter(|c| *c != ':').collect();
        let mut out = [0u8; 32];
        hex::decode_to_slice(&cleaned, &mut out)
            .map_err(|e| TransportError::Config(format!("bad fingerprint {s:?}: {e}")))?;
        Ok(Self(out))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Pins the leaf certificate must satisfy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinSet {
    /// Accepted SubjectPublicKeyInfo fingerprints.
    pub public_keys: Vec<Fingerprint>,
    /// Fingerprint of the full leaf certificate.
    pub certificate: Fingerprint,
}

/// Why a leaf certificate was rejected by the pin check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFailure {
    Unparsable,
    PublicKey,
    Certificate,
}

impl fmt::Display for PinFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinFailure::Unparsable => f.write_str("leaf certificate could not be parsed"),
            PinFailure::PublicKey => f.write_str("public key pin mismatch"),
            PinFailure::Certificate => f.write_str("certificate pin mismatch"),
        }
    }
}

impl PinSet {
    /// Check a DER-encoded leaf certificate against both pins.
    pub fn check(&self, leaf_der: &[u8]) -> Result<(), PinFailure> {
        let spki = spki_fingerprint(leaf_der).ok_or(PinFailure::Unparsable)?;
        if !self.public_keys.contains(&spki) {
            return Err(PinFailure::PublicKey);
        }
        if Fingerprint::of(leaf_der) != self.certificate {
            return Err(PinFailure::Certificate);
        }
        Ok(())
    }
}

/// SHA-256 of the SubjectPublicKeyInfo of a DER certificate.
pub fn spki_fingerprint(cert_der: &[u8]) -> Option<Fingerprint> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    Some(Fingerprint::of(cert.public_key().raw))
}

/// WebPKI verification followed by the pin check.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: PinSet,
}

impl PinnedCertVerifier {
    pub fn new(
        roots: RootCertStore,
        pins: PinSet,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TransportError> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| TransportError::Config(format!("building verifier: {e}")))?;
        Ok(Self { inner, pins })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .inspect_err(|e| warn!(server = ?server_name, error = %e, "certificate chain rejected"))?;

        if let Err(failure) = self.pins.check(end_entity.as_ref()) {
            warn!(server = ?server_name, %failure, "certificate pin rejected");
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }

        debug!(server = ?server_name, "certificate pins matched");
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Mozilla roots plus any extra trust anchors.
pub fn root_store(extra: &[CertificateDer<'static>]) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in extra {
        roots
            .add(cert.clone())
            .map_err(|e| TransportError::Config(format!("extra CA: {e}")))?;
    }
    Ok(roots)
}

/// Load PEM certificates from a file.
pub fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Config(format!("opening {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Config(format!("reading {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TransportError::Config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// rustls client config that enforces `pins` on every full handshake.
pub fn pinned_client_config(
    pins: PinSet,
    extra_roots: &[CertificateDer<'static>],
) -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PinnedCertVerifier::new(root_store(extra_roots)?, pins, provider.clone())?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Config(format!("protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}
