//! Local TLS server for pinning tests.
//!
//! Generates a throwaway CA and a leaf for `localhost`/`127.0.0.1`, then
//! serves HTTP/1.1 over tokio-rustls on an ephemeral port. The server counts
//! the application bytes it receives, so tests can tell whether a request
//! body ever left the client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tern_transport::pinning::spki_fingerprint;
use tern_transport::{Fingerprint, TransportConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// What the server does after reading a request.
#[derive(Clone, Debug)]
pub enum Reply {
    /// `200 OK` with this JSON body.
    Json(String),
    /// Non-success status with a plain body.
    Status(u16, String),
    /// Read the request, then never answer.
    Silent,
}

/// Throwaway CA and the leaf it signed.
pub struct TestPki {
    pub ca: CertificateDer<'static>,
    pub leaf: CertificateDer<'static>,
    leaf_key: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().expect("ca key");
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "tern test ca");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).expect("ca cert");

        let leaf_key = KeyPair::generate().expect("leaf key");
        let mut leaf_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).expect("leaf params");
        leaf_params.distinguished_name.push(DnType::CommonName, "localhost");
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).expect("leaf cert");

        Self {
            ca: ca.der().clone(),
            leaf: leaf.der().clone(),
            leaf_key: leaf_key.serialize_der(),
        }
    }

    /// SHA-256 of the leaf SubjectPublicKeyInfo.
    pub fn public_key_pin(&self) -> Fingerprint {
        spki_fingerprint(self.leaf.as_ref()).expect("leaf parses")
    }

    /// SHA-256 of the full leaf certificate.
    pub fn certificate_pin(&self) -> Fingerprint {
        Fingerprint::of(self.leaf.as_ref())
    }

    fn server_config(&self) -> rustls::ServerConfig {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key.clone()));
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_no_client_auth()
            .with_single_cert(vec![self.leaf.clone(), self.ca.clone()], key)
            .expect("server cert")
    }
}

/// A running TLS server. Aborted on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub pki: Arc<TestPki>,
    received: Arc<AtomicUsize>,
    handshakes: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(pki: TestPki, reply: Reply) -> Self {
        let pki = Arc::new(pki);
        let acceptor = TlsAcceptor::from(Arc::new(pki.server_config()));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let received = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let (received, handshakes, requests) =
                (Arc::clone(&received), Arc::clone(&handshakes), Arc::clone(&requests));
            tokio::spawn(async move {
                loop {
                    let Ok((tcp, _)) = listener.accept().await else {
                        return;
                    };
                    let acceptor = acceptor.clone();
                    let reply = reply.clone();
                    let (received, handshakes, requests) =
                        (Arc::clone(&received), Arc::clone(&handshakes), Arc::clone(&requests));
                    tokio::spawn(async move {
                        let mut tls = match acceptor.accept(tcp).await {
                            Ok(s) => s,
                            Err(e) => {
                                debug!(error = %e, "test server handshake failed");
                                return;
                            }
                        };
                        handshakes.fetch_add(1, Ordering::SeqCst);
                        let request = read_request(&mut tls).await;
                        received.fetch_add(request.len(), Ordering::SeqCst);
                        if let Ok(mut log) = requests.lock() {
                            log.push(String::from_utf8_lossy(&request).into_owned());
                        }
                        let response = match reply {
                            Reply::Json(body) => http_response(200, "OK", "application/json", &body),
                            Reply::Status(code, body) => http_response(code, "Error", "text/plain", &body),
                            Reply::Silent => {
                                std::future::pending::<()>().await;
                                return;
                            }
                        };
                        let _ = tls.write_all(response.as_bytes()).await;
                        let _ = tls.shutdown().await;
                    });
                }
            })
        };

        Self {
            addr,
            pki,
            received,
            handshakes,
            requests,
            task,
        }
    }

    /// `https://127.0.0.1:<port>`
    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}", self.addr.port())
    }

    /// Transport config for this server with the correct pins.
    pub fn pinned_config(&self) -> TransportConfig {
        TransportConfig::new(
            &self.url(),
            &self.pki.public_key_pin().to_string(),
            &self.pki.certificate_pin().to_string(),
        )
    }

    /// Application bytes read from clients so far.
    pub fn bytes_received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Raw text of every request read so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Handshakes the server side completed.
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Read headers plus a `Content-Length` body. Returns whatever arrived
/// before the peer closed or errored.
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let wanted = end + 4 + content_length(&buf[..end]);
            if buf.len() >= wanted {
                return buf;
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return buf,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn content_length(headers: &[u8]) -> usize {
    String::from_utf8_lossy(headers)
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())
                .flatten()
        })
        .unwrap_or(0)
}

fn http_response(code: u16, reason: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}
