//! Certificate pinning against a real TLS server.
//!
//! Every test starts a tokio-rustls server with a fresh CA on 127.0.0.1 and
//! talks to it through [`SecureTransport`] with that CA as an extra root, so
//! chain validation passes and only the pins decide.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tern_core::address::{Address, Network};
use tern_core::types::Hash256;
use tern_tests::tls::{Reply, TestPki, TestServer};
use tern_transport::{
    BackendApi, BackendClient, Fingerprint, Method, RequestOptions, SecureTransport, TransportConfig, TransportError,
};
use tern_wallet::error::ErrorCategory;
use tern_wallet::{UtxoAggregator, WalletError};
use tokio_util::sync::CancellationToken;

fn addr(b: u8) -> Address {
    Address::from_key_hash(Hash256([b; 32]), Network::Testnet)
}

fn transport(server: &TestServer, config: &TransportConfig) -> SecureTransport {
    SecureTransport::with_extra_roots(config, &[server.pki.ca.clone()]).unwrap()
}

fn client(server: &TestServer, config: &TransportConfig) -> BackendClient {
    BackendClient::new(transport(server, config))
}

fn utxo_rows(owner: &Address) -> String {
    json!([{
        "tx_hash": "ab".repeat(32),
        "tx_index": 1,
        "receiver": owner.to_string(),
        "amount": "1500",
    }])
    .to_string()
}

/// Give a stray server task a moment to record anything it did receive.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn matching_pins_complete_the_request() {
    let owner = addr(1);
    let server = TestServer::start(TestPki::generate(), Reply::Json(utxo_rows(&owner))).await;
    let backend = client(&server, &server.pinned_config());

    let utxos = backend.utxos_for_addresses(&[owner.clone()]).await.unwrap();
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].owner, owner);
    assert_eq!(utxos[0].amount, 1500);
    assert_eq!(utxos[0].output_index, 1);

    assert_eq!(server.handshakes(), 1);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("POST /api/txs/utxoForAddresses "));
    assert!(requests[0].contains(&owner.to_string()));
}

// The leaf fails the pins during the handshake; the request body is never
// sent.
#[tokio::test]
async fn public_key_pin_mismatch_sends_nothing() {
    let server = TestServer::start(TestPki::generate(), Reply::Json("[]".into())).await;
    let mut config = server.pinned_config();
    config.public_key_pins = vec![Fingerprint([0x42; 32]).to_string()];

    let err = client(&server, &config).utxos_for_addresses(&[addr(1)]).await.unwrap_err();
    assert!(matches!(err, TransportError::CertificateValidation(_)), "{err:?}");
    settle().await;
    assert_eq!(server.handshakes(), 0);
    assert_eq!(server.bytes_received(), 0);
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn certificate_pin_mismatch_sends_nothing() {
    let server = TestServer::start(TestPki::generate(), Reply::Json("[]".into())).await;
    let mut config = server.pinned_config();
    config.certificate_pin = Fingerprint([0x42; 32]).to_string();

    let err = client(&server, &config).send_signed("00").await.unwrap_err();
    assert!(matches!(err, TransportError::CertificateValidation(_)), "{err:?}");
    settle().await;
    assert_eq!(server.handshakes(), 0);
    assert_eq!(server.bytes_received(), 0);
}

#[tokio::test]
async fn second_public_key_pin_is_accepted() {
    let server = TestServer::start(TestPki::generate(), Reply::Json(r#"{"sum":"77"}"#.into())).await;
    let mut config = server.pinned_config();
    config.public_key_pins.insert(0, Fingerprint([0x42; 32]).to_string());

    let sum = client(&server, &config).utxo_sum_for_addresses(&[addr(1)]).await.unwrap();
    assert_eq!(sum, 77);
}

#[tokio::test]
async fn untrusted_chain_fails_before_pins() {
    let server = TestServer::start(TestPki::generate(), Reply::Json("[]".into())).await;
    // Correct pins, but the test CA is not a trust anchor.
    let backend = BackendClient::new(SecureTransport::new(&server.pinned_config()).unwrap());

    let err = backend.utxos_for_addresses(&[addr(1)]).await.unwrap_err();
    assert!(matches!(err, TransportError::CertificateValidation(_)), "{err:?}");
    settle().await;
    assert_eq!(server.handshakes(), 0);
    assert_eq!(server.bytes_received(), 0);
}

#[tokio::test]
async fn pin_failure_surfaces_as_untrusted_connection() {
    let server = TestServer::start(TestPki::generate(), Reply::Json("[]".into())).await;
    let mut config = server.pinned_config();
    config.certificate_pin = Fingerprint([0x42; 32]).to_string();
    let aggregator = UtxoAggregator::new(Arc::new(client(&server, &config)));

    let err = aggregator.fetch_utxos(&[addr(1)]).await.unwrap_err();
    assert_eq!(err, WalletError::CertificateValidation);
    assert_eq!(err.category(), ErrorCategory::ConnectionUntrusted);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn silent_server_times_out() {
    let server = TestServer::start(TestPki::generate(), Reply::Silent).await;
    let transport = transport(&server, &server.pinned_config());

    let started = tokio::time::Instant::now();
    let result: Result<serde_json::Value, _> = transport
        .send_with(
            "/api/txs/utxoSumForAddresses",
            Method::POST,
            Some(&json!({ "addresses": [] })),
            &RequestOptions::with_timeout(Duration::from_millis(300)),
        )
        .await;
    assert_eq!(result.unwrap_err(), TransportError::Timeout(Duration::from_millis(300)));
    assert!(started.elapsed() < Duration::from_secs(5));
    settle().await;
    assert!(server.bytes_received() > 0, "request reached the server before it stalled");
}

#[tokio::test]
async fn cancellation_aborts_an_in_flight_request() {
    let server = TestServer::start(TestPki::generate(), Reply::Silent).await;
    let transport = transport(&server, &server.pinned_config());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result: Result<serde_json::Value, _> = transport
        .send_with(
            "/api/txs/pending",
            Method::POST,
            Some(&json!({ "addresses": [] })),
            &RequestOptions::with_cancel(cancel),
        )
        .await;
    assert_eq!(result.unwrap_err(), TransportError::Cancelled);
}

#[tokio::test]
async fn error_status_is_a_retryable_fetch_failure() {
    let server = TestServer::start(TestPki::generate(), Reply::Status(503, "maintenance".into())).await;
    let aggregator = UtxoAggregator::new(Arc::new(client(&server, &server.pinned_config())));

    let err = aggregator.fetch_utxos(&[addr(1)]).await.unwrap_err();
    assert!(matches!(err, WalletError::UtxoFetch(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn malformed_body_is_reported() {
    let server = TestServer::start(TestPki::generate(), Reply::Json("{not json".into())).await;
    let err = client(&server, &server.pinned_config())
        .filter_used(&[addr(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::MalformedResponse(_)), "{err:?}");
}
