//! Backend HTTP/JSON API.
//!
//! [`BackendApi`] is the seam the wallet engine depends on; [`BackendClient`]
//! implements it over [`SecureTransport`]. Every endpoint that takes an
//! address list rejects more than [`MAX_ADDRESSES_PER_REQUEST`] entries before
//! anything is sent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tern_core::address::Address;
use tern_core::constants::MAX_ADDRESSES_PER_REQUEST;
use tern_core::types::{Hash256, Utxo};
use tracing::{debug, info};

use crate::client::{Method, SecureTransport};
use crate::error::TransportError;

pub const UTXO_FOR_ADDRESSES: &str = "/api/txs/utxoForAddresses";
pub const UTXO_SUM_FOR_ADDRESSES: &str = "/api/txs/utxoSumForAddresses";
pub const HISTORY: &str = "/api/txs/history";
pub const SIGNED: &str = "/api/txs/signed";
pub const PENDING: &str = "/api/txs/pending";
pub const FILTER_USED: &str = "/api/addresses/filterUsed";

/// Operations the wallet engine needs from the backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Unspent outputs held by `addresses` (at most 20).
    async fn utxos_for_addresses(&self, addresses: &[Address]) -> Result<Vec<Utxo>, TransportError>;

    /// Sum of unspent outputs held by `addresses` (at most 20).
    async fn utxo_sum_for_addresses(&self, addresses: &[Address]) -> Result<u64, TransportError>;

    /// Transactions touching `addresses` since `date_from`, newest first.
    async fn history(
        &self,
        addresses: &[Address],
        date_from: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, TransportError>;

    /// Unconfirmed transactions touching `addresses`.
    async fn pending(&self, addresses: &[Address]) -> Result<Vec<HistoryEntry>, TransportError>;

    /// Submit a hex-encoded signed transaction.
    async fn send_signed(&self, signed_tx: &str) -> Result<(), TransportError>;

    /// The subset of `addresses` that appear on chain.
    async fn filter_used(&self, addresses: &[Address]) -> Result<Vec<Address>, TransportError>;
}

/// Fail with [`TransportError::BatchTooLarge`] for oversized address lists.
pub fn check_batch(addresses: &[Address]) -> Result<(), TransportError> {
    if addresses.len() > MAX_ADDRESSES_PER_REQUEST {
        return Err(TransportError::BatchTooLarge {
            size: addresses.len(),
            max: MAX_ADDRESSES_PER_REQUEST,
        });
    }
    Ok(())
}

// ── Wire types ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct AddressesRequest<'a> {
    addresses: &'a [Address],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRequest<'a> {
    addresses: &'a [Address],
    date_from: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedRequest<'a> {
    signed_tx: &'a str,
}

/// A UTXO row as returned by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct UtxoRow {
    pub tx_hash: String,
    pub tx_index: u32,
    pub receiver: Address,
    #[serde(deserialize_with = "amount")]
    pub amount: u64,
}

impl UtxoRow {
    /// Validate the row. Zero amounts and bad hashes are malformed.
    pub fn into_utxo(self) -> Result<Utxo, TransportError> {
        let tx_hash = Hash256::from_hex(&self.tx_hash).map_err(|e| {
            TransportError::MalformedResponse(format!("tx_hash {:?}: {e}", self.tx_hash))
        })?;
        if self.amount == 0 {
            return Err(TransportError::MalformedResponse(format!(
                "zero-amount utxo {}:{}",
                self.tx_hash, self.tx_index
            )));
        }
        Ok(Utxo {
            tx_hash,
            output_index: self.tx_index,
            owner: self.receiver,
            amount: self.amount,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SumResponse {
    #[serde(default, deserialize_with = "optional_amount")]
    sum: Option<u64>,
}

/// One transaction in the address history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(with = "hex_hash")]
    pub hash: Hash256,
    pub time: DateTime<Utc>,
    pub inputs_address: Vec<Address>,
    #[serde(deserialize_with = "amounts")]
    pub inputs_amount: Vec<u64>,
    pub outputs_address: Vec<Address>,
    #[serde(deserialize_with = "amounts")]
    pub outputs_amount: Vec<u64>,
    /// Block the transaction was included in; absent while pending.
    #[serde(default)]
    pub block_num: Option<u64>,
}

impl HistoryEntry {
    /// Net effect on `owned` addresses: received minus spent.
    pub fn net_for(&self, owned: &[Address]) -> i128 {
        let sum = |addrs: &[Address], amounts: &[u64]| -> i128 {
            addrs
                .iter()
                .zip(amounts)
                .filter(|(a, _)| owned.contains(*a))
                .map(|(_, v)| *v as i128)
                .sum()
        };
        sum(&self.outputs_address, &self.outputs_amount)
            - sum(&self.inputs_address, &self.inputs_amount)
    }
}

/// Newest first; ties broken by hash, descending.
pub fn sort_history(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.hash.cmp(&a.hash)));
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AmountRepr {
    Number(u64),
    Text(String),
}

impl AmountRepr {
    fn value<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            AmountRepr::Number(n) => Ok(n),
            AmountRepr::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid amount {s:?}"))),
        }
    }
}

/// The backend sends amounts as either JSON numbers or decimal strings.
fn amount<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    AmountRepr::deserialize(d)?.value()
}

fn optional_amount<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    Option::<AmountRepr>::deserialize(d)?
        .map(AmountRepr::value)
        .transpose()
}

fn amounts<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u64>, D::Error> {
    Vec::<AmountRepr>::deserialize(d)?
        .into_iter()
        .map(AmountRepr::value)
        .collect()
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};
    use tern_core::types::Hash256;

    pub fn serialize<S: Serializer>(hash: &Hash256, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(hash)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Hash256, D::Error> {
        let s = String::deserialize(d)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Client ─────────────────────────────────────────────────────────────────

/// [`BackendApi`] over a pinned [`SecureTransport`].
#[derive(Clone, Debug)]
pub struct BackendClient {
    transport: SecureTransport,
}

impl BackendClient {
    pub fn new(transport: SecureTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &SecureTransport {
        &self.transport
    }
}

#[async_trait]
impl BackendApi for BackendClient {
    async fn utxos_for_addresses(&self, addresses: &[Address]) -> Result<Vec<Utxo>, TransportError> {
        check_batch(addresses)?;
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<UtxoRow> = self
            .transport
            .send(UTXO_FOR_ADDRESSES, Method::POST, Some(&AddressesRequest { addresses }))
            .await?;
        debug!(addresses = addresses.len(), rows = rows.len(), "fetched utxos");
        rows.into_iter().map(UtxoRow::into_utxo).collect()
    }

    async fn utxo_sum_for_addresses(&self, addresses: &[Address]) -> Result<u64, TransportError> {
        check_batch(addresses)?;
        if addresses.is_empty() {
            return Ok(0);
        }
        let response: SumResponse = self
            .transport
            .send(UTXO_SUM_FOR_ADDRESSES, Method::POST, Some(&AddressesRequest { addresses }))
            .await?;
        Ok(response.sum.unwrap_or(0))
    }

    async fn history(
        &self,
        addresses: &[Address],
        date_from: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, TransportError> {
        check_batch(addresses)?;
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<HistoryEntry> = self
            .transport
            .send(HISTORY, Method::POST, Some(&HistoryRequest { addresses, date_from }))
            .await?;
        sort_history(&mut entries);
        Ok(entries)
    }

    async fn pending(&self, addresses: &[Address]) -> Result<Vec<HistoryEntry>, TransportError> {
        check_batch(addresses)?;
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<HistoryEntry> = self
            .transport
            .send(PENDING, Method::POST, Some(&AddressesRequest { addresses }))
            .await?;
        sort_history(&mut entries);
        Ok(entries)
    }

    async fn send_signed(&self, signed_tx: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .transport
            .send(SIGNED, Method::POST, Some(&SignedRequest { signed_tx }))
            .await?;
        info!(bytes = signed_tx.len() / 2, "signed transaction accepted by backend");
        Ok(())
    }

    async fn filter_used(&self, addresses: &[Address]) -> Result<Vec<Address>, TransportError> {
        check_batch(addresses)?;
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        self.transport
            .send(FILTER_USED, Method::POST, Some(&AddressesRequest { addresses }))
            .await
    }
}
