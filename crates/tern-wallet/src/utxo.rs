//! UTXO and balance aggregation over the backend.

use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use tern_core::address::Address;
use tern_core::constants::MAX_ADDRESSES_PER_REQUEST;
use tern_core::types::Utxo;
use tern_transport::BackendApi;

use crate::error::WalletError;

/// Fetches unspent outputs and balances for owned addresses.
pub struct UtxoAggregator<B: ?Sized> {
    backend: Arc<B>,
}

impl<B: ?Sized> Clone for UtxoAggregator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: BackendApi + ?Sized> UtxoAggregator<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    fn check_batch(addresses: &[Address]) -> Result<(), WalletError> {
        if addresses.len() > MAX_ADDRESSES_PER_REQUEST {
            return Err(WalletError::BatchTooLarge {
                size: addresses.len(),
                max: MAX_ADDRESSES_PER_REQUEST,
            });
        }
        Ok(())
    }

    /// UTXOs held by at most 20 addresses. Order is unspecified.
    pub async fn fetch_utxos(&self, addresses: &[Address]) -> Result<Vec<Utxo>, WalletError> {
        Self::check_batch(addresses)?;
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let utxos = self
            .backend
            .utxos_for_addresses(addresses)
            .await
            .map_err(WalletError::from_utxo_fetch)?;
        debug!(addresses = addresses.len(), utxos = utxos.len(), "fetched utxos");
        Ok(dedup(utxos))
    }

    /// Balance of at most 20 addresses.
    pub async fn sum_balance(&self, addresses: &[Address]) -> Result<u64, WalletError> {
        Self::check_batch(addresses)?;
        if addresses.is_empty() {
            return Ok(0);
        }
        self.backend
            .utxo_sum_for_addresses(addresses)
            .await
            .map_err(WalletError::from_utxo_fetch)
    }

    /// UTXOs for any number of addresses, fetched in concurrent batches.
    pub async fn fetch_utxos_all(&self, addresses: &[Address]) -> Result<Vec<Utxo>, WalletError> {
        let batches = try_join_all(
            addresses
                .chunks(MAX_ADDRESSES_PER_REQUEST)
                .map(|chunk| self.fetch_utxos(chunk)),
        )
        .await?;
        Ok(dedup(batches.into_iter().flatten().collect()))
    }

    /// Balance of any number of addresses, summed over concurrent batches.
    pub async fn sum_balance_all(&self, addresses: &[Address]) -> Result<u64, WalletError> {
        let sums = try_join_all(
            addresses
                .chunks(MAX_ADDRESSES_PER_REQUEST)
                .map(|chunk| self.sum_balance(chunk)),
        )
        .await?;
        sums.into_iter()
            .try_fold(0u64, |acc, s| acc.checked_add(s))
            .ok_or_else(|| WalletError::UtxoFetch("balance overflow".into()))
    }
}

/// Drop repeated outpoints, keeping the first occurrence.
fn dedup(utxos: Vec<Utxo>) -> Vec<Utxo> {
    let mut seen = HashSet::with_capacity(utxos.len());
    utxos.into_iter().filter(|u| seen.insert(u.outpoint())).collect()
}
