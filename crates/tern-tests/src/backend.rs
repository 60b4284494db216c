//! In-memory backend.
//!
//! Holds a UTXO set, the used-address set and canned history. Submitted
//! transactions are decoded and checked like a real node would: every input
//! must be unspent and carry a valid witness for its owner. Accepted ones
//! spend their inputs and create their outputs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tern_core::address::Address;
use tern_core::crypto;
use tern_core::types::{Hash256, OutPoint, SignedTransaction, Utxo};
use tern_transport::api::check_batch;
use tern_transport::{BackendApi, HistoryEntry, TransportError};
use tracing::debug;

#[derive(Default)]
struct Ledger {
    utxos: BTreeMap<OutPoint, Utxo>,
    used: HashSet<Address>,
    history: Vec<HistoryEntry>,
    pending: Vec<HistoryEntry>,
    submitted: Vec<SignedTransaction>,
    calls: usize,
    next_tx: u64,
    offline: bool,
}

impl Ledger {
    fn call(&mut self) -> Result<(), TransportError> {
        self.calls += 1;
        if self.offline {
            return Err(TransportError::Connect("backend offline".into()));
        }
        Ok(())
    }
}

/// [`BackendApi`] over an in-memory ledger.
#[derive(Default)]
pub struct MemoryBackend {
    ledger: Mutex<Ledger>,
}

fn rejected(reason: impl Into<String>) -> TransportError {
    TransportError::Status {
        status: 400,
        body: reason.into(),
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().expect("ledger lock poisoned")
    }

    /// Credit `amount` to `owner` in a fresh funding transaction.
    pub fn fund(&self, owner: &Address, amount: u64) -> Utxo {
        let mut ledger = self.ledger();
        ledger.next_tx += 1;
        let mut hash = [0xF0; 32];
        hash[..8].copy_from_slice(&ledger.next_tx.to_be_bytes());
        let utxo = Utxo {
            tx_hash: Hash256(hash),
            output_index: 0,
            owner: owner.clone(),
            amount,
        };
        ledger.utxos.insert(utxo.outpoint(), utxo.clone());
        ledger.used.insert(owner.clone());
        utxo
    }

    /// Mark an address as seen on chain without giving it funds.
    pub fn mark_used(&self, address: &Address) {
        self.ledger().used.insert(address.clone());
    }

    pub fn push_history(&self, entry: HistoryEntry) {
        self.ledger().history.push(entry);
    }

    pub fn push_pending(&self, entry: HistoryEntry) {
        self.ledger().pending.push(entry);
    }

    /// Make every call fail with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.ledger().offline = offline;
    }

    /// Number of API calls made so far.
    pub fn calls(&self) -> usize {
        self.ledger().calls
    }

    pub fn submitted(&self) -> Vec<SignedTransaction> {
        self.ledger().submitted.clone()
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.ledger()
            .utxos
            .values()
            .filter(|u| &u.owner == address)
            .map(|u| u.amount)
            .sum()
    }

    pub fn unspent(&self) -> Vec<Utxo> {
        self.ledger().utxos.values().cloned().collect()
    }
}

#[async_trait]
impl BackendApi for MemoryBackend {
    async fn utxos_for_addresses(&self, addresses: &[Address]) -> Result<Vec<Utxo>, TransportError> {
        check_batch(addresses)?;
        let mut ledger = self.ledger();
        ledger.call()?;
        Ok(ledger
            .utxos
            .values()
            .filter(|u| addresses.contains(&u.owner))
            .cloned()
            .collect())
    }

    async fn utxo_sum_for_addresses(&self, addresses: &[Address]) -> Result<u64, TransportError> {
        check_batch(addresses)?;
        let mut ledger = self.ledger();
        ledger.call()?;
        Ok(ledger
            .utxos
            .values()
            .filter(|u| addresses.contains(&u.owner))
            .map(|u| u.amount)
            .sum())
    }

    async fn history(
        &self,
        addresses: &[Address],
        date_from: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, TransportError> {
        check_batch(addresses)?;
        let mut ledger = self.ledger();
        ledger.call()?;
        Ok(ledger
            .history
            .iter()
            .filter(|h| h.time >= date_from && touches(h, addresses))
            .cloned()
            .collect())
    }

    async fn pending(&self, addresses: &[Address]) -> Result<Vec<HistoryEntry>, TransportError> {
        check_batch(addresses)?;
        let mut ledger = self.ledger();
        ledger.call()?;
        Ok(ledger.pending.iter().filter(|h| touches(h, addresses)).cloned().collect())
    }

    async fn send_signed(&self, signed_tx: &str) -> Result<(), TransportError> {
        let mut ledger = self.ledger();
        ledger.call()?;
        let bytes = hex::decode(signed_tx).map_err(|e| rejected(format!("bad hex: {e}")))?;
        let signed = SignedTransaction::from_wire(&bytes).map_err(|e| rejected(e.to_string()))?;
        let tx = &signed.tx;
        tx.validate_structure().map_err(|e| rejected(e.to_string()))?;

        let mut input_total = 0u64;
        for (i, (outpoint, witness)) in tx.inputs.iter().zip(&signed.witnesses).enumerate() {
            let spent = ledger
                .utxos
                .get(outpoint)
                .ok_or_else(|| rejected(format!("input {i} is not unspent")))?;
            crypto::verify_witness(tx, i, witness, &spent.owner.key_hash())
                .map_err(|e| rejected(format!("Invalid witness for input {i}: {e}")))?;
            input_total += spent.amount;
        }
        let output_total = tx.total_output_value().ok_or_else(|| rejected("output overflow"))?;
        if output_total > input_total {
            return Err(rejected("outputs exceed inputs"));
        }

        let txid = tx.txid().map_err(|e| rejected(e.to_string()))?;
        for outpoint in &tx.inputs {
            ledger.utxos.remove(outpoint);
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            let utxo = Utxo {
                tx_hash: txid,
                output_index: index as u32,
                owner: output.address.clone(),
                amount: output.amount,
            };
            ledger.utxos.insert(utxo.outpoint(), utxo);
            ledger.used.insert(output.address.clone());
        }
        debug!(%txid, fee = input_total - output_total, "memory backend accepted transaction");
        ledger.submitted.push(signed);
        Ok(())
    }

    async fn filter_used(&self, addresses: &[Address]) -> Result<Vec<Address>, TransportError> {
        check_batch(addresses)?;
        let mut ledger = self.ledger();
        ledger.call()?;
        Ok(addresses.iter().filter(|a| ledger.used.contains(*a)).cloned().collect())
    }
}

fn touches(entry: &HistoryEntry, addresses: &[Address]) -> bool {
    entry
        .inputs_address
        .iter()
        .chain(&entry.outputs_address)
        .any(|a| addresses.contains(a))
}
