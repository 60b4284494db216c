//! Wallet composition: seed vault, address book, UTXO cache and spending.
//!
//! [`WalletEngine`] ties together key derivation, address recovery, UTXO
//! aggregation, input selection and transaction building over a
//! [`BackendApi`]. It keeps an in-memory view only; persisting the owned
//! address list and UTXO cache is the caller's job.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use tern_core::address::{Address, Network};
use tern_core::constants::MAX_ADDRESSES_PER_REQUEST;
use tern_core::types::{OutPoint, TxStatus, Utxo};
use tern_transport::{BackendApi, HistoryEntry};

use crate::builder::{BuiltTransaction, KeyChainSigner, TransactionBuilder};
use crate::coin_selection::{GroupingPolicy, InputSelector, Payment, SpendPlan};
use crate::encryption::KdfParams;
use crate::error::WalletError;
use crate::fee::FeePolicy;
use crate::keys::{self, Chain, DerivationPath, KeyChain, SeedScheme, WalletSeed};
use crate::mnemonic::WordCount;
use crate::recovery::{AddressBook, Checker, WalletAddress};
use crate::utxo::UtxoAggregator;
use crate::vault::SeedVault;

/// Engine settings that do not come from the seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalletOptions {
    pub network: Network,
    pub fees: FeePolicy,
    pub kdf: KdfParams,
}

/// One wallet over one backend.
pub struct WalletEngine<B: BackendApi + ?Sized> {
    vault: SeedVault,
    network: Network,
    backend: Arc<B>,
    utxos: UtxoAggregator<B>,
    selector: InputSelector,
    book: AddressBook,
    /// Last fetched UTXOs by outpoint.
    utxo_cache: HashMap<OutPoint, Utxo>,
}

impl<B: BackendApi + ?Sized> WalletEngine<B> {
    /// Engine over an existing (possibly encrypted) seed.
    pub fn from_seed(seed: WalletSeed, backend: Arc<B>, options: WalletOptions) -> Self {
        Self {
            vault: SeedVault::new(seed, options.kdf),
            network: options.network,
            utxos: UtxoAggregator::new(Arc::clone(&backend)),
            backend,
            selector: InputSelector::new(options.fees),
            book: AddressBook::new(),
            utxo_cache: HashMap::new(),
        }
    }

    /// Restore a wallet from its recovery phrase. With a password the seed
    /// is held encrypted and every later derivation needs it.
    pub async fn restore(
        phrase: &str,
        word_count: WordCount,
        scheme: SeedScheme,
        password: Option<&[u8]>,
        backend: Arc<B>,
        options: WalletOptions,
    ) -> Result<Self, WalletError> {
        let seed = seed_from_phrase(phrase, word_count, scheme, password, options.kdf).await?;
        info!(?scheme, encrypted = seed.is_encrypted(), "wallet restored");
        Ok(Self::from_seed(seed, backend, options))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn vault(&self) -> &SeedVault {
        &self.vault
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.book
    }

    /// Add previously persisted addresses without re-checking them.
    pub fn load_addresses(&mut self, entries: impl IntoIterator<Item = WalletAddress>) -> usize {
        self.book.extend(entries)
    }

    /// Derive the next unused address on `chain` and add it to the book.
    pub async fn next_address(&mut self, chain: Chain, password: Option<&[u8]>) -> Result<WalletAddress, WalletError> {
        let entry = self.peek_address(chain, password).await?;
        self.book.insert(entry.clone());
        debug!(path = %entry.path, "derived new address");
        Ok(entry)
    }

    /// The address [`Self::next_address`] would return, without recording it.
    async fn peek_address(&self, chain: Chain, password: Option<&[u8]>) -> Result<WalletAddress, WalletError> {
        let root = self.vault.unlock(password).await?;
        let mut keychain = KeyChain::new(&root, self.network)?;
        let path = DerivationPath::wallet(chain, self.book.next_index(chain));
        Ok(WalletAddress::new(keychain.address_at(path)?, path))
    }

    /// Classify `candidates` and add the owned ones to the book.
    pub async fn recover_addresses(
        &mut self,
        candidates: &[Address],
        password: Option<&[u8]>,
    ) -> Result<Vec<WalletAddress>, WalletError> {
        let checker = {
            let root = self.vault.unlock(password).await?;
            Checker::new(&root)?
        };
        let found = checker.classify(candidates);
        let added = self.book.extend(found.iter().cloned());
        info!(candidates = candidates.len(), owned = found.len(), added, "address recovery finished");
        Ok(found)
    }

    /// Walk `chain` in windows of 20 addresses, asking the backend which are
    /// used, until a whole window is unused. Adds every address up to the
    /// last used one.
    pub async fn discover_used(&mut self, chain: Chain, password: Option<&[u8]>) -> Result<usize, WalletError> {
        let root = self.vault.unlock(password).await?;
        let mut keychain = KeyChain::new(&root, self.network)?;
        let mut start = self.book.next_index(chain);
        let mut added = 0;

        loop {
            let window: Vec<WalletAddress> = (start..start + MAX_ADDRESSES_PER_REQUEST as u32)
                .map(|i| {
                    let path = DerivationPath::wallet(chain, i);
                    keychain.address_at(path).map(|a| WalletAddress::new(a, path))
                })
                .collect::<Result<_, _>>()?;
            let candidates: Vec<Address> = window.iter().map(|w| w.address.clone()).collect();
            let used: HashSet<Address> = self.backend.filter_used(&candidates).await?.into_iter().collect();

            let Some(last) = window.iter().rposition(|w| used.contains(&w.address)) else {
                break;
            };
            for mut entry in window.into_iter().take(last + 1) {
                entry.used = used.contains(&entry.address);
                if self.book.insert(entry) {
                    added += 1;
                }
            }
            start += last as u32 + 1;
        }

        info!(?chain, added, "address discovery finished");
        Ok(added)
    }

    /// Fetch UTXOs for every owned address and refresh cached balances.
    pub async fn refresh_utxos(&mut self) -> Result<Vec<Utxo>, WalletError> {
        let addresses = self.book.addresses();
        let utxos = self.utxos.fetch_utxos_all(&addresses).await?;

        let mut balances: HashMap<&Address, u64> = HashMap::new();
        for u in &utxos {
            let b = balances.entry(&u.owner).or_default();
            *b = b.saturating_add(u.amount);
        }
        for addr in &addresses {
            let balance = balances.get(addr).copied().unwrap_or(0);
            self.book.set_balance(addr, balance);
            if balance > 0 {
                self.book.mark_used(addr);
            }
        }

        self.utxo_cache = utxos.iter().map(|u| (u.outpoint(), u.clone())).collect();
        debug!(utxos = utxos.len(), "utxo cache refreshed");
        Ok(utxos)
    }

    /// Spendable UTXOs from the last refresh.
    pub fn cached_utxos(&self) -> Vec<Utxo> {
        self.utxo_cache.values().cloned().collect()
    }

    /// Backend balance of every owned address.
    pub async fn balance(&self) -> Result<u64, WalletError> {
        self.utxos.sum_balance_all(&self.book.addresses()).await
    }

    /// Plan a payment from the cached UTXOs.
    ///
    /// The next internal address is offered as change and is only added to
    /// the book when the plan actually pays change to it.
    pub async fn plan_payment(
        &mut self,
        receiver: &Address,
        amount: u64,
        policy: GroupingPolicy,
        metadata_size: usize,
        password: Option<&[u8]>,
    ) -> Result<SpendPlan, WalletError> {
        if receiver.network() != self.network {
            return Err(WalletError::InvalidAddress(format!(
                "receiver is on {}, wallet is on {}",
                receiver.network(),
                self.network
            )));
        }
        let change = self.peek_address(Chain::Internal, password).await?;
        let payment = Payment {
            receiver: receiver.clone(),
            amount,
            change_address: change.address.clone(),
            metadata_size,
        };
        let plan = self.selector.select(&self.cached_utxos(), &payment, policy)?;
        if plan.change.is_some() {
            debug!(path = %change.path, "reserved change address");
            self.book.insert(change);
        }
        Ok(plan)
    }

    /// Sign `plan` and broadcast it. Spent UTXOs leave the cache once the
    /// backend accepts the transaction.
    pub async fn send(
        &mut self,
        plan: &SpendPlan,
        metadata: Option<Vec<u8>>,
        password: Option<&[u8]>,
    ) -> Result<BuiltTransaction, WalletError> {
        let owners: Vec<WalletAddress> = plan
            .inputs
            .iter()
            .map(|u| {
                self.book
                    .get(&u.owner)
                    .cloned()
                    .ok_or_else(|| WalletError::KeyNotFound(format!("{} is not a wallet address", u.owner)))
            })
            .collect::<Result<_, _>>()?;

        let mut built = {
            let root = self.vault.unlock(password).await?;
            let mut keychain = KeyChain::new(&root, self.network)?;
            let signer = KeyChainSigner::new(&mut keychain, &owners)?;
            let mut builder = TransactionBuilder::from_plan(plan);
            if let Some(metadata) = metadata {
                builder.set_metadata(metadata);
            }
            TransactionBuilder::sign(builder.build_unsigned()?, &signer)?
        };

        self.broadcast(&mut built).await?;
        for u in &plan.inputs {
            self.utxo_cache.remove(&u.outpoint());
            self.book.mark_used(&u.owner);
        }
        Ok(built)
    }

    /// Move every fund of a legacy wallet to a fresh address of this one.
    ///
    /// The legacy phrase's addresses are found among `candidates`; their
    /// UTXOs are spent to a single output with no change.
    pub async fn sweep_legacy(
        &mut self,
        legacy_phrase: &str,
        word_count: WordCount,
        candidates: &[Address],
        password: Option<&[u8]>,
    ) -> Result<BuiltTransaction, WalletError> {
        let legacy = seed_from_phrase(legacy_phrase, word_count, SeedScheme::Legacy, None, KdfParams::default()).await?;
        let legacy_root = keys::derive_root(&legacy, None)?;
        let owned = Checker::new(&legacy_root)?.classify(candidates);
        if owned.is_empty() {
            return Err(WalletError::NotEnoughMoney {
                available: 0,
                required: 1,
            });
        }

        let addresses: Vec<Address> = owned.iter().map(|w| w.address.clone()).collect();
        let utxos = self.utxos.fetch_utxos_all(&addresses).await?;
        let receiver = self.next_address(Chain::External, password).await?;
        let plan = self.selector.sweep(&utxos, &receiver.address)?;

        let mut built = {
            let mut keychain = KeyChain::new(&legacy_root, self.network)?;
            let signer = KeyChainSigner::new(&mut keychain, &owned)?;
            TransactionBuilder::build(&plan, &signer)?
        };
        self.broadcast(&mut built).await?;
        info!(
            inputs = plan.inputs.len(),
            amount = plan.outputs[0].amount,
            fee = plan.fee,
            "legacy funds swept"
        );
        Ok(built)
    }

    async fn broadcast(&self, built: &mut BuiltTransaction) -> Result<(), WalletError> {
        let txid = built.txid()?;
        if let Err(e) = self.backend.send_signed(&built.to_hex()?).await {
            warn!(%txid, error = %e, "broadcast rejected");
            return Err(e.into());
        }
        built.transition(TxStatus::Broadcast)?;
        info!(%txid, "transaction broadcast");
        Ok(())
    }

    /// Transactions touching owned addresses since `since`, newest first.
    pub async fn history(&self, since: DateTime<Utc>) -> Result<Vec<HistoryEntry>, WalletError> {
        let mut entries = Vec::new();
        for chunk in self.book.addresses().chunks(MAX_ADDRESSES_PER_REQUEST) {
            entries.extend(self.backend.history(chunk, since).await?);
        }
        dedup_history(&mut entries);
        Ok(entries)
    }

    /// Unconfirmed transactions touching owned addresses.
    pub async fn pending(&self) -> Result<Vec<HistoryEntry>, WalletError> {
        let mut entries = Vec::new();
        for chunk in self.book.addresses().chunks(MAX_ADDRESSES_PER_REQUEST) {
            entries.extend(self.backend.pending(chunk).await?);
        }
        dedup_history(&mut entries);
        Ok(entries)
    }

    /// The subset of `addresses` that appear on chain; marks owned ones used.
    pub async fn filter_used(&mut self, addresses: &[Address]) -> Result<Vec<Address>, WalletError> {
        let mut used = Vec::new();
        for chunk in addresses.chunks(MAX_ADDRESSES_PER_REQUEST) {
            used.extend(self.backend.filter_used(chunk).await?);
        }
        for a in &used {
            self.book.mark_used(a);
        }
        Ok(used)
    }

    /// Change the seed password (None stores it unencrypted).
    pub async fn change_password(&self, old: Option<&[u8]>, new: Option<&[u8]>) -> Result<(), WalletError> {
        self.vault.change_password(old, new).await
    }
}

/// Validate and derive a seed off the async runtime.
async fn seed_from_phrase(
    phrase: &str,
    word_count: WordCount,
    scheme: SeedScheme,
    password: Option<&[u8]>,
    kdf: KdfParams,
) -> Result<WalletSeed, WalletError> {
    let phrase = Zeroizing::new(phrase.to_owned());
    let password = password.map(|p| Zeroizing::new(p.to_vec()));
    tokio::task::spawn_blocking(move || {
        WalletSeed::from_mnemonic(&phrase, word_count, scheme, password.as_deref().map(Vec::as_slice), kdf)
    })
    .await
    .map_err(|e| WalletError::KeyDerivation(format!("seed task failed: {e}")))?
}

/// Merge batch results: one entry per hash, newest first, then by hash.
fn dedup_history(entries: &mut Vec<HistoryEntry>) {
    entries.sort_by(|a, b| b.time.cmp(&a.time).then(b.hash.cmp(&a.hash)));
    entries.dedup_by(|a, b| a.hash == b.hash);
}
