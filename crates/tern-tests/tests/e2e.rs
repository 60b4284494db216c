//! End-to-end wallet flows against the in-memory backend.
//!
//! Each test restores one or more wallets over a shared [`MemoryBackend`],
//! funds addresses directly in the ledger and drives the engine through
//! recovery, planning, signing and broadcast. The backend verifies every
//! witness and spends inputs exactly like a node would.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use proptest::prelude::*;
use tern_core::address::{Address, Network};
use tern_core::crypto::{self, KeyPair};
use tern_core::types::{Hash256, TxStatus, Utxo};
use tern_tests::backend::MemoryBackend;
use tern_transport::HistoryEntry;
use tern_wallet::encryption::KdfParams;
use tern_wallet::{
    keys, Chain, FeePolicy, GroupingPolicy, InputSelector, KeyPairSigner, Payment, SeedScheme, TransactionBuilder,
    UtxoAggregator, WalletEngine, WalletError, WalletOptions, WalletSeed, WordCount,
};

const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const OTHER_PHRASE: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";
const LEGACY_PHRASE: &str = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong";
const PW: &[u8] = b"correct horse";

const FAST: KdfParams = KdfParams {
    memory_kib: 64,
    iterations: 1,
    parallelism: 1,
};

fn options() -> WalletOptions {
    WalletOptions {
        network: Network::Mainnet,
        fees: FeePolicy::default(),
        kdf: FAST,
    }
}

async fn wallet(
    phrase: &str,
    scheme: SeedScheme,
    password: Option<&[u8]>,
    backend: &Arc<MemoryBackend>,
) -> WalletEngine<MemoryBackend> {
    WalletEngine::restore(phrase, WordCount::Twelve, scheme, password, Arc::clone(backend), options())
        .await
        .unwrap()
}

fn foreign_address() -> Address {
    Address::from_public_key(&KeyPair::generate().public_key(), Network::Mainnet)
}

fn set(addresses: &[Address]) -> BTreeSet<Address> {
    addresses.iter().cloned().collect()
}

// ------------------------------------------------------------------
// phrase validation gates root derivation
// ------------------------------------------------------------------

#[test]
fn twelve_words_derive_a_root() {
    let seed = WalletSeed::from_mnemonic(PHRASE, WordCount::Twelve, SeedScheme::Modern, None, FAST).unwrap();
    assert!(keys::derive_root(&seed, None).is_ok());
}

#[tokio::test]
async fn eleven_words_are_rejected() {
    let (eleven, _) = PHRASE.rsplit_once(' ').unwrap();
    let err = WalletSeed::from_mnemonic(eleven, WordCount::Twelve, SeedScheme::Modern, None, FAST).unwrap_err();
    assert!(matches!(err, WalletError::InvalidMnemonic(_)));

    let backend = Arc::new(MemoryBackend::new());
    let restored =
        WalletEngine::restore(eleven, WordCount::Twelve, SeedScheme::Modern, None, backend, options()).await;
    assert!(matches!(restored, Err(WalletError::InvalidMnemonic(_))));
}

// ------------------------------------------------------------------
// single UTXO, change to a fresh internal address
// ------------------------------------------------------------------

#[tokio::test]
async fn pay_from_single_utxo_with_change() {
    let backend = Arc::new(MemoryBackend::new());
    let mut w = wallet(PHRASE, SeedScheme::Modern, Some(PW), &backend).await;
    let x = w.next_address(Chain::External, Some(PW)).await.unwrap().address;
    backend.fund(&x, 1_000_000);
    w.refresh_utxos().await.unwrap();

    let receiver = foreign_address();
    let plan = w
        .plan_payment(&receiver, 500_000, GroupingPolicy::OptimizeForSize, 0, Some(PW))
        .await
        .unwrap();

    let fee = FeePolicy::default().estimate_fee(1, 2, 0);
    assert_eq!(plan.inputs.len(), 1);
    assert_eq!(plan.inputs[0].owner, x);
    assert_eq!(plan.fee, fee);
    let change = plan.change.clone().expect("change output");
    assert_eq!(change.amount, 500_000 - fee);
    let change_entry = w.addresses().get(&change.address).expect("change address is owned");
    assert_eq!(change_entry.path.chain, Chain::Internal);
    plan.check_conservation().unwrap();

    let built = w.send(&plan, None, Some(PW)).await.unwrap();
    assert_eq!(built.status(), TxStatus::Broadcast);
    assert_eq!(backend.submitted().len(), 1);
    assert_eq!(backend.balance_of(&receiver), 500_000);
    assert_eq!(backend.balance_of(&change.address), 500_000 - fee);
    assert_eq!(backend.balance_of(&x), 0);
    assert!(w.cached_utxos().is_empty());

    w.refresh_utxos().await.unwrap();
    assert_eq!(w.balance().await.unwrap(), 500_000 - fee);
}

// ------------------------------------------------------------------
// not enough money
// ------------------------------------------------------------------

#[tokio::test]
async fn amount_above_balance_is_not_enough_money() {
    let backend = Arc::new(MemoryBackend::new());
    let mut w = wallet(PHRASE, SeedScheme::Modern, Some(PW), &backend).await;
    let x = w.next_address(Chain::External, Some(PW)).await.unwrap().address;
    backend.fund(&x, 1_000_000);
    w.refresh_utxos().await.unwrap();

    for policy in [GroupingPolicy::OptimizeForSecurity, GroupingPolicy::OptimizeForSize] {
        let err = w
            .plan_payment(&foreign_address(), 2_000_000, policy, 0, Some(PW))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::NotEnoughMoney { .. }), "{policy:?}: {err:?}");
    }
    assert!(backend.submitted().is_empty());
}

// ------------------------------------------------------------------
// sender equals receiver
// ------------------------------------------------------------------

#[tokio::test]
async fn paying_own_only_address_is_same_address() {
    let backend = Arc::new(MemoryBackend::new());
    let mut w = wallet(PHRASE, SeedScheme::Modern, Some(PW), &backend).await;
    let x = w.next_address(Chain::External, Some(PW)).await.unwrap().address;
    backend.fund(&x, 1_000_000);
    w.refresh_utxos().await.unwrap();

    let err = w
        .plan_payment(&x, 100_000, GroupingPolicy::OptimizeForSecurity, 0, Some(PW))
        .await
        .unwrap_err();
    assert_eq!(err, WalletError::SameAddress);
    assert!(backend.submitted().is_empty());
}

// Pin mismatches run against a real TLS server in tls.rs.

// ------------------------------------------------------------------
// oversized batch never reaches the backend
// ------------------------------------------------------------------

#[tokio::test]
async fn batch_of_25_is_rejected_before_any_call() {
    let backend = Arc::new(MemoryBackend::new());
    let aggregator = UtxoAggregator::new(Arc::clone(&backend));
    let addresses: Vec<Address> = (0..25).map(|_| foreign_address()).collect();

    let err = aggregator.fetch_utxos(&addresses).await.unwrap_err();
    assert_eq!(err, WalletError::BatchTooLarge { size: 25, max: 20 });
    assert_eq!(backend.calls(), 0);

    // The chunked variant splits instead.
    backend.fund(&addresses[24], 42);
    let utxos = aggregator.fetch_utxos_all(&addresses).await.unwrap();
    assert_eq!(utxos.len(), 1);
    assert_eq!(backend.calls(), 2);
}

// ------------------------------------------------------------------
// Address recovery
// ------------------------------------------------------------------

#[tokio::test]
async fn recovery_finds_exactly_own_addresses() {
    let backend = Arc::new(MemoryBackend::new());

    let mut first = wallet(PHRASE, SeedScheme::Modern, Some(PW), &backend).await;
    for _ in 0..5 {
        first.next_address(Chain::External, Some(PW)).await.unwrap();
    }
    for _ in 0..2 {
        first.next_address(Chain::Internal, Some(PW)).await.unwrap();
    }
    let owned = first.addresses().addresses();

    let mut other = wallet(OTHER_PHRASE, SeedScheme::Modern, None, &backend).await;
    for _ in 0..3 {
        other.next_address(Chain::External, None).await.unwrap();
    }
    let foreign = other.addresses().addresses();

    let mut candidates = Vec::new();
    for (i, a) in owned.iter().enumerate() {
        candidates.push(a.clone());
        if let Some(f) = foreign.get(i) {
            candidates.push(f.clone());
        }
    }
    candidates.push(foreign_address());
    candidates.push(Address::redeem(Hash256([5; 32]), Network::Mainnet));
    candidates.push(owned[0].clone());

    let mut restored = wallet(PHRASE, SeedScheme::Modern, Some(PW), &backend).await;
    let found = restored.recover_addresses(&candidates, Some(PW)).await.unwrap();
    let found_addresses: Vec<Address> = found.iter().map(|w| w.address.clone()).collect();
    assert_eq!(found.len(), owned.len(), "duplicates are reported once");
    assert_eq!(set(&found_addresses), set(&owned));
    for entry in &found {
        assert_eq!(first.addresses().get(&entry.address).map(|e| e.path), Some(entry.path));
    }
    assert_eq!(restored.addresses().next_index(Chain::External), 5);
    assert_eq!(restored.addresses().next_index(Chain::Internal), 2);

    let mut stranger = wallet(OTHER_PHRASE, SeedScheme::Modern, None, &backend).await;
    let theirs = stranger.recover_addresses(&owned, None).await.unwrap();
    assert!(theirs.is_empty());
}

#[tokio::test]
async fn recovery_needs_the_password() {
    let backend = Arc::new(MemoryBackend::new());
    let mut w = wallet(PHRASE, SeedScheme::Modern, Some(PW), &backend).await;
    let addr = foreign_address();
    assert_eq!(w.recover_addresses(&[addr.clone()], None).await.unwrap_err(), WalletError::Decryption);
    assert_eq!(
        w.next_address(Chain::External, Some(b"nope")).await.unwrap_err(),
        WalletError::Decryption
    );
    assert!(w.addresses().is_empty());
}

#[tokio::test]
async fn discovery_walks_to_the_last_used_address() {
    let backend = Arc::new(MemoryBackend::new());
    let mut first = wallet(PHRASE, SeedScheme::Modern, None, &backend).await;
    let mut derived = Vec::new();
    for _ in 0..8 {
        derived.push(first.next_address(Chain::External, None).await.unwrap().address);
    }
    backend.mark_used(&derived[0]);
    backend.mark_used(&derived[7]);

    let mut restored = wallet(PHRASE, SeedScheme::Modern, None, &backend).await;
    let added = restored.discover_used(Chain::External, None).await.unwrap();
    assert_eq!(added, 8);
    assert_eq!(restored.addresses().next_index(Chain::External), 8);
    let used: Vec<bool> = restored.addresses().on_chain(Chain::External).map(|e| e.used).collect();
    assert_eq!(used, vec![true, false, false, false, false, false, false, true]);
    assert_eq!(restored.discover_used(Chain::Internal, None).await.unwrap(), 0);
}

// ------------------------------------------------------------------
// Legacy sweep
// ------------------------------------------------------------------

#[tokio::test]
async fn legacy_funds_are_swept_to_a_fresh_address() {
    let backend = Arc::new(MemoryBackend::new());
    let mut legacy = wallet(LEGACY_PHRASE, SeedScheme::Legacy, None, &backend).await;
    let l1 = legacy.next_address(Chain::External, None).await.unwrap().address;
    let l2 = legacy.next_address(Chain::External, None).await.unwrap().address;
    backend.fund(&l1, 300_000);
    backend.fund(&l2, 700_000);
    let bystander = foreign_address();
    backend.fund(&bystander, 5_000_000);

    let mut modern = wallet(PHRASE, SeedScheme::Modern, Some(PW), &backend).await;
    let candidates = vec![bystander.clone(), l1.clone(), l2.clone()];
    let built = modern
        .sweep_legacy(LEGACY_PHRASE, WordCount::Twelve, &candidates, Some(PW))
        .await
        .unwrap();

    let tx = &built.signed.tx;
    assert_eq!(tx.inputs.len(), 2);
    assert_eq!(tx.outputs.len(), 1);
    let fee = FeePolicy::default().estimate_fee(2, 1, 0);
    assert_eq!(tx.outputs[0].amount, 1_000_000 - fee);
    let target = modern.addresses().get(&tx.outputs[0].address).expect("sweep target is owned");
    assert_eq!(target.path.chain, Chain::External);

    assert_eq!(backend.balance_of(&l1), 0);
    assert_eq!(backend.balance_of(&l2), 0);
    assert_eq!(backend.balance_of(&bystander), 5_000_000);
}

#[tokio::test]
async fn legacy_sweep_without_owned_candidates_fails() {
    let backend = Arc::new(MemoryBackend::new());
    let mut modern = wallet(PHRASE, SeedScheme::Modern, Some(PW), &backend).await;
    let err = modern
        .sweep_legacy(LEGACY_PHRASE, WordCount::Twelve, &[foreign_address()], Some(PW))
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::NotEnoughMoney { available: 0, .. }));
    assert!(backend.submitted().is_empty());
}

// ------------------------------------------------------------------
// Failure handling
// ------------------------------------------------------------------

#[tokio::test]
async fn offline_backend_is_retryable_utxo_fetch() {
    let backend = Arc::new(MemoryBackend::new());
    let mut w = wallet(PHRASE, SeedScheme::Modern, None, &backend).await;
    let x = w.next_address(Chain::External, None).await.unwrap().address;
    backend.fund(&x, 1_000);
    backend.set_offline(true);

    let err = w.refresh_utxos().await.unwrap_err();
    assert!(matches!(err, WalletError::UtxoFetch(_)));
    assert!(err.is_retryable());

    backend.set_offline(false);
    assert_eq!(w.refresh_utxos().await.unwrap().len(), 1);
}

#[tokio::test]
async fn rebroadcasting_a_spent_plan_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let mut w = wallet(PHRASE, SeedScheme::Modern, None, &backend).await;
    let x = w.next_address(Chain::External, None).await.unwrap().address;
    backend.fund(&x, 2_000_000);
    w.refresh_utxos().await.unwrap();

    let plan = w
        .plan_payment(&foreign_address(), 100_000, GroupingPolicy::OptimizeForSecurity, 0, None)
        .await
        .unwrap();
    w.send(&plan, None, None).await.unwrap();
    let err = w.send(&plan, None, None).await.unwrap_err();
    assert!(matches!(err, WalletError::Backend(_)));
    assert_eq!(backend.submitted().len(), 1);
}

#[tokio::test]
async fn forged_witness_maps_to_invalid_witness() {
    use tern_core::types::{SignedTransaction, Transaction, TxOutput};
    use tern_transport::BackendApi;

    let backend = Arc::new(MemoryBackend::new());
    let owner = KeyPair::generate();
    let thief = KeyPair::generate();
    let utxo = backend.fund(&Address::from_public_key(&owner.public_key(), Network::Mainnet), 1_000_000);

    let tx = Transaction::new(
        vec![utxo.outpoint()],
        vec![TxOutput {
            address: Address::from_public_key(&thief.public_key(), Network::Mainnet),
            amount: 900_000,
        }],
    );
    let witness = crypto::sign_hash(&crypto::signing_hash(&tx, 0).unwrap(), &thief);
    let forged = SignedTransaction::new(tx, vec![witness]).unwrap();

    let err = backend.send_signed(&forged.to_hex().unwrap()).await.unwrap_err();
    assert_eq!(WalletError::from(err), WalletError::InvalidWitness);
    assert_eq!(backend.balance_of(&utxo.owner), 1_000_000);
}

#[tokio::test]
async fn metadata_is_carried_and_priced() {
    let backend = Arc::new(MemoryBackend::new());
    let mut w = wallet(PHRASE, SeedScheme::Modern, None, &backend).await;
    let x = w.next_address(Chain::External, None).await.unwrap().address;
    backend.fund(&x, 2_000_000);
    w.refresh_utxos().await.unwrap();

    let metadata = b"invoice 42".to_vec();
    let plan = w
        .plan_payment(&foreign_address(), 100_000, GroupingPolicy::OptimizeForSize, metadata.len(), None)
        .await
        .unwrap();
    assert_eq!(plan.fee, FeePolicy::default().estimate_fee(1, 2, metadata.len()));
    let built = w.send(&plan, Some(metadata.clone()), None).await.unwrap();
    assert_eq!(built.signed.tx.metadata, metadata);
}

// ------------------------------------------------------------------
// History
// ------------------------------------------------------------------

#[tokio::test]
async fn history_spanning_two_batches_is_deduplicated() {
    let backend = Arc::new(MemoryBackend::new());
    let mut w = wallet(PHRASE, SeedScheme::Modern, None, &backend).await;
    let mut owned = Vec::new();
    for _ in 0..25 {
        owned.push(w.next_address(Chain::External, None).await.unwrap().address);
    }

    let entry = HistoryEntry {
        hash: Hash256([0xAA; 32]),
        time: Utc::now(),
        inputs_address: vec![owned[0].clone()],
        inputs_amount: vec![900],
        outputs_address: vec![owned[24].clone(), foreign_address()],
        outputs_amount: vec![400, 300],
        block_num: Some(10),
    };
    backend.push_history(entry.clone());
    backend.push_pending(HistoryEntry {
        hash: Hash256([0xBB; 32]),
        block_num: None,
        ..entry.clone()
    });

    let since = Utc::now() - chrono::Duration::days(1);
    let history = w.history(since).await.unwrap();
    assert_eq!(history, vec![entry.clone()]);
    assert_eq!(history[0].net_for(&owned), 400 - 900);

    let pending = w.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].block_num, None);
}

// --- proptest ---

fn funded(amounts: &[u64]) -> (Vec<Utxo>, KeyPairSigner) {
    let mut signer = KeyPairSigner::new();
    let utxos = amounts
        .iter()
        .enumerate()
        .map(|(i, &amount)| {
            let kp = KeyPair::from_secret_bytes(&[i as u8 + 1; 32]);
            let owner = Address::from_public_key(&kp.public_key(), Network::Mainnet);
            signer.add(kp);
            Utxo {
                tx_hash: Hash256([i as u8; 32]),
                output_index: i as u32,
                owner,
                amount,
            }
        })
        .collect();
    (utxos, signer)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_plan_signs_and_conserves_value(
        amounts in prop::collection::vec(1_000_000u64..50_000_000, 1..6),
        share in 1u64..100,
        by_size in any::<bool>(),
    ) {
        let (utxos, signer) = funded(&amounts);
        let total: u64 = amounts.iter().sum();
        let payment = Payment {
            receiver: Address::from_key_hash(Hash256([0xEE; 32]), Network::Mainnet),
            amount: (total / 100 * share).max(1),
            change_address: Address::from_key_hash(Hash256([0xCC; 32]), Network::Mainnet),
            metadata_size: 0,
        };
        let policy = if by_size { GroupingPolicy::OptimizeForSize } else { GroupingPolicy::OptimizeForSecurity };

        if let Ok(plan) = InputSelector::new(FeePolicy::default()).select(&utxos, &payment, policy) {
            let built = TransactionBuilder::build(&plan, &signer).unwrap();
            let tx = &built.signed.tx;
            for (i, (outpoint, witness)) in tx.inputs.iter().zip(&built.signed.witnesses).enumerate() {
                let owner = &utxos.iter().find(|u| u.outpoint() == *outpoint).unwrap().owner;
                prop_assert!(crypto::verify_witness(tx, i, witness, &owner.key_hash()).is_ok());
            }
            let inputs: u64 = plan.inputs.iter().map(|u| u.amount).sum();
            prop_assert_eq!(inputs, tx.total_output_value().unwrap() + plan.fee);
            prop_assert!(plan.fee >= FeePolicy::default().estimate_fee(tx.inputs.len(), tx.outputs.len(), 0));
        }
    }
}
