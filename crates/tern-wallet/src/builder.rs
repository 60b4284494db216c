//! Transaction assembly and signing.
//!
//! Provides a builder pattern for constructing transactions:
//! 1. Start from a [`SpendPlan`] (or add inputs and outputs by hand)
//! 2. Build the unsigned body
//! 3. Sign every input through a [`TxSigner`] and verify each witness

use std::collections::HashMap;

use tern_core::address::Address;
use tern_core::crypto::{self, KeyPair};
use tern_core::error::TransactionError;
use tern_core::types::{
    Hash256, OutPoint, SignedTransaction, Transaction, TxOutput, TxStatus, TxWitness, Utxo,
};
use tracing::debug;

use crate::coin_selection::SpendPlan;
use crate::error::WalletError;
use crate::keys::KeyChain;
use crate::recovery::WalletAddress;

/// Produces a witness for one input.
pub trait TxSigner {
    /// Sign `sighash` with the key that owns `owner`.
    fn sign_input(&self, sighash: &Hash256, owner: &Address) -> Result<TxWitness, WalletError>;
}

/// Signs with keys derived from the wallet keychain.
pub struct KeyChainSigner<'a> {
    keychain: &'a KeyChain,
}

impl<'a> KeyChainSigner<'a> {
    /// Derive the keys for `addresses` and sign with them.
    pub fn new(keychain: &'a mut KeyChain, addresses: &[WalletAddress]) -> Result<Self, WalletError> {
        for wa in addresses {
            keychain.derive_keypair(wa.path)?;
        }
        Ok(Self { keychain })
    }
}

impl TxSigner for KeyChainSigner<'_> {
    fn sign_input(&self, sighash: &Hash256, owner: &Address) -> Result<TxWitness, WalletError> {
        let kp = self
            .keychain
            .keypair_for_key_hash(&owner.key_hash())
            .ok_or_else(|| WalletError::KeyNotFound(format!("no key for {owner}")))?;
        Ok(crypto::sign_hash(sighash, kp))
    }
}

/// Signs with an explicit set of key pairs, indexed by key hash.
#[derive(Default)]
pub struct KeyPairSigner {
    keys: HashMap<Hash256, KeyPair>,
}

impl KeyPairSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, keypair: KeyPair) -> &mut Self {
        self.keys.insert(keypair.public_key().key_hash(), keypair);
        self
    }
}

impl TxSigner for KeyPairSigner {
    fn sign_input(&self, sighash: &Hash256, owner: &Address) -> Result<TxWitness, WalletError> {
        let kp = self
            .keys
            .get(&owner.key_hash())
            .ok_or_else(|| WalletError::KeyNotFound(format!("no key for {owner}")))?;
        Ok(crypto::sign_hash(sighash, kp))
    }
}

/// An unsigned body with the owner of each input, for signer lookup.
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    pub owners: Vec<Address>,
    pub status: TxStatus,
}

/// A fully witnessed transaction and its lifecycle state.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub signed: SignedTransaction,
    status: TxStatus,
}

impl BuiltTransaction {
    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn txid(&self) -> Result<Hash256, WalletError> {
        Ok(self.signed.txid()?)
    }

    /// Hex wire encoding for broadcast.
    pub fn to_hex(&self) -> Result<String, WalletError> {
        Ok(self.signed.to_hex()?)
    }

    /// Advance the lifecycle, e.g. to `Broadcast` once the backend accepted it.
    pub fn transition(&mut self, next: TxStatus) -> Result<(), WalletError> {
        self.status.transition(next)?;
        Ok(())
    }
}

/// Builder for constructing and signing transactions.
///
/// # Example
/// ```ignore
/// let built = TransactionBuilder::build(&plan, &signer)?;
/// backend.send_signed(&built.to_hex()?).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransactionBuilder {
    inputs: Vec<Utxo>,
    outputs: Vec<TxOutput>,
    metadata: Vec<u8>,
    /// Metadata size the fee was computed for, when built from a plan.
    metadata_budget: Option<usize>,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder holding the plan's inputs, outputs and change.
    pub fn from_plan(plan: &SpendPlan) -> Self {
        Self {
            inputs: plan.inputs.clone(),
            outputs: plan.all_outputs(),
            metadata: Vec::new(),
            metadata_budget: Some(plan.metadata_size),
        }
    }

    pub fn add_input(&mut self, utxo: Utxo) -> &mut Self {
        self.inputs.push(utxo);
        self
    }

    pub fn add_output(&mut self, address: Address, amount: u64) -> &mut Self {
        self.outputs.push(TxOutput { address, amount });
        self
    }

    pub fn set_metadata(&mut self, metadata: Vec<u8>) -> &mut Self {
        self.metadata = metadata;
        self
    }

    /// Assemble the unsigned body.
    ///
    /// Fails with [`WalletError::EmptyInputSet`] when there are no inputs.
    pub fn build_unsigned(&self) -> Result<UnsignedTransaction, WalletError> {
        if self.inputs.is_empty() {
            return Err(WalletError::EmptyInputSet);
        }
        if let Some(budget) = self.metadata_budget {
            if self.metadata.len() > budget {
                return Err(TransactionError::Oversized {
                    size: self.metadata.len(),
                    max: budget,
                }
                .into());
            }
        }

        let inputs: Vec<OutPoint> = self.inputs.iter().map(Utxo::outpoint).collect();
        let mut tx = Transaction::new(inputs, self.outputs.clone());
        tx.metadata = self.metadata.clone();
        tx.validate_structure()?;

        Ok(UnsignedTransaction {
            tx,
            owners: self.inputs.iter().map(|u| u.owner.clone()).collect(),
            status: TxStatus::Draft,
        })
    }

    /// Witness every input and move the transaction to `Signed`.
    ///
    /// Each witness is verified against its input owner's key hash; a signer
    /// returning a witness for the wrong key fails the whole build.
    pub fn sign(unsigned: UnsignedTransaction, signer: &dyn TxSigner) -> Result<BuiltTransaction, WalletError> {
        let UnsignedTransaction { tx, owners, mut status } = unsigned;

        let mut witnesses = Vec::with_capacity(tx.inputs.len());
        for (i, owner) in owners.iter().enumerate() {
            let sighash = crypto::signing_hash(&tx, i)?;
            let witness = signer.sign_input(&sighash, owner)?;
            crypto::verify_witness(&tx, i, &witness, &owner.key_hash())?;
            witnesses.push(witness);
        }

        let signed = SignedTransaction::new(tx, witnesses)?;
        // Rejects transactions over the wire size limit.
        signed.to_wire()?;
        status.transition(TxStatus::Signed)?;
        debug!(txid = %signed.txid()?, inputs = owners.len(), "transaction signed");

        Ok(BuiltTransaction { signed, status })
    }

    /// Build and sign `plan` in one step.
    pub fn build(plan: &SpendPlan, signer: &dyn TxSigner) -> Result<BuiltTransaction, WalletError> {
        Self::sign(Self::from_plan(plan).build_unsigned()?, signer)
    }
}
