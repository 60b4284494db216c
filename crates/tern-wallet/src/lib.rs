//! # tern-wallet
//! Wallet engine: mnemonic handling, SLIP-0010 key derivation, encrypted
//! seed storage, address recovery, UTXO aggregation, fee estimation, input
//! selection and transaction building.

pub mod builder;
pub mod coin_selection;
pub mod encryption;
pub mod error;
pub mod fee;
pub mod keys;
pub mod mnemonic;
pub mod recovery;
pub mod utxo;
pub mod vault;
pub mod wallet;

pub use builder::{BuiltTransaction, KeyChainSigner, KeyPairSigner, TransactionBuilder, TxSigner};
pub use coin_selection::{GroupingPolicy, InputSelector, Payment, SpendPlan};
pub use error::{ErrorCategory, WalletError};
pub use fee::FeePolicy;
pub use keys::{Chain, DerivationPath, ExtendedKey, KeyChain, Seed, SeedScheme, WalletSeed};
pub use mnemonic::WordCount;
pub use recovery::{AddressBook, Checker, WalletAddress};
pub use utxo::UtxoAggregator;
pub use vault::SeedVault;
pub use wallet::{WalletEngine, WalletOptions};
