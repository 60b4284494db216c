//! tern-cli: command-line front end for the Tern wallet engine.
//!
//! Mnemonic tools, wallet creation and restore, address recovery, balance
//! queries, fee estimates, payments and legacy sweeps, with the seed kept
//! encrypted on disk and passwords read without echo.

mod settings;
mod store;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tern_core::address::{Address, Network};
use tern_core::constants::{format_amount, COIN, COIN_DECIMALS};
use tern_transport::BackendClient;
use tern_wallet::encryption::KdfParams;
use tern_wallet::{
    keys, mnemonic, Chain, DerivationPath, FeePolicy, GroupingPolicy, KeyChain, SeedScheme, WalletAddress,
    WalletEngine, WalletError, WalletOptions, WalletSeed, WordCount,
};
use tracing::warn;
use zeroize::Zeroizing;

use settings::TernConfig;
use store::WalletFile;

/// Tern light wallet.
#[derive(Parser)]
#[command(name = "tern-cli")]
#[command(version, about = "Address recovery and payments for a light UTXO wallet.")]
struct Cli {
    /// Configuration file (default: ~/.tern/config.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to wallet file (default: ~/.tern/wallet.json).
    #[arg(short, long, global = true)]
    wallet: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recovery phrase tools.
    Mnemonic {
        #[command(subcommand)]
        action: MnemonicAction,
    },
    /// Wallet file management.
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },
    /// Address management.
    Address {
        #[command(subcommand)]
        action: AddressAction,
    },
    /// Find which candidate addresses belong to this wallet.
    Recover(RecoverArgs),
    /// Query the wallet balance from the backend.
    Balance,
    /// Show recent or pending transactions.
    History(HistoryArgs),
    /// Estimate the fee for a transaction.
    Fee(FeeArgs),
    /// Send a payment.
    Send(SendArgs),
    /// Move all funds of a legacy wallet into this one.
    Sweep(SweepArgs),
}

#[derive(Subcommand)]
enum MnemonicAction {
    /// Generate a new twelve-word phrase.
    Generate,
    /// Validate a phrase. Prompts if not given.
    Check(CheckArgs),
}

#[derive(Args)]
struct CheckArgs {
    /// Phrase to check.
    phrase: Option<String>,

    /// Expected number of words.
    #[arg(long, default_value_t = 12)]
    words: usize,
}

#[derive(Subcommand)]
enum WalletAction {
    /// Create a wallet with a fresh phrase.
    Create(CreateArgs),
    /// Restore a wallet from an existing phrase.
    Restore(RestoreArgs),
    /// Change the wallet password.
    Passwd,
}

#[derive(Args)]
struct CreateArgs {
    /// Network (mainnet or testnet). Defaults to the configured network.
    #[arg(short, long)]
    network: Option<String>,
}

#[derive(Args)]
struct RestoreArgs {
    /// Network (mainnet or testnet). Defaults to the configured network.
    #[arg(short, long)]
    network: Option<String>,

    /// Number of words in the phrase.
    #[arg(long, default_value_t = 12)]
    words: usize,

    /// Derive the seed with the legacy scheme.
    #[arg(long)]
    legacy: bool,
}

#[derive(Subcommand)]
enum AddressAction {
    /// Derive the next receive address.
    New(NewAddressArgs),
    /// List owned addresses.
    List,
}

#[derive(Args)]
struct NewAddressArgs {
    /// Derive a change address instead of a receive address.
    #[arg(long)]
    change: bool,
}

#[derive(Args)]
struct CandidateArgs {
    /// Candidate address (repeatable).
    #[arg(short, long = "address")]
    addresses: Vec<String>,

    /// File with one candidate address per line.
    #[arg(long)]
    from_file: Option<PathBuf>,
}

#[derive(Args)]
struct RecoverArgs {
    #[command(flatten)]
    candidates: CandidateArgs,

    /// Also scan both chains for used addresses on the backend.
    #[arg(long)]
    discover: bool,
}

#[derive(Args)]
struct HistoryArgs {
    /// How many days back to look.
    #[arg(long, default_value_t = 30)]
    days: i64,

    /// Show unconfirmed transactions instead.
    #[arg(long)]
    pending: bool,
}

#[derive(Args)]
struct FeeArgs {
    /// Plan a payment to this address instead of estimating a bare shape.
    #[arg(long, requires = "amount")]
    to: Option<String>,

    /// Payment amount in whole coins (e.g. 10.5).
    #[arg(long)]
    amount: Option<String>,

    #[arg(long, default_value_t = 1)]
    inputs: usize,

    #[arg(long, default_value_t = 2)]
    outputs: usize,

    /// Metadata size in bytes.
    #[arg(long, default_value_t = 0)]
    metadata_size: usize,

    #[arg(long, value_enum, default_value_t = Policy::Security)]
    policy: Policy,
}

#[derive(Args)]
struct SendArgs {
    /// Recipient address.
    #[arg(short, long)]
    to: String,

    /// Amount in whole coins (e.g. 10.5).
    #[arg(short, long)]
    amount: String,

    /// Hex-encoded transaction metadata.
    #[arg(long)]
    metadata: Option<String>,

    #[arg(long, value_enum, default_value_t = Policy::Security)]
    policy: Policy,
}

#[derive(Args)]
struct SweepArgs {
    #[command(flatten)]
    candidates: CandidateArgs,

    /// Number of words in the legacy phrase.
    #[arg(long, default_value_t = 12)]
    words: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Policy {
    /// Spend every UTXO of the sending addresses.
    Security,
    /// Spend as few UTXOs as possible.
    Size,
}

impl From<Policy> for GroupingPolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::Security => GroupingPolicy::OptimizeForSecurity,
            Policy::Size => GroupingPolicy::OptimizeForSize,
        }
    }
}

type Engine = WalletEngine<BackendClient>;

/// Upper bound for `history --days`.
const MAX_HISTORY_DAYS: i64 = 36_500;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    run(cli).await.map_err(|e| {
        let category = e.downcast_ref::<WalletError>().map(|w| w.category().message());
        match category {
            Some(message) => e.context(message),
            None => e,
        }
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config = TernConfig::load(cli.config.as_deref())?;
    let wallet_path = resolve_wallet_path(cli.wallet)?;

    match cli.command {
        Commands::Mnemonic { action } => match action {
            MnemonicAction::Generate => mnemonic_generate(),
            MnemonicAction::Check(args) => mnemonic_check(args),
        },
        Commands::Wallet { action } => match action {
            WalletAction::Create(args) => wallet_create(&config, &wallet_path, args).await,
            WalletAction::Restore(args) => wallet_restore(&config, &wallet_path, args).await,
            WalletAction::Passwd => wallet_passwd(&config, &wallet_path).await,
        },
        Commands::Address { action } => match action {
            AddressAction::New(args) => address_new(&config, &wallet_path, args).await,
            AddressAction::List => address_list(&wallet_path),
        },
        Commands::Recover(args) => recover(&config, &wallet_path, args).await,
        Commands::Balance => balance(&config, &wallet_path).await,
        Commands::History(args) => history(&config, &wallet_path, args).await,
        Commands::Fee(args) => fee(&config, &wallet_path, args).await,
        Commands::Send(args) => send(&config, &wallet_path, args).await,
        Commands::Sweep(args) => sweep(&config, &wallet_path, args).await,
    }
}

fn mnemonic_generate() -> Result<()> {
    let phrase = Zeroizing::new(mnemonic::generate()?);
    println!("{}", phrase.as_str());
    Ok(())
}

fn mnemonic_check(args: CheckArgs) -> Result<()> {
    let words = parse_word_count(args.words)?;
    let phrase = match args.phrase {
        Some(p) => Zeroizing::new(p),
        None => Zeroizing::new(prompt_password("Recovery phrase")?),
    };
    match mnemonic::validate(&phrase, words) {
        Ok(_) => {
            println!("Phrase is valid ({words} words)");
            Ok(())
        }
        Err(e) => bail!("Phrase is invalid: {e}"),
    }
}

/// Create a wallet from a freshly generated phrase.
async fn wallet_create(config: &TernConfig, path: &Path, args: CreateArgs) -> Result<()> {
    if path.exists() {
        bail!("Wallet file already exists: {}", path.display());
    }
    let network = match args.network {
        Some(n) => parse_network(&n)?,
        None => config.network,
    };
    let password = prompt_new_password()?;

    let phrase = Zeroizing::new(mnemonic::generate()?);
    let file = seal_new_wallet(&phrase, WordCount::Twelve, SeedScheme::Modern, &password, network).await?;
    file.save(path).context("Failed to save wallet")?;

    println!("\n=== WALLET CREATED ===");
    println!("Network: {network}");
    println!("\nRECOVERY PHRASE (BACK THIS UP, 12 WORDS):");
    println!("  {}", phrase.as_str());
    println!("\nWARNING: This phrase will NOT be shown again.");
    println!("Anyone with this phrase can spend your funds.");
    print_first_address(&file);
    println!("\nWallet saved to: {}", path.display());
    Ok(())
}

/// Restore a wallet from an existing phrase.
async fn wallet_restore(config: &TernConfig, path: &Path, args: RestoreArgs) -> Result<()> {
    if path.exists() {
        bail!("Wallet file already exists: {}", path.display());
    }
    let network = match args.network {
        Some(n) => parse_network(&n)?,
        None => config.network,
    };
    let words = parse_word_count(args.words)?;
    let scheme = if args.legacy {
        SeedScheme::Legacy
    } else {
        SeedScheme::Modern
    };

    let phrase = Zeroizing::new(prompt_password("Recovery phrase")?);
    mnemonic::validate(&phrase, words)?;
    let password = prompt_new_password()?;

    let file = seal_new_wallet(&phrase, words, scheme, &password, network).await?;
    file.save(path).context("Failed to save wallet")?;

    println!("\n=== WALLET RESTORED ===");
    println!("Network: {network}");
    print_first_address(&file);
    println!("Wallet saved to: {}", path.display());
    println!("\nRun `tern-cli recover --discover` to find previously used addresses.");
    Ok(())
}

async fn wallet_passwd(config: &TernConfig, path: &Path) -> Result<()> {
    let (engine, old) = open_engine(config, path)?;
    let new = prompt_new_password()?;
    engine.change_password(Some(old.as_bytes()), Some(new.as_bytes())).await?;
    WalletFile::capture(&engine).await?.save(path)?;
    println!("Password changed.");
    Ok(())
}

async fn address_new(config: &TernConfig, path: &Path, args: NewAddressArgs) -> Result<()> {
    let (mut engine, password) = open_engine(config, path)?;
    let chain = if args.change {
        Chain::Internal
    } else {
        Chain::External
    };
    let entry = engine.next_address(chain, Some(password.as_bytes())).await?;
    WalletFile::capture(&engine).await?.save(path)?;
    println!("{}", entry.address);
    Ok(())
}

fn address_list(path: &Path) -> Result<()> {
    let file = WalletFile::load(path)?;
    println!("\n=== ADDRESSES ({}) ===", file.addresses.len());
    for entry in &file.addresses {
        print_address_row(entry);
    }
    Ok(())
}

async fn recover(config: &TernConfig, path: &Path, args: RecoverArgs) -> Result<()> {
    let candidates = read_candidates(&args.candidates)?;
    if candidates.is_empty() && !args.discover {
        bail!("No candidate addresses given (use --address, --from-file or --discover)");
    }
    let (mut engine, password) = open_engine(config, path)?;
    let before = engine.addresses().len();

    let found = engine.recover_addresses(&candidates, Some(password.as_bytes())).await?;
    if args.discover {
        engine.discover_used(Chain::External, Some(password.as_bytes())).await?;
        engine.discover_used(Chain::Internal, Some(password.as_bytes())).await?;
    }
    WalletFile::capture(&engine).await?.save(path)?;

    println!("\n=== ADDRESS RECOVERY ===");
    println!("Candidates checked: {}", candidates.len());
    println!("Owned candidates:   {}", found.len());
    println!("New addresses:      {}", engine.addresses().len() - before);
    for entry in &found {
        print_address_row(entry);
    }
    Ok(())
}

async fn balance(config: &TernConfig, path: &Path) -> Result<()> {
    let (mut engine, _password) = open_engine(config, path)?;
    let utxos = engine.refresh_utxos().await?;
    WalletFile::capture(&engine).await?.save(path)?;

    let total = utxos
        .iter()
        .try_fold(0u64, |acc, u| acc.checked_add(u.amount))
        .context("Balance overflows")?;

    println!("\n=== WALLET BALANCE ===");
    println!("Network:   {}", engine.network());
    println!("Addresses: {}", engine.addresses().len());
    println!("UTXOs:     {}", utxos.len());
    println!("Balance:   {} ({total} units)", format_amount(total));
    for entry in engine.addresses().entries().iter().filter(|e| e.balance > 0) {
        print_address_row(entry);
    }
    Ok(())
}

async fn history(config: &TernConfig, path: &Path, args: HistoryArgs) -> Result<()> {
    let (engine, _password) = open_engine(config, path)?;
    let entries = if args.pending {
        engine.pending().await?
    } else {
        let since = Utc::now() - Duration::days(args.days.clamp(0, MAX_HISTORY_DAYS));
        engine.history(since).await?
    };
    let owned = engine.addresses().addresses();

    println!("\n=== {} ({}) ===", if args.pending { "PENDING" } else { "HISTORY" }, entries.len());
    for entry in &entries {
        let net = entry.net_for(&owned);
        let sign = if net < 0 { "-" } else { "+" };
        let magnitude = u64::try_from(net.unsigned_abs()).unwrap_or(u64::MAX);
        let block = entry.block_num.map_or_else(|| "pending".to_string(), |b| b.to_string());
        println!(
            "{}  {}  {sign}{}  block {block}",
            entry.time.format("%Y-%m-%d %H:%M:%S"),
            entry.hash,
            format_amount(magnitude),
        );
    }
    Ok(())
}

async fn fee(config: &TernConfig, path: &Path, args: FeeArgs) -> Result<()> {
    let Some(to) = args.to else {
        let estimate = config.fees.estimate_fee(args.inputs, args.outputs, args.metadata_size);
        let size = FeePolicy::estimate_size(args.inputs, args.outputs, args.metadata_size);
        println!(
            "Fee for {} input(s), {} output(s), {} metadata byte(s): {} ({estimate} units, ~{size} bytes)",
            args.inputs,
            args.outputs,
            args.metadata_size,
            format_amount(estimate),
        );
        return Ok(());
    };

    let receiver = parse_address(&to)?;
    let amount = parse_amount(args.amount.as_deref().unwrap_or_default())?;
    let (mut engine, password) = open_engine(config, path)?;
    engine.refresh_utxos().await?;
    let plan = engine
        .plan_payment(&receiver, amount, args.policy.into(), args.metadata_size, Some(password.as_bytes()))
        .await?;

    println!("\n=== PAYMENT PLAN ===");
    println!("Inputs: {}", plan.inputs.len());
    println!("Amount: {}", format_amount(amount));
    println!("Fee:    {} ({} units)", format_amount(plan.fee), plan.fee);
    if let Some(change) = &plan.change {
        println!("Change: {} to {}", format_amount(change.amount), change.address);
    }
    Ok(())
}

async fn send(config: &TernConfig, path: &Path, args: SendArgs) -> Result<()> {
    let receiver = parse_address(&args.to)?;
    let amount = parse_amount(&args.amount)?;
    let metadata = args
        .metadata
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("Metadata must be hex")?;
    let metadata_size = metadata.as_ref().map_or(0, Vec::len);

    let (mut engine, password) = open_engine(config, path)?;
    engine.refresh_utxos().await?;
    let plan = engine
        .plan_payment(&receiver, amount, args.policy.into(), metadata_size, Some(password.as_bytes()))
        .await?;
    let result = engine.send(&plan, metadata, Some(password.as_bytes())).await;
    // A plan with change has reserved its change address, even if broadcast fails.
    WalletFile::capture(&engine).await?.save(path)?;
    let built = result?;

    println!("\n=== TRANSACTION SENT ===");
    println!("TxID:   {}", built.txid()?);
    println!("To:     {receiver}");
    println!("Amount: {} ({amount} units)", format_amount(amount));
    println!("Fee:    {} ({} units)", format_amount(plan.fee), plan.fee);
    if let Some(change) = &plan.change {
        println!("Change: {} ({} units)", format_amount(change.amount), change.amount);
    }
    Ok(())
}

async fn sweep(config: &TernConfig, path: &Path, args: SweepArgs) -> Result<()> {
    let candidates = read_candidates(&args.candidates)?;
    if candidates.is_empty() {
        bail!("No candidate addresses given (use --address or --from-file)");
    }
    let words = parse_word_count(args.words)?;
    let (mut engine, password) = open_engine(config, path)?;
    let legacy = Zeroizing::new(prompt_password("Legacy recovery phrase")?);

    let result = engine
        .sweep_legacy(&legacy, words, &candidates, Some(password.as_bytes()))
        .await;
    WalletFile::capture(&engine).await?.save(path)?;
    let built = result?;

    let tx = &built.signed.tx;
    println!("\n=== LEGACY FUNDS SWEPT ===");
    println!("TxID:   {}", built.txid()?);
    println!("Inputs: {}", tx.inputs.len());
    for output in &tx.outputs {
        println!("To:     {} ({})", output.address, format_amount(output.amount));
    }
    Ok(())
}

/// Load the wallet file and prompt for its password.
fn open_engine(config: &TernConfig, path: &Path) -> Result<(Engine, Zeroizing<String>)> {
    let file = WalletFile::load(path)?;
    let backend = config.backend()?;
    let password = Zeroizing::new(prompt_password("Wallet password")?);
    let options = WalletOptions {
        network: file.network,
        fees: config.fees,
        kdf: KdfParams::default(),
    };
    Ok((file.into_engine(backend, options), password))
}

/// Derive and encrypt a new wallet's seed and first receive address.
async fn seal_new_wallet(
    phrase: &str,
    words: WordCount,
    scheme: SeedScheme,
    password: &str,
    network: Network,
) -> Result<WalletFile> {
    let phrase = Zeroizing::new(phrase.to_owned());
    let password = Zeroizing::new(password.as_bytes().to_vec());
    tokio::task::spawn_blocking(move || -> Result<WalletFile> {
        let seed = WalletSeed::from_mnemonic(&phrase, words, scheme, Some(password.as_slice()), KdfParams::default())?;
        let root = keys::derive_root(&seed, Some(password.as_slice()))?;
        let mut keychain = KeyChain::new(&root, network)?;
        let path = DerivationPath::wallet(Chain::External, 0);
        let first = WalletAddress::new(keychain.address_at(path)?, path);
        let encrypted = seed.as_encrypted().cloned().context("Seed was not encrypted")?;
        Ok(WalletFile::new(network, encrypted, vec![first]))
    })
    .await
    .context("Seed derivation task failed")?
}

fn print_first_address(file: &WalletFile) {
    if let Some(first) = file.addresses.first() {
        println!("\nFirst receive address: {}", first.address);
    }
}

fn print_address_row(entry: &WalletAddress) {
    println!(
        "  {}  {}  {}{}",
        entry.path,
        entry.address,
        format_amount(entry.balance),
        if entry.used { "  (used)" } else { "" }
    );
}

/// Candidate addresses from flags and an optional file. Unparsable entries
/// are skipped with a warning; they cannot belong to any wallet.
fn read_candidates(args: &CandidateArgs) -> Result<Vec<Address>> {
    let mut raw = args.addresses.clone();
    if let Some(file) = &args.from_file {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read candidates from {}", file.display()))?;
        raw.extend(parse_candidate_lines(&text));
    }
    Ok(raw
        .iter()
        .filter_map(|s| match Address::from_str(s) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(candidate = %s, error = %e, "skipping unparsable address");
                None
            }
        })
        .collect())
}

/// Non-empty, non-comment lines, trimmed.
fn parse_candidate_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
}

fn parse_address(s: &str) -> Result<Address> {
    s.trim().parse::<Address>().context("Invalid recipient address")
}

/// Parse a whole-coin decimal string into base units without floating point.
fn parse_amount(s: &str) -> Result<u64> {
    let s = s.trim();
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if whole.is_empty() && frac.is_empty() {
        bail!("Amount is empty");
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        bail!("Amount must be a decimal number: {s}");
    }
    if frac.len() > COIN_DECIMALS {
        bail!("Amount has more than {COIN_DECIMALS} decimal places: {s}");
    }
    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().context("Amount too large")?
    };
    let frac: u64 = format!("{frac:0<width$}", width = COIN_DECIMALS).parse().unwrap_or(0);
    let units = whole
        .checked_mul(COIN)
        .and_then(|w| w.checked_add(frac))
        .context("Amount too large")?;
    if units == 0 {
        bail!("Amount must be greater than zero");
    }
    Ok(units)
}

fn parse_word_count(n: usize) -> Result<WordCount> {
    WordCount::from_words(n).with_context(|| format!("Unsupported phrase length: {n} words"))
}

/// Prompt for a password securely (no echo).
fn prompt_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(format!("{prompt}: ")).context("Failed to read password")
}

fn prompt_new_password() -> Result<Zeroizing<String>> {
    let password = Zeroizing::new(prompt_password("Enter new wallet password")?);
    let confirm = Zeroizing::new(prompt_password("Confirm password")?);
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    if password != confirm {
        bail!("Passwords do not match");
    }
    Ok(password)
}

/// Resolve wallet file path, using default if not provided.
fn resolve_wallet_path(path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(p) = path {
        return Ok(p);
    }
    Ok(settings::data_dir()?.join("wallet.json"))
}

/// Parse network string to Network enum.
fn parse_network(s: &str) -> Result<Network> {
    match s.to_lowercase().as_str() {
        "mainnet" => Ok(Network::Mainnet),
        "testnet" => Ok(Network::Testnet),
        _ => bail!("Invalid network (must be 'mainnet' or 'testnet')"),
    }
}
