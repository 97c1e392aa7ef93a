//! # Collateral: Bitcoin Script Loan Collateral
//!
//! Command line front end for locking loan collateral in two Bitcoin Script
//! outputs and spending them through the branch the current period opens.
//!
//! ## Contract Flow
//!
//! ```text
//! ┌─────────────┐    Lock    ┌─────────────┐  loan expiration  ┌─────────────┐
//! │  Contract   │  ────────> │ Refundable  │  ──────────────>  │ Liquidation │
//! │ (JSON file) │            │ + Seizable  │                   │ (2-of-3)    │
//! └─────────────┘            └─────────────┘                   └─────────────┘
//!                                   │                                 │
//!                    secret reveal  │              liquidation expiration
//!                                   ▼                                 ▼
//!                            ┌─────────────┐                   ┌─────────────┐
//!                            │  Borrower   │                   │  Seizure    │
//!                            │  (refund)   │                   │  (lender)   │
//!                            └─────────────┘                   └─────────────┘
//!                                                                     │
//!                                                    seizure expiration
//!                                                                     ▼
//!                                                              ┌─────────────┐
//!                                                              │  Borrower   │
//!                                                              │  (final)    │
//!                                                              └─────────────┘
//! ```
//!
//! ## Usage Examples
//!
//! ```bash
//! # Each party commits to its secrets and shares the hashes
//! collateral secrets --slots b1,b2 --output lender_secrets.json
//!
//! # Write the contract everyone signs off on
//! collateral init --borrower 02.. --lender 03.. --agent 02.. \
//!     --loan-expiration 1735689600 --liquidation-expiration 1736294400 \
//!     --seizure-expiration 1738368000 --hash a1=.. --hash b1=.. --hash c1=..
//!
//! # Fund both legs from the node wallet
//! collateral lock --refundable 100000 --seizable 50000 --batch
//!
//! # Borrower takes the collateral back with the lender's secret
//! collateral refund <txid> --secret <hex>
//!
//! # After the loan expires, two parties move both legs into a swap contract
//! collateral multisig-sign <txid> --role lender \
//!     --destination <swap refundable> --destination <swap seizable>
//! ```
//!
//! The node connection comes from `RPC_URL`, `RPC_PORT`, `RPC_USER`,
//! `RPC_PASSWORD` and `RPC_WALLET`; the network and encodings from
//! `COLLATERAL_NETWORK`, `COLLATERAL_SCRIPT_MODE` and
//! `COLLATERAL_ADDRESS_MODE`. A `.env` file is honoured.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bitcoin::hashes::sha256;
use bitcoin::secp256k1::{ecdsa::Signature, Message};
use bitcoin::{consensus, Address, Amount, PublicKey, Txid};
use bitcoin_collateral::collateral::provider::locked_value;
use bitcoin_collateral::collateral::{
    CollateralParams, CollateralProvider, CollateralValues, Expirations, Leg, PartialSignatures,
    PartyKeys, PaymentKind, Payout, Protocol, Role, Secret, SecretHashes, SecretSlot, Variant,
};
use bitcoin_collateral::config::ProviderConfig;
use bitcoin_collateral::services::{
    BitcoinRpcClient, EsploraClient, KeyStore, RpcWalletSigner, Signer,
};
use bitcoin_collateral::utils::{amount, txid};
use bitcoin_collateral::CollateralResult;
use clap::{Parser, Subcommand};
use log::info;
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "collateral")]
#[command(about = "Bitcoin Script collateral escrow for loans")]
struct Cli {
    /// Contract file
    #[arg(short, long, global = true, default_value = "contract.json")]
    contract: String,
    /// WIF private keys to sign with instead of the node wallet
    #[arg(long = "wif", global = true)]
    wif: Vec<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new contract file
    Init {
        #[arg(long)]
        borrower: PublicKey,
        #[arg(long)]
        lender: PublicKey,
        #[arg(long)]
        agent: PublicKey,
        /// Liquidator key, required for swap contracts
        #[arg(long)]
        liquidator: Option<PublicKey>,
        /// Loan expiration (UNIX time)
        #[arg(long)]
        loan_expiration: u32,
        /// Liquidation expiration (UNIX time)
        #[arg(long)]
        liquidation_expiration: u32,
        /// Seizure expiration (UNIX time), not used by swap contracts
        #[arg(long)]
        seizure_expiration: Option<u32>,
        /// Secret hash commitments as SLOT=HEX, e.g. b1=3f..
        #[arg(long = "hash")]
        hashes: Vec<String>,
        /// Three-period swap contract
        #[arg(long, default_value_t = false)]
        swap: bool,
        /// Arbitration additionally requires two evidence preimages
        #[arg(long, default_value_t = false)]
        evidence: bool,
        /// Party the seizable leg is seized to
        #[arg(long, default_value = "lender")]
        seizable_guard: Role,
    },
    /// Generate secrets and print their hashes
    Secrets {
        /// Slots to generate, e.g. b1,b2
        #[arg(long, value_delimiter = ',', required = true)]
        slots: Vec<SecretSlot>,
        /// File the secrets are written to
        #[arg(short, long, default_value = "secrets.json")]
        output: String,
    },
    /// Show the collateral addresses and redeem scripts
    Addresses,
    /// Fund both collateral legs from the node wallet
    Lock {
        /// Refundable amount in satoshis
        #[arg(long)]
        refundable: u64,
        /// Seizable amount in satoshis
        #[arg(long)]
        seizable: u64,
        /// Pay both legs in one transaction
        #[arg(long, default_value_t = false)]
        batch: bool,
    },
    /// Wait for the transaction funding a leg
    Find {
        #[arg(default_value = "seizable")]
        leg: Leg,
        /// Search through the block explorer instead of the node
        #[arg(long, default_value_t = false)]
        explorer: bool,
    },
    /// Borrower reclaims both legs during the loan period
    Refund {
        /// Funding transaction IDs
        #[arg(required = true)]
        txids: Vec<String>,
        /// Revealed lender or agent secret
        #[arg(long)]
        secret: Secret,
    },
    /// Liquidator claims a swap contract during the loan period
    Claim {
        #[arg(required = true)]
        txids: Vec<String>,
        /// Revealed secrets
        #[arg(long = "secret", required = true)]
        secrets: Vec<Secret>,
    },
    /// Seize the seizable leg after the liquidation expiration
    Seize {
        #[arg(required = true)]
        txids: Vec<String>,
        /// Borrower secret revealed during liquidation
        #[arg(long)]
        secret: Option<Secret>,
    },
    /// Borrower takes the refundable leg back during the seizure period
    Reclaim {
        #[arg(required = true)]
        txids: Vec<String>,
        #[arg(long)]
        secret: Option<Secret>,
    },
    /// Spend one leg through its final timelock branch
    RefundLeg {
        leg: Leg,
        #[arg(required = true)]
        txids: Vec<String>,
    },
    /// Sign the cooperative spend as one of the arbitration parties
    MultisigSign {
        #[arg(required = true)]
        txids: Vec<String>,
        #[arg(long)]
        role: Role,
        /// ADDRESS or ADDRESS=SATS; one, or one per collateral output
        #[arg(long = "destination", required = true)]
        destinations: Vec<String>,
        /// File the partial signatures are written to
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Combine two parties' signatures and broadcast the cooperative spend
    MultisigSend {
        #[arg(required = true)]
        txids: Vec<String>,
        /// ADDRESS or ADDRESS=SATS, exactly as given to multisig-sign
        #[arg(long = "destination", required = true)]
        destinations: Vec<String>,
        /// Partial signature files
        #[arg(long = "partial", required = true)]
        partials: Vec<String>,
        /// Evidence preimages for contracts that require them
        #[arg(long = "evidence")]
        evidence: Vec<Secret>,
        /// Print the transaction instead of broadcasting it
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

/// Key source for spends: WIF keys from the command line or the node wallet.
enum CliSigner {
    Keys(KeyStore),
    Wallet(RpcWalletSigner),
}

#[async_trait]
impl Signer for CliSigner {
    async fn sign(&self, pubkey: &PublicKey, message: &Message) -> CollateralResult<Signature> {
        match self {
            CliSigner::Keys(store) => store.sign(pubkey, message).await,
            CliSigner::Wallet(wallet) => wallet.sign(pubkey, message).await,
        }
    }
}

type Provider = CollateralProvider<BitcoinRpcClient, CliSigner>;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            borrower,
            lender,
            agent,
            liquidator,
            loan_expiration,
            liquidation_expiration,
            seizure_expiration,
            hashes,
            swap,
            evidence,
            seizable_guard,
        } => {
            let mut keys = PartyKeys::new(borrower, lender, agent)?;
            if let Some(liquidator) = liquidator {
                keys = keys.with_liquidator(liquidator)?;
            }
            let variant = Variant {
                protocol: if swap {
                    Protocol::CollateralSwap
                } else {
                    Protocol::Collateral
                },
                arbitration_evidence: evidence,
                seizable_guard,
            };
            let params = CollateralParams {
                keys,
                secret_hashes: parse_hashes(&hashes)?,
                expirations: Expirations {
                    loan: loan_expiration,
                    liquidation: liquidation_expiration,
                    seizure: seizure_expiration,
                },
                variant,
            };
            init(&cli.contract, params)?;
        }
        Commands::Secrets { slots, output } => {
            secrets(&slots, &output)?;
        }
        Commands::Addresses => {
            addresses(&cli.contract)?;
        }
        Commands::Lock {
            refundable,
            seizable,
            batch,
        } => {
            let values = CollateralValues {
                refundable: Amount::from_sat(refundable),
                seizable: Amount::from_sat(seizable),
            };
            lock(&cli.contract, &cli.wif, values, batch).await?;
        }
        Commands::Find { leg, explorer } => {
            find(&cli.contract, &cli.wif, leg, explorer).await?;
        }
        Commands::Refund { txids, secret } => {
            let (provider, params) = load(&cli.contract, &cli.wif)?;
            let txid = provider.refund(&txid::parse_all(&txids)?, &params, secret).await?;
            report_spend("Refund", txid);
        }
        Commands::Claim { txids, secrets } => {
            let (provider, params) = load(&cli.contract, &cli.wif)?;
            let txid = provider.claim(&txid::parse_all(&txids)?, &params, &secrets).await?;
            report_spend("Claim", txid);
        }
        Commands::Seize { txids, secret } => {
            let (provider, params) = load(&cli.contract, &cli.wif)?;
            let txid = provider.seize(&txid::parse_all(&txids)?, &params, secret).await?;
            report_spend("Seizure", txid);
        }
        Commands::Reclaim { txids, secret } => {
            let (provider, params) = load(&cli.contract, &cli.wif)?;
            let txid = provider
                .reclaim_refundable(&txid::parse_all(&txids)?, &params, secret)
                .await?;
            report_spend("Reclaim", txid);
        }
        Commands::RefundLeg { leg, txids } => {
            let (provider, params) = load(&cli.contract, &cli.wif)?;
            let txids = txid::parse_all(&txids)?;
            let txid = match leg {
                Leg::Refundable => provider.refund_refundable(&txids, &params).await?,
                Leg::Seizable => provider.refund_seizable(&txids, &params).await?,
            };
            report_spend("Final refund", txid);
        }
        Commands::MultisigSign {
            txids,
            role,
            destinations,
            output,
        } => {
            let output = output.unwrap_or_else(|| format!("{}_signatures.json", role));
            multisig_sign(&cli.contract, &cli.wif, &txids, role, &destinations, &output).await?;
        }
        Commands::MultisigSend {
            txids,
            destinations,
            partials,
            evidence,
            dry_run,
        } => {
            multisig_send(
                &cli.contract,
                &cli.wif,
                &txids,
                &destinations,
                &partials,
                &evidence,
                dry_run,
            )
            .await?;
        }
    }

    Ok(())
}

fn parse_hashes(entries: &[String]) -> Result<SecretHashes> {
    let mut hashes = SecretHashes::default();
    for entry in entries {
        let (slot, hash) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Hash must be given as SLOT=HEX, got {}", entry))?;
        let hash = sha256::Hash::from_str(hash).with_context(|| format!("Invalid hash for {}", slot))?;
        hashes.set(slot.parse::<SecretSlot>()?, hash);
    }
    Ok(hashes)
}

fn network_provider(wif: &[String]) -> Result<Provider> {
    let config = ProviderConfig::from_env()?;
    let backend = BitcoinRpcClient::new()?;
    let signer = if wif.is_empty() {
        CliSigner::Wallet(RpcWalletSigner::new(
            backend.clone(),
            config.address_mode,
            config.network,
        ))
    } else {
        let mut store = KeyStore::new();
        for key in wif {
            store.insert_wif(key)?;
        }
        CliSigner::Keys(store)
    };
    Ok(CollateralProvider::new(backend, signer, config))
}

fn load(contract: &str, wif: &[String]) -> Result<(Provider, CollateralParams)> {
    let params = CollateralParams::load_from_file(contract)
        .with_context(|| format!("Failed to load contract from {}", contract))?;
    Ok((network_provider(wif)?, params))
}

fn parse_payouts(provider: &Provider, destinations: &[String]) -> Result<Vec<Payout>> {
    destinations
        .iter()
        .map(|entry| -> Result<Payout> {
            let (address, value) = match entry.split_once('=') {
                Some((address, sats)) => {
                    let sats = sats
                        .parse::<u64>()
                        .with_context(|| format!("Invalid amount in destination {}", entry))?;
                    (address, Some(Amount::from_sat(sats)))
                }
                None => (entry.as_str(), None),
            };
            let address = Address::from_str(address)?.require_network(provider.config().network)?;
            Ok(match value {
                Some(value) => Payout::with_value(address, value),
                None => Payout::to(address),
            })
        })
        .collect()
}

fn report_spend(what: &str, txid: Txid) {
    println!("{} transaction broadcast: {}", what, txid);
}

fn format_time(timestamp: u32) -> String {
    chrono::DateTime::from_timestamp(i64::from(timestamp), 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn init(contract: &str, params: CollateralParams) -> Result<()> {
    let config = ProviderConfig::from_env()?;
    let addresses = CollateralProvider::new((), (), config).lock_addresses(&params)?;

    println!("Creating {:?} contract", params.variant.protocol);
    println!("Loan expires:        {}", format_time(params.expirations.loan));
    println!("Liquidation expires: {}", format_time(params.expirations.liquidation));
    if let Some(seizure) = params.expirations.seizure {
        println!("Seizure expires:     {}", format_time(seizure));
    }
    println!("Refundable: {}", addresses.refundable);
    println!("Seizable:   {}", addresses.seizable);

    params.save_to_file(contract)?;
    println!("Contract saved to {}", contract);
    Ok(())
}

fn secrets(slots: &[SecretSlot], output: &str) -> Result<()> {
    let mut generated = BTreeMap::new();
    for slot in slots {
        let secret = Secret::random();
        println!("{}: {}", slot, secret.hash());
        generated.insert(format!("{:?}", slot).to_lowercase(), secret.to_hex());
    }
    std::fs::write(output, serde_json::to_string_pretty(&generated)?)?;
    println!("Secrets saved to {}; share only the hashes", output);
    Ok(())
}

fn addresses(contract: &str) -> Result<()> {
    let params = CollateralParams::load_from_file(contract)?;
    let config = ProviderConfig::from_env()?;
    let provider = CollateralProvider::new((), (), config);
    let locator = provider.locator(&params)?;

    for leg in Leg::BOTH {
        let script = locator.script(leg);
        println!("\n{} leg", leg);
        println!("  Redeem script: {}", script.redeem_script.to_hex_string());
        for kind in PaymentKind::ALL {
            let marker = if kind == provider.config().script_mode {
                "*"
            } else {
                " "
            };
            println!("  {} {:<11} {}", marker, kind, script.variants.get(kind).address);
        }
    }
    Ok(())
}

async fn lock(contract: &str, wif: &[String], values: CollateralValues, batch: bool) -> Result<()> {
    let (provider, params) = load(contract, wif)?;
    println!(
        "Locking {} from wallet {}",
        amount::format_dual(locked_value(&values).to_sat()),
        provider.backend().get_wallet_name()
    );

    if batch {
        let txid = provider.lock_batch(&values, &params).await?;
        println!("Both legs funded in {}", txid);
    } else {
        let receipt = provider.lock(&values, &params).await?;
        println!("Refundable funded in {}", receipt.refundable);
        println!("Seizable funded in   {}", receipt.seizable);
    }
    Ok(())
}

async fn find(contract: &str, wif: &[String], leg: Leg, explorer: bool) -> Result<()> {
    if explorer {
        let params = CollateralParams::load_from_file(contract)?;
        let provider = CollateralProvider::new(EsploraClient::new()?, (), ProviderConfig::from_env()?);
        let txid = provider.find_lock_transaction(&params, leg).await?;
        println!("{} lock transaction: {}", leg, txid);
        return Ok(());
    }

    let (provider, params) = load(contract, wif)?;
    let txid = provider.find_lock_transaction(&params, leg).await?;
    let confirmations = provider.backend().get_confirmations(&txid).await?;
    println!("{} lock transaction: {} ({} confirmations)", leg, txid, confirmations);
    Ok(())
}

async fn multisig_sign(
    contract: &str,
    wif: &[String],
    txids: &[String],
    role: Role,
    destinations: &[String],
    output: &str,
) -> Result<()> {
    let (provider, params) = load(contract, wif)?;
    let payouts = parse_payouts(&provider, destinations)?;
    let partial = provider
        .multisig_sign(&txid::parse_all(txids)?, &params, role, &payouts)
        .await?;

    std::fs::write(output, serde_json::to_string_pretty(&partial)?)?;
    println!(
        "{} signatures over {} saved to {}",
        role, partial.unsigned_txid, output
    );
    Ok(())
}

async fn multisig_send(
    contract: &str,
    wif: &[String],
    txids: &[String],
    destinations: &[String],
    partial_files: &[String],
    evidence: &[Secret],
    dry_run: bool,
) -> Result<()> {
    let (provider, params) = load(contract, wif)?;
    let payouts = parse_payouts(&provider, destinations)?;
    let txids = txid::parse_all(txids)?;

    let mut partials = Vec::with_capacity(partial_files.len());
    for file in partial_files {
        let json = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read partial signatures from {}", file))?;
        let partial: PartialSignatures = serde_json::from_str(&json)?;
        info!("Loaded {} signatures from {}", partial.role, file);
        partials.push(partial);
    }

    if dry_run {
        let tx = provider
            .multisig_build(&txids, &params, &payouts, &partials, evidence)
            .await?;
        println!("{}", consensus::encode::serialize_hex(&tx));
    } else {
        let txid = provider
            .multisig_send(&txids, &params, &payouts, &partials, evidence)
            .await?;
        report_spend("Cooperative spend", txid);
    }
    Ok(())
}
