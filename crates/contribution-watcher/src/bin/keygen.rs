//! Credential and address utility for the contribution watcher
//!
//! Commands:
//! - generate: Create a new API secret and the hash the service is configured with
//! - hash: Hash an existing secret
//! - derive: Show the transparent address derived for a contribution
//! - memo: Show the hex memo for a contribution

use anyhow::Result;
use clap::{Parser, Subcommand};
use contribution_watcher::address::TransparentDeriver;
use contribution_watcher::auth::{hash_secret, Credential};
use watcher_common::memo::{encode_memo, make_memo};
use watcher_common::ContributionId;
use zcash_protocol::consensus::NetworkType;

#[derive(Parser)]
#[command(name = "watcher-keygen")]
#[command(about = "Contribution watcher credential and address utility")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new API secret and its SHA-256 hash
    Generate,

    /// Print the SHA-256 hash of an existing secret
    Hash {
        secret: String,
    },

    /// Derive the transparent address for a contribution id
    Derive {
        /// BIP32 extended public key
        #[arg(short, long)]
        xpub: String,

        /// Contribution id
        #[arg(short, long)]
        index: i64,

        /// mainnet or testnet
        #[arg(short, long, default_value = "testnet")]
        network: String,
    },

    /// Print the hex memo for a contribution
    Memo {
        /// Contribution id
        #[arg(long)]
        id: i64,

        /// Service name embedded in the memo
        #[arg(short, long, default_value = "Grant.io")]
        service: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate => generate(),
        Commands::Hash { secret } => println!("{}", hash_secret(&secret)),
        Commands::Derive {
            xpub,
            index,
            network,
        } => derive(&xpub, index, &network)?,
        Commands::Memo { id, service } => memo(id, &service)?,
    }

    Ok(())
}

fn generate() {
    println!("=== Contribution Watcher Credential ===\n");

    let credential = Credential::generate();

    println!("API SECRET (give to the backend, keep secret!):");
    println!("  {}", credential.secret);
    println!();

    println!("=== Copy to .env file ===");
    println!("API_SECRET_HASH={}", credential.hash);
    println!("API_SECRET={}", credential.secret);
}

fn derive(xpub: &str, index: i64, network: &str) -> Result<()> {
    let network = match network.to_lowercase().as_str() {
        "mainnet" | "main" => NetworkType::Main,
        "testnet" | "test" => NetworkType::Test,
        "regtest" => NetworkType::Regtest,
        other => anyhow::bail!("Unknown network '{}'", other),
    };

    let deriver = TransparentDeriver::new(xpub, network)?;
    println!("{}", deriver.derive(index)?);
    Ok(())
}

fn memo(id: i64, service: &str) -> Result<()> {
    let id = ContributionId::new(id)?;
    let text = make_memo(id, service);

    println!("Memo:     {}", text);
    println!("Memo hex: {}", encode_memo(&text));
    Ok(())
}
