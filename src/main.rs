//! Account Receivers CLI
//!
//! Creates accounts and issues receivers, addresses and disclosure pubkeys
//! against the configured store. Output is pretty-printed JSON.

use std::sync::Arc;

use account_receivers::logging::{self, EventCategory, LogEvent, LogLevel};
use account_receivers::{
    expiry_in_hours, AccountManager, AccountStore, Branch, Context, MemoryAccountStore,
    ReceiverConfig, SqliteAccountStore, StorageBackend,
};
use bitcoin::bip32::{Xpriv, Xpub};
use clap::{Parser, Subcommand};
use rand::RngCore;
use secp256k1::Secp256k1;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "account-receivers")]
#[command(about = "Derivation index allocation and receiver issuance for HD accounts")]
struct Cli {
    /// Print the loaded configuration before running
    #[arg(long)]
    show_config: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random master key pair (for development only)
    Keygen,

    /// Create an account from one or more xpubs
    CreateAccount {
        /// Extended public key (repeat for multisig)
        #[arg(long = "xpub", required = true)]
        xpubs: Vec<Xpub>,

        /// Signatures required to spend
        #[arg(short, long, default_value = "1")]
        quorum: u8,

        /// Unique human alias
        #[arg(short, long)]
        alias: Option<String>,
    },

    /// Show an account by alias or ID
    Account { identifier: String },

    /// Issue a program receiver
    Receiver {
        identifier: String,

        /// Expiry in hours from now (default 30 days)
        #[arg(long)]
        expires_in_hours: Option<i64>,
    },

    /// Issue an address receiver, or a change address
    Address {
        identifier: String,

        /// Allocate on the change branch
        #[arg(long)]
        change: bool,
    },

    /// Issue a disclosure pubkey
    Pubkey { identifier: String },

    /// List programs issued to an account
    Programs { identifier: String },

    /// Show the witness script behind a multisig program
    WitnessScript {
        identifier: String,

        /// Derivation index of the program
        #[arg(long)]
        index: u32,

        /// Program is on the change branch
        #[arg(long)]
        change: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let config = ReceiverConfig::from_env()?;
    logging::init_from_config(&config)?;

    if let Err(e) = config.validate_for_startup() {
        tracing::error!(target: "receivers::cli", error = %e, "Configuration rejected");
        return Err(e.into());
    }

    let cli = Cli::parse();
    if cli.show_config {
        config.print_summary();
    }

    let network = config.network.bitcoin_network();
    let store: Arc<dyn AccountStore> = match &config.storage {
        StorageBackend::Sqlite { path } => Arc::new(
            SqliteAccountStore::new(path)?.with_busy_timeout(config.storage_timeout()),
        ),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; counters are lost on exit");
            Arc::new(MemoryAccountStore::new())
        }
    };
    let manager = AccountManager::new(store, network);
    let ctx = Context::with_timeout(config.storage_timeout());

    let event = LogEvent::new(LogLevel::Debug, EventCategory::System, "cli_started").with_data(
        serde_json::json!({
            "network": format!("{:?}", config.network),
            "timeout_ms": config.storage_timeout_ms,
        }),
    );
    tracing::debug!(target: "receivers::cli", "{}", event.to_json());

    match cli.command {
        Commands::Keygen => {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            let xprv = Xpriv::new_master(network, &seed)?;
            let xpub = Xpub::from_priv(&Secp256k1::new(), &xprv);

            print_json(&serde_json::json!({
                "xprv": xprv.to_string(),
                "xpub": xpub.to_string(),
            }))?;
        }
        Commands::CreateAccount {
            xpubs,
            quorum,
            alias,
        } => {
            let account = manager.create_account(xpubs, quorum, alias).await?;
            print_json(&account)?;
        }
        Commands::Account { identifier } => {
            let id = manager.resolve(&ctx, &identifier).await?.into_account_id();
            print_json(&manager.find_by_id(&id).await?)?;
        }
        Commands::Receiver {
            identifier,
            expires_in_hours,
        } => {
            let expires_at = expires_in_hours.map(expiry_in_hours).transpose()?;
            let receiver = manager.create_receiver(&ctx, &identifier, expires_at).await?;
            print_json(&receiver)?;
        }
        Commands::Address { identifier, change } => {
            if change {
                let id = manager.resolve(&ctx, &identifier).await?.into_account_id();
                print_json(&manager.create_address(&ctx, &id, true).await?)?;
            } else {
                print_json(&manager.create_address_receiver(&ctx, &identifier).await?)?;
            }
        }
        Commands::Pubkey { identifier } => {
            print_json(&manager.create_pubkey_info(&ctx, &identifier).await?)?;
        }
        Commands::Programs { identifier } => {
            let id = manager.resolve(&ctx, &identifier).await?.into_account_id();
            print_json(&manager.list_control_programs(&id).await?)?;
        }
        Commands::WitnessScript {
            identifier,
            index,
            change,
        } => {
            let id = manager.resolve(&ctx, &identifier).await?.into_account_id();
            let witness_script = manager
                .witness_script(&id, Branch::for_program(change), index)
                .await?;
            print_json(&serde_json::json!({
                "account_id": id,
                "index": index,
                "witness_script": witness_script.map(|s| hex::encode(s.as_bytes())),
            }))?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
