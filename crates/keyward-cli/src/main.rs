//! Keyward key maintenance binary.
//!
//! # Usage
//!
//! ```bash
//! # Publish keys or top up the one-time key pool
//! keyward --db alice.redb rotate --url https://keys.example.com/ \
//!     --identity alice --card-id <64 hex> --identity-key <64 hex>
//!
//! # Local key inventory
//! keyward --db alice.redb status
//! ```
//!
//! Directory credentials can also come from `KEYWARD_URL`, `KEYWARD_TOKEN`,
//! `KEYWARD_IDENTITY`, `KEYWARD_CARD_ID` and `KEYWARD_IDENTITY_KEY`.

use std::{error::Error, path::PathBuf};

use clap::{Args as ClapArgs, Parser, Subcommand};
use keyward_client::{
    RetryConfig, Retrying, SecureChat, SecureChatConfig, SecureChatContext, SystemEnv,
    http::HttpKeyDirectory,
};
use keyward_core::{Card, IdentityPublicKey};
use keyward_crypto::IdentityKeyPair;
use keyward_store::{LongTermKeyStorage, OneTimeKeyStorage, RedbStorage};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type Chat = SecureChat<SystemEnv, Retrying<HttpKeyDirectory, SystemEnv>, RedbStorage>;

/// Keyward key maintenance
#[derive(Parser, Debug)]
#[command(name = "keyward")]
#[command(about = "Maintain end-to-end chat prekeys against a key directory")]
#[command(version)]
struct Args {
    /// Path to the local key database
    #[arg(long, env = "KEYWARD_DB", default_value = "keyward.redb", global = true)]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile local keys with the directory and top up one-time keys
    Rotate(Remote),
    /// Delete published keys, then local keys and pairwise sessions
    Reset(Remote),
    /// Report the local key inventory
    Status,
}

/// Directory connection and local identity.
#[derive(ClapArgs, Debug)]
struct Remote {
    /// Key directory base URL
    #[arg(long, env = "KEYWARD_URL")]
    url: String,

    /// Bearer token for the directory
    #[arg(long, env = "KEYWARD_TOKEN", hide_env_values = true)]
    token: String,

    /// Identity the keys are published for
    #[arg(long, env = "KEYWARD_IDENTITY")]
    identity: String,

    /// Identity card id (64 hex characters)
    #[arg(long, env = "KEYWARD_CARD_ID")]
    card_id: String,

    /// Ed25519 identity seed (64 hex characters)
    #[arg(long, env = "KEYWARD_IDENTITY_KEY", hide_env_values = true)]
    identity_key: String,

    /// JSON file with client tuning; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let storage = RedbStorage::open(&args.db)?;

    match args.command {
        Command::Rotate(remote) => {
            let log = connect(&remote, storage)?.rotate_keys().await?;
            tracing::info!("rotation summary\n{log}");
        },
        Command::Reset(remote) => {
            connect(&remote, storage)?.reset().await?;
            tracing::info!(
                db = %args.db.display(),
                "published keys, local keys and sessions deleted"
            );
        },
        Command::Status => status(&storage)?,
    }

    Ok(())
}

fn connect(remote: &Remote, storage: RedbStorage) -> Result<Chat, Box<dyn Error>> {
    let seed: [u8; 32] = hex::decode(&remote.identity_key)?
        .try_into()
        .map_err(|_| "identity key must be 32 bytes")?;
    let identity = IdentityKeyPair::from_seed(seed);

    let card = Card::new(
        remote.card_id.as_str(),
        remote.identity.as_str(),
        IdentityPublicKey::ed25519(identity.public_key()),
    );
    if card.decoded_id().is_none() {
        return Err("card id must be 64 hex characters".into());
    }

    let config = match &remote.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => SecureChatConfig::default(),
    };

    let env = SystemEnv::new();
    let directory = Retrying::new(
        HttpKeyDirectory::new(&remote.url, remote.token.as_str())?,
        env,
        RetryConfig::default(),
    );

    tracing::info!(identity = %remote.identity, url = %remote.url, "using key directory");
    Ok(SecureChat::new(SecureChatContext { identity, card, env, directory, storage, config }))
}

fn status(storage: &RedbStorage) -> Result<(), Box<dyn Error>> {
    let long_term = storage.retrieve_all_long_term_keys()?;
    let one_time = storage.load_one_time_keys()?;

    let current = long_term
        .iter()
        .find(|key| key.outdated_from.is_none())
        .map_or_else(|| "none".to_string(), |key| key.identifier.to_string());
    let orphaned = one_time.iter().filter(|key| key.orphaned_from.is_some()).count();

    tracing::info!(
        long_term = long_term.len(),
        current = %current,
        one_time_active = one_time.len() - orphaned,
        one_time_orphaned = orphaned,
        "local key inventory"
    );
    Ok(())
}
