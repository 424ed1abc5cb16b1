// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sigchain::chain::ServerLink;
use sigchain::context::SystemClock;
use sigchain::family::KeyStatus;
use sigchain::ids::{Kid, Uid};
use sigchain::merkle::{PathQuery, PathResponse};
use sigchain::store::{FileStore, LocalStore, MemoryStore};
use sigchain::{
    Config, Context, DirectoryService, KeyCatalog, MerkleClient, MerkleError, SigChain,
};

#[derive(Parser)]
#[command(name = "sigchain", about = "Sigchain replay and Merkle proof checks")]
struct Cli {
    /// Client configuration; a missing file means defaults.
    #[arg(long, global = true, default_value = "sigchain.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify a user's links and print the resulting key family.
    Replay(ReplayArgs),
    /// Verify a saved directory response for a user.
    VerifyPath(VerifyPathArgs),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
}

#[derive(Args)]
struct StoreArgs {
    /// Directory for persisted chains and roots; overrides `store_dir`.
    #[arg(long, value_name = "DIR")]
    store: Option<PathBuf>,
}

#[derive(Args)]
struct ReplayArgs {
    /// JSON array of server link records, oldest first.
    #[arg(long, value_name = "FILE")]
    links: PathBuf,
    /// JSON key family as served alongside the chain.
    #[arg(long, value_name = "FILE")]
    keys: PathBuf,
    #[arg(long)]
    username: String,
    /// Eldest KID reported by the directory for this user.
    #[arg(long, value_name = "KID")]
    eldest: Option<String>,
    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args)]
struct VerifyPathArgs {
    /// JSON path response captured from the directory.
    #[arg(long, value_name = "FILE")]
    response: PathBuf,
    #[arg(long)]
    username: String,
    #[command(flatten)]
    store: StoreArgs,
}

/// Serves one captured response, whatever the query.
struct RecordedDirectory(PathResponse);

impl DirectoryService for RecordedDirectory {
    fn fetch_path(&self, _query: &PathQuery) -> Result<PathResponse, MerkleError> {
        Ok(self.0.clone())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load_from_path(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    match cli.command {
        Command::Replay(args) => handle_replay(config, args),
        Command::VerifyPath(args) => handle_verify_path(config, args),
        Command::Config(ConfigCommand::Show) => handle_config_show(&config),
    }
}

fn open_context(config: Config, args: &StoreArgs) -> Result<Context> {
    let dir = args.store.clone().or_else(|| config.store_dir.clone());
    let store: Arc<dyn LocalStore> = match dir {
        Some(dir) => Arc::new(
            FileStore::new(&dir).with_context(|| format!("failed to open {}", dir.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    Ok(Context::new(config, store, Arc::new(SystemClock)))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn handle_replay(config: Config, args: ReplayArgs) -> Result<()> {
    let ctx = open_context(config, &args.store)?;
    let links: Vec<ServerLink> = serde_json::from_slice(&read_file(&args.links)?)
        .with_context(|| format!("failed to parse {}", args.links.display()))?;
    let catalog = KeyCatalog::from_json(&read_file(&args.keys)?)
        .with_context(|| format!("failed to parse {}", args.keys.display()))?;
    let eldest = args
        .eldest
        .as_deref()
        .map(Kid::from_hex)
        .transpose()
        .context("invalid eldest KID")?;

    let uid = Uid::from_username(&args.username);
    let mut chain = SigChain::from_server_links(uid, &args.username, links)
        .context("failed to import links")?;
    let (cached, family) = chain
        .verify_sigs_and_compute_keys(Arc::new(catalog), eldest.as_ref())
        .with_context(|| format!("sigchain for {} failed verification", args.username))?;
    info!(links = chain.len(), cached, "replayed sigchain");

    if args.store.store.is_some() || ctx.config().store_dir.is_some() {
        chain
            .store(ctx.store())
            .context("failed to persist sigchain")?;
    }

    println!(
        "{} ({uid}): {} links, tail seqno {}",
        chain.username(),
        chain.len(),
        chain.last_loaded_seqno()
    );
    let now = ctx.now();
    for (kid, info) in &family.infos().infos {
        let status = match info.status {
            KeyStatus::Uncancelled => format!("{:?}", info.activity_at(now)).to_lowercase(),
            KeyStatus::Revoked => "revoked".to_string(),
        };
        let role = if info.eldest {
            "eldest"
        } else if info.sibkey {
            "sibkey"
        } else {
            "subkey"
        };
        println!("  {kid} {role} {status}");
    }
    Ok(())
}

fn handle_verify_path(config: Config, args: VerifyPathArgs) -> Result<()> {
    let ctx = open_context(config, &args.store)?;
    let response: PathResponse = serde_json::from_slice(&read_file(&args.response)?)
        .with_context(|| format!("failed to parse {}", args.response.display()))?;
    let seqno = response.root.seqno();
    let client = MerkleClient::new(ctx, Arc::new(RecordedDirectory(response)))
        .context("failed to start merkle client")?;
    let leaf = client
        .lookup_user(&PathQuery::for_username(&args.username))
        .with_context(|| format!("path for {} failed verification at root {seqno}", args.username))?;

    println!("root {seqno}: {} ({})", leaf.username, leaf.uid);
    match &leaf.public {
        Some(tail) => println!("  public tail {} {}", tail.seqno, tail.link_id),
        None => println!("  no public chain"),
    }
    if let Some(eldest) = &leaf.eldest {
        println!("  eldest {eldest}");
    }
    Ok(())
}

fn handle_config_show(config: &Config) -> Result<()> {
    let kids = config
        .tree_signing_kids()
        .context("invalid tree-signing keys")?;
    println!(
        "{}",
        serde_json::to_string_pretty(config).context("failed to render config")?
    );
    println!("tree signing keys:");
    for kid in kids {
        println!("  {kid}");
    }
    match config.first_examinable_merkle_seqno() {
        Some(seqno) => println!("historical roots from {seqno}"),
        None => println!("historical roots unrestricted"),
    }
    Ok(())
}
