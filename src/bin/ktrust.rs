// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ktrust::admin::{Domain, DomainStore};
use ktrust::entry::objecthash;
use ktrust::{DomainInfo, Entry, TrustedRoot};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ktrust", about = "Key transparency operator utility")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(subcommand)]
    Domain(DomainCommand),
    #[command(subcommand)]
    Root(RootCommand),
    #[command(subcommand)]
    Entry(EntryCommand),
    #[command(subcommand)]
    Descriptor(DescriptorCommand),
}

#[derive(Subcommand)]
enum DomainCommand {
    Ls(DomainLsArgs),
    Add(DomainAddArgs),
    Rm(DomainIdArgs),
    Restore(DomainIdArgs),
}

#[derive(Subcommand)]
enum RootCommand {
    Show(RootArgs),
}

#[derive(Subcommand)]
enum EntryCommand {
    Hash(FileArgs),
}

#[derive(Subcommand)]
enum DescriptorCommand {
    Check(FileArgs),
}

#[derive(Args, Clone)]
struct StoreArgs {
    #[arg(long, value_name = "DIR", default_value = "domains")]
    store: PathBuf,
}

#[derive(Args)]
struct DomainLsArgs {
    #[command(flatten)]
    common: StoreArgs,
    /// Include soft-deleted domains.
    #[arg(long)]
    deleted: bool,
}

#[derive(Args)]
struct DomainAddArgs {
    #[command(flatten)]
    common: StoreArgs,
    domain_id: String,
    #[arg(long)]
    map_id: i64,
    #[arg(long)]
    log_id: i64,
    #[arg(long, value_name = "HEX")]
    vrf_public_key: String,
    #[arg(long, value_name = "HEX")]
    vrf_private_key: String,
    #[arg(long, value_name = "SECS", default_value_t = 1)]
    min_interval: u64,
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    max_interval: u64,
}

#[derive(Args)]
struct DomainIdArgs {
    #[command(flatten)]
    common: StoreArgs,
    domain_id: String,
}

#[derive(Args)]
struct RootArgs {
    #[arg(long, value_name = "FILE", default_value = "trusted_root.json")]
    path: PathBuf,
}

#[derive(Args)]
struct FileArgs {
    file: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Domain(cmd) => handle_domain(cmd),
        Command::Root(RootCommand::Show(args)) => handle_root_show(args),
        Command::Entry(EntryCommand::Hash(args)) => handle_entry_hash(args),
        Command::Descriptor(DescriptorCommand::Check(args)) => handle_descriptor_check(args),
    }
}

fn open_store(args: &StoreArgs) -> Result<DomainStore> {
    DomainStore::new(&args.store)
        .with_context(|| format!("failed to open domain store {}", args.store.display()))
}

fn handle_domain(command: DomainCommand) -> Result<()> {
    match command {
        DomainCommand::Ls(args) => {
            let store = open_store(&args.common)?;
            let domains = store.list(args.deleted).context("failed to list domains")?;
            if domains.is_empty() {
                println!("no domains");
            }
            for domain in domains {
                let marker = if domain.deleted { " (deleted)" } else { "" };
                println!(
                    "{}{marker}: map {} log {} interval {:?}..{:?}",
                    domain.domain_id,
                    domain.map_id,
                    domain.log_id,
                    domain.min_interval,
                    domain.max_interval
                );
            }
            Ok(())
        }
        DomainCommand::Add(args) => {
            let store = open_store(&args.common)?;
            let domain = Domain {
                domain_id: args.domain_id.clone(),
                map_id: args.map_id,
                log_id: args.log_id,
                vrf_public_key: hex::decode(&args.vrf_public_key)
                    .context("VRF public key is not valid hex")?,
                vrf_private_key: hex::decode(&args.vrf_private_key)
                    .context("VRF private key is not valid hex")?,
                min_interval: Duration::from_secs(args.min_interval),
                max_interval: Duration::from_secs(args.max_interval),
                deleted: false,
            };
            store
                .write(&domain)
                .with_context(|| format!("failed to add domain {}", args.domain_id))?;
            println!("added domain {}", args.domain_id);
            Ok(())
        }
        DomainCommand::Rm(args) => {
            open_store(&args.common)?
                .set_delete(&args.domain_id, true)
                .with_context(|| format!("failed to delete domain {}", args.domain_id))?;
            println!("deleted domain {}", args.domain_id);
            Ok(())
        }
        DomainCommand::Restore(args) => {
            open_store(&args.common)?
                .set_delete(&args.domain_id, false)
                .with_context(|| format!("failed to restore domain {}", args.domain_id))?;
            println!("restored domain {}", args.domain_id);
            Ok(())
        }
    }
}

fn handle_root_show(args: RootArgs) -> Result<()> {
    let root = TrustedRoot::load_from_path(&args.path)
        .with_context(|| format!("failed to load {}", args.path.display()))?;
    if root.tree_size == 0 {
        println!("no trusted root");
        return Ok(());
    }
    println!("tree size: {}", root.tree_size);
    println!("root hash: {}", hex::encode(root.root_hash));
    println!("timestamp: {} ns", root.timestamp_nanos);
    Ok(())
}

fn handle_entry_hash(args: FileArgs) -> Result<()> {
    let bytes =
        fs::read(&args.file).with_context(|| format!("failed to read {}", args.file.display()))?;
    let entry = Entry::from_leaf_value(Some(bytes.as_slice()))
        .with_context(|| format!("failed to decode entry {}", args.file.display()))?;
    println!("{}", hex::encode(objecthash::hash_entry(entry.as_ref())));
    Ok(())
}

fn handle_descriptor_check(args: FileArgs) -> Result<()> {
    let bytes =
        fs::read(&args.file).with_context(|| format!("failed to read {}", args.file.display()))?;
    let info: DomainInfo = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse descriptor {}", args.file.display()))?;
    let anchors = info
        .trust_anchors()
        .with_context(|| format!("descriptor for {} is not usable", info.domain_id))?;
    println!("domain {} ok", anchors.domain_id());
    println!("log key id: {}", anchors.log_public_key().key_id());
    println!("map key id: {}", anchors.map_public_key().key_id());
    Ok(())
}
