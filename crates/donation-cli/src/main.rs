use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use donation_api::{ConfigArgs, DonationApi};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dk")]
#[command(about = "Donation ledger operator CLI")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Search(SearchArgs),
    Backup {
        #[command(subcommand)]
        command: Box<BackupCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Create the donations table if it does not exist.
    Init,
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Free-text token matched against name, email, address, and network.
    #[arg(long, default_value = "")]
    q: String,
    #[arg(long)]
    page: Option<String>,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Re-insert every record of the JSON backup into the primary store.
    Replay(ReplayArgs),
}

#[derive(Debug, Args)]
struct ReplayArgs {
    /// Read this JSON backup instead of the configured one.
    #[arg(long)]
    json: Option<PathBuf>,
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.load().context("failed to load donation config")?;
    let api = DonationApi::new(config);

    match cli.command {
        Command::Db { command } => run_db(*command, &api).await,
        Command::Search(args) => run_search(&args, &api).await,
        Command::Backup { command } => run_backup(*command, &api).await,
    }
}

async fn run_db(command: DbCommand, api: &DonationApi) -> Result<()> {
    match command {
        DbCommand::Init => {
            api.migrate().await.context("schema migration failed")?;
            emit_json(&serde_json::json!({
                "backend": api.backend(),
                "migrated": true,
            }))
        }
    }
}

async fn run_search(args: &SearchArgs, api: &DonationApi) -> Result<()> {
    let results = api.search(&args.q, args.page.as_deref()).await.context("search failed")?;
    emit_json(&results)
}

async fn run_backup(command: BackupCommand, api: &DonationApi) -> Result<()> {
    match command {
        BackupCommand::Replay(args) => {
            let summary = api
                .replay_backup(args.json.as_deref())
                .await
                .context("failed to read json backup")?;
            let mut value = serde_json::to_value(summary)?;
            if let Value::Object(object) = &mut value {
                object.insert(
                    "source".to_string(),
                    Value::String(
                        args.json.unwrap_or_else(|| api.json_backup_path()).display().to_string(),
                    ),
                );
            }
            emit_json(&value)
        }
    }
}
