use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use senti_sync::{RunExit, SyncConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "senti")]
#[command(about = "Daily news sentiment backfill")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill every active symbol once (default).
    Sync,
    /// Apply migrations and ensure the yearly partitions.
    Migrate,
    /// Load a legacy `<exchange>/*.csv` tree into the configured store.
    Import {
        #[arg(long)]
        data_root: PathBuf,
    },
    /// Run syncs on SENTIMENT_SYNC_CRON until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("senti=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn sync() -> ExitCode {
    match senti_sync::run_sync_once_from_env().await {
        Ok(summary) => {
            println!("{}", summary.render_markdown());
            println!(
                "sync complete: run_id={} rows={} exit={}",
                summary.run_id,
                summary.rows_written(),
                summary.exit.code()
            );
            ExitCode::from(summary.exit.code())
        }
        Err(err) => {
            error!(exit = err.exit.code(), error = %err, "sync could not start");
            eprintln!("sync failed: {err}");
            ExitCode::from(err.exit.code())
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Sync => Ok(sync().await),
        Commands::Migrate => {
            let report = senti_sync::migrate_from_env().await?;
            println!(
                "migrate complete: layout_before={} statements={} partitions={}",
                report.layout_before,
                report.statements_applied,
                report.partitions.join(",")
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Import { data_root } => {
            let summary = senti_sync::import_from_env(&data_root).await?;
            println!(
                concat!(
                    "import complete: exchanges={} files={} rows={} ",
                    "already_present={} skipped={} cursors={}",
                ),
                summary.exchanges,
                summary.files,
                summary.rows_imported,
                summary.rows_already_present,
                summary.rows_skipped,
                summary.cursors
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let config = match SyncConfig::from_env() {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("configuration error: {err}");
                    return Ok(ExitCode::from(RunExit::Config.code()));
                }
            };
            senti_sync::scheduler::run_scheduled(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli.command.unwrap_or(Commands::Sync)).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
