use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use recon_sync::{RunOptions, RunSummary, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recon")]
#[command(about = "Snapshot reconciliation and upsert engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once.
    Sync(SyncArgs),
    /// Create the known-state table and the per-source tables.
    Migrate,
    /// Run syncs on RECON_SYNC_CRON until interrupted.
    Schedule(SyncArgs),
    /// Summarize recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Write known state to Parquet.
    Export {
        #[arg(long = "source")]
        sources: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, clap::Args)]
struct SyncArgs {
    /// Only this source; repeatable.
    #[arg(long = "source")]
    sources: Vec<String>,
    /// Re-fetch details for every current record.
    #[arg(long)]
    full_refresh: bool,
    /// Reconcile against a copy of known state and store nothing.
    #[arg(long)]
    dry_run: bool,
}

impl From<SyncArgs> for RunOptions {
    fn from(args: SyncArgs) -> Self {
        RunOptions {
            sources: args.sources,
            full_refresh: args.full_refresh,
            dry_run: args.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let mut filter = EnvFilter::from_default_env();
    for directive in ["recon_cli=info", "recon_sync=info", "recon_adapters=info", "recon_storage=info", "recon_core=info"] {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_once(&args.into()).await?;
            print_summary(&summary)?;
            let status = exit_status(&summary);
            if status != 0 {
                warn!(run_id = %summary.run_id, "no records persisted");
            }
            return Ok(ExitCode::from(status));
        }
        Commands::Migrate => {
            let pipeline = SyncPipeline::new(config)?;
            let tables = pipeline.migrate().await?;
            println!("migrated: known_state {}", tables.join(" "));
        }
        Commands::Schedule(args) => {
            let mut config = config;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            recon_sync::run_scheduler(pipeline, args.into()).await?;
        }
        Commands::Report { runs } => {
            let markdown = recon_sync::report_markdown(&config.reports_dir, runs).await?;
            println!("{markdown}");
        }
        Commands::Export { sources } => {
            let pipeline = SyncPipeline::new(config)?;
            let manifest = pipeline.export(&sources).await?;
            info!(manifest = %manifest.display(), "export complete");
            println!("{}", manifest.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

/// 0 when any stream stored a record, 1 otherwise. Health problems do not count.
fn exit_status(summary: &RunSummary) -> u8 {
    u8::from(!summary.success())
}
