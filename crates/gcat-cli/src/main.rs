use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gcat_sync::PopulateParams;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "gcat-cli")]
#[command(about = "Game catalog ingest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one catalog batch and ingest it.
    Populate(PopulateArgs),
    /// Run populate on the configured cron until interrupted.
    Schedule,
}

#[derive(Debug, Default, clap::Args)]
struct PopulateArgs {
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    order: Option<String>,
    #[arg(long, value_delimiter = ',')]
    product_types: Option<Vec<String>>,
    #[arg(long)]
    release_statuses: Option<String>,
}

impl From<PopulateArgs> for PopulateParams {
    fn from(args: PopulateArgs) -> Self {
        Self {
            limit: args.limit,
            query: args.query,
            order: args.order,
            product_types: args.product_types,
            release_statuses: args.release_statuses,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gcat_sync=info,gcat_adapters=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Populate(PopulateArgs::default())) {
        Commands::Populate(args) => {
            let summary = gcat_sync::run_populate_from_env(&args.into()).await?;
            println!(
                "populate complete: run_id={} fetched={} created={} skipped={} failed={} rejected={} uploads={}/{}{}",
                summary.run_id,
                summary.fetched_products,
                summary.created,
                summary.skipped,
                summary.failed,
                summary.rejected.len(),
                summary.uploads_ok,
                summary.uploads_ok + summary.uploads_failed,
                summary
                    .report_path
                    .as_deref()
                    .map(|p| format!(" report={p}"))
                    .unwrap_or_default()
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(gcat_sync::pipeline_from_env()?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                eprintln!("scheduler disabled; set GCAT_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().populate_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
