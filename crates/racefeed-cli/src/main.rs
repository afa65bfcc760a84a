use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use racefeed_sync::{RegionPredicate, RunStatus, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "racefeed")]
#[command(about = "Race event normalization and upsert pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source once and upsert the normalized events.
    Sync,
    /// Delete stored events outside a US state.
    PruneRegion {
        #[arg(long, default_value = "CA")]
        state: String,
        #[arg(long, default_value = "California")]
        state_name: String,
    },
    /// Delete stored events carrying a source label.
    PurgeSource {
        #[arg(long)]
        source: String,
    },
    /// Run syncs on the configured cron schedule until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("racefeed=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::new(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync {:?}: run_id={} sources={} processed={} created={} updated={} rejected={} reports={}",
                summary.status,
                summary.run_id,
                summary.enabled_sources,
                summary.totals.processed,
                summary.totals.created,
                summary.totals.updated,
                summary.totals.rejected,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            if summary.status == RunStatus::Aborted {
                bail!(
                    "sync aborted: {}",
                    summary.abort_reason.as_deref().unwrap_or("store unavailable")
                );
            }
        }
        Commands::PruneRegion { state, state_name } => {
            let pipeline = SyncPipeline::new(config).await?;
            let counts = pipeline
                .prune_region(&RegionPredicate::new(&state, &state_name))
                .await?;
            println!(
                "prune-region {state}: scanned={} deleted={} failed={} unreadable={}",
                counts.scanned, counts.deleted, counts.failed, counts.unreadable
            );
        }
        Commands::PurgeSource { source } => {
            let pipeline = SyncPipeline::new(config).await?;
            let counts = pipeline.purge_source(&source).await?;
            println!(
                "purge-source {source}: scanned={} deleted={} failed={}",
                counts.scanned, counts.deleted, counts.failed
            );
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let pipeline = SyncPipeline::new(config).await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set RACEFEED_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
