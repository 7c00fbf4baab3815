use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use matchlake_adapters::riot_match_table_schema;
use matchlake_core::PartitionKey;
use matchlake_storage::{LocalParquetTable, TableError, TargetTable};
use matchlake_sync::{
    load_player_registry, maybe_build_scheduler, today_at, trailing_days, write_run_report,
    IngestConfig, IngestPipeline,
};
use tracing::warn;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "matchlake")]
#[command(about = "Riot match ingestion into a partitioned Parquet table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one player's matches for one calendar day.
    Ingest {
        /// Riot handle, `name#tag`.
        #[arg(long)]
        player: String,
        /// Defaults to today in the configured day offset.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Ingest the trailing window for every enabled player.
    Window {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Create the target table with the default match schema.
    InitTable,
    /// Print the target table's schema as JSON.
    Schema,
    /// Run the trailing window on the configured cron until interrupted.
    Schedule,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn enabled_players(config: &IngestConfig) -> Result<Vec<String>> {
    let registry = load_player_registry(&config.players_file).await?;
    Ok(registry.enabled_handles())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Window { days: None }) {
        Commands::Ingest { player, date } => {
            let day = match date {
                Some(day) => day,
                None => today_at(config.day_offset()?),
            };
            let pipeline = IngestPipeline::from_config(&config).await?;
            let stats = pipeline.run_unit(&player, day).await?;
            println!(
                "ingest complete: partition={} fetched={} built={} kept={} dropped={} appended={}",
                PartitionKey::new(player, day),
                stats.fetched,
                stats.built,
                stats.kept,
                stats.dropped,
                stats.appended
            );
        }
        Commands::Window { days } => {
            let players = enabled_players(&config).await?;
            let days = trailing_days(
                today_at(config.day_offset()?),
                days.unwrap_or(config.trailing_days),
            );
            let pipeline = Arc::new(IngestPipeline::from_config(&config).await?);
            let summary = pipeline.run_window(&players, &days).await;
            let reports_dir = write_run_report(&config.reports_dir, &summary).await?;
            println!(
                "window complete: run_id={} units={} failed={} appended={} reports={}",
                summary.run_id,
                summary.units.len(),
                summary.failed_units,
                summary.appended_rows,
                reports_dir.display()
            );
            if !summary.succeeded() {
                anyhow::bail!("{} ingest unit(s) failed", summary.failed_units);
            }
        }
        Commands::InitTable => {
            let table =
                LocalParquetTable::create(&config.table_root, &riot_match_table_schema())
                    .await
                    .with_context(|| {
                        format!("creating table at {}", config.table_root.display())
                    })?;
            println!("table created: {}", table.identifier());
        }
        Commands::Schema => {
            let schema = match LocalParquetTable::open(&config.table_root).await {
                Ok(table) => table.load_schema().await?,
                Err(TableError::NotFound(_)) => riot_match_table_schema(),
                Err(err) => return Err(err.into()),
            };
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Commands::Schedule => {
            let players = enabled_players(&config).await?;
            let pipeline = Arc::new(IngestPipeline::from_config(&config).await?);
            let Some(sched) = maybe_build_scheduler(pipeline, &config, players).await? else {
                anyhow::bail!("scheduler disabled; set MATCHLAKE_SCHEDULER_ENABLED=true");
            };
            sched
                .run_until(async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "cannot listen for ctrl-c; stopping scheduler");
                    }
                })
                .await?;
        }
    }

    Ok(())
}
