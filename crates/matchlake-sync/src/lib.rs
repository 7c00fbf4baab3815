//! Ingestion orchestration: per (player, day) units of fetch, normalize, dedup and
//! append, run concurrently over a window and summarized into run reports.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use matchlake_adapters::{
    riot_match_table_schema, ActivitySource, RiotApiConfig, RiotClient, RowNormalizer,
};
use matchlake_core::{DedupKey, ParticipantRow, PartitionKey};
use matchlake_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, LocalParquetTable, RawPayloadArchive,
    SchemaAdapter, SharedTable, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod append;
pub mod dedup;

pub use append::{AppendError, AppendReport, Appender};
pub use dedup::{DedupError, DedupResolver};

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerRegistry {
    pub players: Vec<PlayerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    pub handle: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl PlayerRegistry {
    pub fn enabled_handles(&self) -> Vec<String> {
        self.players
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.handle.clone())
            .collect()
    }
}

pub async fn load_player_registry(path: &Path) -> Result<PlayerRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api_key: Option<String>,
    pub regional_routing: String,
    pub api_base_url: String,
    pub table_root: PathBuf,
    pub players_file: PathBuf,
    pub rate_delay_ms: u64,
    pub trailing_days: u32,
    pub concurrency: usize,
    pub day_offset_minutes: i32,
    pub http_timeout_secs: u64,
    /// Requests per second across all units; 0 leaves the client unthrottled.
    pub rate_limit_per_sec: u32,
    pub user_agent: String,
    pub raw_archive_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub cron: String,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let regional_routing =
            std::env::var("RIOT_REGIONAL_ROUTING").unwrap_or_else(|_| "europe".to_string());
        Self {
            api_key: std::env::var("RIOT_API_KEY").ok().filter(|v| !v.trim().is_empty()),
            api_base_url: std::env::var("RIOT_API_BASE_URL")
                .unwrap_or_else(|_| RiotApiConfig::regional_base_url(&regional_routing)),
            regional_routing,
            table_root: std::env::var("MATCHLAKE_TABLE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./warehouse/lol_raw/data_api_mining")),
            players_file: std::env::var("MATCHLAKE_PLAYERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./players.yaml")),
            rate_delay_ms: env_parse("MATCHLAKE_RATE_DELAY_MS", 1200),
            trailing_days: env_parse("MATCHLAKE_TRAILING_DAYS", 3),
            concurrency: env_parse("MATCHLAKE_CONCURRENCY", 4),
            day_offset_minutes: env_parse("MATCHLAKE_DAY_OFFSET_MINUTES", 0),
            http_timeout_secs: env_parse("MATCHLAKE_HTTP_TIMEOUT_SECS", 20),
            rate_limit_per_sec: env_parse("MATCHLAKE_RATE_LIMIT_PER_SEC", 0),
            user_agent: std::env::var("MATCHLAKE_USER_AGENT")
                .unwrap_or_else(|_| "matchlake/0.1".to_string()),
            raw_archive_dir: std::env::var("MATCHLAKE_RAW_ARCHIVE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            reports_dir: std::env::var("MATCHLAKE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scheduler_enabled: std::env::var("MATCHLAKE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: std::env::var("MATCHLAKE_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: TokenBucketConfig::per_second(self.rate_limit_per_sec),
            ..Default::default()
        }
    }

    /// Fixed offset that defines calendar days for fetching.
    pub fn day_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.day_offset_minutes.saturating_mul(60)).with_context(|| {
            format!("day offset of {} minutes is out of range", self.day_offset_minutes)
        })
    }
}

/// Calendar date "today" at the given offset.
pub fn today_at(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}

/// `n` days ending at `today`, oldest first.
pub fn trailing_days(today: NaiveDate, n: u32) -> Vec<NaiveDate> {
    (0..u64::from(n))
        .rev()
        .filter_map(|back| today.checked_sub_days(Days::new(back)))
        .collect()
}

type PartitionLockMap = HashMap<PartitionKey, Arc<Mutex<()>>>;

/// Per-partition async mutexes serializing the read-then-append critical section.
/// An entry lives only while some unit holds or waits on it.
#[derive(Debug, Default)]
pub struct PartitionLocks {
    locks: Arc<std::sync::Mutex<PartitionLockMap>>,
}

impl PartitionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, partition: &PartitionKey) -> Arc<Mutex<()>> {
        let mut map = lock_map(&self.locks);
        map.entry(partition.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Locks every partition in sorted order; release by dropping the guards.
    pub async fn acquire(&self, partitions: &BTreeSet<PartitionKey>) -> Vec<PartitionGuard> {
        let mut guards = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let guard = self.lock_for(partition).lock_owned().await;
            guards.push(PartitionGuard {
                partition: partition.clone(),
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            });
        }
        guards
    }

    /// Partitions currently held or awaited.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_map(locks: &std::sync::Mutex<PartitionLockMap>) -> std::sync::MutexGuard<'_, PartitionLockMap> {
    locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Held lock on one partition. Dropping it releases the lock and forgets the
/// partition once nobody else references it.
#[derive(Debug)]
pub struct PartitionGuard {
    partition: PartitionKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<std::sync::Mutex<PartitionLockMap>>,
}

impl PartitionGuard {
    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }
}

impl Drop for PartitionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = lock_map(&self.locks);
        // Clones are only handed out under the map lock, so a count of one is final.
        if map
            .get(&self.partition)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.partition);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitStats {
    pub fetched: usize,
    pub built: usize,
    pub kept: usize,
    pub dropped: usize,
    pub appended: usize,
    /// Appended rows keyed by `player@date`.
    pub appended_by_partition: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub player: String,
    pub event_date: NaiveDate,
    pub status: UnitStatus,
    pub stats: UnitStats,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitOutcome>,
    pub appended_rows: usize,
    pub failed_units: usize,
}

impl IngestRunSummary {
    pub fn succeeded(&self) -> bool {
        self.failed_units == 0
    }
}

pub struct IngestPipeline {
    source: Arc<dyn ActivitySource>,
    table: SharedTable,
    normalizer: RowNormalizer,
    dedup: DedupResolver,
    locks: PartitionLocks,
    concurrency: usize,
}

impl IngestPipeline {
    pub fn new(source: Arc<dyn ActivitySource>, table: SharedTable) -> Self {
        Self {
            source,
            table,
            normalizer: RowNormalizer::new(),
            dedup: DedupResolver::new(),
            locks: PartitionLocks::new(),
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Wires the Riot client and the local table described by `config`.
    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("RIOT_API_KEY is not set")?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let mut riot = RiotClient::new(
            Arc::new(http),
            RiotApiConfig {
                api_key,
                base_url: config.api_base_url.clone(),
                rate_delay: Duration::from_millis(config.rate_delay_ms),
                day_offset: config.day_offset()?,
                backoff: BackoffPolicy::default(),
            },
        )
        .context("configuring riot client")?;
        if let Some(dir) = &config.raw_archive_dir {
            riot = riot.with_archive(RawPayloadArchive::new(dir.clone()));
        }

        let table = LocalParquetTable::open_or_create(&config.table_root, &riot_match_table_schema())
            .await
            .with_context(|| format!("opening table at {}", config.table_root.display()))?;

        Ok(Self::new(Arc::new(riot), Arc::new(table)).with_concurrency(config.concurrency))
    }

    pub fn table(&self) -> &SharedTable {
        &self.table
    }

    /// One (player, day) unit: fetch, normalize, then dedup and append.
    pub async fn run_unit(&self, player: &str, day: NaiveDate) -> Result<UnitStats> {
        let span = info_span!("ingest_unit", source = self.source.source_id(), player, %day);
        async move {
            let schema = SchemaAdapter::load(self.table.as_ref())
                .await
                .context("loading table schema")?;
            let partition = PartitionKey::new(player, day);

            let records = self
                .source
                .fetch_day(player, day)
                .await
                .with_context(|| format!("fetching activities for {partition}"))?;

            let mut rows = Vec::new();
            for record in &records {
                rows.extend(
                    self.normalizer
                        .normalize(record, &partition)
                        .with_context(|| format!("normalizing activities for {partition}"))?,
                );
            }

            let mut stats = self.ingest_rows(&schema, rows).await?;
            stats.fetched = records.len();
            info!(
                fetched = stats.fetched,
                built = stats.built,
                kept = stats.kept,
                dropped = stats.dropped,
                appended = stats.appended,
                "ingest unit finished"
            );
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    /// Dedup-filters `rows` against the table and in-batch repeats, then appends
    /// the survivors in one commit. Holds the partition locks for the whole step.
    pub async fn ingest_rows(
        &self,
        schema: &SchemaAdapter,
        rows: Vec<ParticipantRow>,
    ) -> Result<UnitStats> {
        let built = rows.len();
        if rows.is_empty() {
            return Ok(UnitStats::default());
        }

        let partitions: BTreeSet<PartitionKey> =
            rows.iter().map(|row| row.partition().clone()).collect();
        let _guards = self.locks.acquire(&partitions).await;

        let existing = self
            .dedup
            .resolve(self.table.as_ref(), &partitions)
            .await
            .context("resolving existing keys")?;

        let mut seen: HashSet<(PartitionKey, DedupKey)> = HashSet::new();
        let kept: Vec<ParticipantRow> = rows
            .into_iter()
            .filter(|row| {
                let stored = existing
                    .get(row.partition())
                    .is_some_and(|keys| keys.contains(row.key()));
                !stored && seen.insert((row.partition().clone(), row.key().clone()))
            })
            .collect();

        let report = Appender::new(schema.clone())
            .append(self.table.as_ref(), &kept)
            .await
            .context("appending rows")?;

        let appended_by_partition: BTreeMap<String, usize> = report
            .by_partition
            .iter()
            .map(|(partition, rows)| (partition.to_string(), *rows))
            .collect();
        for (partition, rows) in &appended_by_partition {
            debug!(%partition, rows, snapshot_id = ?report.snapshot_id, "partition appended");
        }

        Ok(UnitStats {
            fetched: 0,
            built,
            kept: kept.len(),
            dropped: built - kept.len(),
            appended: report.rows,
            appended_by_partition,
        })
    }

    /// Runs every (player, day) unit with bounded concurrency. A failing unit is
    /// recorded and does not stop the others.
    pub async fn run_window(
        self: &Arc<Self>,
        players: &[String],
        days: &[NaiveDate],
    ) -> IngestRunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let limit = Arc::new(Semaphore::new(self.concurrency));

        let mut tasks = JoinSet::new();
        for player in players {
            for day in days {
                let pipeline = Arc::clone(self);
                let limit = Arc::clone(&limit);
                let player = player.clone();
                let day = *day;
                tasks.spawn(async move {
                    let _permit = limit.acquire_owned().await.ok();
                    let result = pipeline.run_unit(&player, day).await;
                    unit_outcome(player, day, result)
                });
            }
        }

        let mut units = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => units.push(outcome),
                Err(err) => error!(error = %err, "ingest unit task aborted"),
            }
        }
        units.sort_by(|a, b| (&a.player, a.event_date).cmp(&(&b.player, b.event_date)));

        let summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            appended_rows: units.iter().map(|u| u.stats.appended).sum(),
            failed_units: units
                .iter()
                .filter(|u| u.status == UnitStatus::Failed)
                .count(),
            units,
        };
        info!(
            %run_id,
            units = summary.units.len(),
            failed = summary.failed_units,
            appended = summary.appended_rows,
            "ingest window finished"
        );
        summary
    }
}

fn unit_outcome(player: String, day: NaiveDate, result: Result<UnitStats>) -> UnitOutcome {
    match result {
        Ok(stats) => UnitOutcome {
            player,
            event_date: day,
            status: UnitStatus::Succeeded,
            stats,
            error: None,
        },
        Err(err) => {
            error!(player = %player, %day, error = %format!("{err:#}"), "ingest unit failed");
            UnitOutcome {
                player,
                event_date: day,
                status: UnitStatus::Failed,
                stats: UnitStats::default(),
                error: Some(format!("{err:#}")),
            }
        }
    }
}

/// Writes `ingest_summary.json` and `ingest_brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_run_report(reports_root: &Path, summary: &IngestRunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing ingest summary")?;
    fs::write(reports_dir.join("ingest_summary.json"), json)
        .await
        .context("writing ingest_summary.json")?;

    let mut per_player: BTreeMap<&str, usize> = BTreeMap::new();
    for unit in &summary.units {
        *per_player.entry(unit.player.as_str()).or_default() += unit.stats.appended;
    }
    let failures = summary
        .units
        .iter()
        .filter(|u| u.status == UnitStatus::Failed)
        .map(|u| {
            format!(
                "- {} {}: {}",
                u.player,
                u.event_date,
                u.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>();

    let brief = format!(
        "# Match Lake Ingest Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Units: {}\n- Failed units: {}\n- Appended rows: {}\n\n## Appended Rows by Player\n{}\n\n## Failures\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.units.len(),
        summary.failed_units,
        summary.appended_rows,
        per_player
            .iter()
            .map(|(player, rows)| format!("- {player}: {rows}"))
            .collect::<Vec<_>>()
            .join("\n"),
        if failures.is_empty() {
            "- none".to_string()
        } else {
            failures.join("\n")
        }
    );
    fs::write(reports_dir.join("ingest_brief.md"), brief)
        .await
        .context("writing ingest_brief.md")?;

    Ok(reports_dir)
}

/// Cron-driven window runs. Runs never overlap, and shutdown waits for the
/// one in flight.
pub struct IngestScheduler {
    sched: JobScheduler,
    cron: String,
    in_flight: Arc<Mutex<()>>,
}

impl IngestScheduler {
    /// Starts the scheduler, then stops it once `shutdown` resolves.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.sched.start().await.context("starting scheduler")?;
        info!(cron = %self.cron, "scheduler running");

        shutdown.await;
        info!("shutting down scheduler");
        self.sched
            .shutdown()
            .await
            .context("shutting down scheduler")?;

        if self.in_flight.try_lock().is_err() {
            info!("waiting for the running ingest window to finish");
        }
        let _idle = self.in_flight.lock().await;
        Ok(())
    }
}

/// Builds the cron job that runs the trailing window for `players`, if enabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<IngestPipeline>,
    config: &IngestConfig,
    players: Vec<String>,
) -> Result<Option<IngestScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let offset = config.day_offset()?;
    let trailing = config.trailing_days;
    let reports_dir = config.reports_dir.clone();
    let players = Arc::new(players);
    let in_flight = Arc::new(Mutex::new(()));

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_in_flight = Arc::clone(&in_flight);
    let job = Job::new_async(config.cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let players = Arc::clone(&players);
        let reports_dir = reports_dir.clone();
        let in_flight = Arc::clone(&job_in_flight);
        Box::pin(async move {
            let Ok(_running) = in_flight.try_lock() else {
                warn!("previous ingest window still running; skipping this tick");
                return;
            };
            let days = trailing_days(today_at(offset), trailing);
            let summary = pipeline.run_window(&players, &days).await;
            if let Err(err) = write_run_report(&reports_dir, &summary).await {
                warn!(error = %format!("{err:#}"), "failed to write scheduled run report");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(IngestScheduler {
        sched,
        cron: config.cron.clone(),
        in_flight,
    }))
}
