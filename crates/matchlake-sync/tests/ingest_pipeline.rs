use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow_array::RecordBatch;
use async_trait::async_trait;
use chrono::NaiveDate;
use matchlake_adapters::{riot_match_table_schema, ActivitySource, AdapterError};
use matchlake_core::{
    ActivityRecord, ParticipantRow, PartitionKey, MATCH_ID_COLUMN, PARTICIPANT_ID_COLUMN,
};
use matchlake_storage::{
    AppendReceipt, LocalParquetTable, ScanTask, SchemaAdapter, TableError, TableScan,
    TableSchema, TargetTable,
};
use matchlake_sync::{
    write_run_report, DedupResolver, IngestPipeline, UnitStatus,
};
use serde_json::{json, Value as JsonValue};

const MONTY: &str = "Monty Gard#RU1";
const BREAKS: &str = "Breaksthesilence#RU1";

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
}

fn sample_payload(match_id: &str) -> JsonValue {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/riot/match_sample.json");
    let mut payload: JsonValue = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    payload["metadata"]["matchId"] = json!(match_id);
    payload
}

fn sample_match(match_id: &str) -> ActivityRecord {
    ActivityRecord::from_payload(sample_payload(match_id)).unwrap()
}

#[derive(Default)]
struct FakeSource {
    days: HashMap<(String, NaiveDate), Vec<ActivityRecord>>,
}

impl FakeSource {
    fn with(mut self, player: &str, day: NaiveDate, records: Vec<ActivityRecord>) -> Self {
        self.days.insert((player.to_string(), day), records);
        self
    }
}

#[async_trait]
impl ActivitySource for FakeSource {
    fn source_id(&self) -> &'static str {
        "fake"
    }

    async fn fetch_day(
        &self,
        player: &str,
        day: NaiveDate,
    ) -> Result<Vec<ActivityRecord>, AdapterError> {
        if player.starts_with("ghost") {
            return Err(AdapterError::UnresolvedPlayer(player.to_string()));
        }
        Ok(self
            .days
            .get(&(player.to_string(), day))
            .cloned()
            .unwrap_or_default())
    }
}

/// Local table whose scan paths can be switched off.
struct FlakyTable {
    inner: LocalParquetTable,
    fail_bulk: AtomicBool,
    fail_tasks: AtomicBool,
}

impl FlakyTable {
    fn new(inner: LocalParquetTable) -> Self {
        Self {
            inner,
            fail_bulk: AtomicBool::new(false),
            fail_tasks: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TargetTable for FlakyTable {
    fn identifier(&self) -> String {
        self.inner.identifier()
    }

    async fn load_schema(&self) -> Result<TableSchema, TableError> {
        self.inner.load_schema().await
    }

    async fn scan_to_batches(&self, scan: &TableScan) -> Result<Vec<RecordBatch>, TableError> {
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(TableError::Unsupported("bulk scan disabled".to_string()));
        }
        self.inner.scan_to_batches(scan).await
    }

    async fn plan_scan_tasks(&self, scan: &TableScan) -> Result<Vec<ScanTask>, TableError> {
        if self.fail_tasks.load(Ordering::SeqCst) {
            return Err(TableError::Unsupported("task planning disabled".to_string()));
        }
        self.inner.plan_scan_tasks(scan).await
    }

    async fn read_scan_task(
        &self,
        scan: &TableScan,
        task: &ScanTask,
    ) -> Result<Vec<RecordBatch>, TableError> {
        self.inner.read_scan_task(scan, task).await
    }

    async fn append(&self, batch: RecordBatch) -> Result<AppendReceipt, TableError> {
        self.inner.append(batch).await
    }
}

async fn new_table(dir: &Path) -> LocalParquetTable {
    LocalParquetTable::create(dir.join("lol_raw/data_api_mining"), &riot_match_table_schema())
        .await
        .unwrap()
}

async fn stored_keys(table: &dyn TargetTable, player: &str, d: NaiveDate) -> usize {
    DedupResolver::new()
        .existing_keys(table, &PartitionKey::new(player, d))
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn rerunning_a_unit_appends_nothing_new() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(new_table(tmp.path()).await);
    let source = FakeSource::default().with(MONTY, day(9), vec![sample_match("RU_1"), sample_match("RU_2")]);
    let pipeline = IngestPipeline::new(Arc::new(source), table.clone());

    let first = pipeline.run_unit(MONTY, day(9)).await.unwrap();
    assert_eq!(first.fetched, 2);
    assert_eq!(first.built, 4);
    assert_eq!(first.appended, 4);
    assert_eq!(
        first.appended_by_partition,
        BTreeMap::from([(PartitionKey::new(MONTY, day(9)).to_string(), 4)])
    );

    let second = pipeline.run_unit(MONTY, day(9)).await.unwrap();
    assert_eq!(second.built, 4);
    assert_eq!(second.kept, 0);
    assert_eq!(second.dropped, 4);
    assert_eq!(second.appended, 0);
    assert!(second.appended_by_partition.is_empty());

    assert_eq!(stored_keys(&*table, MONTY, day(9)).await, 4);
    assert_eq!(table.manifest().await.unwrap().snapshot_id, 1);
}

#[tokio::test]
async fn duplicate_matches_inside_one_batch_are_collapsed() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(new_table(tmp.path()).await);
    let source = FakeSource::default().with(MONTY, day(9), vec![sample_match("RU_1"), sample_match("RU_1")]);
    let pipeline = IngestPipeline::new(Arc::new(source), table.clone());

    let stats = pipeline.run_unit(MONTY, day(9)).await.unwrap();
    assert_eq!(stats.built, 4);
    assert_eq!(stats.kept, 2);
    assert_eq!(stats.appended, 2);
}

#[tokio::test]
async fn partitions_are_independent_for_dedup() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(new_table(tmp.path()).await);
    let source = FakeSource::default()
        .with(MONTY, day(9), vec![sample_match("RU_1")])
        .with(BREAKS, day(9), vec![sample_match("RU_1")])
        .with(MONTY, day(10), vec![sample_match("RU_1")]);
    let pipeline = Arc::new(IngestPipeline::new(Arc::new(source), table.clone()));

    let summary = pipeline
        .run_window(&[MONTY.to_string(), BREAKS.to_string()], &[day(9), day(10)])
        .await;
    assert!(summary.succeeded());
    assert_eq!(summary.units.len(), 4);
    assert_eq!(summary.appended_rows, 6);
    assert_eq!(stored_keys(&*table, BREAKS, day(9)).await, 2);
    assert_eq!(stored_keys(&*table, BREAKS, day(10)).await, 0);
}

#[tokio::test]
async fn concurrent_units_on_one_partition_never_double_append() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(new_table(tmp.path()).await);
    let source = FakeSource::default().with(MONTY, day(9), vec![sample_match("RU_1"), sample_match("RU_2")]);
    let pipeline = Arc::new(IngestPipeline::new(Arc::new(source), table.clone()).with_concurrency(4));

    let players = vec![MONTY.to_string(); 4];
    let summary = pipeline.run_window(&players, &[day(9)]).await;
    assert!(summary.succeeded());
    assert_eq!(summary.appended_rows, 4);
    assert_eq!(stored_keys(&*table, MONTY, day(9)).await, 4);
}

#[tokio::test]
async fn failing_units_do_not_stop_the_window() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(new_table(tmp.path()).await);
    let mut drifted = sample_payload("RU_9");
    drifted["info"]
        .as_object_mut()
        .unwrap()
        .remove("gameVersion");
    let source = FakeSource::default()
        .with(MONTY, day(9), vec![sample_match("RU_1")])
        .with(BREAKS, day(9), vec![ActivityRecord::from_payload(drifted).unwrap()]);
    let pipeline = Arc::new(IngestPipeline::new(Arc::new(source), table.clone()));

    let players = vec![MONTY.to_string(), BREAKS.to_string(), "ghost#RU1".to_string()];
    let summary = pipeline.run_window(&players, &[day(9)]).await;

    assert_eq!(summary.failed_units, 2);
    assert_eq!(summary.appended_rows, 2);
    let by_player: BTreeMap<&str, &UnitStatus> = summary
        .units
        .iter()
        .map(|u| (u.player.as_str(), &u.status))
        .collect();
    assert_eq!(by_player[MONTY], &UnitStatus::Succeeded);
    assert_eq!(by_player[BREAKS], &UnitStatus::Failed);
    assert_eq!(by_player["ghost#RU1"], &UnitStatus::Failed);
    let drift = summary.units.iter().find(|u| u.player == BREAKS).unwrap();
    assert!(drift.error.as_deref().unwrap().contains("metadata.gameversion"));

    let reports = tmp.path().join("reports");
    let dir = write_run_report(&reports, &summary).await.unwrap();
    let json: JsonValue =
        serde_json::from_slice(&std::fs::read(dir.join("ingest_summary.json")).unwrap()).unwrap();
    assert_eq!(json["failed_units"], json!(2));
    let brief = std::fs::read_to_string(dir.join("ingest_brief.md")).unwrap();
    assert!(brief.contains("ghost#RU1"));
}

#[tokio::test]
async fn empty_window_succeeds_without_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(new_table(tmp.path()).await);
    let pipeline = IngestPipeline::new(Arc::new(FakeSource::default()), table.clone());

    let stats = pipeline.run_unit(MONTY, day(11)).await.unwrap();
    assert_eq!(stats, Default::default());
    assert!(table.manifest().await.unwrap().files.is_empty());
}

#[tokio::test]
async fn dedup_falls_back_to_scan_tasks_when_bulk_scan_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(FlakyTable::new(new_table(tmp.path()).await));
    let source = FakeSource::default().with(MONTY, day(9), vec![sample_match("RU_1")]);
    let pipeline = IngestPipeline::new(Arc::new(source), table.clone());

    pipeline.run_unit(MONTY, day(9)).await.unwrap();
    table.fail_bulk.store(true, Ordering::SeqCst);
    let rerun = pipeline.run_unit(MONTY, day(9)).await.unwrap();
    assert_eq!(rerun.appended, 0);
    assert_eq!(rerun.dropped, 2);
}

#[tokio::test]
async fn bulk_scan_file_limit_uses_task_reads() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(new_table(tmp.path()).await.with_max_bulk_scan_files(1));
    let source = FakeSource::default()
        .with(MONTY, day(9), vec![sample_match("RU_1")])
        .with(MONTY, day(10), vec![sample_match("RU_1")]);
    let pipeline = IngestPipeline::new(Arc::new(source), table.clone());

    pipeline.run_unit(MONTY, day(9)).await.unwrap();
    let schema = SchemaAdapter::load(&*table).await.unwrap();
    let rows = matchlake_adapters::RowNormalizer::new()
        .normalize(&sample_match("RU_2"), &PartitionKey::new(MONTY, day(9)))
        .unwrap();
    pipeline.ingest_rows(&schema, rows).await.unwrap();
    assert_eq!(table.manifest().await.unwrap().files.len(), 2);

    let rerun = pipeline.run_unit(MONTY, day(9)).await.unwrap();
    assert_eq!(rerun.appended, 0);
    assert_eq!(stored_keys(&*table, MONTY, day(9)).await, 4);
}

#[tokio::test]
async fn failing_key_resolution_blocks_the_append() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(FlakyTable::new(new_table(tmp.path()).await));
    table.fail_bulk.store(true, Ordering::SeqCst);
    table.fail_tasks.store(true, Ordering::SeqCst);
    let source = FakeSource::default().with(MONTY, day(9), vec![sample_match("RU_1")]);
    let pipeline = IngestPipeline::new(Arc::new(source), table.clone());

    let err = pipeline.run_unit(MONTY, day(9)).await.unwrap_err();
    assert!(format!("{err:#}").contains("resolving existing keys"));
    assert!(table.inner.manifest().await.unwrap().files.is_empty());
}

#[tokio::test]
async fn one_bad_row_aborts_the_whole_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let table = Arc::new(new_table(tmp.path()).await);
    let pipeline = IngestPipeline::new(Arc::new(FakeSource::default()), table.clone());
    let schema = SchemaAdapter::load(&*table).await.unwrap();

    let partition = PartitionKey::new(MONTY, day(9));
    let mut rows = matchlake_adapters::RowNormalizer::new()
        .normalize(&sample_match("RU_1"), &partition)
        .unwrap();
    let mut columns = rows[0].columns().clone();
    columns.remove("metadata.gameversion");
    columns.insert(PARTICIPANT_ID_COLUMN.to_string(), json!("puuid-third"));
    columns.insert(MATCH_ID_COLUMN.to_string(), json!("RU_1"));
    rows.push(ParticipantRow::new(partition.clone(), columns).unwrap());

    let err = pipeline.ingest_rows(&schema, rows).await.unwrap_err();
    assert!(format!("{err:#}").contains("metadata.gameversion"));
    let manifest = table.manifest().await.unwrap();
    assert_eq!(manifest.snapshot_id, 0);
    assert_eq!(stored_keys(&*table, MONTY, day(9)).await, 0);
}
