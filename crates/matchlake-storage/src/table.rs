//! Target table abstraction and a local, catalog-directory implementation backed by
//! Parquet data files.
//!
//! A [`LocalParquetTable`] directory holds `schema.json` (the declared schema),
//! `snapshots/` (one immutable manifest per committed snapshot) and `data/`. A data
//! file becomes visible only when a snapshot listing it is published. Publishing
//! snapshot `n + 1` is exclusive across every handle and process sharing the
//! directory; a writer that loses the race re-reads snapshot `n + 1` and retries, so
//! every append is all-or-nothing and no committed file is ever dropped.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::Date32Type;
use arrow_array::{BooleanArray, RecordBatch};
use arrow_schema::ArrowError;
use arrow_select::filter::filter_record_batch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchlake_core::{PartitionKey, EVENT_DATE_COLUMN, PLAYER_COLUMN};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::schema::{date_to_days, days_to_date, SchemaAdapter, SchemaError, TableSchema};
use crate::{sha256_hex, write_new_file_atomically};

const SCHEMA_FILE: &str = "schema.json";
const SNAPSHOTS_DIR: &str = "snapshots";
const DATA_DIR: &str = "data";
const MANIFEST_FORMAT_VERSION: u32 = 1;
const DEFAULT_MAX_BULK_SCAN_FILES: usize = 64;
const MAX_COMMIT_ATTEMPTS: usize = 128;

/// Partition-filtered, column-projected read of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableScan {
    pub partition: PartitionKey,
    pub projection: Vec<String>,
}

impl TableScan {
    pub fn new(partition: PartitionKey, projection: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            partition,
            projection: projection.into_iter().map(Into::into).collect(),
        }
    }
}

/// One file-level unit of a planned scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTask {
    pub data_file: String,
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendReceipt {
    pub snapshot_id: u64,
    pub data_file: String,
    pub record_count: usize,
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table at {0} does not exist")]
    NotFound(String),
    #[error("table at {0} already exists")]
    AlreadyExists(String),
    #[error("column `{0}` is not present in the data")]
    UnknownColumn(String),
    #[error("batch schema does not match the declared table schema")]
    SchemaMismatch,
    #[error("refusing to commit an empty batch")]
    EmptyBatch,
    #[error("gave up committing to {table} after {attempts} conflicting snapshots")]
    CommitConflict { table: String, attempts: usize },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Catalog-addressed analytical table: schema introspection, partition/column
/// pushdown scans and atomic appends.
#[async_trait]
pub trait TargetTable: Send + Sync {
    fn identifier(&self) -> String;

    async fn load_schema(&self) -> Result<TableSchema, TableError>;

    /// Materializes the whole scan in one call.
    async fn scan_to_batches(&self, scan: &TableScan) -> Result<Vec<RecordBatch>, TableError>;

    async fn plan_scan_tasks(&self, scan: &TableScan) -> Result<Vec<ScanTask>, TableError>;

    async fn read_scan_task(
        &self,
        scan: &TableScan,
        task: &ScanTask,
    ) -> Result<Vec<RecordBatch>, TableError>;

    /// Commits the batch atomically; it is either fully visible afterwards or not at all.
    async fn append(&self, batch: RecordBatch) -> Result<AppendReceipt, TableError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileEntry {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub record_count: usize,
    pub partitions: Vec<PartitionKey>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableManifest {
    pub format_version: u32,
    pub snapshot_id: u64,
    pub files: Vec<DataFileEntry>,
}

impl Default for TableManifest {
    fn default() -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            snapshot_id: 0,
            files: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct LocalParquetTable {
    root: PathBuf,
    max_bulk_scan_files: usize,
    commit_lock: Mutex<()>,
}

impl LocalParquetTable {
    /// Creates the catalog entry with the given schema. Fails if one already exists.
    pub async fn create(root: impl Into<PathBuf>, schema: &TableSchema) -> Result<Self, TableError> {
        let table = Self::at(root.into());
        SchemaAdapter::new(schema.clone())?;

        let schema_bytes = serde_json::to_vec_pretty(schema)?;
        if !write_new_file_atomically(&table.schema_path(), &schema_bytes).await? {
            return Err(TableError::AlreadyExists(table.identifier()));
        }
        let manifest_bytes = serde_json::to_vec_pretty(&TableManifest::default())?;
        write_new_file_atomically(&table.snapshot_path(0), &manifest_bytes).await?;
        fs::create_dir_all(table.root.join(DATA_DIR)).await?;
        info!(table = %table.identifier(), columns = schema.fields.len(), "created table");
        Ok(table)
    }

    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, TableError> {
        let table = Self::at(root.into());
        if !fs::try_exists(table.schema_path()).await? {
            return Err(TableError::NotFound(table.identifier()));
        }
        Ok(table)
    }

    pub async fn open_or_create(
        root: impl Into<PathBuf>,
        schema: &TableSchema,
    ) -> Result<Self, TableError> {
        let root = root.into();
        match Self::open(root.clone()).await {
            Ok(table) => Ok(table),
            Err(TableError::NotFound(_)) => Self::create(root, schema).await,
            Err(err) => Err(err),
        }
    }

    pub fn with_max_bulk_scan_files(mut self, max_files: usize) -> Self {
        self.max_bulk_scan_files = max_files;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest of the latest published snapshot.
    pub async fn manifest(&self) -> Result<TableManifest, TableError> {
        let dir = self.root.join(SNAPSHOTS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TableManifest::default())
            }
            Err(err) => return Err(err.into()),
        };
        let mut latest = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let snapshot_id = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(id) = snapshot_id {
                latest = latest.max(Some(id));
            }
        }
        match latest {
            Some(id) => self.read_snapshot(id).await,
            None => Ok(TableManifest::default()),
        }
    }

    async fn read_snapshot(&self, snapshot_id: u64) -> Result<TableManifest, TableError> {
        let bytes = fs::read(self.snapshot_path(snapshot_id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn at(root: PathBuf) -> Self {
        Self {
            root,
            max_bulk_scan_files: DEFAULT_MAX_BULK_SCAN_FILES,
            commit_lock: Mutex::new(()),
        }
    }

    fn schema_path(&self) -> PathBuf {
        self.root.join(SCHEMA_FILE)
    }

    fn snapshot_path(&self, snapshot_id: u64) -> PathBuf {
        self.root
            .join(SNAPSHOTS_DIR)
            .join(format!("{snapshot_id:020}.json"))
    }

    async fn read_task(&self, scan: &TableScan, task: &ScanTask) -> Result<Vec<RecordBatch>, TableError> {
        let path = self.root.join(&task.data_file);
        let scan = scan.clone();
        tokio::task::spawn_blocking(move || scan_data_file(&path, &scan))
            .await
            .map_err(|err| TableError::Other(anyhow::anyhow!("scan task panicked: {err}")))?
    }
}

#[async_trait]
impl TargetTable for LocalParquetTable {
    fn identifier(&self) -> String {
        self.root.display().to_string()
    }

    async fn load_schema(&self) -> Result<TableSchema, TableError> {
        let bytes = match fs::read(self.schema_path()).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TableError::NotFound(self.identifier()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn scan_to_batches(&self, scan: &TableScan) -> Result<Vec<RecordBatch>, TableError> {
        let tasks = self.plan_scan_tasks(scan).await?;
        if tasks.len() > self.max_bulk_scan_files {
            return Err(TableError::Unsupported(format!(
                "bulk scan over {} files exceeds the limit of {}",
                tasks.len(),
                self.max_bulk_scan_files
            )));
        }
        let mut batches = Vec::new();
        for task in &tasks {
            batches.extend(self.read_task(scan, task).await?);
        }
        Ok(batches)
    }

    async fn plan_scan_tasks(&self, scan: &TableScan) -> Result<Vec<ScanTask>, TableError> {
        let manifest = self.manifest().await?;
        Ok(manifest
            .files
            .into_iter()
            .filter(|entry| entry.partitions.contains(&scan.partition))
            .map(|entry| ScanTask {
                data_file: entry.path,
                record_count: entry.record_count,
            })
            .collect())
    }

    async fn read_scan_task(
        &self,
        scan: &TableScan,
        task: &ScanTask,
    ) -> Result<Vec<RecordBatch>, TableError> {
        self.read_task(scan, task).await
    }

    async fn append(&self, batch: RecordBatch) -> Result<AppendReceipt, TableError> {
        if batch.num_rows() == 0 {
            return Err(TableError::EmptyBatch);
        }
        let adapter = SchemaAdapter::load(self).await?;
        if batch.schema().fields() != adapter.arrow_schema().fields() {
            return Err(TableError::SchemaMismatch);
        }

        let partitions = batch_partitions(&batch)?;
        let bytes = encode_parquet(&batch)?;
        let relative = format!("{DATA_DIR}/{}.parquet", Uuid::new_v4());
        let data_path = self.root.join(&relative);

        let _commit = self.commit_lock.lock().await;
        write_new_file_atomically(&data_path, &bytes).await?;
        let entry = DataFileEntry {
            path: relative.clone(),
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
            record_count: batch.num_rows(),
            partitions,
            added_at: Utc::now(),
        };

        let mut manifest = self.manifest().await?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut next = manifest.clone();
            next.snapshot_id += 1;
            next.files.push(entry.clone());
            let manifest_bytes = serde_json::to_vec_pretty(&next)?;
            match write_new_file_atomically(&self.snapshot_path(next.snapshot_id), &manifest_bytes)
                .await
            {
                Ok(true) => {
                    manifest = next;
                    break;
                }
                Ok(false) if attempts < MAX_COMMIT_ATTEMPTS => {
                    debug!(
                        snapshot_id = next.snapshot_id,
                        attempts, "snapshot already published by another writer; rebasing"
                    );
                    manifest = match self.read_snapshot(next.snapshot_id).await {
                        Ok(winner) => winner,
                        Err(err) => {
                            let _ = fs::remove_file(&data_path).await;
                            return Err(err);
                        }
                    };
                }
                Ok(false) => {
                    let _ = fs::remove_file(&data_path).await;
                    return Err(TableError::CommitConflict {
                        table: self.identifier(),
                        attempts,
                    });
                }
                Err(err) => {
                    let _ = fs::remove_file(&data_path).await;
                    return Err(err.into());
                }
            }
        }

        debug!(
            snapshot_id = manifest.snapshot_id,
            data_file = %relative,
            rows = batch.num_rows(),
            "committed append"
        );
        Ok(AppendReceipt {
            snapshot_id: manifest.snapshot_id,
            data_file: relative,
            record_count: batch.num_rows(),
        })
    }
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, TableError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))?;
    writer.write(batch)?;
    Ok(writer.into_inner()?)
}

fn batch_partitions(batch: &RecordBatch) -> Result<Vec<PartitionKey>, TableError> {
    let players = batch
        .column_by_name(PLAYER_COLUMN)
        .and_then(|c| c.as_string_opt::<i32>())
        .ok_or_else(|| TableError::UnknownColumn(PLAYER_COLUMN.to_string()))?;
    let dates = batch
        .column_by_name(EVENT_DATE_COLUMN)
        .and_then(|c| c.as_primitive_opt::<Date32Type>())
        .ok_or_else(|| TableError::UnknownColumn(EVENT_DATE_COLUMN.to_string()))?;

    let mut partitions = BTreeSet::new();
    for (player, days) in players.iter().zip(dates.iter()) {
        if let (Some(player), Some(date)) = (player, days.and_then(days_to_date)) {
            partitions.insert(PartitionKey::new(player, date));
        }
    }
    Ok(partitions.into_iter().collect())
}

fn partition_mask(batch: &RecordBatch, partition: &PartitionKey) -> Result<BooleanArray, TableError> {
    let players = batch
        .column_by_name(PLAYER_COLUMN)
        .and_then(|c| c.as_string_opt::<i32>())
        .ok_or_else(|| TableError::UnknownColumn(PLAYER_COLUMN.to_string()))?;
    let dates = batch
        .column_by_name(EVENT_DATE_COLUMN)
        .and_then(|c| c.as_primitive_opt::<Date32Type>())
        .ok_or_else(|| TableError::UnknownColumn(EVENT_DATE_COLUMN.to_string()))?;
    let day = date_to_days(partition.event_date);

    let mask: Vec<bool> = players
        .iter()
        .zip(dates.iter())
        .map(|(p, d)| p == Some(partition.player.as_str()) && d == Some(day))
        .collect();
    Ok(BooleanArray::from(mask))
}

fn scan_data_file(path: &Path, scan: &TableScan) -> Result<Vec<RecordBatch>, TableError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let file_schema = builder.schema().clone();

    let mut roots = BTreeSet::new();
    for name in [PLAYER_COLUMN, EVENT_DATE_COLUMN]
        .into_iter()
        .chain(scan.projection.iter().map(String::as_str))
    {
        let idx = file_schema
            .index_of(name)
            .map_err(|_| TableError::UnknownColumn(name.to_string()))?;
        roots.insert(idx);
    }
    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    let reader = builder.with_projection(mask).build()?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let selected = partition_mask(&batch, &scan.partition)?;
        let filtered = filter_record_batch(&batch, &selected)?;
        if filtered.num_rows() == 0 {
            continue;
        }
        let schema = filtered.schema();
        let indices = scan
            .projection
            .iter()
            .map(|name| schema.index_of(name))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(filtered.project(&indices)?);
    }
    Ok(out)
}

/// Shared handle type used by the ingestion pipeline.
pub type SharedTable = Arc<dyn TargetTable>;
