//! Strict, all-or-nothing append of participant rows in declared schema order.

use std::collections::BTreeMap;

use arrow_array::RecordBatch;
use matchlake_core::{DedupKey, ParticipantRow, PartitionKey};
use matchlake_storage::{SchemaAdapter, SchemaError, TableError, TargetTable};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("row {key:?} is missing required columns {missing:?}")]
    MissingRequired { key: DedupKey, missing: Vec<String> },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendReport {
    pub rows: usize,
    pub by_partition: BTreeMap<PartitionKey, usize>,
    pub snapshot_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Appender {
    schema: SchemaAdapter,
}

impl Appender {
    pub fn new(schema: SchemaAdapter) -> Self {
        Self { schema }
    }

    /// Every required field must be a key of every row.
    pub fn validate(&self, rows: &[ParticipantRow]) -> Result<(), AppendError> {
        for row in rows {
            let missing: Vec<String> = self
                .schema
                .required_fields()
                .filter(|field| !row.contains(&field.name))
                .map(|field| field.name.clone())
                .collect();
            if !missing.is_empty() {
                return Err(AppendError::MissingRequired {
                    key: row.key().clone(),
                    missing,
                });
            }
        }
        Ok(())
    }

    /// Completes absent optional columns with nulls, drops columns the schema does
    /// not declare, and converts in declared order.
    pub fn to_record_batch(&self, rows: &[ParticipantRow]) -> Result<RecordBatch, AppendError> {
        let ordered: Vec<Vec<JsonValue>> = rows
            .iter()
            .map(|row| {
                self.schema
                    .fields()
                    .iter()
                    .map(|field| row.get(&field.name).cloned().unwrap_or(JsonValue::Null))
                    .collect()
            })
            .collect();
        Ok(self.schema.to_record_batch(&ordered)?)
    }

    pub async fn append(
        &self,
        table: &dyn TargetTable,
        rows: &[ParticipantRow],
    ) -> Result<AppendReport, AppendError> {
        if rows.is_empty() {
            return Ok(AppendReport::default());
        }
        self.validate(rows)?;
        let batch = self.to_record_batch(rows)?;
        let receipt = table.append(batch).await?;

        let mut by_partition = BTreeMap::new();
        for row in rows {
            *by_partition.entry(row.partition().clone()).or_default() += 1;
        }
        debug!(
            rows = receipt.record_count,
            snapshot_id = receipt.snapshot_id,
            partitions = by_partition.len(),
            "appended batch"
        );
        Ok(AppendReport {
            rows: receipt.record_count,
            by_partition,
            snapshot_id: Some(receipt.snapshot_id),
        })
    }
}
