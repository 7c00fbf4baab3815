//! Existing-key resolution for the partitions a candidate batch touches.

use std::collections::{BTreeMap, BTreeSet};

use arrow_array::cast::AsArray;
use arrow_array::RecordBatch;
use matchlake_core::{DedupKey, ExistingKeySet, PartitionKey, MATCH_ID_COLUMN, PARTICIPANT_ID_COLUMN};
use matchlake_storage::{TableError, TableScan, TargetTable};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("scanning existing keys of {partition} failed: {source}")]
    Scan {
        partition: PartitionKey,
        #[source]
        source: TableError,
    },
    #[error("key scan of {partition} returned no string column `{column}`")]
    KeyColumn {
        partition: PartitionKey,
        column: &'static str,
    },
}

/// Read-only lookup of the (match, participant) keys already stored per partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupResolver;

impl DedupResolver {
    pub fn new() -> Self {
        Self
    }

    /// Partition-filtered scan projecting only the key columns.
    pub fn key_scan(partition: &PartitionKey) -> TableScan {
        TableScan::new(partition.clone(), [MATCH_ID_COLUMN, PARTICIPANT_ID_COLUMN])
    }

    pub async fn resolve(
        &self,
        table: &dyn TargetTable,
        partitions: &BTreeSet<PartitionKey>,
    ) -> Result<BTreeMap<PartitionKey, ExistingKeySet>, DedupError> {
        let mut resolved = BTreeMap::new();
        for partition in partitions {
            let keys = self.existing_keys(table, partition).await?;
            resolved.insert(partition.clone(), keys);
        }
        Ok(resolved)
    }

    /// Tries the bulk scan first and falls back to reading file-level scan tasks
    /// when it fails or comes back empty.
    pub async fn existing_keys(
        &self,
        table: &dyn TargetTable,
        partition: &PartitionKey,
    ) -> Result<ExistingKeySet, DedupError> {
        let scan = Self::key_scan(partition);
        match table.scan_to_batches(&scan).await {
            Ok(batches) if batches.iter().any(|b| b.num_rows() > 0) => {
                return collect_keys(&batches, partition);
            }
            Ok(_) => debug!(%partition, "bulk key scan returned no rows; reading scan tasks"),
            Err(err) => debug!(%partition, error = %err, "bulk key scan failed; reading scan tasks"),
        }

        let scan_error = |source| DedupError::Scan {
            partition: partition.clone(),
            source,
        };
        let tasks = table.plan_scan_tasks(&scan).await.map_err(scan_error)?;
        let mut keys = ExistingKeySet::new();
        for task in &tasks {
            let batches = table.read_scan_task(&scan, task).await.map_err(scan_error)?;
            keys.extend(collect_keys(&batches, partition)?);
        }
        debug!(%partition, tasks = tasks.len(), keys = keys.len(), "resolved keys from scan tasks");
        Ok(keys)
    }
}

fn collect_keys(batches: &[RecordBatch], partition: &PartitionKey) -> Result<ExistingKeySet, DedupError> {
    let mut keys = ExistingKeySet::new();
    for batch in batches {
        let column = |name: &'static str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_string_opt::<i32>())
                .ok_or_else(|| DedupError::KeyColumn {
                    partition: partition.clone(),
                    column: name,
                })
        };
        let match_ids = column(MATCH_ID_COLUMN)?;
        let participant_ids = column(PARTICIPANT_ID_COLUMN)?;
        for (match_id, participant_id) in match_ids.iter().zip(participant_ids.iter()) {
            if let (Some(match_id), Some(participant_id)) = (match_id, participant_id) {
                keys.insert(DedupKey::new(match_id, participant_id));
            }
        }
    }
    Ok(keys)
}
