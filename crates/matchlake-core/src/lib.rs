//! Core domain model for Match Lake: fetched match payloads, flattened participant rows,
//! partition/dedup keys and the column naming rules shared by writers and readers.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const PLAYER_COLUMN: &str = "source_nickname";
pub const EVENT_DATE_COLUMN: &str = "event_date";
pub const MATCH_ID_COLUMN: &str = "metadata.matchid";
pub const PARTICIPANT_ID_COLUMN: &str = "participant.puuid";

/// Match-level columns every normalized activity must carry.
pub const REQUIRED_METADATA_COLUMNS: [&str; 6] = [
    MATCH_ID_COLUMN,
    "metadata.gamecreation",
    "metadata.gameduration",
    "metadata.gamemode",
    "metadata.queueid",
    "metadata.gameversion",
];

const METADATA_PREFIX: &str = "metadata";
const PARTICIPANT_PREFIX: &str = "participant";

/// Column name for a match-level field given its dotted path below the `metadata`
/// or `info` section of the payload (`gameCreation` -> `metadata.gamecreation`).
pub fn metadata_column(path: &str) -> String {
    format!("{METADATA_PREFIX}.{}", path.to_lowercase())
}

/// Column name for a participant field: every non-alphanumeric character is
/// stripped and the rest lowercased (`summoner1Id` -> `participant.summoner1id`).
pub fn participant_column(field: &str) -> String {
    let flat: String = field
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    format!("{PARTICIPANT_PREFIX}.{flat}")
}

/// Ingestion partition: one tracked player on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub player: String,
    pub event_date: NaiveDate,
}

impl PartitionKey {
    pub fn new(player: impl Into<String>, event_date: NaiveDate) -> Self {
        Self {
            player: player.into(),
            event_date,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.player, self.event_date)
    }
}

/// Natural key of one stored row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub match_id: String,
    pub participant_id: String,
}

impl DedupKey {
    pub fn new(match_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            match_id: match_id.into(),
            participant_id: participant_id.into(),
        }
    }
}

/// Keys already present in the table for one partition.
pub type ExistingKeySet = HashSet<DedupKey>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedActivity {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no `{0}` object")]
    MissingSection(&'static str),
    #[error("payload has no participants list")]
    MissingParticipants,
}

/// One fetched match. Construction guarantees the metadata and info sections
/// and the participants list exist; their contents are not interpreted here.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    metadata: JsonMap<String, JsonValue>,
    info: JsonMap<String, JsonValue>,
    participants: Vec<JsonValue>,
}

impl ActivityRecord {
    pub fn from_payload(payload: JsonValue) -> Result<Self, MalformedActivity> {
        let JsonValue::Object(mut root) = payload else {
            return Err(MalformedActivity::NotAnObject);
        };
        let Some(JsonValue::Object(metadata)) = root.remove("metadata") else {
            return Err(MalformedActivity::MissingSection("metadata"));
        };
        let Some(JsonValue::Object(mut info)) = root.remove("info") else {
            return Err(MalformedActivity::MissingSection("info"));
        };
        let Some(JsonValue::Array(participants)) = info.remove("participants") else {
            return Err(MalformedActivity::MissingParticipants);
        };
        Ok(Self {
            metadata,
            info,
            participants,
        })
    }

    pub fn match_id(&self) -> Option<&str> {
        self.metadata.get("matchId").and_then(JsonValue::as_str)
    }

    pub fn metadata(&self) -> &JsonMap<String, JsonValue> {
        &self.metadata
    }

    /// The `info` section without its participants list.
    pub fn info(&self) -> &JsonMap<String, JsonValue> {
        &self.info
    }

    pub fn participants(&self) -> &[JsonValue] {
        &self.participants
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("row has no string value for `{0}`")]
    MissingKeyColumn(&'static str),
}

/// One participant of one match, flattened to column name -> value and stamped
/// with the partition it was ingested for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantRow {
    partition: PartitionKey,
    key: DedupKey,
    columns: BTreeMap<String, JsonValue>,
}

impl ParticipantRow {
    pub fn new(
        partition: PartitionKey,
        mut columns: BTreeMap<String, JsonValue>,
    ) -> Result<Self, RowError> {
        columns.insert(
            PLAYER_COLUMN.to_string(),
            JsonValue::String(partition.player.clone()),
        );
        columns.insert(
            EVENT_DATE_COLUMN.to_string(),
            JsonValue::String(partition.event_date.format("%Y-%m-%d").to_string()),
        );
        let match_id = string_column(&columns, MATCH_ID_COLUMN)?;
        let participant_id = string_column(&columns, PARTICIPANT_ID_COLUMN)?;
        Ok(Self {
            partition,
            key: DedupKey {
                match_id,
                participant_id,
            },
            columns,
        })
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn key(&self) -> &DedupKey {
        &self.key
    }

    pub fn columns(&self) -> &BTreeMap<String, JsonValue> {
        &self.columns
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }
}

fn string_column(
    columns: &BTreeMap<String, JsonValue>,
    column: &'static str,
) -> Result<String, RowError> {
    columns
        .get(column)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or(RowError::MissingKeyColumn(column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn participant_columns_strip_and_lowercase() {
        assert_eq!(
            participant_column("timeCCingOthers"),
            "participant.timeccingothers"
        );
        assert_eq!(participant_column("summoner1Id"), "participant.summoner1id");
        assert_eq!(
            participant_column("riotId_Game-Name"),
            "participant.riotidgamename"
        );
    }

    #[test]
    fn metadata_columns_keep_dotted_path() {
        assert_eq!(metadata_column("gameCreation"), "metadata.gamecreation");
        assert_eq!(metadata_column("status.Code"), "metadata.status.code");
    }

    #[test]
    fn payload_without_participants_is_rejected() {
        let err = ActivityRecord::from_payload(json!({
            "metadata": {"matchId": "RU_1"},
            "info": {"gameMode": "CLASSIC"}
        }))
        .unwrap_err();
        assert_eq!(err, MalformedActivity::MissingParticipants);

        let err = ActivityRecord::from_payload(json!({"status": {"status_code": 404}})).unwrap_err();
        assert_eq!(err, MalformedActivity::MissingSection("metadata"));
    }

    #[test]
    fn activity_record_splits_sections() {
        let record = ActivityRecord::from_payload(json!({
            "metadata": {"matchId": "RU_1"},
            "info": {"gameMode": "CLASSIC", "participants": [{"puuid": "p1"}]}
        }))
        .unwrap();
        assert_eq!(record.match_id(), Some("RU_1"));
        assert_eq!(record.participants().len(), 1);
        assert!(!record.info().contains_key("participants"));
    }

    #[test]
    fn rows_are_stamped_with_partition_and_key() {
        let day = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        let mut columns = BTreeMap::new();
        columns.insert(MATCH_ID_COLUMN.to_string(), json!("RU_1"));
        columns.insert(PARTICIPANT_ID_COLUMN.to_string(), json!("p1"));
        let row = ParticipantRow::new(PartitionKey::new("Monty Gard#RU1", day), columns).unwrap();

        assert_eq!(row.key(), &DedupKey::new("RU_1", "p1"));
        assert_eq!(row.get(PLAYER_COLUMN), Some(&json!("Monty Gard#RU1")));
        assert_eq!(row.get(EVENT_DATE_COLUMN), Some(&json!("2025-06-09")));
    }

    #[test]
    fn rows_without_participant_id_are_refused() {
        let day = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        let mut columns = BTreeMap::new();
        columns.insert(MATCH_ID_COLUMN.to_string(), json!("RU_1"));
        let err = ParticipantRow::new(PartitionKey::new("p", day), columns).unwrap_err();
        assert_eq!(err, RowError::MissingKeyColumn(PARTICIPANT_ID_COLUMN));
    }
}
