//! Flattens one match into one row per participant and canonicalizes the
//! dynamically shaped participant fields (`challenges`, `missions`, `perks`).

use std::collections::BTreeMap;

use matchlake_core::{
    metadata_column, participant_column, ActivityRecord, ParticipantRow, PartitionKey,
    PARTICIPANT_ID_COLUMN, REQUIRED_METADATA_COLUMNS,
};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

const UNKNOWN_MATCH: &str = "<unknown>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("match {match_id} is missing required fields {missing:?}")]
    SchemaDrift {
        match_id: String,
        missing: Vec<String>,
    },
    #[error("match {match_id} has unexpected perks shape at `{path}`")]
    PerksShape { match_id: String, path: String },
}

/// Total coercion of any JSON value to a float.
///
/// bool -> 0/1, number -> itself, numeric string -> parsed value, other string ->
/// character count, array -> length, object -> key count, null -> 0.0.
pub fn coerce_to_f64(value: &JsonValue) -> f64 {
    match value {
        JsonValue::Bool(b) => f64::from(u8::from(*b)),
        JsonValue::Number(n) => n.as_f64().filter(|f| f.is_finite()).unwrap_or_else(|| {
            debug!(value = %n, "number is not representable as f64; using 0.0");
            0.0
        }),
        JsonValue::String(s) => match s.trim().parse::<f64>() {
            Ok(parsed) if parsed.is_finite() => parsed,
            _ => s.chars().count() as f64,
        },
        JsonValue::Array(items) => items.len() as f64,
        JsonValue::Object(map) => map.len() as f64,
        JsonValue::Null => {
            debug!("null coerced to 0.0");
            0.0
        }
    }
}

fn canonicalize_numeric_map(
    value: &JsonValue,
    column: &str,
    convert: impl Fn(f64) -> JsonValue,
) -> JsonValue {
    match value {
        JsonValue::Null => JsonValue::Null,
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, v)| (key.clone(), convert(coerce_to_f64(v))))
                .collect(),
        ),
        other => {
            warn!(column, kind = json_kind(other), "expected an object; using an empty map");
            JsonValue::Object(JsonMap::new())
        }
    }
}

pub fn canonicalize_challenges(value: &JsonValue) -> JsonValue {
    canonicalize_numeric_map(value, "participant.challenges", JsonValue::from)
}

pub fn canonicalize_missions(value: &JsonValue) -> JsonValue {
    canonicalize_numeric_map(value, "participant.missions", |f| JsonValue::from(f as i64))
}

struct PerksReader<'a> {
    match_id: &'a str,
}

impl PerksReader<'_> {
    fn shape_error(&self, path: &str) -> NormalizeError {
        NormalizeError::PerksShape {
            match_id: self.match_id.to_string(),
            path: path.to_string(),
        }
    }

    fn object<'v>(
        &self,
        value: Option<&'v JsonValue>,
        path: &str,
    ) -> Result<&'v JsonMap<String, JsonValue>, NormalizeError> {
        value
            .and_then(JsonValue::as_object)
            .ok_or_else(|| self.shape_error(path))
    }

    fn array<'v>(
        &self,
        value: Option<&'v JsonValue>,
        path: &str,
    ) -> Result<&'v [JsonValue], NormalizeError> {
        value
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| self.shape_error(path))
    }

    fn int(&self, value: Option<&JsonValue>, path: &str) -> Result<i64, NormalizeError> {
        let number = value
            .and_then(JsonValue::as_number)
            .ok_or_else(|| self.shape_error(path))?;
        number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or_else(|| self.shape_error(path))
    }

    fn string(&self, value: Option<&JsonValue>, path: &str) -> Result<JsonValue, NormalizeError> {
        match value {
            Some(JsonValue::String(s)) => Ok(JsonValue::String(s.clone())),
            Some(JsonValue::Null) | None => Ok(JsonValue::Null),
            Some(_) => Err(self.shape_error(path)),
        }
    }

    fn perks(&self, value: &JsonValue) -> Result<JsonValue, NormalizeError> {
        let perks = self.object(Some(value), "perks")?;

        let stat = self.object(perks.get("statPerks"), "perks.statPerks")?;
        let statperks = json!({
            "defense": self.int(stat.get("defense"), "perks.statPerks.defense")?,
            "flex": self.int(stat.get("flex"), "perks.statPerks.flex")?,
            "offense": self.int(stat.get("offense"), "perks.statPerks.offense")?,
        });

        let mut styles = Vec::new();
        for (i, style) in self.array(perks.get("styles"), "perks.styles")?.iter().enumerate() {
            let base = format!("perks.styles[{i}]");
            let style = self.object(Some(style), &base)?;
            let mut selections = Vec::new();
            let selections_path = format!("{base}.selections");
            for (j, selection) in self
                .array(style.get("selections"), &selections_path)?
                .iter()
                .enumerate()
            {
                let path = format!("{selections_path}[{j}]");
                let selection = self.object(Some(selection), &path)?;
                selections.push(json!({
                    "perk": self.int(selection.get("perk"), &format!("{path}.perk"))?,
                    "var1": self.int(selection.get("var1"), &format!("{path}.var1"))?,
                    "var2": self.int(selection.get("var2"), &format!("{path}.var2"))?,
                    "var3": self.int(selection.get("var3"), &format!("{path}.var3"))?,
                }));
            }
            styles.push(json!({
                "description": self.string(style.get("description"), &format!("{base}.description"))?,
                "selections": selections,
                "style": self.int(style.get("style"), &format!("{base}.style"))?,
            }));
        }

        Ok(json!({ "statperks": statperks, "styles": styles }))
    }
}

/// Rewrites `perks` into `{statperks, styles}` with explicit integer casts.
/// JSON null is kept as null; any other deviation is an error.
pub fn normalize_perks(value: &JsonValue, match_id: &str) -> Result<JsonValue, NormalizeError> {
    if value.is_null() {
        return Ok(JsonValue::Null);
    }
    PerksReader { match_id }.perks(value)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn flatten_section(
    out: &mut BTreeMap<String, JsonValue>,
    prefix: &str,
    section: &JsonMap<String, JsonValue>,
) {
    for (key, value) in section {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            JsonValue::Object(inner) => flatten_section(out, &path, inner),
            other => {
                out.insert(metadata_column(&path), other.clone());
            }
        }
    }
}

/// Pure transformation from a fetched match to participant rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowNormalizer;

impl RowNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Match-level columns shared by every participant row of `record`.
    pub fn metadata_columns(&self, record: &ActivityRecord) -> BTreeMap<String, JsonValue> {
        let mut columns = BTreeMap::new();
        flatten_section(&mut columns, "", record.metadata());
        flatten_section(&mut columns, "", record.info());
        columns
    }

    pub fn normalize(
        &self,
        record: &ActivityRecord,
        partition: &PartitionKey,
    ) -> Result<Vec<ParticipantRow>, NormalizeError> {
        let match_id = record.match_id().unwrap_or(UNKNOWN_MATCH).to_string();
        let metadata = self.metadata_columns(record);

        let missing: Vec<String> = REQUIRED_METADATA_COLUMNS
            .iter()
            .filter(|column| metadata.get(**column).map_or(true, JsonValue::is_null))
            .map(|column| column.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(NormalizeError::SchemaDrift { match_id, missing });
        }

        let mut rows = Vec::with_capacity(record.participants().len());
        for participant in record.participants() {
            let fields = participant
                .as_object()
                .filter(|p| {
                    p.get("puuid")
                        .and_then(JsonValue::as_str)
                        .is_some_and(|id| !id.is_empty())
                })
                .ok_or_else(|| NormalizeError::SchemaDrift {
                    match_id: match_id.clone(),
                    missing: vec![PARTICIPANT_ID_COLUMN.to_string()],
                })?;

            let mut columns = metadata.clone();
            for (field, value) in fields {
                let column = participant_column(field);
                let value = match field.as_str() {
                    "challenges" => canonicalize_challenges(value),
                    "missions" => canonicalize_missions(value),
                    "perks" => normalize_perks(value, &match_id)?,
                    _ => value.clone(),
                };
                columns.insert(column, value);
            }

            let row = ParticipantRow::new(partition.clone(), columns).map_err(|err| {
                NormalizeError::SchemaDrift {
                    match_id: match_id.clone(),
                    missing: vec![err.to_string()],
                }
            })?;
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use matchlake_core::{DedupKey, EVENT_DATE_COLUMN, MATCH_ID_COLUMN, PLAYER_COLUMN};
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_match() -> ActivityRecord {
        let path = workspace_root().join("fixtures/riot/match_sample.json");
        let bytes = std::fs::read(&path).unwrap();
        ActivityRecord::from_payload(serde_json::from_slice(&bytes).unwrap()).unwrap()
    }

    fn partition() -> PartitionKey {
        PartitionKey::new("Monty Gard#RU1", NaiveDate::from_ymd_opt(2025, 6, 9).unwrap())
    }

    #[test]
    fn coercion_ladder_is_total_and_deterministic() {
        let challenges = json!({"a": true, "b": "3.5", "c": "x", "d": [1, 2]});
        assert_eq!(
            canonicalize_challenges(&challenges),
            json!({"a": 1.0, "b": 3.5, "c": 1.0, "d": 2.0})
        );
        assert_eq!(coerce_to_f64(&json!({"k": 1, "j": 2})), 2.0);
        assert_eq!(coerce_to_f64(&JsonValue::Null), 0.0);
        assert_eq!(coerce_to_f64(&json!(false)), 0.0);
        assert_eq!(coerce_to_f64(&json!("NaN")), 3.0);
        assert_eq!(coerce_to_f64(&json!(" 12 ")), 12.0);
    }

    #[test]
    fn missions_truncate_to_integers() {
        let missions = json!({"playerScore0": 7.9, "playerScore1": "2", "flag": true});
        assert_eq!(
            canonicalize_missions(&missions),
            json!({"playerScore0": 7, "playerScore1": 2, "flag": 1})
        );
    }

    #[test]
    fn non_object_maps_become_empty_but_null_stays_null() {
        assert_eq!(canonicalize_challenges(&json!([1, 2])), json!({}));
        assert_eq!(canonicalize_missions(&JsonValue::Null), JsonValue::Null);
    }

    #[test]
    fn sample_match_yields_one_row_per_participant() {
        let rows = RowNormalizer::new().normalize(&sample_match(), &partition()).unwrap();
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(first.key(), &DedupKey::new("RU_462051893", "puuid-monty"));
        assert_eq!(first.get(MATCH_ID_COLUMN), Some(&json!("RU_462051893")));
        assert_eq!(first.get("metadata.gamecreation"), Some(&json!(1_749_460_000_000_i64)));
        assert_eq!(first.get("metadata.queueid"), Some(&json!(420)));
        assert_eq!(first.get(PLAYER_COLUMN), Some(&json!("Monty Gard#RU1")));
        assert_eq!(first.get(EVENT_DATE_COLUMN), Some(&json!("2025-06-09")));
        assert_eq!(first.get("participant.timeccingothers"), Some(&json!(14)));
        assert_eq!(first.get("participant.summoner1id"), Some(&json!(4)));
        assert!(!first.contains("metadata.participants.0"));
        assert!(!first.contains("metadata.teams.0"));

        let challenges = first.get("participant.challenges").unwrap();
        assert_eq!(challenges["kda"], json!(4.5));
        assert_eq!(challenges["legendaryItemUsed"], json!(3.0));

        let perks = first.get("participant.perks").unwrap();
        assert_eq!(perks["statperks"]["flex"], json!(5008));
        assert_eq!(perks["styles"][0]["selections"][0]["var1"], json!(1203));
        assert_eq!(perks["styles"][1]["description"], json!("subStyle"));
    }

    #[test]
    fn nested_info_objects_flatten_with_dots() {
        let record = ActivityRecord::from_payload(json!({
            "metadata": {"matchId": "RU_1"},
            "info": {
                "gameCreation": 1, "gameDuration": 2, "gameMode": "ARAM",
                "queueId": 450, "gameVersion": "15.11",
                "status": {"Code": 0},
                "participants": [{"puuid": "p1"}]
            }
        }))
        .unwrap();
        let rows = RowNormalizer::new().normalize(&record, &partition()).unwrap();
        assert_eq!(rows[0].get("metadata.status.code"), Some(&json!(0)));
        assert_eq!(rows[0].get("participant.puuid"), Some(&json!("p1")));
    }

    #[test]
    fn missing_required_metadata_is_schema_drift() {
        let record = ActivityRecord::from_payload(json!({
            "metadata": {"matchId": "RU_1"},
            "info": {"gameCreation": 1, "gameMode": "CLASSIC", "queueId": null, "participants": []}
        }))
        .unwrap();
        let err = RowNormalizer::new().normalize(&record, &partition()).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::SchemaDrift {
                match_id: "RU_1".to_string(),
                missing: vec![
                    "metadata.gameduration".to_string(),
                    "metadata.queueid".to_string(),
                    "metadata.gameversion".to_string(),
                ],
            }
        );
    }

    #[test]
    fn participant_without_puuid_is_schema_drift() {
        let record = ActivityRecord::from_payload(json!({
            "metadata": {"matchId": "RU_1"},
            "info": {
                "gameCreation": 1, "gameDuration": 2, "gameMode": "CLASSIC",
                "queueId": 420, "gameVersion": "15.11",
                "participants": [{"puuid": "p1"}, {"summonerName": "ghost"}]
            }
        }))
        .unwrap();
        let err = RowNormalizer::new().normalize(&record, &partition()).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::SchemaDrift { missing, .. } if missing == vec![PARTICIPANT_ID_COLUMN.to_string()]
        ));
    }

    #[test]
    fn perks_shape_deviation_fails_fast() {
        let perks = json!({
            "statPerks": {"defense": 5001, "flex": 5008, "offense": 5005},
            "styles": [{"description": "primaryStyle", "style": 8100,
                        "selections": [{"perk": 8112, "var1": "lots", "var2": 0, "var3": 0}]}]
        });
        let err = normalize_perks(&perks, "RU_1").unwrap_err();
        assert_eq!(
            err,
            NormalizeError::PerksShape {
                match_id: "RU_1".to_string(),
                path: "perks.styles[0].selections[0].var1".to_string(),
            }
        );

        let err = normalize_perks(&json!([1, 2]), "RU_1").unwrap_err();
        assert!(matches!(err, NormalizeError::PerksShape { path, .. } if path == "perks"));
    }

    #[test]
    fn perks_floats_are_truncated() {
        let perks = json!({
            "statPerks": {"defense": 5001.0, "flex": 5008, "offense": 5005.7},
            "styles": []
        });
        let normalized = normalize_perks(&perks, "RU_1").unwrap();
        assert_eq!(
            normalized,
            json!({"statperks": {"defense": 5001, "flex": 5008, "offense": 5005}, "styles": []})
        );
        assert_eq!(normalize_perks(&JsonValue::Null, "RU_1").unwrap(), JsonValue::Null);
    }
}
