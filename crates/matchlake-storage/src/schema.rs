//! Declared table schema and its conversion to Arrow.
//!
//! The catalog stores an ordered list of [`SchemaField`]s. [`SchemaAdapter`] validates
//! that list once, derives the matching Arrow schema, and converts rows that are
//! already ordered to the declared column order into a [`RecordBatch`].

use std::collections::HashSet;
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float32Array,
    Float64Array, Int32Array, Int64Array, ListArray, MapArray, RecordBatch, StringArray,
    StructArray, TimestampMicrosecondArray,
};
use arrow_buffer::{NullBuffer, OffsetBuffer};
use arrow_schema::{ArrowError, DataType, Field, FieldRef, Fields, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::table::{TableError, TargetTable};

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;
const MAX_DECIMAL128_PRECISION: u8 = 38;
const MAP_ENTRIES_NAME: &str = "key_value";
const LIST_ELEMENT_NAME: &str = "element";

static NULL: JsonValue = JsonValue::Null;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogicalType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Date,
    Timestamp,
    Timestamptz,
    String,
    Binary,
    Decimal {
        precision: u8,
        scale: i8,
    },
    Map {
        key: Box<LogicalType>,
        value: Box<LogicalType>,
        #[serde(default)]
        value_required: bool,
    },
    List {
        element: Box<LogicalType>,
        #[serde(default)]
        element_required: bool,
    },
    Struct {
        fields: Vec<SchemaField>,
    },
}

impl LogicalType {
    pub fn map_of(key: LogicalType, value: LogicalType) -> Self {
        Self::Map {
            key: Box::new(key),
            value: Box::new(value),
            value_required: false,
        }
    }

    pub fn list_of(element: LogicalType) -> Self {
        Self::List {
            element: Box::new(element),
            element_required: false,
        }
    }

    pub fn struct_of(fields: Vec<SchemaField>) -> Self {
        Self::Struct { fields }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::Timestamptz => "timestamptz",
            Self::String => "string",
            Self::Binary => "binary",
            Self::Decimal { .. } => "decimal",
            Self::Map { .. } => "map",
            Self::List { .. } => "list",
            Self::Struct { .. } => "struct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: LogicalType,
    pub required: bool,
}

impl SchemaField {
    pub fn required(name: impl Into<String>, field_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableSchema {
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("duplicate field `{0}`")]
    DuplicateField(String),
    #[error("map field `{0}` must have string keys")]
    UnsupportedMapKey(String),
    #[error("struct field `{0}` declares no children")]
    EmptyStruct(String),
    #[error("decimal field `{field}` has unsupported precision/scale ({precision}, {scale})")]
    InvalidDecimal {
        field: String,
        precision: u8,
        scale: i8,
    },
    #[error("column `{column}` expects {expected}, found {found}")]
    Conversion {
        column: String,
        expected: &'static str,
        found: String,
    },
    #[error("row has {found} values but the schema declares {expected} columns")]
    RowWidth { expected: usize, found: usize },
    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

/// In-memory view of the table's declared schema plus the converter into Arrow.
#[derive(Debug, Clone)]
pub struct SchemaAdapter {
    schema: TableSchema,
    arrow: SchemaRef,
}

impl SchemaAdapter {
    pub fn new(schema: TableSchema) -> Result<Self, SchemaError> {
        validate_fields(&schema.fields, "")?;
        let arrow = Arc::new(Schema::new(
            schema.fields.iter().map(arrow_field).collect::<Vec<_>>(),
        ));
        Ok(Self { schema, arrow })
    }

    /// Reads the schema from the table's catalog entry.
    pub async fn load(table: &dyn TargetTable) -> Result<Self, TableError> {
        let schema = table.load_schema().await?;
        Ok(Self::new(schema)?)
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.schema.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.schema.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &SchemaField> {
        self.schema.fields.iter().filter(|f| f.required)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        self.arrow.clone()
    }

    /// Converts rows whose values are already in declared column order.
    pub fn to_record_batch(&self, rows: &[Vec<JsonValue>]) -> Result<RecordBatch, SchemaError> {
        let width = self.schema.fields.len();
        if let Some(row) = rows.iter().find(|r| r.len() != width) {
            return Err(SchemaError::RowWidth {
                expected: width,
                found: row.len(),
            });
        }
        if rows.is_empty() {
            return Ok(RecordBatch::new_empty(self.arrow.clone()));
        }

        let columns = self
            .schema
            .fields
            .iter()
            .enumerate()
            .map(|(idx, field)| {
                let values: Vec<&JsonValue> = rows.iter().map(|row| &row[idx]).collect();
                build_array(&field.field_type, &values, &field.name)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RecordBatch::try_new(self.arrow.clone(), columns)?)
    }
}

fn validate_fields(fields: &[SchemaField], parent: &str) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for field in fields {
        let path = if parent.is_empty() {
            field.name.clone()
        } else {
            format!("{parent}.{}", field.name)
        };
        if !seen.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateField(path));
        }
        validate_type(&field.field_type, &path)?;
    }
    Ok(())
}

fn validate_type(ty: &LogicalType, path: &str) -> Result<(), SchemaError> {
    match ty {
        LogicalType::Decimal { precision, scale } => {
            if *precision == 0
                || *precision > MAX_DECIMAL128_PRECISION
                || *scale < 0
                || *scale as u8 > *precision
            {
                return Err(SchemaError::InvalidDecimal {
                    field: path.to_string(),
                    precision: *precision,
                    scale: *scale,
                });
            }
            Ok(())
        }
        LogicalType::Map { key, value, .. } => {
            if **key != LogicalType::String {
                return Err(SchemaError::UnsupportedMapKey(path.to_string()));
            }
            validate_type(value, path)
        }
        LogicalType::List { element, .. } => validate_type(element, path),
        LogicalType::Struct { fields } => {
            if fields.is_empty() {
                return Err(SchemaError::EmptyStruct(path.to_string()));
            }
            validate_fields(fields, path)
        }
        _ => Ok(()),
    }
}

fn arrow_field(field: &SchemaField) -> Field {
    Field::new(&field.name, arrow_type(&field.field_type), !field.required)
}

fn list_element_field(element: &LogicalType, element_required: bool) -> FieldRef {
    Arc::new(Field::new(
        LIST_ELEMENT_NAME,
        arrow_type(element),
        !element_required,
    ))
}

fn map_entry_fields(value: &LogicalType, value_required: bool) -> Fields {
    Fields::from(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("value", arrow_type(value), !value_required),
    ])
}

fn map_entries_field(value: &LogicalType, value_required: bool) -> FieldRef {
    Arc::new(Field::new(
        MAP_ENTRIES_NAME,
        DataType::Struct(map_entry_fields(value, value_required)),
        false,
    ))
}

/// Arrow type for a declared logical type.
pub fn arrow_type(ty: &LogicalType) -> DataType {
    match ty {
        LogicalType::Boolean => DataType::Boolean,
        LogicalType::Int => DataType::Int32,
        LogicalType::Long => DataType::Int64,
        LogicalType::Float => DataType::Float32,
        LogicalType::Double => DataType::Float64,
        LogicalType::Date => DataType::Date32,
        LogicalType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        LogicalType::Timestamptz => {
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        }
        LogicalType::String => DataType::Utf8,
        LogicalType::Binary => DataType::Binary,
        LogicalType::Decimal { precision, scale } => DataType::Decimal128(*precision, *scale),
        LogicalType::Map {
            value,
            value_required,
            ..
        } => DataType::Map(map_entries_field(value, *value_required), false),
        LogicalType::List {
            element,
            element_required,
        } => DataType::List(list_element_field(element, *element_required)),
        LogicalType::Struct { fields } => {
            DataType::Struct(fields.iter().map(arrow_field).collect::<Fields>())
        }
    }
}

pub fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)
        .and_then(NaiveDate::from_num_days_from_ce_opt)
}

fn describe(value: &JsonValue) -> String {
    let text = value.to_string();
    if text.chars().count() > 48 {
        let head: String = text.chars().take(45).collect();
        format!("{head}...")
    } else {
        text
    }
}

fn scalar<T>(
    value: &JsonValue,
    column: &str,
    expected: &'static str,
    convert: impl Fn(&JsonValue) -> Option<T>,
) -> Result<Option<T>, SchemaError> {
    if value.is_null() {
        return Ok(None);
    }
    convert(value).map(Some).ok_or_else(|| SchemaError::Conversion {
        column: column.to_string(),
        expected,
        found: describe(value),
    })
}

fn json_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_i32(value: &JsonValue) -> Option<i32> {
    json_i64(value).and_then(|v| i32::try_from(v).ok())
}

fn json_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
        _ => None,
    }
}

fn json_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

fn json_binary(value: &JsonValue) -> Option<Vec<u8>> {
    match value {
        JsonValue::String(s) => Some(s.as_bytes().to_vec()),
        JsonValue::Array(items) => items
            .iter()
            .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect(),
        _ => None,
    }
}

fn json_date(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .ok()
            .map(date_to_days),
        JsonValue::Number(_) => json_i32(value),
        _ => None,
    }
}

fn json_timestamp_micros(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(_) => json_i64(value),
        JsonValue::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_micros())
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                        .ok()
                        .map(|dt| dt.and_utc().timestamp_micros())
                })
        }
        _ => None,
    }
}

/// Parses a plain decimal literal into its unscaled value, truncating extra digits.
fn parse_decimal(text: &str, scale: i8) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let scale = usize::try_from(scale).ok()?;
    let mut frac: String = frac_part.chars().take(scale).collect();
    while frac.len() < scale {
        frac.push('0');
    }
    let unscaled: i128 = format!("{int_part}{frac}").parse().ok()?;
    Some(if negative { -unscaled } else { unscaled })
}

fn json_decimal(value: &JsonValue, scale: i8) -> Option<i128> {
    match value {
        JsonValue::Number(n) => parse_decimal(&n.to_string(), scale),
        JsonValue::String(s) => parse_decimal(s, scale),
        _ => None,
    }
}

fn validity(values: &[&JsonValue]) -> Option<NullBuffer> {
    let valid: Vec<bool> = values.iter().map(|v| !v.is_null()).collect();
    valid.iter().any(|v| !v).then(|| NullBuffer::from(valid))
}

fn build_array(ty: &LogicalType, values: &[&JsonValue], column: &str) -> Result<ArrayRef, SchemaError> {
    let expected = ty.name();
    let array: ArrayRef = match ty {
        LogicalType::Boolean => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, json_bool))
                .collect::<Result<BooleanArray, _>>()?,
        ),
        LogicalType::Int => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, json_i32))
                .collect::<Result<Int32Array, _>>()?,
        ),
        LogicalType::Long => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, json_i64))
                .collect::<Result<Int64Array, _>>()?,
        ),
        LogicalType::Float => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, |v| json_f64(v).map(|f| f as f32)))
                .collect::<Result<Float32Array, _>>()?,
        ),
        LogicalType::Double => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, json_f64))
                .collect::<Result<Float64Array, _>>()?,
        ),
        LogicalType::Date => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, json_date))
                .collect::<Result<Date32Array, _>>()?,
        ),
        LogicalType::Timestamp => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, json_timestamp_micros))
                .collect::<Result<TimestampMicrosecondArray, _>>()?,
        ),
        LogicalType::Timestamptz => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, json_timestamp_micros))
                .collect::<Result<TimestampMicrosecondArray, _>>()?
                .with_timezone("UTC"),
        ),
        LogicalType::String => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, json_string))
                .collect::<Result<StringArray, _>>()?,
        ),
        LogicalType::Binary => {
            let bytes = values
                .iter()
                .map(|v| scalar(v, column, expected, json_binary))
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(BinaryArray::from_iter(bytes))
        }
        LogicalType::Decimal { precision, scale } => Arc::new(
            values
                .iter()
                .map(|v| scalar(v, column, expected, |v| json_decimal(v, *scale)))
                .collect::<Result<Decimal128Array, _>>()?
                .with_precision_and_scale(*precision, *scale)?,
        ),
        LogicalType::List {
            element,
            element_required,
        } => {
            let mut lengths = Vec::with_capacity(values.len());
            let mut children: Vec<&JsonValue> = Vec::new();
            for value in values {
                match value {
                    JsonValue::Null => lengths.push(0),
                    JsonValue::Array(items) => {
                        lengths.push(items.len());
                        children.extend(items.iter());
                    }
                    other => {
                        return Err(SchemaError::Conversion {
                            column: column.to_string(),
                            expected,
                            found: describe(other),
                        })
                    }
                }
            }
            let child = build_array(element, &children, &format!("{column}[]"))?;
            Arc::new(ListArray::try_new(
                list_element_field(element, *element_required),
                OffsetBuffer::from_lengths(lengths),
                child,
                validity(values),
            )?)
        }
        LogicalType::Map {
            value,
            value_required,
            ..
        } => {
            let mut lengths = Vec::with_capacity(values.len());
            let mut keys: Vec<&str> = Vec::new();
            let mut children: Vec<&JsonValue> = Vec::new();
            for entry in values {
                match entry {
                    JsonValue::Null => lengths.push(0),
                    JsonValue::Object(map) => {
                        lengths.push(map.len());
                        for (k, v) in map {
                            keys.push(k.as_str());
                            children.push(v);
                        }
                    }
                    other => {
                        return Err(SchemaError::Conversion {
                            column: column.to_string(),
                            expected,
                            found: describe(other),
                        })
                    }
                }
            }
            let key_array: ArrayRef = Arc::new(StringArray::from(keys));
            let value_array = build_array(value, &children, &format!("{column}{{}}"))?;
            let entries = StructArray::try_new(
                map_entry_fields(value, *value_required),
                vec![key_array, value_array],
                None,
            )?;
            Arc::new(MapArray::try_new(
                map_entries_field(value, *value_required),
                OffsetBuffer::from_lengths(lengths),
                entries,
                validity(values),
                false,
            )?)
        }
        LogicalType::Struct { fields } => {
            for value in values {
                if !matches!(value, JsonValue::Null | JsonValue::Object(_)) {
                    return Err(SchemaError::Conversion {
                        column: column.to_string(),
                        expected,
                        found: describe(value),
                    });
                }
            }
            let children = fields
                .iter()
                .map(|child| {
                    let child_values: Vec<&JsonValue> = values
                        .iter()
                        .map(|v| v.get(&child.name).unwrap_or(&NULL))
                        .collect();
                    build_array(
                        &child.field_type,
                        &child_values,
                        &format!("{column}.{}", child.name),
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(StructArray::try_new(
                fields.iter().map(arrow_field).collect::<Fields>(),
                children,
                validity(values),
            )?)
        }
    };
    Ok(array)
}
