//! JSON-lines batch input
//!
//! One record per line:
//!
//! ```json
//! {"source": "oura", "timestamp": "2024-11-03 01:30:00", "tz": "America/New_York", "fields": {"score": 81}}
//! ```
//!
//! `tz` is optional. `utc` (RFC 3339) may replace the wall clock for sources
//! that report absolute instants; it needs `tz` alongside it.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::db::models::{FieldValue, RawTimestamp, Record};
use crate::db::schema::{ColumnType, TableDescriptor};
use crate::error::{IngestError, Result};
use crate::normalize::parse_naive;

#[derive(Debug, Deserialize)]
struct InputLine {
    source: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    tz: Option<String>,
    #[serde(default)]
    utc: Option<String>,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

/// Read a JSON-lines file into records for `table`
pub fn read_records(path: &Path, table: &TableDescriptor) -> Result<Vec<Record>> {
    let file = File::open(path)
        .map_err(|e| IngestError::config(format!("Failed to open {}: {}", path.display(), e)))?;
    parse_records(BufReader::new(file), table)
}

/// Decode JSON lines. Malformed lines fail the whole input with their line
/// number; timestamps and values that merely do not fit the table are left for
/// the engine to accept or reject per row.
pub fn parse_records(reader: impl BufRead, table: &TableDescriptor) -> Result<Vec<Record>> {
    let mut records = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let line_no = index + 1;
        let input: InputLine = serde_json::from_str(&line)
            .map_err(|e| IngestError::invalid_record(format!("line {}: {}", line_no, e)))?;
        records.push(
            to_record(input, table)
                .map_err(|e| IngestError::invalid_record(format!("line {}: {}", line_no, e)))?,
        );
    }

    Ok(records)
}

fn to_record(input: InputLine, table: &TableDescriptor) -> Result<Record> {
    let timestamp = match (input.utc, input.tz, input.timestamp) {
        (Some(text), Some(tz), _) => RawTimestamp::InstantText { text, tz },
        (Some(_), None, _) => {
            return Err(IngestError::invalid_record("'utc' requires 'tz'"));
        }
        (None, Some(tz), Some(text)) => RawTimestamp::ZonedText { text, tz },
        (None, None, Some(text)) => RawTimestamp::Text(text),
        (None, _, None) => {
            return Err(IngestError::invalid_record("missing 'timestamp'"));
        }
    };

    let mut record = Record::new(input.source, timestamp);
    for (name, value) in input.fields {
        let column_type = table
            .columns()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.column_type);
        record = record.with_field(name, decode_value(value, column_type));
    }
    Ok(record)
}

/// Decode a JSON value, guided by the declared column type when there is one
fn decode_value(value: Value, column_type: Option<ColumnType>) -> FieldValue {
    match (column_type, value) {
        (_, Value::Null) => FieldValue::Null,
        (Some(ColumnType::Float), Value::Number(n)) => match n.as_f64() {
            Some(f) => FieldValue::Float(f),
            None => FieldValue::Text(n.to_string()),
        },
        (Some(ColumnType::Date), Value::String(s)) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(FieldValue::Date)
            .unwrap_or(FieldValue::Text(s)),
        (Some(ColumnType::Timestamp), Value::String(s)) => match parse_naive(&s) {
            Ok(t) => FieldValue::Timestamp(t),
            Err(_) => FieldValue::Text(s),
        },
        (_, Value::Bool(b)) => FieldValue::Bool(b),
        (_, Value::Number(n)) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        (_, Value::String(s)) => FieldValue::Text(s),
        (_, other) => FieldValue::Text(other.to_string()),
    }
}
