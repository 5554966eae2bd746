//! Record and row models shared by the normalizer, deduplicator and writer

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

use super::schema::{COL_DATE, COL_LOCAL, COL_SOURCE, COL_TZ_NAME, COL_TZ_SOURCE, COL_UTC};

/// A typed payload value, as handed over by a source adapter
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Hashable form used when this value participates in a primary key
    pub fn key_part(&self) -> KeyPart {
        match self {
            FieldValue::Null => KeyPart::Null,
            FieldValue::Bool(v) => KeyPart::Bool(*v),
            FieldValue::Int(v) => KeyPart::Int(*v),
            // -0.0 and 0.0 compare equal, so they must share a key
            FieldValue::Float(v) if *v == 0.0 => KeyPart::Float(0),
            FieldValue::Float(v) => KeyPart::Float(v.to_bits()),
            FieldValue::Text(v) => KeyPart::Text(v.clone()),
            FieldValue::Date(v) => KeyPart::Date(*v),
            FieldValue::Timestamp(v) => KeyPart::Timestamp(truncate_micros(*v)),
        }
    }

    /// The value as it reads back from storage, which keeps microseconds
    pub fn to_storage_precision(self) -> Self {
        match self {
            FieldValue::Timestamp(v) => FieldValue::Timestamp(truncate_micros(v)),
            other => other,
        }
    }
}

/// Drop sub-microsecond digits
pub fn truncate_micros(value: NaiveDateTime) -> NaiveDateTime {
    value
        .with_nanosecond(value.nanosecond() / 1_000 * 1_000)
        .unwrap_or(value)
}

/// One component of a primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "null"),
            KeyPart::Bool(v) => write!(f, "{}", v),
            KeyPart::Int(v) => write!(f, "{}", v),
            KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            KeyPart::Text(v) => write!(f, "{}", v),
            KeyPart::Date(v) => write!(f, "{}", v),
            KeyPart::Timestamp(v) => write!(f, "{}", v),
        }
    }
}

/// Raw timestamp as produced by a source adapter, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawTimestamp {
    /// Wall-clock value with no zone information
    Naive(NaiveDateTime),
    /// Wall-clock text; any trailing UTC offset is ignored
    Text(String),
    /// Wall-clock value with the zone it was recorded in
    Zoned { local: NaiveDateTime, tz: String },
    /// Absolute instant with the zone it was recorded in
    Instant { utc: DateTime<Utc>, tz: String },
    /// Unparsed wall-clock text with its zone
    ZonedText { text: String, tz: String },
    /// Unparsed RFC 3339 instant with its zone
    InstantText { text: String, tz: String },
}

/// A record handed to the engine by an external adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub source: String,
    pub timestamp: RawTimestamp,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(source: impl Into<String>, timestamp: RawTimestamp) -> Self {
        Self {
            source: source.into(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style payload setter
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// How reliable the local component of a normalized timestamp is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TzSource {
    /// Zone presumed to be the configured home zone
    Assumed,
    /// Zone reported by the source
    Actual,
}

impl TzSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TzSource::Assumed => "assumed",
            TzSource::Actual => "actual",
        }
    }
}

impl fmt::Display for TzSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TzSource {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assumed" => Ok(TzSource::Assumed),
            "actual" => Ok(TzSource::Actual),
            other => Err(IngestError::invalid_record(format!(
                "Unknown tz_source '{}'",
                other
            ))),
        }
    }
}

/// Timestamp after normalization. `utc` is canonical; `local` is the wall clock
/// in `tz_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTimestamp {
    pub utc: DateTime<Utc>,
    pub local: NaiveDateTime,
    pub tz_name: String,
    pub tz_source: TzSource,
}

/// A normalized row, as stored in a partition
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub source: String,
    pub timestamp: NormalizedTimestamp,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Row {
    /// Local calendar date, which drives partition assignment
    pub fn local_date(&self) -> NaiveDate {
        self.timestamp.local.date()
    }

    /// Payload value, `Null` when absent
    pub fn field(&self, name: &str) -> &FieldValue {
        self.fields.get(name).unwrap_or(&FieldValue::Null)
    }

    /// Key component for a payload or built-in column
    pub fn key_part(&self, column: &str) -> KeyPart {
        match column {
            COL_SOURCE => KeyPart::Text(self.source.clone()),
            COL_DATE => KeyPart::Date(self.local_date()),
            COL_UTC => KeyPart::Timestamp(self.timestamp.utc.naive_utc()),
            COL_LOCAL => KeyPart::Timestamp(self.timestamp.local),
            COL_TZ_NAME => KeyPart::Text(self.timestamp.tz_name.clone()),
            COL_TZ_SOURCE => KeyPart::Text(self.timestamp.tz_source.as_str().to_string()),
            name => self.field(name).key_part(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        let utc = DateTime::from_timestamp(1_710_000_000, 0).unwrap();
        Row {
            source: "oura".to_string(),
            timestamp: NormalizedTimestamp {
                utc,
                local: utc.naive_utc(),
                tz_name: "UTC".to_string(),
                tz_source: TzSource::Actual,
            },
            fields: BTreeMap::from([("bpm".to_string(), FieldValue::Int(61))]),
        }
    }

    #[test]
    fn test_key_part_builtins() {
        let row = sample_row();
        assert_eq!(row.key_part("source"), KeyPart::Text("oura".to_string()));
        assert_eq!(row.key_part("bpm"), KeyPart::Int(61));
        assert_eq!(row.key_part("missing"), KeyPart::Null);
        assert_eq!(row.key_part("date"), KeyPart::Date(row.local_date()));
    }

    #[test]
    fn test_float_zero_keys_match() {
        assert_eq!(
            FieldValue::Float(0.0).key_part(),
            FieldValue::Float(-0.0).key_part()
        );
    }

    #[test]
    fn test_timestamp_key_uses_storage_precision() {
        let base = NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_nano_opt(8, 0, 0, 123_456_789)
            .unwrap();
        let stored = base.with_nanosecond(123_456_000).unwrap();

        assert_eq!(
            FieldValue::Timestamp(base).key_part(),
            FieldValue::Timestamp(stored).key_part()
        );
        assert_eq!(
            FieldValue::Timestamp(base).to_storage_precision(),
            FieldValue::Timestamp(stored)
        );
    }

    #[test]
    fn test_tz_source_parse() {
        assert_eq!("assumed".parse::<TzSource>().unwrap(), TzSource::Assumed);
        assert!("guessed".parse::<TzSource>().is_err());
    }
}
