//! Table descriptors and the registry they live in

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};

use crate::db::models::FieldValue;
use crate::error::{IngestError, Result};

/// Partition column holding the date bucket
pub const COL_DATE: &str = "date";
/// Partition column holding the source identifier
pub const COL_SOURCE: &str = "source";
pub const COL_UTC: &str = "timestamp_utc";
pub const COL_LOCAL: &str = "timestamp_local";
pub const COL_TZ_NAME: &str = "tz_name";
pub const COL_TZ_SOURCE: &str = "tz_source";

const BUILTIN_COLUMNS: [&str; 6] = [COL_DATE, COL_SOURCE, COL_UTC, COL_LOCAL, COL_TZ_NAME, COL_TZ_SOURCE];

/// How a table's batches are committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Replace every partition present in the batch, leave the rest alone
    DeleteMatching,
    /// Merge the batch into the whole table by primary key
    UpsertByKey,
}

impl WriteStrategy {
    /// The partition period this strategy requires.
    ///
    /// Upserts open every partition of the table, so they need coarse monthly
    /// buckets to keep the number of files bounded.
    pub fn partition_period(&self) -> PartitionPeriod {
        match self {
            WriteStrategy::DeleteMatching => PartitionPeriod::Daily,
            WriteStrategy::UpsertByKey => PartitionPeriod::Monthly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStrategy::DeleteMatching => "delete_matching",
            WriteStrategy::UpsertByKey => "upsert_by_key",
        }
    }
}

/// Date bucket granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionPeriod {
    Daily,
    Monthly,
}

/// Which timestamp normalization strategy a table's sources need
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampStrategy {
    /// Strategy A: wall clock presumed to be in the home zone
    #[default]
    Assumed,
    /// Strategy B: the source reports the real zone
    Actual,
}

/// Declared type of a payload column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn arrow_type(&self) -> DataType {
        match self {
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Int => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::Text => DataType::Utf8,
            ColumnType::Date => DataType::Date32,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }

    /// Whether a value fits this column (nulls are checked separately)
    pub fn accepts(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (_, FieldValue::Null)
                | (ColumnType::Bool, FieldValue::Bool(_))
                | (ColumnType::Int, FieldValue::Int(_))
                | (ColumnType::Float, FieldValue::Float(_))
                | (ColumnType::Text, FieldValue::Text(_))
                | (ColumnType::Date, FieldValue::Date(_))
                | (ColumnType::Timestamp, FieldValue::Timestamp(_))
        )
    }
}

/// A payload column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Immutable per-table configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    name: String,
    write_strategy: WriteStrategy,
    partition_period: PartitionPeriod,
    timestamp_strategy: TimestampStrategy,
    primary_key: Vec<String>,
    columns: Vec<ColumnSpec>,
    sources: Vec<String>,
}

impl TableDescriptor {
    /// Create a descriptor; the partition period follows from the write strategy
    pub fn new<I, S>(name: impl Into<String>, write_strategy: WriteStrategy, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            write_strategy,
            partition_period: write_strategy.partition_period(),
            timestamp_strategy: TimestampStrategy::default(),
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            columns: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnSpec>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timestamp_strategy(mut self, strategy: TimestampStrategy) -> Self {
        self.timestamp_strategy = strategy;
        self
    }

    /// Override the derived partition period. Only legacy layouts need this;
    /// an upsert table on daily partitions fails with `ResourceExhausted` once
    /// its history outgrows the open-partition limit.
    pub fn with_partition_period(mut self, period: PartitionPeriod) -> Self {
        self.partition_period = period;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write_strategy(&self) -> WriteStrategy {
        self.write_strategy
    }

    pub fn partition_period(&self) -> PartitionPeriod {
        self.partition_period
    }

    pub fn timestamp_strategy(&self) -> TimestampStrategy {
        self.timestamp_strategy
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Allowed sources; empty means any path-safe identifier
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Monthly iff upsert_by_key
    pub fn follows_period_rule(&self) -> bool {
        self.partition_period == self.write_strategy.partition_period()
    }

    /// Structural checks: names, key columns, sources
    pub fn validate(&self) -> Result<()> {
        if !is_path_safe(&self.name) {
            return Err(IngestError::config(format!(
                "Table name '{}' must match [A-Za-z0-9_-]+",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if BUILTIN_COLUMNS.contains(&column.name.as_str()) {
                return Err(IngestError::config(format!(
                    "Table '{}': column '{}' shadows a built-in column",
                    self.name, column.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(IngestError::config(format!(
                    "Table '{}': duplicate column '{}'",
                    self.name, column.name
                )));
            }
        }

        if self.primary_key.is_empty() {
            return Err(IngestError::config(format!(
                "Table '{}' has an empty primary key",
                self.name
            )));
        }
        for key in &self.primary_key {
            if !BUILTIN_COLUMNS.contains(&key.as_str()) && !seen.contains(key.as_str()) {
                return Err(IngestError::config(format!(
                    "Table '{}': primary key column '{}' is not defined",
                    self.name, key
                )));
            }
        }

        if let Some(bad) = self.sources.iter().find(|s| !is_path_safe(s)) {
            return Err(IngestError::config(format!(
                "Table '{}': source '{}' must match [A-Za-z0-9_-]+",
                self.name, bad
            )));
        }

        Ok(())
    }

    /// Check a record's source and payload against the table definition
    pub fn check_record(&self, source: &str, fields: &BTreeMap<String, FieldValue>) -> Result<()> {
        if !is_path_safe(source) {
            return Err(IngestError::invalid_record(format!(
                "Source '{}' is not a valid partition value",
                source
            )));
        }
        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == source) {
            return Err(IngestError::invalid_record(format!(
                "Source '{}' is not allowed for table '{}'",
                source, self.name
            )));
        }

        for (name, value) in fields {
            let spec = self
                .columns
                .iter()
                .find(|c| &c.name == name)
                .ok_or_else(|| {
                    IngestError::invalid_record(format!(
                        "Unknown column '{}' for table '{}'",
                        name, self.name
                    ))
                })?;
            if !spec.column_type.accepts(value) {
                return Err(IngestError::invalid_record(format!(
                    "Column '{}' expects {:?}, got {:?}",
                    name, spec.column_type, value
                )));
            }
        }

        for spec in self.columns.iter().filter(|c| !c.nullable) {
            if fields.get(&spec.name).map_or(true, FieldValue::is_null) {
                return Err(IngestError::invalid_record(format!(
                    "Column '{}' is required",
                    spec.name
                )));
            }
        }

        Ok(())
    }

    /// Arrow schema of a partition file. Partition columns live in the path.
    pub fn arrow_schema(&self) -> SchemaRef {
        let mut fields = vec![
            Field::new(
                COL_UTC,
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new(COL_LOCAL, DataType::Timestamp(TimeUnit::Microsecond, None), false),
            Field::new(COL_TZ_NAME, DataType::Utf8, false),
            Field::new(COL_TZ_SOURCE, DataType::Utf8, false),
        ];
        fields.extend(
            self.columns
                .iter()
                .map(|c| Field::new(&c.name, c.column_type.arrow_type(), c.nullable)),
        );
        Arc::new(Schema::new(fields))
    }
}

/// Immutable map of table name to descriptor, passed explicitly into each call
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<String, Arc<TableDescriptor>>,
}

impl TableRegistry {
    pub fn new<I>(descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = TableDescriptor>,
    {
        let mut tables = BTreeMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            let name = descriptor.name().to_string();
            if tables.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(IngestError::config(format!("Table '{}' defined twice", name)));
            }
        }
        Ok(Self { tables })
    }

    pub fn get(&self, name: &str) -> Result<&TableDescriptor> {
        self.tables
            .get(name)
            .map(|d| d.as_ref())
            .ok_or_else(|| IngestError::UnknownTable(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Table names, sources and partition values become directory names
pub fn is_path_safe(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
