//! Parquet read/write utilities for Hive-partitioned tables
//!
//! Every partition holds a single `part-0.parquet`. Writes go to a temp file
//! that is renamed over the target, so readers see either the old or the new
//! content of a partition, never a torn file.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::*;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::db::models::{FieldValue, NormalizedTimestamp, Row};
use crate::db::schema::{
    ColumnType, TableDescriptor, COL_LOCAL, COL_TZ_NAME, COL_TZ_SOURCE, COL_UTC,
};
use crate::error::{IngestError, Result};

use super::partitions::PartitionKey;

/// File name of a partition's content
pub const PART_FILE: &str = "part-0.parquet";
const TEMP_EXTENSION: &str = "parquet.tmp";

/// Parquet storage for ingested tables
#[derive(Debug, Clone)]
pub struct ParquetStore {
    base_path: PathBuf,
}

impl ParquetStore {
    /// Create a new ParquetStore at the given base path
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.base_path.join(table)
    }

    pub fn partition_dir(&self, table: &str, key: &PartitionKey) -> PathBuf {
        self.table_dir(table).join(key.relative_dir())
    }

    /// Get the full path for a partition file
    pub fn partition_path(&self, table: &str, key: &PartitionKey) -> PathBuf {
        self.partition_dir(table, key).join(PART_FILE)
    }

    /// Glob matching every partition file of a table, for external readers
    pub fn glob_pattern(&self, table: &str) -> String {
        format!("{}/*/*/*.parquet", self.table_dir(table).display())
    }

    /// All partition directories of a table, sorted. Directories that exist
    /// but hold no data file are included; the validator reports them.
    pub fn list_partitions(&self, table: &str) -> Result<Vec<PartitionKey>> {
        let table_dir = self.table_dir(table);
        if !table_dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for date_entry in read_dir(&table_dir)? {
            if !date_entry.is_dir() {
                continue;
            }
            let Some(date_name) = dir_name(&date_entry) else {
                continue;
            };
            for source_entry in read_dir(&date_entry)? {
                if !source_entry.is_dir() {
                    continue;
                }
                let key = dir_name(&source_entry)
                    .and_then(|source_name| PartitionKey::from_dir_names(&date_name, &source_name));
                if let Some(key) = key {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Temp files left behind by an interrupted write
    pub fn leftover_temp_files(&self, table: &str) -> Result<Vec<PathBuf>> {
        let mut leftovers = Vec::new();
        for key in self.list_partitions(table)? {
            let dir = self.partition_dir(table, &key);
            for path in read_dir(&dir)? {
                if path.to_string_lossy().ends_with(TEMP_EXTENSION) {
                    leftovers.push(path);
                }
            }
        }
        Ok(leftovers)
    }

    /// Read the rows of one partition; a missing partition is empty
    pub fn read_partition(&self, table: &TableDescriptor, key: &PartitionKey) -> Result<Vec<Row>> {
        let path = self.partition_path(table.name(), key);
        let batches = self.read_batches(&path)?;

        let mut rows = Vec::new();
        for batch in batches {
            rows.extend(batch_to_rows(table, &key.source, &batch).map_err(|e| {
                IngestError::write_failure(key.to_string(), format!("Failed to decode rows: {}", e))
            })?);
        }
        Ok(rows)
    }

    /// Read every partition of a table, one at a time
    pub fn read_table(&self, table: &TableDescriptor) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for key in self.list_partitions(table.name())? {
            rows.extend(self.read_partition(table, &key)?);
        }
        Ok(rows)
    }

    /// Row counts per partition
    pub fn partition_row_counts(&self, table: &TableDescriptor) -> Result<BTreeMap<PartitionKey, usize>> {
        let mut counts = BTreeMap::new();
        for key in self.list_partitions(table.name())? {
            let rows = self.read_partition(table, &key)?;
            counts.insert(key, rows.len());
        }
        Ok(counts)
    }

    /// Make `rows` the complete content of a partition.
    ///
    /// The new file is written next to the old one and renamed over it; any
    /// other data files in the directory are removed first so nothing from the
    /// previous version survives.
    pub fn replace_partition(
        &self,
        table: &TableDescriptor,
        key: &PartitionKey,
        rows: &[Row],
    ) -> Result<usize> {
        let dir = self.partition_dir(table.name(), key);
        let failure = |message: String| IngestError::write_failure(key.to_string(), message);

        fs::create_dir_all(&dir)
            .map_err(|e| failure(format!("Failed to create directory {:?}: {}", dir, e)))?;

        let batch = rows_to_batch(table, rows)
            .map_err(|e| failure(format!("Failed to build record batch: {}", e)))?;
        let path = dir.join(PART_FILE);
        let temp_path = path.with_extension(TEMP_EXTENSION);

        write_batch(&temp_path, &batch).map_err(failure)?;

        for stale in read_dir(&dir)? {
            if stale != path && stale != temp_path && stale.is_file() {
                fs::remove_file(&stale)
                    .map_err(|e| failure(format!("Failed to remove {:?}: {}", stale, e)))?;
            }
        }

        // Atomic rename
        fs::rename(&temp_path, &path)
            .map_err(|e| failure(format!("Failed to rename temp file: {}", e)))?;

        debug!(table = table.name(), partition = %key, rows = rows.len(), "partition replaced");
        Ok(rows.len())
    }

    /// Remove a partition and its directory. Returns whether it existed.
    pub fn drop_partition(&self, table: &str, key: &PartitionKey) -> Result<bool> {
        let dir = self.partition_dir(table, key);
        if !dir.exists() {
            return Ok(false);
        }

        fs::remove_dir_all(&dir).map_err(|e| {
            IngestError::write_failure(key.to_string(), format!("Failed to remove directory: {}", e))
        })?;

        // Drop the date directory once its last source is gone
        if let Some(date_dir) = dir.parent() {
            if read_dir(date_dir)?.is_empty() {
                fs::remove_dir(date_dir).map_err(|e| {
                    IngestError::write_failure(
                        key.to_string(),
                        format!("Failed to remove date directory: {}", e),
                    )
                })?;
            }
        }

        debug!(table, partition = %key, "partition dropped");
        Ok(true)
    }

    /// Read all record batches from a partition file
    fn read_batches(&self, path: &Path) -> Result<Vec<RecordBatch>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let context = path.display().to_string();
        let file = File::open(path).map_err(|e| {
            IngestError::write_failure(&context, format!("Failed to open file: {}", e))
        })?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| IngestError::write_failure(&context, format!("Failed to create reader: {}", e)))?
            .build()
            .map_err(|e| IngestError::write_failure(&context, format!("Failed to build reader: {}", e)))?;

        reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| IngestError::write_failure(&context, format!("Failed to read batches: {}", e)))
    }
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let failure = |e: std::io::Error| {
        IngestError::write_failure(dir.display().to_string(), format!("Failed to read directory: {}", e))
    };

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(failure)? {
        entries.push(entry.map_err(failure)?.path());
    }
    entries.sort();
    Ok(entries)
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

/// Write a record batch to a file, ZSTD compressed
fn write_batch(path: &Path, batch: &RecordBatch) -> std::result::Result<(), String> {
    let file = File::create(path).map_err(|e| format!("Failed to create temp file: {}", e))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| format!("Failed to create Parquet writer: {}", e))?;

    writer
        .write(batch)
        .map_err(|e| format!("Failed to write batch: {}", e))?;

    writer
        .close()
        .map_err(|e| format!("Failed to close writer: {}", e))?;

    Ok(())
}

fn epoch() -> NaiveDate {
    NaiveDate::default()
}

fn rows_to_batch(table: &TableDescriptor, rows: &[Row]) -> std::result::Result<RecordBatch, String> {
    let utc: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| Some(r.timestamp.utc.timestamp_micros()))
        .collect::<TimestampMicrosecondArray>()
        .with_timezone("UTC");
    let local: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| Some(r.timestamp.local.and_utc().timestamp_micros()))
        .collect();
    let tz_name: StringArray = rows.iter().map(|r| Some(r.timestamp.tz_name.as_str())).collect();
    let tz_source: StringArray = rows
        .iter()
        .map(|r| Some(r.timestamp.tz_source.as_str()))
        .collect();

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(utc),
        Arc::new(local),
        Arc::new(tz_name),
        Arc::new(tz_source),
    ];

    for spec in table.columns() {
        let values = rows.iter().map(|r| r.field(&spec.name));
        let mismatch = |v: &FieldValue| format!("column '{}' cannot hold {:?}", spec.name, v);

        let array: ArrayRef = match spec.column_type {
            ColumnType::Bool => Arc::new(
                values
                    .map(|v| match v {
                        FieldValue::Null => Ok(None),
                        FieldValue::Bool(b) => Ok(Some(*b)),
                        other => Err(mismatch(other)),
                    })
                    .collect::<std::result::Result<BooleanArray, _>>()?,
            ),
            ColumnType::Int => Arc::new(
                values
                    .map(|v| match v {
                        FieldValue::Null => Ok(None),
                        FieldValue::Int(i) => Ok(Some(*i)),
                        other => Err(mismatch(other)),
                    })
                    .collect::<std::result::Result<Int64Array, _>>()?,
            ),
            ColumnType::Float => Arc::new(
                values
                    .map(|v| match v {
                        FieldValue::Null => Ok(None),
                        FieldValue::Float(f) => Ok(Some(*f)),
                        other => Err(mismatch(other)),
                    })
                    .collect::<std::result::Result<Float64Array, _>>()?,
            ),
            ColumnType::Text => Arc::new(
                values
                    .map(|v| match v {
                        FieldValue::Null => Ok(None),
                        FieldValue::Text(s) => Ok(Some(s.as_str())),
                        other => Err(mismatch(other)),
                    })
                    .collect::<std::result::Result<StringArray, _>>()?,
            ),
            ColumnType::Date => Arc::new(
                values
                    .map(|v| match v {
                        FieldValue::Null => Ok(None),
                        FieldValue::Date(d) => Ok(Some((*d - epoch()).num_days() as i32)),
                        other => Err(mismatch(other)),
                    })
                    .collect::<std::result::Result<Date32Array, _>>()?,
            ),
            ColumnType::Timestamp => Arc::new(
                values
                    .map(|v| match v {
                        FieldValue::Null => Ok(None),
                        FieldValue::Timestamp(t) => Ok(Some(t.and_utc().timestamp_micros())),
                        other => Err(mismatch(other)),
                    })
                    .collect::<std::result::Result<TimestampMicrosecondArray, _>>()?,
            ),
        };
        columns.push(array);
    }

    RecordBatch::try_new(table.arrow_schema(), columns)
        .map_err(|e| format!("Failed to create record batch: {}", e))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> std::result::Result<&'a T, String> {
    batch
        .column_by_name(name)
        .ok_or_else(|| format!("missing column '{}'", name))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("column '{}' has an unexpected type", name))
}

fn micros_to_naive(micros: i64) -> std::result::Result<NaiveDateTime, String> {
    DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| format!("timestamp {} out of range", micros))
}

fn batch_to_rows(
    table: &TableDescriptor,
    source: &str,
    batch: &RecordBatch,
) -> std::result::Result<Vec<Row>, String> {
    let len = batch.num_rows();
    let utc = column::<TimestampMicrosecondArray>(batch, COL_UTC)?;
    let local = column::<TimestampMicrosecondArray>(batch, COL_LOCAL)?;
    let tz_name = column::<StringArray>(batch, COL_TZ_NAME)?;
    let tz_source = column::<StringArray>(batch, COL_TZ_SOURCE)?;

    let mut rows = Vec::with_capacity(len);
    for i in 0..len {
        rows.push(Row {
            source: source.to_string(),
            timestamp: NormalizedTimestamp {
                utc: micros_to_naive(utc.value(i))?.and_utc(),
                local: micros_to_naive(local.value(i))?,
                tz_name: tz_name.value(i).to_string(),
                tz_source: tz_source.value(i).parse().map_err(|e| format!("{}", e))?,
            },
            fields: BTreeMap::new(),
        });
    }

    for spec in table.columns() {
        // Columns added after a partition was written read back as null
        if batch.column_by_name(&spec.name).is_none() {
            continue;
        }
        let name = spec.name.as_str();

        for (i, row) in rows.iter_mut().enumerate() {
            let value = match spec.column_type {
                ColumnType::Bool => {
                    let a = column::<BooleanArray>(batch, name)?;
                    a.is_valid(i).then(|| FieldValue::Bool(a.value(i)))
                }
                ColumnType::Int => {
                    let a = column::<Int64Array>(batch, name)?;
                    a.is_valid(i).then(|| FieldValue::Int(a.value(i)))
                }
                ColumnType::Float => {
                    let a = column::<Float64Array>(batch, name)?;
                    a.is_valid(i).then(|| FieldValue::Float(a.value(i)))
                }
                ColumnType::Text => {
                    let a = column::<StringArray>(batch, name)?;
                    a.is_valid(i).then(|| FieldValue::Text(a.value(i).to_string()))
                }
                ColumnType::Date => {
                    let a = column::<Date32Array>(batch, name)?;
                    a.is_valid(i)
                        .then(|| FieldValue::Date(epoch() + chrono::Duration::days(a.value(i) as i64)))
                }
                ColumnType::Timestamp => {
                    let a = column::<TimestampMicrosecondArray>(batch, name)?;
                    if a.is_valid(i) {
                        Some(FieldValue::Timestamp(micros_to_naive(a.value(i))?))
                    } else {
                        None
                    }
                }
            };
            if let Some(value) = value {
                row.fields.insert(spec.name.clone(), value);
            }
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TzSource;
    use crate::db::schema::{ColumnSpec, WriteStrategy};
    use tempfile::TempDir;

    fn table() -> TableDescriptor {
        TableDescriptor::new("workouts", WriteStrategy::DeleteMatching, ["source", "timestamp_utc"])
            .with_columns(vec![
                ColumnSpec::new("kind", ColumnType::Text),
                ColumnSpec::new("calories", ColumnType::Int),
                ColumnSpec::new("distance_km", ColumnType::Float),
                ColumnSpec::new("indoor", ColumnType::Bool),
                ColumnSpec::new("plan_date", ColumnType::Date),
                ColumnSpec::new("ended_at", ColumnType::Timestamp),
            ])
    }

    fn workout(hour: u32) -> Row {
        let local = NaiveDate::from_ymd_opt(2024, 12, 15)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        Row {
            source: "strava".to_string(),
            timestamp: NormalizedTimestamp {
                utc: (local + chrono::Duration::hours(5)).and_utc(),
                local,
                tz_name: "America/New_York".to_string(),
                tz_source: TzSource::Assumed,
            },
            fields: BTreeMap::from([
                ("kind".to_string(), FieldValue::Text("run".to_string())),
                ("calories".to_string(), FieldValue::Int(500)),
                ("distance_km".to_string(), FieldValue::Float(10.5)),
                ("indoor".to_string(), FieldValue::Bool(false)),
                (
                    "plan_date".to_string(),
                    FieldValue::Date(NaiveDate::from_ymd_opt(2024, 12, 14).unwrap()),
                ),
                (
                    "ended_at".to_string(),
                    FieldValue::Timestamp(local + chrono::Duration::minutes(45)),
                ),
            ]),
        }
    }

    #[test]
    fn test_partition_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let table = table();
        let key = PartitionKey::new("2024-12-15", "strava");

        let mut sparse = workout(9);
        sparse.fields.remove("calories");
        let rows = vec![workout(7), sparse];

        store.replace_partition(&table, &key, &rows).unwrap();
        let read_back = store.read_partition(&table, &key).unwrap();

        assert_eq!(read_back, rows);
        assert!(store
            .partition_path("workouts", &key)
            .ends_with("workouts/date=2024-12-15/source=strava/part-0.parquet"));
    }

    #[test]
    fn test_replace_discards_previous_content() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let table = table();
        let key = PartitionKey::new("2024-12-15", "strava");

        store
            .replace_partition(&table, &key, &[workout(6), workout(7), workout(8)])
            .unwrap();
        // A stray file from another writer must not survive a replacement
        fs::write(store.partition_dir("workouts", &key).join("part-1.parquet"), b"junk").unwrap();

        store.replace_partition(&table, &key, &[workout(9)]).unwrap();

        let read_back = store.read_partition(&table, &key).unwrap();
        assert_eq!(read_back, vec![workout(9)]);
        let files = read_dir(&store.partition_dir("workouts", &key)).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_list_and_drop_partitions() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let table = table();
        let a = PartitionKey::new("2024-12-15", "strava");
        let b = PartitionKey::new("2024-12-15", "garmin");
        let c = PartitionKey::new("2024-12-16", "strava");

        assert!(store.list_partitions("workouts").unwrap().is_empty());
        for key in [&a, &b, &c] {
            store.replace_partition(&table, key, &[workout(7)]).unwrap();
        }
        assert_eq!(store.list_partitions("workouts").unwrap(), vec![b.clone(), a.clone(), c.clone()]);

        assert!(store.drop_partition("workouts", &c).unwrap());
        assert!(!store.drop_partition("workouts", &c).unwrap());
        assert!(!store.table_dir("workouts").join("date=2024-12-16").exists());
        assert_eq!(store.list_partitions("workouts").unwrap(), vec![b, a]);
    }

    #[test]
    fn test_missing_partition_reads_empty() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let rows = store
            .read_partition(&table(), &PartitionKey::new("2020-01-01", "strava"))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_directory_errors_are_write_failures() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        // A plain file where the table directory should be
        fs::write(store.table_dir("workouts"), b"not a directory").unwrap();

        assert!(matches!(
            store.list_partitions("workouts"),
            Err(IngestError::PartitionWriteFailure { .. })
        ));
        assert!(matches!(
            store.replace_partition(&table(), &PartitionKey::new("2024-12-15", "strava"), &[workout(7)]),
            Err(IngestError::PartitionWriteFailure { .. })
        ));
    }

    #[test]
    fn test_leftover_temp_files_are_found() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let key = PartitionKey::new("2024-12-15", "strava");
        store.replace_partition(&table(), &key, &[workout(7)]).unwrap();
        assert!(store.leftover_temp_files("workouts").unwrap().is_empty());

        let temp_file = store.partition_dir("workouts", &key).join("part-0.parquet.tmp");
        fs::write(&temp_file, b"partial").unwrap();
        assert_eq!(store.leftover_temp_files("workouts").unwrap(), vec![temp_file]);
    }
}
