//! Post-hoc consistency check of a stored table
//!
//! A crash mid-commit leaves a table partly rewritten. Nothing repairs it
//! automatically; this pass finds the damage so the batch can be re-run.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::db::schema::{TableDescriptor, WriteStrategy};
use crate::dedup::{format_key, DeduplicationEngine, RowKey};
use crate::error::Result;

use super::parquet::ParquetStore;
use super::partitions::{PartitionKey, PartitionPlanner};

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub table: String,
    pub row_counts: BTreeMap<PartitionKey, usize>,
    /// Primary keys stored more than once, formatted
    pub duplicate_keys: Vec<String>,
    /// Rows whose local date or source does not match their partition
    pub misplaced_rows: BTreeMap<PartitionKey, usize>,
    /// Partition directories without a data file
    pub empty_partitions: Vec<PartitionKey>,
    /// Temp files left by an interrupted write
    pub temp_files: Vec<PathBuf>,
    /// Buckets with no partition between a source's first and last bucket.
    /// Informational; sources legitimately skip days.
    pub missing_buckets: BTreeMap<String, Vec<String>>,
}

impl ValidationReport {
    pub fn total_rows(&self) -> usize {
        self.row_counts.values().sum()
    }

    pub fn partition_count(&self) -> usize {
        self.row_counts.len()
    }

    /// No duplicate keys, misplaced rows, empty partitions or temp files
    pub fn is_consistent(&self) -> bool {
        self.duplicate_keys.is_empty()
            && self.misplaced_rows.is_empty()
            && self.empty_partitions.is_empty()
            && self.temp_files.is_empty()
    }
}

/// Inspect every partition of a table.
///
/// Keys are checked table-wide for `upsert_by_key` tables and per partition
/// for `delete_matching` tables.
pub fn validate_table(store: &ParquetStore, table: &TableDescriptor) -> Result<ValidationReport> {
    let planner = PartitionPlanner::for_table(table);
    let engine = DeduplicationEngine::for_table(table);
    let global_keys = table.write_strategy() == WriteStrategy::UpsertByKey;

    let mut report = ValidationReport {
        table: table.name().to_string(),
        temp_files: store.leftover_temp_files(table.name())?,
        ..Default::default()
    };

    let mut seen: HashSet<RowKey> = HashSet::new();
    let mut duplicates: HashSet<RowKey> = HashSet::new();
    let mut buckets_by_source: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for key in store.list_partitions(table.name())? {
        if !store.partition_path(table.name(), &key).exists() {
            report.empty_partitions.push(key);
            continue;
        }

        let rows = store.read_partition(table, &key)?;
        if !global_keys {
            seen.clear();
        }

        let mut misplaced = 0;
        for row in &rows {
            if planner.assign(row) != key {
                misplaced += 1;
            }
            let row_key = engine.key(row);
            if !seen.insert(row_key.clone()) {
                duplicates.insert(row_key);
            }
        }

        if misplaced > 0 {
            report.misplaced_rows.insert(key.clone(), misplaced);
        }
        buckets_by_source
            .entry(key.source.clone())
            .or_default()
            .push(key.bucket.clone());
        report.row_counts.insert(key, rows.len());
    }

    let period = planner.period();
    for (source, buckets) in buckets_by_source {
        let first = buckets.iter().min().and_then(|b| period.bucket_start(b));
        let last = buckets.iter().max().and_then(|b| period.bucket_start(b));
        if let (Some(first), Some(last)) = (first, last) {
            let missing: Vec<String> = period
                .buckets_between(first, last)
                .into_iter()
                .filter(|b| !buckets.contains(b))
                .collect();
            if !missing.is_empty() {
                report.missing_buckets.insert(source, missing);
            }
        }
    }

    let mut duplicate_keys: Vec<String> = duplicates.iter().map(|k| format_key(k)).collect();
    duplicate_keys.sort();
    report.duplicate_keys = duplicate_keys;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{FieldValue, NormalizedTimestamp, Row, TzSource};
    use crate::db::schema::{ColumnSpec, ColumnType};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn table(strategy: WriteStrategy) -> TableDescriptor {
        TableDescriptor::new("hr", strategy, ["source", "id"])
            .with_columns(vec![ColumnSpec::new("id", ColumnType::Int)])
    }

    fn row(date: NaiveDate, id: i64) -> Row {
        let local = date.and_hms_opt(12, 0, 0).unwrap();
        Row {
            source: "polar".to_string(),
            timestamp: NormalizedTimestamp {
                utc: local.and_utc(),
                local,
                tz_name: "UTC".to_string(),
                tz_source: TzSource::Actual,
            },
            fields: BTreeMap::from([("id".to_string(), FieldValue::Int(id))]),
        }
    }

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    #[test]
    fn test_clean_table_is_consistent() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let table = table(WriteStrategy::DeleteMatching);
        store
            .replace_partition(&table, &PartitionKey::new("2024-01-01", "polar"), &[row(date(1, 1), 1)])
            .unwrap();
        store
            .replace_partition(&table, &PartitionKey::new("2024-01-03", "polar"), &[row(date(1, 3), 2)])
            .unwrap();

        let report = validate_table(&store, &table).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.total_rows(), 2);
        assert_eq!(report.partition_count(), 2);
        assert_eq!(report.missing_buckets["polar"], vec!["2024-01-02".to_string()]);
    }

    #[test]
    fn test_detects_duplicates_across_upsert_partitions() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let table = table(WriteStrategy::UpsertByKey);
        store
            .replace_partition(&table, &PartitionKey::new("2024-01", "polar"), &[row(date(1, 5), 7)])
            .unwrap();
        store
            .replace_partition(&table, &PartitionKey::new("2024-02", "polar"), &[row(date(2, 5), 7)])
            .unwrap();

        let report = validate_table(&store, &table).unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.duplicate_keys, vec!["(polar, 7)".to_string()]);
    }

    #[test]
    fn test_detects_misplaced_rows_and_leftovers() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let table = table(WriteStrategy::DeleteMatching);
        let key = PartitionKey::new("2024-01-01", "polar");
        store.replace_partition(&table, &key, &[row(date(1, 2), 1)]).unwrap();
        fs::write(store.partition_dir("hr", &key).join("part-0.parquet.tmp"), b"x").unwrap();
        fs::create_dir_all(store.partition_dir("hr", &PartitionKey::new("2024-01-09", "polar"))).unwrap();

        let report = validate_table(&store, &table).unwrap();
        assert_eq!(report.misplaced_rows[&key], 1);
        assert_eq!(report.temp_files.len(), 1);
        assert_eq!(report.empty_partitions, vec![PartitionKey::new("2024-01-09", "polar")]);
        assert!(!report.is_consistent());
    }
}
