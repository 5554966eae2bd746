//! Partition key calculation for Hive-style partitioned Parquet storage

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};

use crate::db::models::Row;
use crate::db::schema::{is_path_safe, PartitionPeriod, TableDescriptor, COL_DATE, COL_SOURCE};

impl PartitionPeriod {
    /// Bucket label for a date
    pub fn bucket(&self, date: NaiveDate) -> String {
        match self {
            // Daily: YYYY-MM-DD
            PartitionPeriod::Daily => date.format("%Y-%m-%d").to_string(),
            // Monthly: YYYY-MM
            PartitionPeriod::Monthly => date.format("%Y-%m").to_string(),
        }
    }

    /// First day covered by a bucket label
    pub fn bucket_start(&self, bucket: &str) -> Option<NaiveDate> {
        match self {
            PartitionPeriod::Daily => NaiveDate::parse_from_str(bucket, "%Y-%m-%d").ok(),
            PartitionPeriod::Monthly => {
                NaiveDate::parse_from_str(&format!("{}-01", bucket), "%Y-%m-%d").ok()
            }
        }
    }

    /// Every bucket label between two dates, inclusive
    pub fn buckets_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<String> {
        let mut buckets = Vec::new();
        let mut current = from;

        while current <= to {
            buckets.push(self.bucket(current));

            // Advance by appropriate interval
            let next = match self {
                PartitionPeriod::Daily => current.succ_opt(),
                PartitionPeriod::Monthly => {
                    if current.month() == 12 {
                        NaiveDate::from_ymd_opt(current.year() + 1, 1, 1)
                    } else {
                        NaiveDate::from_ymd_opt(current.year(), current.month() + 1, 1)
                    }
                }
            };
            match next {
                Some(next) => current = next,
                None => break,
            }
        }

        buckets
    }
}

/// Identity of one partition: `(date_bucket, source)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub bucket: String,
    pub source: String,
}

impl PartitionKey {
    pub fn new(bucket: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            source: source.into(),
        }
    }

    /// Directory relative to the table root: `date=<bucket>/source=<source>`
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("{}={}", COL_DATE, self.bucket))
            .join(format!("{}={}", COL_SOURCE, self.source))
    }

    /// Recover a key from its two directory names
    pub fn from_dir_names(date_dir: &str, source_dir: &str) -> Option<Self> {
        let bucket = date_dir.strip_prefix("date=")?;
        let source = source_dir.strip_prefix("source=")?;
        let bucket_ok = !bucket.is_empty()
            && bucket.chars().all(|c| c.is_ascii_digit() || c == '-');
        if !bucket_ok || !is_path_safe(source) {
            return None;
        }
        Some(Self::new(bucket, source))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "date={}/source={}", self.bucket, self.source)
    }
}

/// Rows grouped by the partition they belong to
#[derive(Debug, Default)]
pub struct PartitionPlan {
    pub partitions: BTreeMap<PartitionKey, Vec<Row>>,
}

impl PartitionPlan {
    /// Every partition the plan touches, in order
    pub fn touched(&self) -> Vec<PartitionKey> {
        self.partitions.keys().cloned().collect()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn row_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }
}

/// Assigns rows to partitions at the table's granularity
#[derive(Debug, Clone, Copy)]
pub struct PartitionPlanner {
    period: PartitionPeriod,
}

impl PartitionPlanner {
    pub fn for_table(table: &TableDescriptor) -> Self {
        Self {
            period: table.partition_period(),
        }
    }

    pub fn period(&self) -> PartitionPeriod {
        self.period
    }

    /// Partition for a single row, from its local date and source
    pub fn assign(&self, row: &Row) -> PartitionKey {
        PartitionKey::new(self.period.bucket(row.local_date()), row.source.clone())
    }

    /// Group rows by partition, keeping batch order within each partition
    pub fn plan(&self, rows: Vec<Row>) -> PartitionPlan {
        let mut partitions: BTreeMap<PartitionKey, Vec<Row>> = BTreeMap::new();
        for row in rows {
            partitions.entry(self.assign(&row)).or_default().push(row);
        }
        PartitionPlan { partitions }
    }
}
