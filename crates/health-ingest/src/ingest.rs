//! Batch ingestion pipeline: validate → normalize → dedup → commit

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::models::{Record, Row};
use crate::db::schema::TableRegistry;
use crate::dedup::DeduplicationEngine;
use crate::error::{IngestError, Result};
use crate::normalize::TimestampNormalizer;
use crate::storage::{PartitionKey, PartitionedWriter};

/// What to do with a record that fails validation or normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strictness {
    /// Drop the record, report it, keep going
    #[default]
    SkipRow,
    /// Fail the whole batch before anything is written
    AbortBatch,
}

/// A record dropped under [`Strictness::SkipRow`]
#[derive(Debug)]
pub struct RejectedRow {
    /// Position in the input batch
    pub index: usize,
    pub error: IngestError,
}

/// Outcome of one ingest call
#[derive(Debug)]
pub struct IngestReport {
    pub table: String,
    pub rows_received: usize,
    pub rejected: Vec<RejectedRow>,
    /// Rows collapsed by a later row with the same key in the same batch
    pub rows_deduplicated: usize,
    /// Stored rows replaced (upsert tables only)
    pub rows_superseded: usize,
    pub rows_written: usize,
    pub partitions_touched: Vec<PartitionKey>,
    pub partitions_removed: Vec<PartitionKey>,
}

impl IngestReport {
    /// Rows that made it past validation and normalization
    pub fn rows_processed(&self) -> usize {
        self.rows_received - self.rejected.len()
    }
}

pub struct Ingestor {
    normalizer: TimestampNormalizer,
    writer: PartitionedWriter,
    strictness: Strictness,
}

impl Ingestor {
    pub fn new(normalizer: TimestampNormalizer, writer: PartitionedWriter, strictness: Strictness) -> Self {
        Self {
            normalizer,
            writer,
            strictness,
        }
    }

    pub fn writer(&self) -> &PartitionedWriter {
        &self.writer
    }

    /// Ingest one batch into one table
    pub fn ingest(&self, registry: &TableRegistry, table: &str, records: Vec<Record>) -> Result<IngestReport> {
        let table = registry.get(table)?;
        let rows_received = records.len();
        let mut rejected = Vec::new();

        // Schema checks first so bad records do not feed DST inference
        let mut accepted: Vec<(usize, Record)> = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            match table.check_record(&record.source, &record.fields) {
                Ok(()) => accepted.push((index, record)),
                Err(error) => self.reject(&mut rejected, table.name(), index, error)?,
            }
        }

        let timestamps = self
            .normalizer
            .normalize_all(accepted.iter().map(|(_, r)| &r.timestamp), table.timestamp_strategy());

        let mut rows = Vec::with_capacity(accepted.len());
        for ((index, record), timestamp) in accepted.into_iter().zip(timestamps) {
            match timestamp {
                Ok(timestamp) => rows.push(Row {
                    source: record.source,
                    timestamp,
                    fields: record
                        .fields
                        .into_iter()
                        .map(|(name, value)| (name, value.to_storage_precision()))
                        .collect(),
                }),
                Err(error) if error.is_row_level() => {
                    self.reject(&mut rejected, table.name(), index, error)?
                }
                Err(error) => return Err(error),
            }
        }
        rejected.sort_by_key(|r| r.index);

        let deduplicated = DeduplicationEngine::for_table(table).dedup_batch(rows);
        let summary = self.writer.commit(table, deduplicated.rows)?;

        info!(
            table = table.name(),
            received = rows_received,
            rejected = rejected.len(),
            deduplicated = deduplicated.collapsed,
            written = summary.rows_written,
            "ingest complete"
        );

        Ok(IngestReport {
            table: table.name().to_string(),
            rows_received,
            rejected,
            rows_deduplicated: deduplicated.collapsed,
            rows_superseded: summary.rows_superseded,
            rows_written: summary.rows_written,
            partitions_touched: summary.partitions_written,
            partitions_removed: summary.partitions_removed,
        })
    }

    fn reject(
        &self,
        rejected: &mut Vec<RejectedRow>,
        table: &str,
        index: usize,
        error: IngestError,
    ) -> Result<()> {
        match self.strictness {
            Strictness::AbortBatch => Err(error),
            Strictness::SkipRow => {
                warn!(table, index, error = %error, "skipping record");
                rejected.push(RejectedRow { index, error });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{FieldValue, RawTimestamp};
    use crate::db::schema::{ColumnSpec, ColumnType, TableDescriptor, WriteStrategy};
    use crate::normalize::{AmbiguousPolicy, NormalizerSettings};
    use crate::storage::{ParquetStore, DEFAULT_MAX_OPEN_PARTITIONS};
    use chrono::{NaiveDate, TimeZone, Utc};
    use tempfile::TempDir;

    fn registry() -> TableRegistry {
        TableRegistry::new([TableDescriptor::new(
            "weight",
            WriteStrategy::DeleteMatching,
            ["source", "timestamp_utc"],
        )
        .with_columns(vec![ColumnSpec::new("kg", ColumnType::Float).required()])
        .with_sources(["withings"])])
        .unwrap()
    }

    fn ingestor(root: &std::path::Path, strictness: Strictness) -> Ingestor {
        let settings = NormalizerSettings {
            home_tz: chrono_tz::Europe::Berlin,
            ambiguous: AmbiguousPolicy::Infer,
            min_utc: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            future_grace: chrono::Duration::hours(24),
        };
        let normalizer = TimestampNormalizer::new(settings)
            .with_now(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let writer = PartitionedWriter::new(ParquetStore::new(root), DEFAULT_MAX_OPEN_PARTITIONS);
        Ingestor::new(normalizer, writer, strictness)
    }

    fn weigh_in(source: &str, day: u32, kg: FieldValue) -> Record {
        let local = NaiveDate::from_ymd_opt(2024, 7, day)
            .unwrap()
            .and_hms_opt(7, 30, 0)
            .unwrap();
        Record::new(source, RawTimestamp::Naive(local)).with_field("kg", kg)
    }

    #[test]
    fn test_ingest_skips_bad_rows() {
        let temp = TempDir::new().unwrap();
        let ingestor = ingestor(temp.path(), Strictness::SkipRow);
        let records = vec![
            weigh_in("withings", 1, FieldValue::Float(80.1)),
            weigh_in("scale_x", 1, FieldValue::Float(80.0)),
            weigh_in("withings", 2, FieldValue::Text("heavy".into())),
            weigh_in("withings", 2, FieldValue::Float(79.9)),
            weigh_in("withings", 2, FieldValue::Float(79.8)),
        ];

        let report = ingestor.ingest(&registry(), "weight", records).unwrap();
        assert_eq!(report.rows_received, 5);
        assert_eq!(
            report.rejected.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(report.rows_processed(), 3);
        assert_eq!(report.rows_deduplicated, 1);
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.partitions_touched.len(), 2);
    }

    #[test]
    fn test_abort_batch_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let ingestor = ingestor(temp.path(), Strictness::AbortBatch);
        let old = Record::new(
            "withings",
            RawTimestamp::Naive(NaiveDate::from_ymd_opt(1990, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()),
        )
        .with_field("kg", FieldValue::Float(70.0));

        let err = ingestor
            .ingest(
                &registry(),
                "weight",
                vec![weigh_in("withings", 1, FieldValue::Float(80.0)), old],
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::TimestampOutOfRange { .. }));
        assert!(!temp.path().join("weight").exists());
    }

    #[test]
    fn test_malformed_timestamp_text_is_row_level() {
        let temp = TempDir::new().unwrap();
        let ingestor = ingestor(temp.path(), Strictness::SkipRow);
        let text = |timestamp: RawTimestamp| {
            Record::new("withings", timestamp).with_field("kg", FieldValue::Float(80.0))
        };
        let records = vec![
            text(RawTimestamp::ZonedText {
                text: "tomorrow".into(),
                tz: "Europe/Paris".into(),
            }),
            text(RawTimestamp::InstantText {
                text: "2024-07-01 07:30".into(),
                tz: "Europe/Paris".into(),
            }),
            text(RawTimestamp::InstantText {
                text: "2024-07-01T05:30:00Z".into(),
                tz: "Europe/Paris".into(),
            }),
        ];

        let report = ingestor.ingest(&registry(), "weight", records).unwrap();
        assert_eq!(
            report.rejected.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(report
            .rejected
            .iter()
            .all(|r| matches!(r.error, IngestError::InvalidTimestamp(_))));
        assert_eq!(report.rows_written, 1);
    }

    #[test]
    fn test_unknown_table() {
        let temp = TempDir::new().unwrap();
        let ingestor = ingestor(temp.path(), Strictness::SkipRow);
        let err = ingestor.ingest(&registry(), "glucose", Vec::new()).unwrap_err();
        assert!(matches!(err, IngestError::UnknownTable(_)));
    }
}
