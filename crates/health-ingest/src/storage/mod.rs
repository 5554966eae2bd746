//! Storage layer for ingested health data
//!
//! Tables are Hive-partitioned Parquet directories, partitioned on the local
//! date bucket and the source.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/health-ingest/
//! ├── steps/                                   # delete_matching, daily
//! │   ├── date=2024-12-01/
//! │   │   ├── source=fitbit/part-0.parquet
//! │   │   └── source=garmin/part-0.parquet
//! │   └── ...
//! └── sleep_sessions/                          # upsert_by_key, monthly
//!     ├── date=2024-12/
//!     │   └── source=oura/part-0.parquet
//!     └── ...
//! ```
//!
//! ## Concurrent Access
//!
//! Partition files are written atomically (temp file + rename), so readers
//! always see a whole file. A table being rewritten by `upsert_by_key` can still
//! show a mix of old and new partitions until the commit finishes. External
//! apps can query data using DuckDB:
//!
//! ```sql
//! SELECT * FROM read_parquet('steps/*/*/*.parquet', hive_partitioning = true)
//! WHERE date >= '2024-12-01';
//! ```

mod parquet;
mod partitions;
mod validate;
mod writer;

pub use parquet::{ParquetStore, PART_FILE};
pub use partitions::{PartitionKey, PartitionPlan, PartitionPlanner};
pub use validate::{validate_table, ValidationReport};
pub use writer::{
    CommitPhase, CommitSummary, MergeStrategy, PartitionedWriter, WholeTableMerge,
    DEFAULT_MAX_OPEN_PARTITIONS,
};

use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

/// Get the default storage path
pub fn default_storage_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("health-ingest")
}

/// Storage manager wrapping the Parquet store
pub struct Storage {
    pub parquet: ParquetStore,
}

impl Storage {
    /// Open storage at a custom location
    pub fn open(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).map_err(|e| {
            IngestError::config(format!(
                "Failed to create storage directory {:?}: {}",
                base_path, e
            ))
        })?;

        Ok(Self {
            parquet: ParquetStore::new(base_path),
        })
    }

    /// Writer over this storage
    pub fn writer(&self, max_open_partitions: usize) -> PartitionedWriter {
        PartitionedWriter::new(self.parquet.clone(), max_open_partitions)
    }

    /// Get the base path for external readers
    pub fn base_path(&self) -> &Path {
        self.parquet.base_path()
    }
}
