use thiserror::Error;

/// Main error type for health-ingest
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Timestamp out of range: {value} (allowed {min} .. {max})")]
    TimestampOutOfRange {
        value: String,
        min: String,
        max: String,
    },

    #[error("Ambiguous local time {local} in {tz}: {reason}")]
    TimezoneAmbiguous {
        local: String,
        tz: String,
        reason: String,
    },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Partition write failed for '{partition}': {message}")]
    PartitionWriteFailure { partition: String, message: String },

    #[error("Primary key collision survived deduplication in '{table}': {key}")]
    PrimaryKeyCollisionUnresolved { table: String, key: String },

    #[error(
        "Too many partitions for '{table}': {partitions} would be open at once (limit {limit}). \
         Check partition_period for this table's write strategy."
    )]
    ResourceExhausted {
        table: String,
        partitions: usize,
        limit: usize,
    },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Create a configuration error from a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid record error from a message
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    /// Create a write failure for a partition (or the table itself)
    pub fn write_failure(partition: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PartitionWriteFailure {
            partition: partition.into(),
            message: message.into(),
        }
    }

    /// Errors raised for a single row. Callers decide whether to skip the row
    /// or abort the batch; everything else aborts the table's write.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            Self::TimestampOutOfRange { .. }
                | Self::TimezoneAmbiguous { .. }
                | Self::UnknownTimezone(_)
                | Self::InvalidTimestamp(_)
                | Self::InvalidRecord(_)
        )
    }
}

/// Render an error for the terminal, with a hint where one exists
pub fn format_user_error(err: &IngestError) -> String {
    match err {
        IngestError::ResourceExhausted { .. } => format!(
            "{}\nHint: upsert_by_key tables must use monthly partitions. This is a configuration \
             defect; retrying will not help.",
            err
        ),
        IngestError::PartitionWriteFailure { .. } => format!(
            "{}\nHint: the table may be partially written. Run `health-ingest validate` and \
             re-run the same batch.",
            err
        ),
        _ => err.to_string(),
    }
}
