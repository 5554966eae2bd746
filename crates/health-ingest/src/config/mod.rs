//! Configuration: global ingest settings and the table definitions
//!
//! Loaded from a TOML file, by default `~/.config/health-ingest/config.toml`:
//!
//! ```toml
//! home_timezone = "Europe/Berlin"
//! ambiguous_policy = "infer"
//! strictness = "skip-row"
//!
//! [[tables]]
//! name = "sleep_sessions"
//! write_strategy = "upsert_by_key"
//! timestamp_strategy = "actual"
//! primary_key = ["source", "session_id"]
//! sources = ["oura", "whoop"]
//! columns = [
//!     { name = "session_id", type = "text", nullable = false },
//!     { name = "score", type = "int" },
//! ]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::schema::{
    ColumnSpec, PartitionPeriod, TableDescriptor, TableRegistry, TimestampStrategy, WriteStrategy,
};
use crate::error::{IngestError, Result};
use crate::ingest::Strictness;
use crate::normalize::{parse_tz, AmbiguousPolicy, NormalizerSettings};
use crate::storage::DEFAULT_MAX_OPEN_PARTITIONS;

/// Default configuration directory name
const CONFIG_DIR_NAME: &str = "health-ingest";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the configuration directory path
/// Returns ~/.config/health-ingest on Unix, ~/Library/Application Support/health-ingest on macOS
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join(CONFIG_DIR_NAME))
        .ok_or_else(|| IngestError::config("Could not determine config directory"))
}

/// Default location of the configuration file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// One `[[tables]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub write_strategy: WriteStrategy,
    /// Must agree with the write strategy when given
    #[serde(default)]
    pub partition_period: Option<PartitionPeriod>,
    #[serde(default)]
    pub timestamp_strategy: TimestampStrategy,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl TableConfig {
    pub fn to_descriptor(&self) -> TableDescriptor {
        let descriptor = TableDescriptor::new(
            self.name.clone(),
            self.write_strategy,
            self.primary_key.iter().cloned(),
        )
        .with_timestamp_strategy(self.timestamp_strategy)
        .with_columns(self.columns.clone())
        .with_sources(self.sources.iter().cloned());

        match self.partition_period {
            Some(period) => descriptor.with_partition_period(period),
            None => descriptor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Storage root; the platform data directory when unset
    pub data_dir: Option<PathBuf>,
    /// IANA zone for sources that report bare wall-clock values
    pub home_timezone: String,
    pub ambiguous_policy: AmbiguousPolicy,
    /// Earliest accepted date (UTC midnight)
    pub min_timestamp: NaiveDate,
    pub future_grace_hours: i64,
    pub strictness: Strictness,
    pub max_open_partitions: usize,
    pub tables: Vec<TableConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            home_timezone: "UTC".to_string(),
            ambiguous_policy: AmbiguousPolicy::default(),
            min_timestamp: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default(),
            future_grace_hours: 24,
            strictness: Strictness::default(),
            max_open_partitions: DEFAULT_MAX_OPEN_PARTITIONS,
            tables: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: IngestConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "loading config");
        Self::from_toml(&content)
    }

    /// Load a file if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        parse_tz(&self.home_timezone)?;

        if self.max_open_partitions == 0 {
            return Err(IngestError::config("max_open_partitions must be greater than 0"));
        }
        if self.future_grace_hours < 0 {
            return Err(IngestError::config("future_grace_hours must not be negative"));
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            if !names.insert(table.name.as_str()) {
                return Err(IngestError::config(format!("Table '{}' defined twice", table.name)));
            }

            let descriptor = table.to_descriptor();
            if !descriptor.follows_period_rule() {
                return Err(IngestError::config(format!(
                    "Table '{}': {} requires {:?} partitions, got {:?}",
                    table.name,
                    table.write_strategy.as_str(),
                    table.write_strategy.partition_period(),
                    descriptor.partition_period()
                )));
            }
            descriptor.validate()?;
        }

        if self.tables.is_empty() {
            warn!("no tables configured");
        }

        Ok(())
    }

    /// Storage root, honouring the configured override
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(crate::storage::default_storage_path)
    }

    pub fn normalizer_settings(&self) -> Result<NormalizerSettings> {
        Ok(NormalizerSettings {
            home_tz: parse_tz(&self.home_timezone)?,
            ambiguous: self.ambiguous_policy,
            min_utc: DateTime::<Utc>::from_naive_utc_and_offset(
                self.min_timestamp.and_hms_opt(0, 0, 0).unwrap_or_default(),
                Utc,
            ),
            future_grace: Duration::hours(self.future_grace_hours),
        })
    }

    pub fn registry(&self) -> Result<TableRegistry> {
        TableRegistry::new(self.tables.iter().map(TableConfig::to_descriptor))
    }
}
