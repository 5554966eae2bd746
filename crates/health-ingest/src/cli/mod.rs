//! Command-line front end

pub mod commands;
pub mod input;

use std::path::PathBuf;

use crate::config::{default_config_path, IngestConfig};
use crate::db::schema::TableRegistry;
use crate::error::Result;
use crate::storage::Storage;

/// Configuration and storage location shared by every command
pub struct Context {
    pub config: IngestConfig,
    pub data_dir: PathBuf,
}

impl Context {
    /// Load configuration. An explicit path must exist; the default path may
    /// be absent, in which case defaults apply.
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => IngestConfig::load(path)?,
            None => IngestConfig::load_or_default(default_config_path()?)?,
        };
        let data_dir = data_dir.unwrap_or_else(|| config.data_dir());
        Ok(Self { config, data_dir })
    }

    pub fn storage(&self) -> Result<Storage> {
        Storage::open(self.data_dir.clone())
    }

    pub fn registry(&self) -> Result<TableRegistry> {
        self.config.registry()
    }
}
