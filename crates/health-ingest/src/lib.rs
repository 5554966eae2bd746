pub mod cli;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod normalize;
pub mod storage;

pub use config::IngestConfig;
pub use db::{Record, RawTimestamp, Row, TableDescriptor, TableRegistry};
pub use error::{IngestError, Result};
pub use ingest::{IngestReport, Ingestor, Strictness};
