//! Data model for health records
//!
//! `models` holds the record and row types flowing through the engine;
//! `schema` holds table descriptors and the registry.

pub mod models;
pub mod schema;

pub use models::*;
pub use schema::{
    ColumnSpec, ColumnType, PartitionPeriod, TableDescriptor, TableRegistry, TimestampStrategy,
    WriteStrategy,
};
