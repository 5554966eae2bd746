pub mod ingest;
pub mod partitions;
pub mod validate;

pub use ingest::run as ingest;
pub use partitions::{drop as drop_partitions, list as list_partitions};
pub use validate::run as validate;
