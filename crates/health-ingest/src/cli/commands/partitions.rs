//! Partition listing and removal

use crate::cli::Context;
use crate::error::{IngestError, Result};
use crate::storage::PartitionKey;

/// List a table's partitions with row counts
pub fn list(ctx: &Context, table: &str) -> Result<()> {
    let registry = ctx.registry()?;
    let descriptor = registry.get(table)?;
    let storage = ctx.storage()?;

    let counts = storage.parquet.partition_row_counts(descriptor)?;
    if counts.is_empty() {
        println!("No partitions found for '{}'.", table);
        return Ok(());
    }

    println!("{:<12} {:<20} {:>10}", "Date", "Source", "Rows");
    println!("{}", "-".repeat(44));
    for (key, rows) in &counts {
        println!("{:<12} {:<20} {:>10}", key.bucket, key.source, rows);
    }

    let total: usize = counts.values().sum();
    println!(
        "\n{} partitions, {} rows in {}",
        counts.len(),
        total,
        storage.parquet.table_dir(table).display()
    );
    Ok(())
}

/// Drop the partitions of one date bucket, optionally for a single source
pub fn drop(ctx: &Context, table: &str, bucket: &str, source: Option<&str>) -> Result<()> {
    let registry = ctx.registry()?;
    let descriptor = registry.get(table)?;
    let period = descriptor.partition_period();
    if period.bucket_start(bucket).map(|d| period.bucket(d)).as_deref() != Some(bucket) {
        return Err(IngestError::config(format!(
            "'{}' is not a {:?} bucket for table '{}'",
            bucket, period, table
        )));
    }

    let storage = ctx.storage()?;
    let targets: Vec<PartitionKey> = storage
        .parquet
        .list_partitions(table)?
        .into_iter()
        .filter(|key| key.bucket == bucket && source.map_or(true, |s| key.source == s))
        .collect();

    if targets.is_empty() {
        println!("Nothing to drop.");
        return Ok(());
    }

    for key in &targets {
        storage.parquet.drop_partition(table, key)?;
        println!("Dropped {}/{}", table, key);
    }
    Ok(())
}
