//! Consistency check of a stored table

use crate::cli::Context;
use crate::error::Result;
use crate::storage::validate_table;

/// Print the validation report. Returns whether the table is consistent.
pub fn run(ctx: &Context, table: &str) -> Result<bool> {
    let registry = ctx.registry()?;
    let descriptor = registry.get(table)?;
    let storage = ctx.storage()?;

    let report = validate_table(&storage.parquet, descriptor)?;

    println!("Table:       {}", report.table);
    println!("Partitions:  {}", report.partition_count());
    println!("Rows:        {}", report.total_rows());

    for key in &report.duplicate_keys {
        println!("Duplicate key:     {}", key);
    }
    for (key, count) in &report.misplaced_rows {
        println!("Misplaced rows:    {} in {}", count, key);
    }
    for key in &report.empty_partitions {
        println!("Empty partition:   {}", key);
    }
    for path in &report.temp_files {
        println!("Leftover temp:     {}", path.display());
    }
    for (source, missing) in &report.missing_buckets {
        println!("Gaps ({}): {}", source, missing.join(", "));
    }

    if report.is_consistent() {
        println!("\nOK");
    } else {
        println!("\nInconsistent: re-run the last batch for this table.");
    }
    Ok(report.is_consistent())
}
