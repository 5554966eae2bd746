//! Ingest a JSON-lines batch into one table

use std::path::Path;

use crate::cli::input::read_records;
use crate::cli::Context;
use crate::error::Result;
use crate::ingest::{IngestReport, Ingestor};
use crate::normalize::TimestampNormalizer;

/// Read `input` and commit it to `table`
pub fn run(ctx: &Context, table: &str, input: &Path) -> Result<()> {
    let registry = ctx.registry()?;
    let descriptor = registry.get(table)?;
    let records = read_records(input, descriptor)?;

    let storage = ctx.storage()?;
    let ingestor = Ingestor::new(
        TimestampNormalizer::new(ctx.config.normalizer_settings()?),
        storage.writer(ctx.config.max_open_partitions),
        ctx.config.strictness,
    );

    let report = ingestor.ingest(&registry, table, records)?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &IngestReport) {
    println!("Table:           {}", report.table);
    println!("Rows received:   {}", report.rows_received);
    println!("Rows rejected:   {}", report.rejected.len());
    println!("Deduplicated:    {}", report.rows_deduplicated);
    if report.rows_superseded > 0 {
        println!("Superseded:      {}", report.rows_superseded);
    }
    println!("Rows written:    {}", report.rows_written);
    println!("Partitions:      {}", report.partitions_touched.len());
    if !report.partitions_removed.is_empty() {
        println!("Removed:         {}", report.partitions_removed.len());
    }

    if !report.rejected.is_empty() {
        println!("\nRejected records:");
        for rejected in &report.rejected {
            println!("  #{:<6} {}", rejected.index + 1, rejected.error);
        }
    }
}
