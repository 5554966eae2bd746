//! Primary-key deduplication
//!
//! Later rows win: within a batch the last occurrence of a key survives, and
//! when merging into stored data the incoming row replaces the stored one.

use std::collections::HashSet;

use crate::db::models::{KeyPart, Row};
use crate::db::schema::TableDescriptor;
use crate::error::{IngestError, Result};

/// Values of the primary-key columns of one row
pub type RowKey = Vec<KeyPart>;

/// Result of collapsing a batch
#[derive(Debug)]
pub struct Deduplicated {
    pub rows: Vec<Row>,
    /// Rows dropped because a later row shared their key
    pub collapsed: usize,
}

/// Result of merging a batch into stored rows
#[derive(Debug)]
pub struct Merged {
    pub rows: Vec<Row>,
    /// Stored rows replaced by an incoming row with the same key
    pub superseded: usize,
    /// Duplicate stored rows that were collapsed along the way
    pub collapsed_existing: usize,
}

pub struct DeduplicationEngine<'a> {
    table: &'a TableDescriptor,
}

impl<'a> DeduplicationEngine<'a> {
    pub fn for_table(table: &'a TableDescriptor) -> Self {
        Self { table }
    }

    pub fn key(&self, row: &Row) -> RowKey {
        self.table
            .primary_key()
            .iter()
            .map(|column| row.key_part(column))
            .collect()
    }

    /// Keep the last row for each key. Survivors stay in the order of their
    /// last occurrence.
    pub fn dedup_batch(&self, rows: Vec<Row>) -> Deduplicated {
        let total = rows.len();
        let mut seen: HashSet<RowKey> = HashSet::with_capacity(total);
        let mut kept: Vec<Row> = Vec::with_capacity(total);

        for row in rows.into_iter().rev() {
            if seen.insert(self.key(&row)) {
                kept.push(row);
            }
        }
        kept.reverse();

        Deduplicated {
            collapsed: total - kept.len(),
            rows: kept,
        }
    }

    /// Merge an incoming batch into stored rows, incoming winning on conflict
    pub fn merge_existing(&self, existing: Vec<Row>, incoming: Vec<Row>) -> Merged {
        let incoming_keys: HashSet<RowKey> = incoming.iter().map(|r| self.key(r)).collect();
        let superseded = existing
            .iter()
            .filter(|r| incoming_keys.contains(&self.key(r)))
            .count();
        let incoming_len = incoming.len();

        let mut combined = existing;
        combined.extend(incoming);
        let deduplicated = self.dedup_batch(combined);

        // Collapses beyond the superseded rows and any intra-batch repeats were
        // duplicates already present in storage
        let incoming_repeats = incoming_len - incoming_keys.len();
        let collapsed_existing = deduplicated
            .collapsed
            .saturating_sub(superseded + incoming_repeats);

        Merged {
            rows: deduplicated.rows,
            superseded,
            collapsed_existing,
        }
    }

    /// Invariant check; unreachable after a successful dedup
    pub fn ensure_unique(&self, rows: &[Row]) -> Result<()> {
        let mut seen: HashSet<RowKey> = HashSet::with_capacity(rows.len());
        for row in rows {
            let key = self.key(row);
            if seen.contains(&key) {
                return Err(IngestError::PrimaryKeyCollisionUnresolved {
                    table: self.table.name().to_string(),
                    key: format_key(&key),
                });
            }
            seen.insert(key);
        }
        Ok(())
    }
}

pub fn format_key(key: &[KeyPart]) -> String {
    let parts: Vec<String> = key.iter().map(|p| p.to_string()).collect();
    format!("({})", parts.join(", "))
}
