//! Commit of a prepared batch to a partitioned table

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::db::models::Row;
use crate::db::schema::{TableDescriptor, WriteStrategy};
use crate::dedup::{DeduplicationEngine, Merged};
use crate::error::{IngestError, Result};

use super::parquet::ParquetStore;
use super::partitions::{PartitionKey, PartitionPlan, PartitionPlanner};

/// Upper bound on partitions a single upsert may hold open
pub const DEFAULT_MAX_OPEN_PARTITIONS: usize = 512;

/// Where a table's commit currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    Planning,
    Merging,
    Committing,
    Failed,
}

impl fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitPhase::Idle => "idle",
            CommitPhase::Planning => "planning",
            CommitPhase::Merging => "merging",
            CommitPhase::Committing => "committing",
            CommitPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

type PhaseBoard = Mutex<BTreeMap<String, CommitPhase>>;

/// Phase tracking for one table in one run. There is no rollback: a failure
/// after partitions were replaced leaves them replaced, and the table stays
/// `Failed` on the writer until its next commit.
struct CommitRun<'a> {
    table: &'a str,
    phase: CommitPhase,
    board: &'a PhaseBoard,
}

impl<'a> CommitRun<'a> {
    fn start(table: &'a str, board: &'a PhaseBoard) -> Self {
        Self {
            table,
            phase: CommitPhase::Idle,
            board,
        }
    }

    fn set(&mut self, next: CommitPhase) {
        self.phase = next;
        if let Ok(mut board) = self.board.lock() {
            board.insert(self.table.to_string(), next);
        }
    }

    fn advance(&mut self, next: CommitPhase) {
        debug!(table = self.table, from = %self.phase, to = %next, "commit phase");
        self.set(next);
    }

    fn fail(&mut self, err: IngestError) -> IngestError {
        warn!(table = self.table, phase = %self.phase, error = %err, "commit failed");
        self.set(CommitPhase::Failed);
        err
    }

    fn finish(mut self) -> CommitPhase {
        self.advance(CommitPhase::Idle);
        self.phase
    }
}

/// What a commit did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub table: String,
    pub strategy: WriteStrategy,
    pub rows_written: usize,
    /// Stored rows replaced by an incoming row with the same key
    pub rows_superseded: usize,
    /// Duplicate stored rows collapsed during an upsert
    pub collapsed_existing: usize,
    pub partitions_written: Vec<PartitionKey>,
    pub partitions_removed: Vec<PartitionKey>,
    pub phase: CommitPhase,
}

impl CommitSummary {
    fn empty(table: &TableDescriptor) -> Self {
        Self {
            table: table.name().to_string(),
            strategy: table.write_strategy(),
            rows_written: 0,
            rows_superseded: 0,
            collapsed_existing: 0,
            partitions_written: Vec::new(),
            partitions_removed: Vec::new(),
            phase: CommitPhase::Idle,
        }
    }
}

/// Combines stored rows with an incoming batch for `upsert_by_key` tables
pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce the complete post-merge row set for the table
    fn merge(
        &self,
        store: &ParquetStore,
        table: &TableDescriptor,
        existing: &[PartitionKey],
        incoming: Vec<Row>,
    ) -> Result<Merged>;
}

/// Reads every stored partition and merges the batch into it.
///
/// Cost grows with the size of the table, not the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeTableMerge;

impl MergeStrategy for WholeTableMerge {
    fn name(&self) -> &'static str {
        "whole_table"
    }

    fn merge(
        &self,
        store: &ParquetStore,
        table: &TableDescriptor,
        existing: &[PartitionKey],
        incoming: Vec<Row>,
    ) -> Result<Merged> {
        let mut stored = Vec::new();
        for key in existing {
            stored.extend(store.read_partition(table, key)?);
        }
        debug!(table = table.name(), rows = stored.len(), "read stored rows");

        Ok(DeduplicationEngine::for_table(table).merge_existing(stored, incoming))
    }
}

/// Writes batches according to each table's write strategy
pub struct PartitionedWriter {
    store: ParquetStore,
    max_open_partitions: usize,
    merge: Box<dyn MergeStrategy>,
    phases: PhaseBoard,
}

impl PartitionedWriter {
    pub fn new(store: ParquetStore, max_open_partitions: usize) -> Self {
        Self {
            store,
            max_open_partitions,
            merge: Box::new(WholeTableMerge),
            phases: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_merge_strategy(mut self, merge: Box<dyn MergeStrategy>) -> Self {
        self.merge = merge;
        self
    }

    pub fn store(&self) -> &ParquetStore {
        &self.store
    }

    pub fn max_open_partitions(&self) -> usize {
        self.max_open_partitions
    }

    /// Phase of the table's latest commit; `Failed` sticks until the next one
    pub fn phase(&self, table: &str) -> CommitPhase {
        self.phases
            .lock()
            .ok()
            .and_then(|board| board.get(table).copied())
            .unwrap_or(CommitPhase::Idle)
    }

    /// Commit deduplicated rows to a table. An empty batch writes nothing.
    pub fn commit(&self, table: &TableDescriptor, rows: Vec<Row>) -> Result<CommitSummary> {
        if rows.is_empty() {
            debug!(table = table.name(), "empty batch, nothing to commit");
            return Ok(CommitSummary::empty(table));
        }

        let mut run = CommitRun::start(table.name(), &self.phases);
        let summary = match table.write_strategy() {
            WriteStrategy::DeleteMatching => self.delete_matching(&mut run, table, rows),
            WriteStrategy::UpsertByKey => self.upsert_by_key(&mut run, table, rows),
        }?;
        let phase = run.finish();

        info!(
            table = table.name(),
            strategy = table.write_strategy().as_str(),
            rows = summary.rows_written,
            partitions = summary.partitions_written.len(),
            removed = summary.partitions_removed.len(),
            "commit complete"
        );

        Ok(CommitSummary { phase, ..summary })
    }

    /// Replace each partition the batch touches; leave all others alone
    fn delete_matching(
        &self,
        run: &mut CommitRun<'_>,
        table: &TableDescriptor,
        rows: Vec<Row>,
    ) -> Result<CommitSummary> {
        run.advance(CommitPhase::Planning);
        DeduplicationEngine::for_table(table)
            .ensure_unique(&rows)
            .map_err(|e| run.fail(e))?;
        ensure_required(table, &rows).map_err(|e| run.fail(e))?;
        let plan = PartitionPlanner::for_table(table).plan(rows);

        run.advance(CommitPhase::Committing);
        let rows_written = self.write_plan(run, table, &plan)?;

        Ok(CommitSummary {
            rows_written,
            partitions_written: plan.touched(),
            ..CommitSummary::empty(table)
        })
    }

    /// Merge into the whole table and rewrite every partition
    fn upsert_by_key(
        &self,
        run: &mut CommitRun<'_>,
        table: &TableDescriptor,
        rows: Vec<Row>,
    ) -> Result<CommitSummary> {
        run.advance(CommitPhase::Planning);
        let planner = PartitionPlanner::for_table(table);
        let existing = self.store.list_partitions(table.name()).map_err(|e| run.fail(e))?;

        let mut open: BTreeSet<PartitionKey> = existing.iter().cloned().collect();
        open.extend(rows.iter().map(|row| planner.assign(row)));
        if open.len() > self.max_open_partitions {
            return Err(run.fail(IngestError::ResourceExhausted {
                table: table.name().to_string(),
                partitions: open.len(),
                limit: self.max_open_partitions,
            }));
        }

        run.advance(CommitPhase::Merging);
        let merged = self
            .merge
            .merge(&self.store, table, &existing, rows)
            .map_err(|e| run.fail(e))?;
        DeduplicationEngine::for_table(table)
            .ensure_unique(&merged.rows)
            .map_err(|e| run.fail(e))?;
        // Stored rows may predate a column that is now required
        ensure_required(table, &merged.rows).map_err(|e| run.fail(e))?;
        debug!(
            table = table.name(),
            merge = self.merge.name(),
            rows = merged.rows.len(),
            superseded = merged.superseded,
            "merged"
        );
        let plan = planner.plan(merged.rows);

        run.advance(CommitPhase::Committing);
        let rows_written = self.write_plan(run, table, &plan)?;

        // Partitions whose rows all moved elsewhere
        let mut removed = Vec::new();
        for key in existing {
            if !plan.partitions.contains_key(&key) {
                self.store
                    .drop_partition(table.name(), &key)
                    .map_err(|e| run.fail(e))?;
                removed.push(key);
            }
        }

        Ok(CommitSummary {
            rows_written,
            rows_superseded: merged.superseded,
            collapsed_existing: merged.collapsed_existing,
            partitions_written: plan.touched(),
            partitions_removed: removed,
            ..CommitSummary::empty(table)
        })
    }

    fn write_plan(
        &self,
        run: &mut CommitRun<'_>,
        table: &TableDescriptor,
        plan: &PartitionPlan,
    ) -> Result<usize> {
        debug!(
            table = table.name(),
            partitions = plan.partition_count(),
            rows = plan.row_count(),
            "writing plan"
        );
        let mut written = 0;
        for (key, rows) in &plan.partitions {
            written += self
                .store
                .replace_partition(table, key, rows)
                .map_err(|e| run.fail(e))?;
        }
        Ok(written)
    }
}

/// Every required column must hold a value before anything is written
fn ensure_required(table: &TableDescriptor, rows: &[Row]) -> Result<()> {
    for spec in table.columns().iter().filter(|c| !c.nullable) {
        let missing = rows.iter().filter(|row| row.field(&spec.name).is_null()).count();
        if missing > 0 {
            return Err(IngestError::config(format!(
                "Column '{}' of table '{}' is required but {} row(s) have no value; \
                 declare it nullable or backfill the stored partitions",
                spec.name,
                table.name(),
                missing
            )));
        }
    }
    Ok(())
}
