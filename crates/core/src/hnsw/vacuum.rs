//! Delete-marking, bulk delete and compaction.
//!
//! Deletes only set a tombstone: the node keeps its vector and its edges and
//! stays navigable, but is never returned. [`HnswIndex::compact`] is the
//! physical removal path. It snapshots the live rows and builds a fresh graph
//! from them without holding any lock on the source, which also repairs every
//! edge that pointed at a removed node.

use crate::error::Result;
use crate::hnsw::graph::HnswIndex;
use crate::hnsw::vectors::RowId;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Result of a bulk delete pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkDeleteStats {
    /// Nodes newly tombstoned by this pass.
    pub tuples_removed: usize,
    /// Live nodes remaining.
    pub num_index_tuples: usize,
}

/// Cleanup statistics reported after a vacuum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VacuumStats {
    pub num_index_tuples: usize,
    pub tuples_deleted: usize,
    /// Tombstones per thousand allocated nodes.
    pub dead_ratio_permille: usize,
}

/// Result of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompactionStats {
    pub kept: usize,
    pub dropped: usize,
    pub elapsed: Duration,
}

impl HnswIndex {
    /// Tombstone the live node indexing `row_id`. Returns `false` if there is none.
    pub fn mark_deleted(&self, row_id: RowId) -> bool {
        match self.vectors.lookup_live(row_id) {
            Some(id) => self.mark_node_deleted(id),
            None => false,
        }
    }

    /// Tombstone an internal node. Returns `true` if the flag changed.
    pub fn mark_node_deleted(&self, id: u32) -> bool {
        match self.vectors.tombstone(id) {
            Some(was_live) => {
                if was_live {
                    self.note_deleted();
                }
                true
            }
            None => false,
        }
    }

    /// Tombstone every live node whose row matches `should_delete`.
    pub fn bulk_delete<F>(&self, should_delete: F) -> BulkDeleteStats
    where
        F: Fn(RowId) -> bool,
    {
        let mut removed = 0;
        for id in 0..self.vectors.allocated() {
            if self.vectors.is_deleted(id) {
                continue;
            }
            let Some(row_id) = self.vectors.row_id(id) else {
                continue;
            };
            if should_delete(row_id) && self.mark_node_deleted(id) {
                removed += 1;
            }
        }
        tracing::info!(
            tuples_removed = removed,
            remaining = self.len(),
            "bulk delete finished"
        );
        BulkDeleteStats {
            tuples_removed: removed,
            num_index_tuples: self.len(),
        }
    }

    pub fn vacuum_stats(&self) -> VacuumStats {
        let total = self.node_count();
        let deleted = self.deleted_count();
        VacuumStats {
            num_index_tuples: self.len(),
            tuples_deleted: deleted,
            dead_ratio_permille: if total == 0 { 0 } else { deleted * 1000 / total },
        }
    }

    /// Rebuild the index from its live nodes, dropping every tombstone.
    ///
    /// Live rows are re-inserted serially in internal-id order with a random source
    /// seeded from the index options, so compaction is reproducible.
    pub fn compact(&self) -> Result<(HnswIndex, CompactionStats)> {
        let start = Instant::now();

        // Phase 1: snapshot live rows
        let total = self.vectors.allocated();
        let live: Vec<(RowId, &[f32])> = (0..total)
            .filter(|&id| !self.vectors.is_deleted(id))
            .filter_map(|id| Some((self.vectors.row_id(id)?, self.vectors.get(id)?)))
            .collect();

        // Phase 2: build the replacement
        let fresh = HnswIndex::new(self.options.clone())?;
        for (row_id, vector) in &live {
            fresh.insert(*row_id, vector)?;
        }

        let stats = CompactionStats {
            kept: live.len(),
            dropped: total as usize - live.len(),
            elapsed: start.elapsed(),
        };
        tracing::info!(
            kept = stats.kept,
            dropped = stats.dropped,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "index compacted"
        );
        Ok((fresh, stats))
    }
}
