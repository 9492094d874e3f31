//! HNSW insertion algorithm.
//!
//! Inserts a vector into the graph with bidirectional connections and heuristic
//! neighbor pruning (Algorithm 4 from the HNSW paper). Insertion runs in two
//! phases. The search phase is read-only: greedy descent to the node's top
//! layer, then a beam of `efbuild` on every layer it occupies. The commit phase
//! links the planned neighbors layer by layer from the bottom up, so a node
//! only becomes reachable on a layer once every layer beneath it is linked.

use crate::error::{HnswError, Result};
use crate::hnsw::distance::DistanceMetric;
use crate::hnsw::graph::{EntryPoint, HnswIndex};
use crate::hnsw::layers::{sort_edges, Edge};
use crate::hnsw::search::{greedy_descent, search_layer, with_visited};
use crate::hnsw::vectors::{RowId, VectorStore};
use crate::options::NeighborSelection;
use rand::Rng;

/// Neighbor selection policy bound to the vectors it measures.
pub(crate) struct Selector<'a> {
    pub(crate) vectors: &'a VectorStore,
    pub(crate) metric: DistanceMetric,
    pub(crate) policy: NeighborSelection,
}

impl Selector<'_> {
    /// Choose up to `cap` neighbors from `candidates` (distances relative to the base node).
    /// The result is sorted by `(distance, id)`.
    pub(crate) fn select(&self, candidates: &[Edge], cap: usize) -> Vec<Edge> {
        let mut sorted = candidates.to_vec();
        sort_edges(&mut sorted);
        sorted.dedup_by_key(|e| e.id);
        if sorted.len() <= cap {
            return sorted;
        }
        match self.policy {
            NeighborSelection::Nearest => {
                sorted.truncate(cap);
                sorted
            }
            NeighborSelection::Heuristic => self.select_heuristic(&sorted, cap),
        }
    }

    /// A candidate is kept only if it is at least as close to the base as to every
    /// neighbor kept so far. This avoids redundant clusters of near-identical neighbors.
    /// Unfilled slots take the closest discarded candidates.
    fn select_heuristic(&self, sorted: &[Edge], cap: usize) -> Vec<Edge> {
        let mut selected: Vec<Edge> = Vec::with_capacity(cap);
        let mut discarded: Vec<Edge> = Vec::new();

        for &candidate in sorted {
            if selected.len() >= cap {
                break;
            }
            let Some(cv) = self.vectors.get(candidate.id) else {
                continue;
            };
            let is_diverse = selected.iter().all(|s| {
                self.vectors
                    .get(s.id)
                    .map_or(true, |sv| candidate.distance <= self.metric.distance(cv, sv))
            });
            if is_diverse {
                selected.push(candidate);
            } else {
                discarded.push(candidate);
            }
        }

        for candidate in discarded {
            if selected.len() >= cap {
                break;
            }
            selected.push(candidate);
        }

        sort_edges(&mut selected);
        selected
    }
}

impl HnswIndex {
    pub(crate) fn selector(&self) -> Selector<'_> {
        Selector {
            vectors: &self.vectors,
            metric: self.options.metric,
            policy: self.options.selection,
        }
    }

    /// Draw a top layer from an exponential distribution with scale `1/ln(m)`.
    pub fn random_level<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let m = self.options.m.max(2) as f64;
        let ml = 1.0 / m.ln();
        // gen() is in [0, 1); flip it so ln never sees 0
        let u: f64 = 1.0 - rng.gen::<f64>();
        let level = (-u.ln() * ml).floor() as usize;
        level.min(crate::config::MAX_LEVEL - 1)
    }

    /// Insert `vector` for `row_id`, drawing its layer from the index's own random source.
    ///
    /// Returns the new internal id.
    pub fn insert(&self, row_id: RowId, vector: &[f32]) -> Result<u32> {
        let level = {
            let mut rng = self.rng.lock();
            self.random_level(&mut *rng)
        };
        self.insert_at_level(row_id, vector, level)
    }

    /// Insert with an explicitly supplied random source.
    pub fn insert_with_rng<R: Rng + ?Sized>(
        &self,
        row_id: RowId,
        vector: &[f32],
        rng: &mut R,
    ) -> Result<u32> {
        let level = self.random_level(rng);
        self.insert_at_level(row_id, vector, level)
    }

    fn insert_at_level(&self, row_id: RowId, vector: &[f32], level: usize) -> Result<u32> {
        self.vectors.check_dims(vector)?;
        let _writer = self.begin_write();
        let id = self.vectors.put(row_id, vector)?;
        if let Err(e) = self.link_new_node(id, level) {
            tracing::error!(
                node = id,
                %row_id,
                error = %e,
                "insert failed after id allocation, discarding node"
            );
            self.vectors.mark_deleted(id);
            // settle the slot so flushes can move past it
            self.vectors.mark_committed(id);
            return Err(e);
        }
        if self.vectors.mark_committed(id) {
            self.note_committed();
        }
        Ok(id)
    }

    fn link_new_node(&self, id: u32, level: usize) -> Result<()> {
        self.graph.add_node(id, level)?;
        let Some(entry) = self.claim_entry(id, level) else {
            // first node: it is the entry point and has nothing to link to
            return Ok(());
        };

        let Some(query) = self.vectors.get(id) else {
            return Err(HnswError::Corrupt(format!("node {id} has no stored vector")));
        };
        let selector = self.selector();

        // Phase 1: greedy descent from the entry layer down to level + 1
        let mut current = if entry.layer > level {
            greedy_descent(self, query, entry.node, entry.layer, level + 1)?.id
        } else {
            entry.node
        };

        // Phase 2: plan neighbors on every shared layer, top-down
        let top = level.min(entry.layer);
        let mut plan: Vec<Vec<Edge>> = vec![Vec::new(); top + 1];
        with_visited(self, |visited| -> Result<()> {
            for layer in (0..=top).rev() {
                let candidates = search_layer(
                    self,
                    query,
                    &[current],
                    self.options.ef_build,
                    layer,
                    visited,
                    true,
                )?;
                plan[layer] = selector.select(&candidates, self.options.max_links(layer));
                if let Some(best) = candidates.first() {
                    current = best.id;
                }
            }
            Ok(())
        })?;

        // Phase 3: commit bottom-up under per-node locks
        for (layer, selected) in plan.iter().enumerate() {
            self.graph.connect(id, layer, selected, &selector)?;
        }

        if level > entry.layer {
            self.promote_entry(EntryPoint { node: id, layer: level });
        }
        Ok(())
    }
}
