//! HNSW search algorithms: greedy descent, single-layer beam search and
//! multi-layer KNN.
//!
//! Tombstoned nodes are still used for navigation but excluded from results
//! unless the caller asks for them (graph construction does). Every ordering
//! is by `(distance, id)`, so equal distances always resolve to the smaller
//! internal id and repeated searches return identical lists.

use crate::error::{HnswError, Result};
use crate::hnsw::graph::HnswIndex;
use crate::hnsw::layers::Edge;
use crate::hnsw::vectors::RowId;
use crate::hnsw::visited::VisitedSet;
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

thread_local! {
    /// Visited marks reused by every search and insert on this thread.
    static SEARCH_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::default());
}

/// Run `f` with this thread's visited set, sized for the current graph.
pub(crate) fn with_visited<R>(index: &HnswIndex, f: impl FnOnce(&mut VisitedSet) -> R) -> R {
    SEARCH_VISITED.with(|cell| {
        let mut visited = cell.borrow_mut();
        visited.reserve_nodes(index.vectors.allocated() as usize);
        f(&mut visited)
    })
}

/// Per-query search parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    pub k: usize,
    /// Candidate list size; `None` uses the index's `efsearch`. Raised to at least `k`,
    /// then capped at the node count since a larger beam cannot find more.
    pub ef: Option<usize>,
    /// Drop results farther than this distance.
    pub max_distance: Option<f32>,
}

impl SearchOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ef: None,
            max_distance: None,
        }
    }

    pub fn with_ef(mut self, ef: usize) -> Self {
        self.ef = Some(ef);
        self
    }

    pub fn with_max_distance(mut self, max_distance: f32) -> Self {
        self.max_distance = Some(max_distance);
        self
    }
}

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchResult {
    pub row_id: RowId,
    /// Internal node id.
    pub node: u32,
    pub distance: f32,
}

/// Min-heap entry for the candidate frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    distance: OrderedFloat<f32>,
    id: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .cmp(&self.distance)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap entry for the result set; the top is the current worst result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ResultEntry {
    distance: OrderedFloat<f32>,
    id: u32,
}

#[inline]
fn distance_to(index: &HnswIndex, query: &[f32], id: u32) -> Option<f32> {
    index
        .vectors
        .get(id)
        .map(|v| index.options.metric.distance(query, v))
}

/// Single-best-neighbor descent from `start` through layers `from_layer..=to_layer`
/// (walking downwards). Returns the closest node found at `to_layer`.
pub(crate) fn greedy_descent(
    index: &HnswIndex,
    query: &[f32],
    start: u32,
    from_layer: usize,
    to_layer: usize,
) -> Result<Edge> {
    let start_dist = distance_to(index, query, start)
        .ok_or_else(|| HnswError::Corrupt(format!("entry node {start} has no vector")))?;
    let mut current = Edge::new(start, start_dist);
    if to_layer > from_layer {
        return Ok(current);
    }
    let mut buf = Vec::with_capacity(index.options.max_links(0));
    for layer in (to_layer..=from_layer).rev() {
        loop {
            index
                .graph
                .neighbor_ids_into(current.id, layer, &mut buf)?;
            let mut improved = false;
            for &n in &buf {
                if let Some(d) = distance_to(index, query, n) {
                    let next = Edge::new(n, d);
                    if next.key() < current.key() {
                        current = next;
                        improved = true;
                    }
                }
            }
            if !improved {
                break;
            }
        }
    }
    Ok(current)
}

/// Bounded best-first search of one layer.
///
/// Returns up to `ef` nodes closest to `query`, ascending by `(distance, id)`.
/// Each call starts a fresh traversal in `visited`.
pub(crate) fn search_layer(
    index: &HnswIndex,
    query: &[f32],
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    include_deleted: bool,
) -> Result<Vec<Edge>> {
    visited.begin();
    // the heaps never hold more than every node once
    let reserve = ef.min(index.node_count()).saturating_add(1);
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(reserve);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(reserve);
    // Cached worst result key; avoids repeated heap peeks in the hot loop
    let mut worst: Option<ResultEntry> = None;
    let admits = |id: u32| include_deleted || !index.vectors.is_deleted(id);

    for &ep in entry_points {
        if !visited.visit(ep) {
            continue;
        }
        let Some(dist) = distance_to(index, query, ep) else {
            continue;
        };
        let entry = ResultEntry {
            distance: OrderedFloat(dist),
            id: ep,
        };
        candidates.push(Candidate {
            distance: entry.distance,
            id: ep,
        });
        if admits(ep) {
            results.push(entry);
            if results.len() > ef {
                results.pop();
            }
            if results.len() >= ef {
                worst = results.peek().copied();
            }
        }
    }

    let mut neighbor_ids = Vec::with_capacity(index.options.max_links(layer));
    while let Some(candidate) = candidates.pop() {
        // The closest frontier node is farther than the worst kept result: done
        if let Some(w) = worst {
            if candidate.distance > w.distance {
                break;
            }
        }

        index
            .graph
            .neighbor_ids_into(candidate.id, layer, &mut neighbor_ids)?;
        for &neighbor in &neighbor_ids {
            if !visited.visit(neighbor) {
                continue;
            }
            let Some(dist) = distance_to(index, query, neighbor) else {
                continue;
            };
            let entry = ResultEntry {
                distance: OrderedFloat(dist),
                id: neighbor,
            };
            if worst.is_some_and(|w| entry >= w) {
                continue;
            }
            candidates.push(Candidate {
                distance: entry.distance,
                id: neighbor,
            });
            if admits(neighbor) {
                results.push(entry);
                if results.len() > ef {
                    results.pop();
                }
                if results.len() >= ef {
                    worst = results.peek().copied();
                }
            }
        }
    }

    Ok(results
        .into_sorted_vec()
        .into_iter()
        .map(|r| Edge::new(r.id, r.distance.0))
        .collect())
}

/// Multi-layer KNN search: greedy descent to layer 1, then a beam of
/// `max(ef, k)` at layer 0. Returns the `k` closest live nodes.
pub fn knn_search(index: &HnswIndex, query: &[f32], k: usize, ef: usize) -> Result<Vec<Edge>> {
    let Some(entry) = index.entry_point() else {
        return Err(HnswError::EmptyIndex);
    };
    let start = greedy_descent(index, query, entry.node, entry.layer, 1)?;
    let ef = ef.max(k).min(index.node_count().max(1));
    let mut results = with_visited(index, |visited| {
        search_layer(index, query, &[start.id], ef, 0, visited, false)
    })?;
    results.truncate(k);
    Ok(results)
}

impl HnswIndex {
    /// Approximate `k` nearest neighbors of `query` using the index's `efsearch`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.search_with(query, &SearchOptions::new(k))
    }

    /// Approximate nearest neighbors with per-query options.
    ///
    /// Results are ascending by distance; equal distances are ordered by internal id.
    pub fn search_with(&self, query: &[f32], opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        if opts.k == 0 {
            return Err(HnswError::InvalidParameter("k must be at least 1".to_string()));
        }
        self.vectors.check_dims(query)?;
        if self.is_empty() {
            return Err(HnswError::EmptyIndex);
        }
        self.record_search();

        let ef = opts.ef.unwrap_or(self.options.ef_search);
        let hits = knn_search(self, query, opts.k, ef)?;
        Ok(hits
            .into_iter()
            .filter(|e| opts.max_distance.map_or(true, |max| e.distance <= max))
            .filter_map(|e| {
                self.vectors.row_id(e.id).map(|row_id| SearchResult {
                    row_id,
                    node: e.id,
                    distance: e.distance,
                })
            })
            .collect())
    }

    /// Exact k nearest live nodes by linear scan. Used to measure recall.
    pub fn brute_force(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.vectors.check_dims(query)?;
        let mut all: Vec<Edge> = (0..self.vectors.allocated())
            .filter(|&id| !self.vectors.is_deleted(id))
            .filter_map(|id| distance_to(self, query, id).map(|d| Edge::new(id, d)))
            .collect();
        crate::hnsw::layers::sort_edges(&mut all);
        all.truncate(k);
        Ok(all
            .into_iter()
            .filter_map(|e| {
                self.vectors.row_id(e.id).map(|row_id| SearchResult {
                    row_id,
                    node: e.id,
                    distance: e.distance,
                })
            })
            .collect())
    }
}
