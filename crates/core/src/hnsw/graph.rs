//! HNSW index structure, lifecycle state and introspection.
//!
//! [`HnswIndex`] ties the vector store and the graph layer store together with
//! the entry point and the index-wide counters. Every operation takes `&self`;
//! the index is `Send + Sync` and is shared directly between build workers,
//! inserting sessions and searching sessions.

use crate::error::Result;
use crate::hnsw::layers::GraphLayerStore;
use crate::hnsw::vectors::VectorStore;
use crate::options::IndexOptions;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Node at the highest populated layer, where every search starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryPoint {
    pub node: u32,
    pub layer: usize,
}

/// Lifecycle state of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// Nothing has been inserted yet.
    Empty,
    /// A build or insert is in flight, or a build failed and awaits resumption.
    Building,
    Ready,
}

/// Per-layer graph statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStats {
    pub layer: usize,
    pub nodes: usize,
    pub edges: usize,
    pub max_degree: usize,
    pub avg_degree: f64,
}

/// Index-wide statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub state: IndexState,
    pub options: IndexOptions,
    pub nodes: usize,
    pub live: usize,
    pub deleted: usize,
    pub entry_point: Option<EntryPoint>,
    pub layers: Vec<LayerStats>,
    pub search_count: u64,
    pub memory_bytes: usize,
}

/// Decrements the writer count when an insert finishes.
pub(crate) struct WriteGuard<'a> {
    writers: &'a AtomicUsize,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.writers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// HNSW index over fixed-dimension `f32` vectors.
pub struct HnswIndex {
    pub(crate) options: IndexOptions,
    pub(crate) vectors: VectorStore,
    pub(crate) graph: GraphLayerStore,
    entry: RwLock<Option<EntryPoint>>,
    pub(crate) rng: Mutex<StdRng>,
    live: AtomicUsize,
    writers: AtomicUsize,
    /// Set while a build runs; stays set if the build fails until it is re-run.
    pub(crate) build_incomplete: AtomicBool,
    pub(crate) build_active: AtomicBool,
    search_count: AtomicU64,
    /// Entry point changed since the last flush.
    pub(crate) header_dirty: AtomicBool,
}

impl HnswIndex {
    /// Creates an empty index. Options are validated first.
    pub fn new(options: IndexOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            vectors: VectorStore::new(options.dims),
            graph: GraphLayerStore::new(options.m),
            rng: Mutex::new(StdRng::seed_from_u64(options.seed)),
            entry: RwLock::new(None),
            live: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
            build_incomplete: AtomicBool::new(false),
            build_active: AtomicBool::new(false),
            search_count: AtomicU64::new(0),
            header_dirty: AtomicBool::new(true),
            options,
        })
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub fn dims(&self) -> usize {
        self.options.dims
    }

    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    pub fn graph(&self) -> &GraphLayerStore {
        &self.graph
    }

    /// Returns the number of non-deleted, fully linked nodes.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Returns `true` if the index contains no live nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of internal ids assigned, including tombstoned nodes.
    pub fn node_count(&self) -> usize {
        self.vectors.allocated() as usize
    }

    pub fn deleted_count(&self) -> usize {
        (0..self.vectors.allocated())
            .filter(|&id| self.vectors.is_deleted(id))
            .count()
    }

    pub fn state(&self) -> IndexState {
        if self.writers.load(Ordering::Acquire) > 0
            || self.build_incomplete.load(Ordering::Acquire)
        {
            IndexState::Building
        } else if self.vectors.allocated() == 0 {
            IndexState::Empty
        } else {
            IndexState::Ready
        }
    }

    pub fn entry_point(&self) -> Option<EntryPoint> {
        *self.entry.read()
    }

    /// Highest populated layer, or `None` for an empty graph.
    pub fn max_layer(&self) -> Option<usize> {
        self.entry_point().map(|e| e.layer)
    }

    /// Number of searches served since the index was created or loaded.
    pub fn search_count(&self) -> u64 {
        self.search_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_search(&self) {
        self.search_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn begin_write(&self) -> WriteGuard<'_> {
        self.writers.fetch_add(1, Ordering::AcqRel);
        WriteGuard {
            writers: &self.writers,
        }
    }

    pub(crate) fn note_committed(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_deleted(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Make `id` the entry point if the graph has none yet. Otherwise returns the current one.
    pub(crate) fn claim_entry(&self, id: u32, level: usize) -> Option<EntryPoint> {
        if let Some(entry) = *self.entry.read() {
            return Some(entry);
        }
        let mut entry = self.entry.write();
        match *entry {
            Some(current) => Some(current),
            None => {
                *entry = Some(EntryPoint {
                    node: id,
                    layer: level,
                });
                self.header_dirty.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Replace the entry point if `candidate` sits on a higher layer.
    pub(crate) fn promote_entry(&self, candidate: EntryPoint) {
        let mut entry = self.entry.write();
        if entry.map_or(true, |e| candidate.layer > e.layer) {
            tracing::debug!(
                node = candidate.node,
                layer = candidate.layer,
                "entry point promoted"
            );
            *entry = Some(candidate);
            self.header_dirty.store(true, Ordering::Release);
        }
    }

    pub(crate) fn restore_entry(&self, entry: Option<EntryPoint>) {
        *self.entry.write() = entry;
    }

    pub(crate) fn restore_live(&self, live: usize) {
        self.live.store(live, Ordering::Release);
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.vectors.memory_bytes() + self.graph.memory_bytes(self.vectors.allocated())
    }

    /// Per-layer node/edge counts and degree statistics.
    pub fn stats(&self) -> IndexStats {
        let count = self.vectors.allocated();
        let mut layers: Vec<LayerStats> = Vec::new();
        for id in 0..count {
            let Some(top) = self.graph.top_layer(id) else {
                continue;
            };
            for layer in 0..=top {
                if layers.len() <= layer {
                    layers.push(LayerStats {
                        layer,
                        nodes: 0,
                        edges: 0,
                        max_degree: 0,
                        avg_degree: 0.0,
                    });
                }
                let degree = self.graph.degree(id, layer);
                let s = &mut layers[layer];
                s.nodes += 1;
                s.edges += degree;
                s.max_degree = s.max_degree.max(degree);
            }
        }
        for s in &mut layers {
            if s.nodes > 0 {
                s.avg_degree = s.edges as f64 / s.nodes as f64;
            }
        }
        let deleted = self.deleted_count();
        IndexStats {
            state: self.state(),
            options: self.options.clone(),
            nodes: count as usize,
            live: self.len(),
            deleted,
            entry_point: self.entry_point(),
            layers,
            search_count: self.search_count(),
            memory_bytes: self.memory_bytes(),
        }
    }

    /// Check structural invariants: presence on every layer up to the top layer,
    /// degree caps, edge symmetry, in-bounds neighbor ids, and an entry point on
    /// the highest populated layer.
    ///
    /// Meant for quiescent indexes (no insert in flight), e.g. after a build or a load.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let count = self.vectors.allocated();
        let mut highest: Option<usize> = None;
        for id in 0..count {
            if self.vectors.get(id).is_none() {
                return Err(format!("node {id} has no vector"));
            }
            let top = self
                .graph
                .top_layer(id)
                .ok_or_else(|| format!("node {id} missing from the graph"))?;
            highest = Some(highest.map_or(top, |h| h.max(top)));
            for layer in 0..=top {
                let edges = self.graph.neighbors(id, layer).map_err(|e| e.to_string())?;
                let cap = self.options.max_links(layer);
                if edges.len() > cap {
                    return Err(format!(
                        "node {id} has {} edges at layer {layer}, cap is {cap}",
                        edges.len()
                    ));
                }
                if edges.windows(2).any(|w| w[0].key() >= w[1].key()) {
                    return Err(format!("node {id} layer {layer} list is not sorted"));
                }
                for e in &edges {
                    if e.id >= count || e.id == id {
                        return Err(format!("node {id} layer {layer} links to invalid node {}", e.id));
                    }
                    let back = self.graph.neighbors(e.id, layer).map_err(|err| {
                        format!("node {id} links to {} above its top layer: {err}", e.id)
                    })?;
                    if !back.iter().any(|b| b.id == id) {
                        return Err(format!(
                            "edge {id} -> {} at layer {layer} is not symmetric",
                            e.id
                        ));
                    }
                }
            }
        }
        match (self.entry_point(), highest) {
            (None, None) => Ok(()),
            (Some(entry), Some(h)) if entry.layer == h && entry.node < count => {
                match self.graph.top_layer(entry.node) {
                    Some(top) if top == h => Ok(()),
                    _ => Err(format!("entry node {} is not on layer {h}", entry.node)),
                }
            }
            (entry, h) => Err(format!(
                "entry point {entry:?} does not match highest layer {h:?}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::vectors::RowId;

    #[test]
    fn test_new_index_is_empty() {
        let index = HnswIndex::new(IndexOptions::new(3)).unwrap();
        assert_eq!(index.state(), IndexState::Empty);
        assert!(index.is_empty());
        assert_eq!(index.entry_point(), None);
        assert_eq!(index.max_layer(), None);
        assert!(index.validate().is_ok());
    }

    #[test]
    fn test_new_rejects_invalid_options() {
        assert!(HnswIndex::new(IndexOptions::new(0)).is_err());
        assert!(HnswIndex::new(IndexOptions::new(4).with_m(32).with_ef_build(16)).is_err());
    }

    #[test]
    fn test_state_after_insert_is_ready() {
        let index = HnswIndex::new(IndexOptions::new(2).with_m(4).with_ef_build(8)).unwrap();
        index.insert(RowId(1), &[0.0, 1.0]).unwrap();
        assert_eq!(index.state(), IndexState::Ready);
        {
            let _w = index.begin_write();
            assert_eq!(index.state(), IndexState::Building);
        }
        assert_eq!(index.state(), IndexState::Ready);
    }

    #[test]
    fn test_promote_entry_only_moves_up() {
        let index = HnswIndex::new(IndexOptions::new(1)).unwrap();
        assert_eq!(index.claim_entry(0, 2), None);
        assert_eq!(
            index.claim_entry(1, 5),
            Some(EntryPoint { node: 0, layer: 2 })
        );
        index.promote_entry(EntryPoint { node: 1, layer: 1 });
        assert_eq!(index.entry_point(), Some(EntryPoint { node: 0, layer: 2 }));
        index.promote_entry(EntryPoint { node: 3, layer: 4 });
        assert_eq!(index.entry_point(), Some(EntryPoint { node: 3, layer: 4 }));
    }

    #[test]
    fn test_stats_counts_layers() {
        let index = HnswIndex::new(IndexOptions::new(1).with_m(2).with_ef_build(4)).unwrap();
        for i in 0..50u64 {
            index.insert(RowId(i), &[i as f32]).unwrap();
        }
        let stats = index.stats();
        assert_eq!(stats.nodes, 50);
        assert_eq!(stats.live, 50);
        assert_eq!(stats.layers[0].nodes, 50);
        assert!(stats.layers[0].max_degree <= 4);
        for pair in stats.layers.windows(2) {
            assert!(pair[0].nodes >= pair[1].nodes);
        }
        assert_eq!(
            stats.entry_point.map(|e| e.layer),
            Some(stats.layers.len() - 1)
        );
        assert!(stats.memory_bytes > 0);
    }
}
