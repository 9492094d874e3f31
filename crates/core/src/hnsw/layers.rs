//! Graph layer store: per-node, per-layer adjacency lists.
//!
//! Every `(node, layer)` list sits behind its own `RwLock` and is kept sorted
//! by `(distance, id)`. Mutations lock the full set of lists they touch in
//! ascending node-id order, so writers on disjoint neighborhoods never contend
//! and overlapping writers cannot deadlock. Readers take one short read lock
//! per list and copy the ids out.
//!
//! Edges are symmetric. When a list overflows its cap the selection policy
//! re-derives the kept set and every dropped edge is unlinked on both sides:
//! immediately if the other end is already locked, otherwise right after the
//! lock set is released.

use crate::error::{HnswError, Result};
use crate::hnsw::arena::AppendArena;
use crate::hnsw::insert::Selector;
use ordered_float::OrderedFloat;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Adjacency entry: neighbor id and cached distance to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub id: u32,
    pub distance: f32,
}

impl Edge {
    pub fn new(id: u32, distance: f32) -> Self {
        Self { id, distance }
    }

    /// Total order used everywhere: ascending distance, then ascending id.
    #[inline]
    pub fn key(&self) -> (OrderedFloat<f32>, u32) {
        (OrderedFloat(self.distance), self.id)
    }
}

pub(crate) fn sort_edges(edges: &mut [Edge]) {
    edges.sort_unstable_by_key(Edge::key);
}

struct LayerSlot {
    edges: RwLock<Vec<Edge>>,
    degree: AtomicU32,
    dirty: AtomicBool,
}

impl LayerSlot {
    fn new(edges: Vec<Edge>, dirty: bool) -> Self {
        Self {
            degree: AtomicU32::new(edges.len() as u32),
            edges: RwLock::new(edges),
            dirty: AtomicBool::new(dirty),
        }
    }
}

struct NodeLinks {
    layers: Box<[LayerSlot]>,
}

/// Adjacency lists for every node, addressed by internal id.
pub struct GraphLayerStore {
    m: usize,
    nodes: AppendArena<NodeLinks>,
}

impl GraphLayerStore {
    pub fn new(m: usize) -> Self {
        Self {
            m,
            nodes: AppendArena::new(),
        }
    }

    /// Connection cap: `m` above layer 0, `2 * m` at layer 0.
    #[inline]
    pub fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    /// Publish empty lists for layers `0..=top_layer`.
    pub fn add_node(&self, id: u32, top_layer: usize) -> Result<()> {
        let layers = (0..=top_layer)
            .map(|_| LayerSlot::new(Vec::new(), true))
            .collect();
        self.nodes
            .set(id, NodeLinks { layers })
            .map_err(|_| HnswError::Corrupt(format!("graph node {id} published twice")))
    }

    /// Publish a node with persisted lists. `lists[l]` must already be sorted.
    pub(crate) fn restore_node(&self, id: u32, lists: Vec<Vec<Edge>>) -> Result<()> {
        let layers = lists
            .into_iter()
            .map(|edges| LayerSlot::new(edges, false))
            .collect();
        self.nodes
            .set(id, NodeLinks { layers })
            .map_err(|_| HnswError::Corrupt(format!("graph node {id} restored twice")))
    }

    /// Assigned top layer of `id`, if the node exists.
    #[inline]
    pub fn top_layer(&self, id: u32) -> Option<usize> {
        self.nodes.get(id).map(|n| n.layers.len() - 1)
    }

    fn slot(&self, id: u32, layer: usize) -> Result<&LayerSlot> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| HnswError::Corrupt(format!("graph node {id} does not exist")))?;
        node.layers.get(layer).ok_or(HnswError::LayerBounds {
            node: id,
            layer,
            top_layer: node.layers.len() - 1,
        })
    }

    /// Neighbors of `id` at `layer`, ascending by distance.
    pub fn neighbors(&self, id: u32, layer: usize) -> Result<Vec<Edge>> {
        Ok(self.slot(id, layer)?.edges.read().clone())
    }

    /// Copy neighbor ids of `id` at `layer` into `out` (cleared first).
    #[inline]
    pub(crate) fn neighbor_ids_into(
        &self,
        id: u32,
        layer: usize,
        out: &mut Vec<u32>,
    ) -> Result<()> {
        let slot = self.slot(id, layer)?;
        out.clear();
        out.extend(slot.edges.read().iter().map(|e| e.id));
        Ok(())
    }

    /// Current edge count of `id` at `layer`; 0 if absent.
    #[inline]
    pub fn degree(&self, id: u32, layer: usize) -> usize {
        self.slot(id, layer)
            .map_or(0, |s| s.degree.load(Ordering::Acquire) as usize)
    }

    /// Add the symmetric edge `a <-> b` at `layer`, pruning either side back to its cap.
    pub fn link(
        &self,
        a: u32,
        b: u32,
        layer: usize,
        distance: f32,
        selector: &Selector<'_>,
    ) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let mut deferred = Vec::new();
        {
            let mut set = LockSet::acquire(self, [a, b], layer)?;
            let (ai, bi) = (set.position(a), set.position(b));
            insert_sorted(set.edges_mut(ai), Edge::new(b, distance));
            insert_sorted(set.edges_mut(bi), Edge::new(a, distance));
            self.prune_if_full(&mut set, a, layer, selector, &mut deferred);
            self.prune_if_full(&mut set, b, layer, selector, &mut deferred);
        }
        self.finish_unlinks(deferred, layer)
    }

    /// Install `node`'s list at `layer` and all back-edges from `selected`, in one lock set.
    ///
    /// `selected` holds distances from `node`. Neighbors that overflow are pruned.
    pub(crate) fn connect(
        &self,
        node: u32,
        layer: usize,
        selected: &[Edge],
        selector: &Selector<'_>,
    ) -> Result<()> {
        let mut deferred = Vec::new();
        {
            let ids = std::iter::once(node).chain(selected.iter().map(|e| e.id));
            let mut set = LockSet::acquire(self, ids, layer)?;
            let me = set.position(node);
            {
                let own = set.edges_mut(me);
                own.clear();
                own.extend(selected.iter().copied().filter(|e| e.id != node));
                sort_edges(own);
            }
            set.sync(me);
            for edge in selected.iter().filter(|e| e.id != node) {
                let idx = set.position(edge.id);
                insert_sorted(set.edges_mut(idx), Edge::new(node, edge.distance));
                self.prune_if_full(&mut set, edge.id, layer, selector, &mut deferred);
            }
        }
        self.finish_unlinks(deferred, layer)
    }

    /// Prune `owner`'s list inside `set` if it exceeds the layer cap.
    ///
    /// Dropped edges whose other end is in `set` are unlinked at once; the rest are
    /// queued in `deferred` as `(owner, victim)`.
    fn prune_if_full(
        &self,
        set: &mut LockSet<'_>,
        owner: u32,
        layer: usize,
        selector: &Selector<'_>,
        deferred: &mut Vec<(u32, u32)>,
    ) {
        let idx = set.position(owner);
        let cap = self.max_links(layer);
        if set.edges(idx).len() > cap {
            for victim in self.shrink(set, idx, layer, cap, selector) {
                match set.try_position(victim) {
                    Some(vi) => {
                        remove_edge(set.edges_mut(vi), owner);
                        set.sync(vi);
                    }
                    None => deferred.push((owner, victim)),
                }
            }
        }
        set.sync(idx);
    }

    /// Re-derive the kept set of an overflowing list. Returns the dropped neighbor ids.
    ///
    /// A neighbor whose only edge at this layer points back at the owner is never
    /// dropped; the farthest kept neighbor that still has other edges goes instead.
    fn shrink(
        &self,
        set: &mut LockSet<'_>,
        idx: usize,
        layer: usize,
        cap: usize,
        selector: &Selector<'_>,
    ) -> Vec<u32> {
        let current = set.edges(idx).clone();
        let mut kept = selector.select(&current, cap);
        let mut dropped: Vec<Edge> = current
            .iter()
            .filter(|e| !kept.iter().any(|k| k.id == e.id))
            .copied()
            .collect();

        for slot in 0..dropped.len() {
            let victim = dropped[slot];
            if set.degree_of(self, victim.id, layer) > 1 {
                continue;
            }
            let swap = kept.iter().rposition(|k| {
                set.degree_of(self, k.id, layer) > 1 && !dropped.iter().any(|d| d.id == k.id)
            });
            if let Some(pos) = swap {
                dropped[slot] = kept.remove(pos);
                kept.push(victim);
            }
        }

        sort_edges(&mut kept);
        *set.edges_mut(idx) = kept;
        dropped.into_iter().map(|e| e.id).collect()
    }

    /// Remove `owner` from each victim's list unless `owner` re-linked it meanwhile.
    fn finish_unlinks(&self, deferred: Vec<(u32, u32)>, layer: usize) -> Result<()> {
        for (owner, victim) in deferred {
            let mut set = LockSet::acquire(self, [owner, victim], layer)?;
            let oi = set.position(owner);
            if set.edges(oi).iter().any(|e| e.id == victim) {
                continue;
            }
            let vi = set.position(victim);
            if remove_edge(set.edges_mut(vi), owner) {
                set.sync(vi);
            }
        }
        Ok(())
    }

    /// Clear and return the dirty flag of `(id, layer)`.
    pub(crate) fn take_dirty(&self, id: u32, layer: usize) -> bool {
        self.slot(id, layer)
            .is_ok_and(|s| s.dirty.swap(false, Ordering::AcqRel))
    }

    pub(crate) fn set_dirty(&self, id: u32, layer: usize) {
        if let Ok(s) = self.slot(id, layer) {
            s.dirty.store(true, Ordering::Release);
        }
    }

    /// Approximate heap footprint of the first `count` nodes.
    pub fn memory_bytes(&self, count: u32) -> usize {
        let per_slot = std::mem::size_of::<LayerSlot>();
        let lists: usize = (0..count)
            .filter_map(|id| self.nodes.get(id))
            .flat_map(|n| n.layers.iter())
            .map(|s| per_slot + s.edges.read().capacity() * std::mem::size_of::<Edge>())
            .sum();
        self.nodes.reserved_bytes() + lists
    }
}

/// Write guards over a sorted, de-duplicated set of lists at one layer.
struct LockSet<'a> {
    ids: Vec<u32>,
    slots: Vec<&'a LayerSlot>,
    guards: Vec<RwLockWriteGuard<'a, Vec<Edge>>>,
}

impl<'a> LockSet<'a> {
    /// Resolve every slot first, then lock in ascending id order.
    fn acquire(
        store: &'a GraphLayerStore,
        ids: impl IntoIterator<Item = u32>,
        layer: usize,
    ) -> Result<Self> {
        let mut ids: Vec<u32> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        let slots = ids
            .iter()
            .map(|&id| store.slot(id, layer))
            .collect::<Result<Vec<_>>>()?;
        let guards = slots.iter().map(|&s| s.edges.write()).collect();
        Ok(Self { ids, slots, guards })
    }

    fn try_position(&self, id: u32) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    /// Index of a member id. Members are fixed at acquisition.
    fn position(&self, id: u32) -> usize {
        match self.ids.binary_search(&id) {
            Ok(i) => i,
            Err(_) => unreachable!("node {id} is not part of the lock set"),
        }
    }

    fn edges(&self, idx: usize) -> &Vec<Edge> {
        &self.guards[idx]
    }

    fn edges_mut(&mut self, idx: usize) -> &mut Vec<Edge> {
        &mut self.guards[idx]
    }

    /// Publish the degree of a mutated list and mark it for the next flush.
    fn sync(&self, idx: usize) {
        let slot = self.slots[idx];
        slot.degree
            .store(self.guards[idx].len() as u32, Ordering::Release);
        slot.dirty.store(true, Ordering::Release);
    }

    /// Degree of `id`: exact for members, last published value otherwise.
    fn degree_of(&self, store: &GraphLayerStore, id: u32, layer: usize) -> usize {
        match self.try_position(id) {
            Some(i) => self.guards[i].len(),
            None => store.degree(id, layer),
        }
    }
}

fn insert_sorted(list: &mut Vec<Edge>, edge: Edge) {
    if let Some(pos) = list.iter().position(|e| e.id == edge.id) {
        list.remove(pos);
    }
    let at = list.partition_point(|e| e.key() < edge.key());
    list.insert(at, edge);
}

fn remove_edge(list: &mut Vec<Edge>, id: u32) -> bool {
    match list.iter().position(|e| e.id == id) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::distance::DistanceMetric;
    use crate::hnsw::vectors::{RowId, VectorStore};
    use crate::options::NeighborSelection;

    /// Points on a line at x = 0, 1, 2, ...
    fn line(n: u32, m: usize) -> (VectorStore, GraphLayerStore) {
        let vectors = VectorStore::new(1);
        let graph = GraphLayerStore::new(m);
        for i in 0..n {
            let id = vectors.put(RowId(i as u64), &[i as f32]).unwrap();
            graph.add_node(id, 0).unwrap();
        }
        (vectors, graph)
    }

    fn selector(vectors: &VectorStore, policy: NeighborSelection) -> Selector<'_> {
        Selector {
            vectors,
            metric: DistanceMetric::L2,
            policy,
        }
    }

    fn ids(graph: &GraphLayerStore, id: u32) -> Vec<u32> {
        graph
            .neighbors(id, 0)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect()
    }

    fn assert_symmetric(graph: &GraphLayerStore, n: u32) {
        for a in 0..n {
            for e in graph.neighbors(a, 0).unwrap() {
                assert!(
                    ids(graph, e.id).contains(&a),
                    "edge {a}->{} has no reverse",
                    e.id
                );
            }
        }
    }

    #[test]
    fn test_link_is_symmetric_and_sorted() {
        let (vectors, graph) = line(4, 2);
        let sel = selector(&vectors, NeighborSelection::Heuristic);
        graph.link(0, 3, 0, 9.0, &sel).unwrap();
        graph.link(0, 1, 0, 1.0, &sel).unwrap();
        assert_eq!(ids(&graph, 0), vec![1, 3]);
        assert_eq!(ids(&graph, 3), vec![0]);
        assert_eq!(graph.degree(0, 0), 2);
        assert_symmetric(&graph, 4);
    }

    #[test]
    fn test_neighbors_above_top_layer_fails() {
        let (_, graph) = line(1, 2);
        assert!(matches!(
            graph.neighbors(0, 1),
            Err(HnswError::LayerBounds {
                node: 0,
                layer: 1,
                top_layer: 0
            })
        ));
        assert_eq!(graph.top_layer(0), Some(0));
        assert_eq!(graph.top_layer(1), None);
    }

    #[test]
    fn test_overflow_prunes_both_directions() {
        // cap at layer 0 is 2 * m = 2
        let (vectors, graph) = line(6, 1);
        let sel = selector(&vectors, NeighborSelection::Nearest);
        // give every far node a second edge so none of them is protected as an orphan
        graph.link(3, 4, 0, 1.0, &sel).unwrap();
        graph.link(4, 5, 0, 1.0, &sel).unwrap();
        graph.link(0, 1, 0, 1.0, &sel).unwrap();
        graph.link(0, 2, 0, 4.0, &sel).unwrap();
        graph.link(0, 3, 0, 9.0, &sel).unwrap();
        assert_eq!(ids(&graph, 0), vec![1, 2]);
        assert!(!ids(&graph, 3).contains(&0), "pruned edge removed on far side");
        for id in 0..6 {
            assert!(graph.degree(id, 0) <= graph.max_links(0));
        }
        assert_symmetric(&graph, 6);
    }

    #[test]
    fn test_orphan_guard_keeps_sole_edge() {
        let (vectors, graph) = line(5, 1);
        let sel = selector(&vectors, NeighborSelection::Nearest);
        // node 1 gets a second edge, node 2 and 3 only know node 0
        graph.link(1, 4, 0, 9.0, &sel).unwrap();
        graph.link(0, 1, 0, 1.0, &sel).unwrap();
        graph.link(0, 2, 0, 4.0, &sel).unwrap();
        graph.link(0, 3, 0, 9.0, &sel).unwrap();
        // nearest would keep {1, 2}, but 3 would be orphaned, so 1 is dropped instead
        assert_eq!(ids(&graph, 0), vec![2, 3]);
        assert_eq!(ids(&graph, 1), vec![4]);
        assert_symmetric(&graph, 5);
    }

    #[test]
    fn test_connect_installs_list_and_back_edges() {
        let (vectors, graph) = line(4, 2);
        let sel = selector(&vectors, NeighborSelection::Heuristic);
        let selected = [Edge::new(1, 1.0), Edge::new(2, 4.0)];
        graph.connect(0, 0, &selected, &sel).unwrap();
        assert_eq!(ids(&graph, 0), vec![1, 2]);
        assert_eq!(ids(&graph, 1), vec![0]);
        assert_eq!(ids(&graph, 2), vec![0]);
        assert!(graph.take_dirty(1, 0));
        assert!(!graph.take_dirty(1, 0));
    }

    #[test]
    fn test_concurrent_links_stay_symmetric_and_capped() {
        let n = 64u32;
        let (vectors, graph) = line(n, 2);
        let sel = selector(&vectors, NeighborSelection::Heuristic);
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let graph = &graph;
                let sel = &sel;
                s.spawn(move || {
                    for a in (t..n).step_by(4) {
                        for b in [a + 1, a + 3, a + 7] {
                            if b < n {
                                let d = ((b - a) * (b - a)) as f32;
                                graph.link(a, b, 0, d, sel).unwrap();
                            }
                        }
                    }
                });
            }
        });
        for id in 0..n {
            assert!(graph.degree(id, 0) <= graph.max_links(0));
        }
        assert_symmetric(&graph, n);
    }
}
