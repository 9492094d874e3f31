//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor index.
//!
//! Vectors live in an append-only store addressed by dense internal ids. The
//! graph keeps one sorted, symmetric neighbor list per node and layer, each
//! behind its own lock, so searches and inserts run concurrently against a
//! shared [`HnswIndex`]. Layer 0 holds every node with up to `2·m` links; each
//! higher layer holds a geometrically thinning subset with up to `m` links.

mod arena;
/// Parallel index build with cancellation and resume.
pub mod build;
/// Distance metrics: squared L2, negated inner product, and cosine.
pub mod distance;
/// Index structure, lifecycle state, statistics and invariant checks.
pub mod graph;
/// Insertion with heuristic neighbor selection.
pub mod insert;
/// Per-node, per-layer adjacency lists and the lock-ordered linking protocol.
pub mod layers;
/// Greedy descent, single-layer beam search and multi-layer KNN.
pub mod search;
/// Tombstones, bulk delete and compaction.
pub mod vacuum;
/// Append-only vector storage keyed by internal node id.
pub mod vectors;
/// Generation-based visited set for graph traversal.
pub mod visited;

pub use build::{BuildOptions, BuildReport, CancelToken};
pub use distance::DistanceMetric;
pub use graph::{EntryPoint, HnswIndex, IndexState, IndexStats, LayerStats};
pub use layers::{Edge, GraphLayerStore};
pub use search::{knn_search, SearchOptions, SearchResult};
pub use vacuum::{BulkDeleteStats, CompactionStats, VacuumStats};
pub use vectors::{RowId, VectorStore};
