//! # quantum-core
//!
//! Embeddable HNSW approximate nearest neighbor index engine: fixed-dimension
//! `f32` vectors, three distance metrics, a parallel build coordinator, and an
//! incremental persistence adapter over a key-value page region.
//!
//! This is the core library crate with no async dependencies. The `quantum-hnsw`
//! binary in `crates/cli` drives it from the command line.

/// Global configuration constants: limits, defaults, and tuning parameters.
pub mod config;
/// Error type shared by every index operation.
pub mod error;
/// HNSW index: vector store, graph layers, insertion, search, build and vacuum.
pub mod hnsw;
/// Index creation options and per-session settings.
pub mod options;
/// Storage layer: record layout, page regions, and incremental flush/load.
pub mod storage;

pub use error::{HnswError, Result};
pub use hnsw::{DistanceMetric, HnswIndex, IndexState, RowId, SearchOptions, SearchResult};
pub use options::{IndexOptions, NeighborSelection, SessionSettings};
