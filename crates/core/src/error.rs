//! Error type shared by every index operation.

use crate::hnsw::vectors::RowId;
use std::io;
use thiserror::Error;

/// Errors surfaced by index construction, mutation, search and persistence.
#[derive(Debug, Error)]
pub enum HnswError {
    /// A vector's length differs from the index's configured `dims`.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An index option, session setting or call argument is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Search against an index with no live nodes.
    #[error("index contains no live nodes")]
    EmptyIndex,

    /// A layer above a node's assigned top layer was addressed. Indicates a bug.
    #[error("layer {layer} out of bounds for node {node} (top layer {top_layer})")]
    LayerBounds {
        node: u32,
        layer: usize,
        top_layer: usize,
    },

    /// Another build is already running against this index.
    #[error("a build is already in progress on this index")]
    ConcurrentBuildConflict,

    /// A live node already indexes this row.
    #[error("row {0} is already indexed")]
    DuplicateRow(RowId),

    /// The build was cancelled between node commits.
    #[error("build cancelled after {committed} committed nodes")]
    BuildCancelled { committed: usize },

    /// Persisted state failed validation.
    #[error("corrupt index state: {0}")]
    Corrupt(String),

    /// Region payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for HnswError {
    fn from(e: bincode::Error) -> Self {
        HnswError::Codec(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HnswError>;
