//! Storage layer: record layout, key-value regions, and incremental persistence.
//!
//! The index persists into any [`KvRegion`] the host provides. Records use a
//! fixed little-endian layout (see [`layout`]). [`FileRegion`] is the
//! standalone durable region: an fsynced, CRC32-framed batch log with
//! snapshot compaction through an atomic temp-file + rename.

/// Header, vector and adjacency record encodings and their keys.
pub mod layout;
/// Flush into and load from a region.
pub mod persistence;
/// The `KvRegion` trait, write batches, and the in-memory region.
pub mod region;
/// File-backed region log with CRC32 framing.
pub mod wal;

pub use layout::{Header, VectorRecord};
pub use persistence::FlushStats;
pub use region::{KvRegion, MemoryRegion, WriteBatch};
pub use wal::{FileRegion, ReplayStats};
