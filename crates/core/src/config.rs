//! Global configuration constants for quantum_hnsw.
//!
//! Index option defaults and accepted ranges, graph limits, and on-disk
//! identifiers are defined here. These are compile-time constants; runtime
//! configuration is parsed by [`crate::options`] and by the CLI.

/// Default number of bidirectional links per node on layers above 0.
///
/// Layer 0 uses `2 * m`. Higher values improve recall but increase memory and build time.
pub const DEFAULT_M: usize = 16;

/// Smallest accepted `m`.
pub const MIN_M: usize = 1;

/// Largest accepted `m`.
pub const MAX_M: usize = 64;

/// Default candidate list size during index construction (`efbuild`).
pub const DEFAULT_EF_BUILD: usize = 128;

/// Largest accepted `efbuild`.
pub const MAX_EF_BUILD: usize = 500;

/// Default candidate list size during search (`efsearch`).
///
/// Queries may override it; the effective value is always at least `k`.
pub const DEFAULT_EF_SEARCH: usize = 64;

/// Largest accepted `efsearch`.
pub const MAX_EF_SEARCH: usize = 1024;

/// Maximum allowed vector dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Number of layers a node may occupy. Sampled levels are capped at `MAX_LEVEL - 1`.
pub const MAX_LEVEL: usize = 8;

/// Default seed for the index random source used in layer sampling.
pub const DEFAULT_SEED: u64 = 0x5EED_0F_4A55;

/// Default worker count for index builds (`quantum.index_parallel`).
pub const DEFAULT_INDEX_PARALLEL: usize = 1;

/// Upper bound on build workers.
pub const MAX_INDEX_PARALLEL: usize = 64;

/// Number of chunks handed to each build worker. More chunks balance uneven insert cost.
pub const BUILD_CHUNKS_PER_WORKER: usize = 4;

/// Interval (in committed nodes) between build progress log lines.
pub const BUILD_PROGRESS_INTERVAL: usize = 10_000;

/// Magic number at the start of the persisted header record.
pub const HEADER_MAGIC: u32 = 0xDBAC_9527;

/// Version of the persisted record layout.
pub const LAYOUT_VERSION: u32 = 1;

/// File name of the region log inside a data directory.
pub const REGION_FILE_NAME: &str = "index.qlog";

/// Default directory for region files used by the CLI.
pub const DEFAULT_DATA_DIR: &str = "./data";
