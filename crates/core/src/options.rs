//! Index options and session settings.
//!
//! [`IndexOptions`] is fixed at index creation and parsed from the same
//! `key=value` list the host passes in `CREATE INDEX ... WITH (...)`.
//! [`SessionSettings`] carries the session-scoped `quantum.index_parallel` knob.

use crate::config;
use crate::error::{HnswError, Result};
use crate::hnsw::distance::DistanceMetric;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a node's kept neighbor set is derived from a candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborSelection {
    /// Keep a candidate unless an already-kept neighbor is nearer to it than the base is,
    /// then fill remaining slots with the closest discarded candidates.
    #[default]
    Heuristic,
    /// Keep the closest candidates.
    Nearest,
}

impl NeighborSelection {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            NeighborSelection::Heuristic => 0,
            NeighborSelection::Nearest => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(NeighborSelection::Heuristic),
            1 => Some(NeighborSelection::Nearest),
            _ => None,
        }
    }
}

/// Immutable per-index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Links per node on layers above 0. Layer 0 allows `2 * m`.
    pub m: usize,
    /// Candidate list size during insertion.
    pub ef_build: usize,
    /// Default candidate list size during search.
    pub ef_search: usize,
    /// Vector dimensionality.
    pub dims: usize,
    pub metric: DistanceMetric,
    pub selection: NeighborSelection,
    /// Seed of the index random source used for layer sampling.
    pub seed: u64,
}

impl IndexOptions {
    /// Options with defaults for everything but `dims`.
    pub fn new(dims: usize) -> Self {
        Self {
            m: config::DEFAULT_M,
            ef_build: config::DEFAULT_EF_BUILD,
            ef_search: config::DEFAULT_EF_SEARCH,
            dims,
            metric: DistanceMetric::default(),
            selection: NeighborSelection::default(),
            seed: config::DEFAULT_SEED,
        }
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn with_ef_build(mut self, ef_build: usize) -> Self {
        self.ef_build = ef_build;
        self
    }

    pub fn with_ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = ef_search;
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_selection(mut self, selection: NeighborSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Parse a reloption list such as `"m=16, efbuild=64, dims=128, efsearch=32, algorithm=l2"`.
    ///
    /// `dims` is required. Parsed options are validated before being returned.
    pub fn parse(input: &str) -> Result<Self> {
        let mut opts = Self::new(0);
        let mut saw_dims = false;
        for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                HnswError::InvalidParameter(format!("expected key=value, got '{pair}'"))
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('\'');
            match key.as_str() {
                "m" => opts.m = parse_number(&key, value)?,
                "efbuild" | "ef_build" | "efconstruction" | "ef_construction" => {
                    opts.ef_build = parse_number(&key, value)?
                }
                "efsearch" | "ef_search" => opts.ef_search = parse_number(&key, value)?,
                "dims" => {
                    opts.dims = parse_number(&key, value)?;
                    saw_dims = true;
                }
                "algorithm" | "metric" => opts.metric = value.parse()?,
                "link_nearest" => {
                    opts.selection = if parse_bool(&key, value)? {
                        NeighborSelection::Nearest
                    } else {
                        NeighborSelection::Heuristic
                    }
                }
                "seed" => opts.seed = parse_number(&key, value)?,
                _ => {
                    return Err(HnswError::InvalidParameter(format!(
                        "unrecognized index option '{key}'"
                    )))
                }
            }
        }
        if !saw_dims {
            return Err(HnswError::InvalidParameter(
                "index option 'dims' is required".into(),
            ));
        }
        opts.validate()?;
        Ok(opts)
    }

    /// Check every option against its accepted range.
    pub fn validate(&self) -> Result<()> {
        check_range("m", self.m, config::MIN_M, config::MAX_M)?;
        check_range("dims", self.dims, 1, config::MAX_DIMENSION)?;
        check_range("efbuild", self.ef_build, 1, config::MAX_EF_BUILD)?;
        check_range("efsearch", self.ef_search, 1, config::MAX_EF_SEARCH)?;
        if self.ef_build < self.m {
            return Err(HnswError::InvalidParameter(format!(
                "efbuild ({}) must be >= m ({})",
                self.ef_build, self.m
            )));
        }
        Ok(())
    }

    /// Connection cap for `layer`.
    #[inline]
    pub fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

impl FromStr for IndexOptions {
    type Err = HnswError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Session-scoped tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Worker count for subsequent builds. 1 builds serially.
    pub index_parallel: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            index_parallel: config::DEFAULT_INDEX_PARALLEL,
        }
    }
}

impl SessionSettings {
    /// Apply a `SET name = value` statement. Accepts the bare or `quantum.`-prefixed name.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let name = name.trim().to_ascii_lowercase();
        let name = name.strip_prefix("quantum.").unwrap_or(&name);
        match name {
            "index_parallel" => {
                let n: usize = parse_number("index_parallel", value.trim())?;
                check_range("index_parallel", n, 1, config::MAX_INDEX_PARALLEL)?;
                self.index_parallel = n;
                Ok(())
            }
            _ => Err(HnswError::InvalidParameter(format!(
                "unrecognized configuration parameter '{name}'"
            ))),
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        HnswError::InvalidParameter(format!("invalid value for '{key}': '{value}'"))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(HnswError::InvalidParameter(format!(
            "invalid boolean for '{key}': '{value}'"
        ))),
    }
}

fn check_range(key: &str, value: usize, min: usize, max: usize) -> Result<()> {
    if value < min || value > max {
        return Err(HnswError::InvalidParameter(format!(
            "{key} = {value} is outside the valid range [{min}, {max}]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_option_list() {
        let opts =
            IndexOptions::parse("m=4, efbuild=8, dims=2, efsearch=16, algorithm=cosine").unwrap();
        assert_eq!(opts.m, 4);
        assert_eq!(opts.ef_build, 8);
        assert_eq!(opts.dims, 2);
        assert_eq!(opts.ef_search, 16);
        assert_eq!(opts.metric, DistanceMetric::Cosine);
        assert_eq!(opts.selection, NeighborSelection::Heuristic);
    }

    #[test]
    fn test_parse_defaults() {
        let opts: IndexOptions = "dims=128".parse().unwrap();
        assert_eq!(opts.m, config::DEFAULT_M);
        assert_eq!(opts.ef_build, config::DEFAULT_EF_BUILD);
        assert_eq!(opts.ef_search, config::DEFAULT_EF_SEARCH);
        assert_eq!(opts.metric, DistanceMetric::L2);
        assert_eq!(opts.seed, config::DEFAULT_SEED);
    }

    #[test]
    fn test_parse_aliases_and_link_nearest() {
        let opts =
            IndexOptions::parse("dims=3, ef_construction=40, metric=ip, link_nearest=on").unwrap();
        assert_eq!(opts.ef_build, 40);
        assert_eq!(opts.metric, DistanceMetric::InnerProduct);
        assert_eq!(opts.selection, NeighborSelection::Nearest);
    }

    #[test]
    fn test_dims_required() {
        assert!(matches!(
            IndexOptions::parse("m=8"),
            Err(HnswError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_values() {
        for bad in [
            "dims=0",
            "dims=4097",
            "dims=8, m=0",
            "dims=8, m=65",
            "dims=8, m=16, efbuild=8",
            "dims=8, efsearch=0",
            "dims=8, m=abc",
            "dims=8, bogus=1",
            "dims=8, m",
        ] {
            assert!(
                matches!(IndexOptions::parse(bad), Err(HnswError::InvalidParameter(_))),
                "expected InvalidParameter for '{bad}'"
            );
        }
    }

    #[test]
    fn test_max_links_doubles_at_layer_zero() {
        let opts = IndexOptions::new(4).with_m(6);
        assert_eq!(opts.max_links(0), 12);
        assert_eq!(opts.max_links(1), 6);
        assert_eq!(opts.max_links(5), 6);
    }

    #[test]
    fn test_session_settings_set() {
        let mut s = SessionSettings::default();
        assert_eq!(s.index_parallel, 1);
        s.set("quantum.index_parallel", "4").unwrap();
        assert_eq!(s.index_parallel, 4);
        s.set("index_parallel", " 2 ").unwrap();
        assert_eq!(s.index_parallel, 2);
        assert!(s.set("quantum.index_parallel", "0").is_err());
        assert!(s.set("quantum.other", "1").is_err());
        assert_eq!(s.index_parallel, 2);
    }
}
