//! Distance metric implementations for HNSW search.
//!
//! Supports three distance functions: squared euclidean (L2, the default),
//! inner product, and cosine. Kernels accumulate in 8 fixed lanes over
//! `chunks_exact` so the compiler can vectorize them while the summation order
//! stays identical on every platform: the same inputs always produce the same
//! bits, which keeps graph construction reproducible for a fixed seed.

use crate::error::HnswError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LANES: usize = 8;

/// Distance metric used for vector similarity computation.
///
/// All metrics return a distance value where **lower is better** (more similar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance (L2²). Range: \[0, ∞).
    #[default]
    L2,
    /// Negative inner product: `-dot(a, b)`. Lower = higher similarity; may be negative.
    InnerProduct,
    /// Cosine distance: `1 - cosine_similarity`. Range: \[0, 2\].
    Cosine,
}

impl DistanceMetric {
    /// Distance between two vectors of equal length.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            DistanceMetric::L2 => l2_squared(a, b),
            DistanceMetric::InnerProduct => -dot(a, b),
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
        }
    }

    /// Name accepted by the `algorithm` index option.
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::InnerProduct => "inner_product",
            DistanceMetric::Cosine => "cosine",
        }
    }

    /// Stable tag stored in the persisted header.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            DistanceMetric::L2 => 1,
            DistanceMetric::InnerProduct => 2,
            DistanceMetric::Cosine => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DistanceMetric::L2),
            2 => Some(DistanceMetric::InnerProduct),
            3 => Some(DistanceMetric::Cosine),
            _ => None,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DistanceMetric {
    type Err = HnswError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            "inner_product" | "dot" | "ip" => Ok(DistanceMetric::InnerProduct),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(HnswError::InvalidParameter(format!(
                "unknown distance algorithm '{other}' (expected l2, inner_product or cosine)"
            ))),
        }
    }
}

/// Euclidean distance between two vectors (square root of the L2 metric).
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_squared(a, b).sqrt()
}

/// Plain inner product of two vectors.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b)
}

#[inline]
fn reduce(acc: [f32; LANES]) -> f32 {
    ((acc[0] + acc[4]) + (acc[1] + acc[5])) + ((acc[2] + acc[6]) + (acc[3] + acc[7]))
}

#[inline]
fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let ca = a.chunks_exact(LANES);
    let cb = b.chunks_exact(LANES);
    let (ra, rb) = (ca.remainder(), cb.remainder());
    for (x, y) in ca.zip(cb) {
        for i in 0..LANES {
            let d = x[i] - y[i];
            acc[i] += d * d;
        }
    }
    let mut tail = 0.0f32;
    for (x, y) in ra.iter().zip(rb) {
        let d = x - y;
        tail += d * d;
    }
    reduce(acc) + tail
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let ca = a.chunks_exact(LANES);
    let cb = b.chunks_exact(LANES);
    let (ra, rb) = (ca.remainder(), cb.remainder());
    for (x, y) in ca.zip(cb) {
        for i in 0..LANES {
            acc[i] += x[i] * y[i];
        }
    }
    let mut tail = 0.0f32;
    for (x, y) in ra.iter().zip(rb) {
        tail += x * y;
    }
    reduce(acc) + tail
}

/// Cosine similarity in \[-1, 1\]. Returns 0 when either vector has zero norm.
#[inline]
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut ab = [0.0f32; LANES];
    let mut aa = [0.0f32; LANES];
    let mut bb = [0.0f32; LANES];
    let ca = a.chunks_exact(LANES);
    let cb = b.chunks_exact(LANES);
    let (ra, rb) = (ca.remainder(), cb.remainder());
    for (x, y) in ca.zip(cb) {
        for i in 0..LANES {
            ab[i] += x[i] * y[i];
            aa[i] += x[i] * x[i];
            bb[i] += y[i] * y[i];
        }
    }
    let (mut tab, mut taa, mut tbb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in ra.iter().zip(rb) {
        tab += x * y;
        taa += x * x;
        tbb += y * y;
    }
    let dot = reduce(ab) + tab;
    let denom = ((reduce(aa) + taa) * (reduce(bb) + tbb)).sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}
