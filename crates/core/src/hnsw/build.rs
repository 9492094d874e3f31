//! Parallel build coordinator.
//!
//! A build validates the whole input stream up front, skips rows that are
//! already indexed, and fans the rest out over a `rayon` pool bounded by the
//! session's `index_parallel`. Workers run the read-only search phase of
//! insertion against the shared graph and serialize only on the per-node locks
//! taken while linking. Each chunk draws layers from its own random source
//! derived from the build seed, so no random state is shared between workers.
//!
//! With one worker the build is a plain serial loop in input order and is
//! bit-reproducible for a fixed seed. With more workers the graph depends on
//! scheduling but always satisfies the index invariants.

use crate::config;
use crate::error::{HnswError, Result};
use crate::hnsw::graph::HnswIndex;
use crate::hnsw::vectors::RowId;
use crate::options::SessionSettings;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag, checked between node commits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Options for one build invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Worker count, `1..=MAX_INDEX_PARALLEL`.
    pub parallelism: usize,
    pub cancel: Option<CancelToken>,
    /// Seed for layer sampling. `None` draws one from the index's random source.
    pub seed: Option<u64>,
}

impl BuildOptions {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            cancel: None,
            seed: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl From<&SessionSettings> for BuildOptions {
    fn from(settings: &SessionSettings) -> Self {
        Self::new(settings.index_parallel)
    }
}

/// Summary of a completed build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildReport {
    pub inserted: usize,
    /// Rows already present in the index.
    pub skipped: usize,
    pub workers: usize,
    pub elapsed: Duration,
}

/// Clears the active-build flag however the build ends.
struct ActiveBuild<'a>(&'a AtomicBool);

impl Drop for ActiveBuild<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Progress shared by all workers of one build.
struct Progress<'a> {
    committed: AtomicUsize,
    skipped: AtomicUsize,
    total: usize,
    cancel: Option<&'a CancelToken>,
}

impl Progress<'_> {
    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(HnswError::BuildCancelled {
                committed: self.committed.load(Ordering::Acquire),
            });
        }
        Ok(())
    }

    fn record(&self, outcome: Result<u32>) -> Result<()> {
        match outcome {
            Ok(_) => {
                let n = self.committed.fetch_add(1, Ordering::AcqRel) + 1;
                if n % config::BUILD_PROGRESS_INTERVAL == 0 {
                    tracing::debug!(committed = n, total = self.total, "build progress");
                }
                Ok(())
            }
            // repeated row inside the stream
            Err(HnswError::DuplicateRow(_)) => {
                self.skipped.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Seed for chunk `index`, spread with the golden-ratio increment.
fn chunk_seed(base: u64, index: usize) -> u64 {
    base ^ (index as u64).wrapping_add(1).wrapping_mul(GOLDEN_GAMMA)
}

/// Seed for the node inserted serially before the workers start.
fn seed_node_seed(base: u64) -> u64 {
    base.rotate_left(17) ^ !GOLDEN_GAMMA
}

impl HnswIndex {
    /// Build from a stream of rows with `parallelism` workers.
    pub fn build<I>(&self, rows: I, parallelism: usize) -> Result<BuildReport>
    where
        I: IntoIterator<Item = (RowId, Vec<f32>)>,
    {
        self.build_with(rows, &BuildOptions::new(parallelism))
    }

    /// Build using the worker count configured for the session.
    pub fn build_for_session<I>(&self, rows: I, settings: &SessionSettings) -> Result<BuildReport>
    where
        I: IntoIterator<Item = (RowId, Vec<f32>)>,
    {
        self.build_with(rows, &BuildOptions::from(settings))
    }

    /// Build from a stream of rows.
    ///
    /// Fails with `ConcurrentBuildConflict` if another build is running. Rows whose
    /// id is already live are skipped, so a failed or cancelled build is resumed by
    /// calling `build` again with the same stream. Until a build succeeds the index
    /// reports [`IndexState::Building`](crate::hnsw::IndexState::Building).
    pub fn build_with<I>(&self, rows: I, opts: &BuildOptions) -> Result<BuildReport>
    where
        I: IntoIterator<Item = (RowId, Vec<f32>)>,
    {
        if opts.parallelism == 0 || opts.parallelism > config::MAX_INDEX_PARALLEL {
            return Err(HnswError::InvalidParameter(format!(
                "index_parallel must be between 1 and {}, got {}",
                config::MAX_INDEX_PARALLEL,
                opts.parallelism
            )));
        }
        if self
            .build_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HnswError::ConcurrentBuildConflict);
        }
        let _active = ActiveBuild(&self.build_active);
        let start = Instant::now();

        let rows: Vec<(RowId, Vec<f32>)> = rows.into_iter().collect();
        for (row_id, vector) in &rows {
            if let Err(e) = self.vectors.check_dims(vector) {
                tracing::warn!(%row_id, error = %e, "build rejected before any insert");
                return Err(e);
            }
        }
        self.build_incomplete.store(true, Ordering::Release);

        let pending: Vec<&(RowId, Vec<f32>)> = rows
            .iter()
            .filter(|(row_id, _)| self.vectors.lookup_live(*row_id).is_none())
            .collect();
        let progress = Progress {
            committed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(rows.len() - pending.len()),
            total: pending.len(),
            cancel: opts.cancel.as_ref(),
        };
        let workers = opts.parallelism.min(pending.len().max(1));
        tracing::info!(
            rows = rows.len(),
            pending = pending.len(),
            workers,
            "index build started"
        );

        let outcome = if workers == 1 {
            self.build_serial(&pending, opts.seed, &progress)
        } else {
            let seed = opts.seed.unwrap_or_else(|| self.rng.lock().gen());
            self.build_parallel(&pending, workers, seed, &progress)
        };

        let committed = progress.committed.load(Ordering::Acquire);
        if let Err(e) = outcome {
            let e = match e {
                HnswError::BuildCancelled { .. } => HnswError::BuildCancelled { committed },
                other => other,
            };
            tracing::warn!(committed, error = %e, "index build stopped; index left in building state");
            return Err(e);
        }

        self.build_incomplete.store(false, Ordering::Release);
        let report = BuildReport {
            inserted: committed,
            skipped: progress.skipped.load(Ordering::Acquire),
            workers,
            elapsed: start.elapsed(),
        };
        tracing::info!(
            inserted = report.inserted,
            skipped = report.skipped,
            workers,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "index build finished"
        );
        Ok(report)
    }

    fn build_serial(
        &self,
        rows: &[&(RowId, Vec<f32>)],
        seed: Option<u64>,
        progress: &Progress<'_>,
    ) -> Result<()> {
        let mut own_rng = seed.map(StdRng::seed_from_u64);
        for (row_id, vector) in rows.iter().copied() {
            progress.check_cancel()?;
            let outcome = match own_rng.as_mut() {
                Some(rng) => self.insert_with_rng(*row_id, vector, rng),
                None => self.insert(*row_id, vector),
            };
            progress.record(outcome)?;
        }
        Ok(())
    }

    fn build_parallel(
        &self,
        rows: &[&(RowId, Vec<f32>)],
        workers: usize,
        seed: u64,
        progress: &Progress<'_>,
    ) -> Result<()> {
        let Some((first, rest)) = rows.split_first() else {
            return Ok(());
        };
        // seed the graph serially so workers never race for the first entry point
        if self.entry_point().is_none() {
            progress.check_cancel()?;
            let mut rng = StdRng::seed_from_u64(seed_node_seed(seed));
            progress.record(self.insert_with_rng(first.0, &first.1, &mut rng))?;
        }
        let rest = if self.vectors.lookup_live(first.0).is_some() {
            rest
        } else {
            rows
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("quantum-build-{i}"))
            .build()
            .map_err(|e| HnswError::Io(std::io::Error::other(e.to_string())))?;
        let chunk_len = rest
            .len()
            .div_ceil(workers * config::BUILD_CHUNKS_PER_WORKER)
            .max(1);

        pool.install(|| {
            rest.par_chunks(chunk_len)
                .enumerate()
                .try_for_each(|(chunk_index, chunk)| {
                    let mut rng = StdRng::seed_from_u64(chunk_seed(seed, chunk_index));
                    for (row_id, vector) in chunk.iter().copied() {
                        progress.check_cancel()?;
                        progress.record(self.insert_with_rng(*row_id, vector, &mut rng))?;
                    }
                    Ok(())
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::graph::IndexState;
    use crate::options::IndexOptions;

    fn rows(n: u64) -> Vec<(RowId, Vec<f32>)> {
        (0..n)
            .map(|i| {
                let x = (i * 7919 % 1000) as f32 / 10.0;
                let y = (i * 104_729 % 1000) as f32 / 10.0;
                (RowId(i), vec![x, y])
            })
            .collect()
    }

    fn small_index() -> HnswIndex {
        HnswIndex::new(IndexOptions::new(2).with_m(4).with_ef_build(16)).unwrap()
    }

    #[test]
    fn test_serial_build() {
        let index = small_index();
        let report = index.build(rows(300), 1).unwrap();
        assert_eq!(report.inserted, 300);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.workers, 1);
        assert_eq!(index.len(), 300);
        assert_eq!(index.state(), IndexState::Ready);
        assert!(index.validate().is_ok(), "{:?}", index.validate());
    }

    #[test]
    fn test_parallel_build_satisfies_invariants() {
        let index = small_index();
        let report = index.build(rows(2_000), 4).unwrap();
        assert_eq!(report.inserted, 2_000);
        assert_eq!(report.workers, 4);
        assert_eq!(index.len(), 2_000);
        assert_eq!(index.state(), IndexState::Ready);
        assert!(index.validate().is_ok(), "{:?}", index.validate());
    }

    #[test]
    fn test_parallel_build_from_empty_with_seed() {
        let index = small_index();
        assert!(index.entry_point().is_none());
        let report = index
            .build_with(rows(500), &BuildOptions::new(4).with_seed(u64::MAX))
            .unwrap();
        assert_eq!(report.inserted, 500);
        assert_eq!(index.len(), 500);
        assert!(index.entry_point().is_some());
        assert!(index.validate().is_ok(), "{:?}", index.validate());
    }

    #[test]
    fn test_seed_derivation_at_extremes() {
        for base in [0, 1, u64::MAX] {
            let chunks: Vec<u64> = [0, 1, usize::MAX - 1, usize::MAX]
                .iter()
                .map(|&i| chunk_seed(base, i))
                .collect();
            assert_ne!(chunks[0], chunks[1]);
            assert_ne!(chunks[2], chunks[3]);
            assert_ne!(seed_node_seed(base), chunks[0]);
        }
    }

    #[test]
    fn test_seeded_serial_builds_match() {
        let a = small_index();
        let b = small_index();
        a.build_with(rows(400), &BuildOptions::new(1).with_seed(5)).unwrap();
        b.build_with(rows(400), &BuildOptions::new(1).with_seed(5)).unwrap();
        assert_eq!(a.entry_point(), b.entry_point());
        for id in 0..400 {
            assert_eq!(
                a.graph.neighbors(id, 0).unwrap(),
                b.graph.neighbors(id, 0).unwrap()
            );
        }
    }

    #[test]
    fn test_invalid_parallelism_rejected() {
        let index = small_index();
        for p in [0, config::MAX_INDEX_PARALLEL + 1] {
            assert!(matches!(
                index.build(rows(3), p),
                Err(HnswError::InvalidParameter(_))
            ));
        }
        assert_eq!(index.state(), IndexState::Empty);
    }

    #[test]
    fn test_dimension_mismatch_rejects_whole_build() {
        let index = small_index();
        let mut input = rows(10);
        input.push((RowId(99), vec![1.0, 2.0, 3.0]));
        assert!(matches!(
            index.build(input, 2),
            Err(HnswError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert_eq!(index.node_count(), 0);
        assert_eq!(index.state(), IndexState::Empty);
    }

    #[test]
    fn test_concurrent_build_conflict() {
        let index = small_index();
        index.build_active.store(true, Ordering::Release);
        assert!(matches!(
            index.build(rows(5), 1),
            Err(HnswError::ConcurrentBuildConflict)
        ));
        index.build_active.store(false, Ordering::Release);
        assert!(index.build(rows(5), 1).is_ok());
    }

    #[test]
    fn test_cancelled_build_resumes() {
        let index = small_index();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = index
            .build_with(rows(50), &BuildOptions::new(2).with_cancel(cancel))
            .unwrap_err();
        assert!(matches!(err, HnswError::BuildCancelled { committed: 0 }));
        assert_eq!(index.state(), IndexState::Building);

        // partial progress, then resume with the full stream
        let partial: Vec<_> = rows(50).into_iter().take(20).collect();
        index.build(partial, 2).unwrap();
        let report = index.build(rows(50), 3).unwrap();
        assert_eq!(report.skipped, 20);
        assert_eq!(report.inserted, 30);
        assert_eq!(index.len(), 50);
        assert_eq!(index.state(), IndexState::Ready);
        assert!(index.validate().is_ok());
    }

    #[test]
    fn test_cancel_during_parallel_build() {
        let index = small_index();
        let cancel = CancelToken::new();
        let opts = BuildOptions::new(4).with_cancel(cancel.clone());
        let finished = AtomicBool::new(false);

        let outcome = std::thread::scope(|scope| {
            scope.spawn(|| {
                while index.node_count() < 200 && !finished.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                cancel.cancel();
            });
            let outcome = index.build_with(rows(5_000), &opts);
            finished.store(true, Ordering::Release);
            outcome
        });

        match outcome {
            Err(HnswError::BuildCancelled { committed }) => {
                assert!(committed < 5_000);
                assert_eq!(index.len(), committed);
                assert_eq!(index.state(), IndexState::Building);
            }
            other => assert!(other.is_ok(), "unexpected outcome {other:?}"),
        }
        assert!(index.validate().is_ok(), "{:?}", index.validate());

        let report = index.build(rows(5_000), 4).unwrap();
        assert_eq!(report.inserted + report.skipped, 5_000);
        assert_eq!(index.len(), 5_000);
        assert_eq!(index.state(), IndexState::Ready);
        assert!(index.validate().is_ok(), "{:?}", index.validate());
    }

    #[test]
    fn test_repeated_rows_in_stream_are_skipped() {
        let index = small_index();
        let mut input = rows(10);
        input.extend(rows(3));
        let report = index.build(input, 1).unwrap();
        assert_eq!(report.inserted, 10);
        assert_eq!(report.skipped, 3);
    }

    #[test]
    fn test_session_settings_drive_worker_count() {
        let index = small_index();
        let mut settings = SessionSettings::default();
        settings.set("quantum.index_parallel", "3").unwrap();
        let report = index.build_for_session(rows(100), &settings).unwrap();
        assert_eq!(report.workers, 3);
    }
}
