//! File-backed region: an append-only log of write batches.
//!
//! Each batch is framed as `[u32 length BE][u32 CRC32 BE][bincode payload]`
//! and durably flushed with `fsync` before `apply` returns, so a batch is
//! either fully replayed or not at all. Opening the region replays the log
//! into memory; replay stops at the first torn or corrupt frame and the file
//! is cut back to the last good frame. A failed append is rolled back to the
//! same boundary while the region is open, so later batches never land behind
//! a partial frame. [`FileRegion::compact`] rewrites the live key set as a
//! single frame through an atomic temp-file + rename.

use crate::config;
use crate::error::{HnswError, Result};
use crate::storage::region::{scan_map, KvRegion, WriteBatch};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Diagnostic statistics from a log replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Number of batches successfully applied.
    pub success: usize,
    /// Number of batches skipped due to deserialization errors (CRC was valid).
    pub skipped: usize,
    /// Number of CRC mismatches encountered (replay stopped).
    pub crc_errors: usize,
    /// Whether replay was terminated by a truncated frame.
    pub truncated: bool,
    /// Length of the log prefix made of whole, verified frames.
    pub valid_bytes: u64,
}

/// Durable [`KvRegion`] stored in a single log file.
pub struct FileRegion {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    writer: BufWriter<File>,
    path: PathBuf,
    replay: ReplayStats,
    /// File length covered by acknowledged frames.
    durable_len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

impl FileRegion {
    /// Open or create the region log inside `dir` and replay it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(config::REGION_FILE_NAME);
        let mut map = BTreeMap::new();
        let replay = if path.exists() {
            replay_into(&path, &mut map)?
        } else {
            ReplayStats::default()
        };

        let file = open_append(&path)?;
        if file.metadata()?.len() > replay.valid_bytes {
            tracing::warn!(
                path = %path.display(),
                valid_bytes = replay.valid_bytes,
                "discarding damaged log tail"
            );
            file.set_len(replay.valid_bytes)?;
            file.sync_all()?;
        }
        tracing::debug!(
            path = %path.display(),
            batches = replay.success,
            keys = map.len(),
            "region opened"
        );
        let durable_len = replay.valid_bytes;
        Ok(Self {
            map,
            writer: BufWriter::new(file),
            path,
            replay,
            durable_len,
            poisoned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Statistics of the replay performed when the region was opened.
    pub fn replay_stats(&self) -> &ReplayStats {
        &self.replay
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Rewrite the log as one frame holding the current key set.
    ///
    /// Writes to a temp file, fsyncs it, then renames it over the log.
    pub fn compact(&mut self) -> Result<u64> {
        let mut snapshot = WriteBatch::new();
        for (k, v) in &self.map {
            snapshot.put(k.clone(), v.clone());
        }
        let framed = serialize_and_frame(&snapshot)?;

        let tmp_path = self.path.with_extension("qlog.tmp");
        {
            let mut opts = OpenOptions::new();
            opts.create(true).write(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut tmp = opts.open(&tmp_path)?;
            tmp.write_all(&framed)?;
            tmp.sync_all()?;
        }
        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;
        self.writer = BufWriter::new(open_append(&self.path)?);
        self.durable_len = framed.len() as u64;
        self.poisoned = false;

        let crc = crc32fast::hash(&framed[8..]);
        tracing::info!(
            "Compacted region {:?} ({} keys, {} bytes, CRC32={:#010x})",
            self.path,
            self.map.len(),
            framed.len(),
            crc
        );
        Ok(framed.len() as u64)
    }

    fn append_frame(&mut self, framed: &[u8]) -> io::Result<()> {
        self.writer.write_all(framed)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Drop whatever part of a failed frame reached the buffer or the file.
    fn discard_partial_frame(&mut self) -> io::Result<()> {
        let file = open_append(&self.path)?;
        let failed = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back unflushed bytes instead of writing them on drop
        let _ = failed.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }
}

impl KvRegion for FileRegion {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_map(&self.map, prefix))
    }

    /// Serializes the batch, writes, flushes and fsyncs it before touching memory.
    fn apply(&mut self, batch: WriteBatch) -> Result<()> {
        if self.poisoned {
            return Err(HnswError::Io(io::Error::other(format!(
                "region log {} has an unrecoverable partial frame; reopen it",
                self.path.display()
            ))));
        }
        let framed = serialize_and_frame(&batch)?;
        if let Err(e) = self.append_frame(&framed) {
            match self.discard_partial_frame() {
                Ok(()) => tracing::warn!(
                    path = %self.path.display(),
                    durable_len = self.durable_len,
                    error = %e,
                    "region append failed; rolled back partial frame"
                ),
                Err(rollback) => {
                    self.poisoned = true;
                    tracing::error!(
                        path = %self.path.display(),
                        error = %e,
                        rollback_error = %rollback,
                        "region append failed and could not be rolled back"
                    );
                }
            }
            return Err(e.into());
        }
        self.durable_len += framed.len() as u64;
        batch.apply_to(&mut self.map);
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

/// Read every frame of the log at `path` into `map`, verifying CRC32 checksums.
fn replay_into(path: &Path, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<ReplayStats> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut stats = ReplayStats::default();
    let mut header_buf = [0u8; 8];

    loop {
        match reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if stats.valid_bytes < file_len {
                    tracing::warn!("region log truncated mid-header, stopping replay");
                    stats.truncated = true;
                }
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]])
            as usize;
        let stored_crc =
            u32::from_be_bytes([header_buf[4], header_buf[5], header_buf[6], header_buf[7]]);
        if stats.valid_bytes + 8 + len as u64 > file_len {
            tracing::warn!("region log truncated mid-frame, stopping replay");
            stats.truncated = true;
            break;
        }
        let mut data = vec![0u8; len];
        match reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!("region log truncated mid-frame, stopping replay");
                stats.truncated = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let computed_crc = crc32fast::hash(&data);
        if computed_crc != stored_crc {
            tracing::warn!(
                "region log frame CRC mismatch: expected {:#010x}, got {:#010x}, stopping replay",
                stored_crc,
                computed_crc
            );
            stats.crc_errors += 1;
            break;
        }
        match bincode::deserialize::<WriteBatch>(&data) {
            Ok(batch) => {
                batch.apply_to(map);
                stats.success += 1;
            }
            Err(e) => {
                tracing::warn!("region log frame deserialization failed, skipping: {}", e);
                stats.skipped += 1;
            }
        }
        stats.valid_bytes += 8 + len as u64;
    }

    Ok(stats)
}

/// Serialize a batch into its on-disk frame format:
/// `[u32 len BE][u32 crc32 BE][bincode payload]`.
fn serialize_and_frame(batch: &WriteBatch) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(batch)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| HnswError::Codec(format!("batch of {} bytes is too large", bytes.len())))?;
    let crc = crc32fast::hash(&bytes);

    let mut framed = Vec::with_capacity(8 + bytes.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&crc.to_be_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}
