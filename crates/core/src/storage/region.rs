//! Key-value page regions the index persists into.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Puts and deletes applied to a region as one atomic unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Total key and value bytes carried by the batch.
    pub fn payload_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|(k, v)| k.len() + v.as_ref().map_or(0, Vec::len))
            .sum()
    }

    pub(crate) fn apply_to(self, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        for (key, value) in self.ops {
            match value {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }
}

/// Durable key-value storage provided by the host.
///
/// `apply` must be atomic: after a crash either every operation of the batch
/// is visible or none is.
pub trait KvRegion {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All pairs whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn apply(&mut self, batch: WriteBatch) -> Result<()>;
}

pub(crate) fn scan_map(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Volatile region backed by a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryRegion {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    batches: usize,
}

impl MemoryRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of batches applied so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Overwrite a raw value, bypassing batching. Used to simulate damage in tests.
    pub fn put_raw(&mut self, key: &[u8], value: Vec<u8>) {
        self.map.insert(key.to_vec(), value);
    }
}

impl KvRegion for MemoryRegion {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_map(&self.map, prefix))
    }

    fn apply(&mut self, batch: WriteBatch) -> Result<()> {
        batch.apply_to(&mut self.map);
        self.batches += 1;
        Ok(())
    }
}
