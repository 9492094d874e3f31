//! Vector store: fixed-dimension vectors addressed by dense internal ids.
//!
//! Vectors live in an [`AppendArena`], so an assigned vector never moves and
//! concurrent readers borrow it without locking. Id allocation and the
//! row-id map share one mutex that is held only while a slot is published.

use crate::error::{HnswError, Result};
use crate::hnsw::arena::AppendArena;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

/// Host row identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct RowId(pub u64);

impl RowId {
    /// Pack a heap tuple pointer (block number, line pointer offset).
    pub fn from_block_offset(block: u32, offset: u16) -> Self {
        RowId(((block as u64) << 16) | offset as u64)
    }

    pub fn block(&self) -> u32 {
        (self.0 >> 16) as u32
    }

    pub fn offset(&self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block(), self.offset())
    }
}

impl From<u64> for RowId {
    fn from(v: u64) -> Self {
        RowId(v)
    }
}

const DELETED: u8 = 0b01;
/// Set once the node is fully linked into the graph.
const COMMITTED: u8 = 0b10;

pub(crate) struct StoredVector {
    row_id: RowId,
    data: Box<[f32]>,
    /// `DELETED | COMMITTED`; a node is live when committed and not deleted.
    flags: AtomicU8,
    /// Needs to be written on the next flush.
    dirty: AtomicBool,
}

/// Append-only store of vectors and their row ids.
pub struct VectorStore {
    dims: usize,
    slots: AppendArena<StoredVector>,
    /// Row id → latest node for that row. Doubles as the id allocation lock.
    rows: Mutex<HashMap<RowId, u32>>,
    allocated: AtomicU32,
}

impl VectorStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            slots: AppendArena::new(),
            rows: Mutex::new(HashMap::new()),
            allocated: AtomicU32::new(0),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Fail with `DimensionMismatch` unless `vector` has exactly `dims` components.
    #[inline]
    pub fn check_dims(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dims {
            return Err(HnswError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Assign the next internal id to `vector` and store it.
    ///
    /// Rejects a row that already has a live node with `DuplicateRow`.
    pub fn put(&self, row_id: RowId, vector: &[f32]) -> Result<u32> {
        self.check_dims(vector)?;
        let stored = StoredVector {
            row_id,
            data: vector.into(),
            flags: AtomicU8::new(0),
            dirty: AtomicBool::new(true),
        };
        let mut rows = self.rows.lock();
        if let Some(&existing) = rows.get(&row_id) {
            if !self.is_deleted(existing) {
                return Err(HnswError::DuplicateRow(row_id));
            }
        }
        let id = self.allocated.load(Ordering::Acquire);
        if id == u32::MAX {
            return Err(HnswError::InvalidParameter(
                "index is full: internal id space exhausted".into(),
            ));
        }
        self.slots
            .set(id, stored)
            .map_err(|_| HnswError::Corrupt(format!("vector slot {id} published twice")))?;
        self.allocated.store(id + 1, Ordering::Release);
        rows.insert(row_id, id);
        Ok(id)
    }

    /// Re-create a persisted vector at its original id.
    pub(crate) fn restore(
        &self,
        id: u32,
        row_id: RowId,
        data: Vec<f32>,
        deleted: bool,
    ) -> Result<()> {
        self.check_dims(&data)?;
        let mut rows = self.rows.lock();
        let stored = StoredVector {
            row_id,
            data: data.into_boxed_slice(),
            flags: AtomicU8::new(if deleted { COMMITTED | DELETED } else { COMMITTED }),
            dirty: AtomicBool::new(false),
        };
        self.slots
            .set(id, stored)
            .map_err(|_| HnswError::Corrupt(format!("duplicate vector record for node {id}")))?;
        if !deleted || !rows.contains_key(&row_id) {
            rows.insert(row_id, id);
        }
        self.allocated.fetch_max(id + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Vector stored at `id`. O(1), lock-free.
    #[inline]
    pub fn get(&self, id: u32) -> Option<&[f32]> {
        self.slots.get(id).map(|v| &*v.data)
    }

    pub fn row_id(&self, id: u32) -> Option<RowId> {
        self.slots.get(id).map(|v| v.row_id)
    }

    /// Latest node indexing `row_id`, live or not.
    pub fn lookup(&self, row_id: RowId) -> Option<u32> {
        self.rows.lock().get(&row_id).copied()
    }

    /// Latest live node indexing `row_id`.
    pub fn lookup_live(&self, row_id: RowId) -> Option<u32> {
        self.lookup(row_id).filter(|&id| !self.is_deleted(id))
    }

    /// Set the tombstone flag. Storage is kept so ids stay stable for concurrent readers.
    /// Returns `true` if the flag changed.
    pub(crate) fn mark_deleted(&self, id: u32) -> bool {
        self.tombstone(id).is_some()
    }

    /// Set the tombstone flag. Returns `None` if it was already set (or the id is
    /// unknown), otherwise whether the node had been committed, i.e. was live.
    pub(crate) fn tombstone(&self, id: u32) -> Option<bool> {
        let v = self.slots.get(id)?;
        let prev = v.flags.fetch_or(DELETED, Ordering::AcqRel);
        if prev & DELETED != 0 {
            return None;
        }
        v.dirty.store(true, Ordering::Release);
        Some(prev & COMMITTED != 0)
    }

    /// Unknown ids count as deleted.
    #[inline]
    pub fn is_deleted(&self, id: u32) -> bool {
        self.slots
            .get(id)
            .map_or(true, |v| v.flags.load(Ordering::Acquire) & DELETED != 0)
    }

    /// Mark `id` fully linked. Returns `true` if the node became live (not deleted meanwhile).
    pub(crate) fn mark_committed(&self, id: u32) -> bool {
        match self.slots.get(id) {
            Some(v) => {
                let prev = v.flags.fetch_or(COMMITTED, Ordering::AcqRel);
                prev & (COMMITTED | DELETED) == 0
            }
            None => false,
        }
    }

    #[inline]
    pub fn is_committed(&self, id: u32) -> bool {
        self.slots
            .get(id)
            .is_some_and(|v| v.flags.load(Ordering::Acquire) & COMMITTED != 0)
    }

    /// Clear and return the dirty flag of `id`.
    pub(crate) fn take_dirty(&self, id: u32) -> bool {
        self.slots
            .get(id)
            .is_some_and(|v| v.dirty.swap(false, Ordering::AcqRel))
    }

    pub(crate) fn set_dirty(&self, id: u32) {
        if let Some(v) = self.slots.get(id) {
            v.dirty.store(true, Ordering::Release);
        }
    }

    /// Number of ids handed out so far. Every id below this value has a stored vector.
    #[inline]
    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        let vectors = self.allocated() as usize * self.dims * std::mem::size_of::<f32>();
        let rows = self.rows.lock().capacity() * (std::mem::size_of::<(RowId, u32)>() + 1);
        self.slots.reserved_bytes() + vectors + rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let store = VectorStore::new(3);
        let a = store.put(RowId(10), &[1.0, 2.0, 3.0]).unwrap();
        let b = store.put(RowId(11), &[4.0, 5.0, 6.0]).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(store.get(b), Some(&[4.0, 5.0, 6.0][..]));
        assert_eq!(store.row_id(a), Some(RowId(10)));
        assert_eq!(store.lookup(RowId(11)), Some(1));
        assert_eq!(store.allocated(), 2);
        assert!(store.get(2).is_none());
    }

    #[test]
    fn test_dimension_mismatch_allocates_nothing() {
        let store = VectorStore::new(128);
        let err = store.put(RowId(1), &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            HnswError::DimensionMismatch {
                expected: 128,
                actual: 3
            }
        ));
        assert_eq!(store.allocated(), 0);
        assert!(store.lookup(RowId(1)).is_none());
    }

    #[test]
    fn test_duplicate_live_row_rejected() {
        let store = VectorStore::new(2);
        store.put(RowId(7), &[0.0, 1.0]).unwrap();
        assert!(matches!(
            store.put(RowId(7), &[0.0, 2.0]),
            Err(HnswError::DuplicateRow(RowId(7)))
        ));
        assert_eq!(store.allocated(), 1);
    }

    #[test]
    fn test_reinsert_after_delete_gets_new_id() {
        let store = VectorStore::new(2);
        let first = store.put(RowId(7), &[0.0, 1.0]).unwrap();
        assert!(store.mark_deleted(first));
        assert!(!store.mark_deleted(first), "second delete is a no-op");
        let second = store.put(RowId(7), &[0.0, 2.0]).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.lookup_live(RowId(7)), Some(second));
        assert_eq!(store.get(first), Some(&[0.0, 1.0][..]), "tombstone keeps storage");
    }

    #[test]
    fn test_dirty_and_committed_flags() {
        let store = VectorStore::new(1);
        let id = store.put(RowId(1), &[0.5]).unwrap();
        assert!(!store.is_committed(id));
        assert!(store.mark_committed(id));
        assert!(store.is_committed(id));
        assert!(!store.mark_committed(id), "already committed");
        assert!(store.take_dirty(id));
        assert!(!store.take_dirty(id));
        assert_eq!(store.tombstone(id), Some(true));
        assert_eq!(store.tombstone(id), None);
        assert!(store.take_dirty(id));
    }

    #[test]
    fn test_deleted_before_commit_never_becomes_live() {
        let store = VectorStore::new(1);
        let id = store.put(RowId(1), &[0.5]).unwrap();
        assert_eq!(store.tombstone(id), Some(false));
        assert!(!store.mark_committed(id));
    }

    #[test]
    fn test_unknown_id_is_deleted() {
        let store = VectorStore::new(1);
        assert!(store.is_deleted(42));
        assert!(!store.mark_deleted(42));
    }

    #[test]
    fn test_row_id_block_offset() {
        let row = RowId::from_block_offset(12, 3);
        assert_eq!(row.block(), 12);
        assert_eq!(row.offset(), 3);
        assert_eq!(row.to_string(), "(12,3)");
    }
}
