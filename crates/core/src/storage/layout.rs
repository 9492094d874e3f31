//! Byte layout of the persisted index.
//!
//! All integers inside records are little-endian. Node ids inside keys are
//! big-endian so that a prefix scan returns records in id order.
//!
//! ```text
//! "H"                    header       magic u32, version u32, dims u32, metric u8,
//!                                     selection u8, m u16, efbuild u16, efsearch u16,
//!                                     entry_node u32, entry_layer u8, reserved u8,
//!                                     node_count u32, seed u64
//! "V" id:u32be           vector       row_id u64, top_layer u8, deleted u8, dims x f32
//! "A" layer:u8 id:u32be  adjacency    count u16, count x u32
//! ```

use crate::config;
use crate::error::{HnswError, Result};
use crate::hnsw::distance::DistanceMetric;
use crate::hnsw::graph::EntryPoint;
use crate::hnsw::vectors::RowId;
use crate::options::{IndexOptions, NeighborSelection};

pub const HEADER_KEY: &[u8] = b"H";
pub const VECTOR_PREFIX: u8 = b'V';
pub const ADJACENCY_PREFIX: u8 = b'A';

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 38;

/// Marks "no entry point" in the header.
const NO_ENTRY: u32 = u32::MAX;

/// Index-wide header record.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub options: IndexOptions,
    pub entry: Option<EntryPoint>,
    /// Number of nodes covered by the vector records, i.e. ids `0..node_count`.
    pub node_count: u32,
}

impl Header {
    pub fn encode(&self) -> Vec<u8> {
        let o = &self.options;
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&config::HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(&config::LAYOUT_VERSION.to_le_bytes());
        out.extend_from_slice(&(o.dims as u32).to_le_bytes());
        out.push(o.metric.tag());
        out.push(o.selection.tag());
        out.extend_from_slice(&(o.m as u16).to_le_bytes());
        out.extend_from_slice(&(o.ef_build as u16).to_le_bytes());
        out.extend_from_slice(&(o.ef_search as u16).to_le_bytes());
        let (node, layer) = match self.entry {
            Some(e) => (e.node, e.layer as u8),
            None => (NO_ENTRY, 0),
        };
        out.extend_from_slice(&node.to_le_bytes());
        out.push(layer);
        out.push(0);
        out.extend_from_slice(&self.node_count.to_le_bytes());
        out.extend_from_slice(&o.seed.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(HnswError::Corrupt(format!(
                "header is {} bytes, expected {HEADER_LEN}",
                bytes.len()
            )));
        }
        let mut r = Reader::new(bytes);
        let magic = r.u32()?;
        if magic != config::HEADER_MAGIC {
            return Err(HnswError::Corrupt(format!("bad header magic {magic:#010x}")));
        }
        let version = r.u32()?;
        if version != config::LAYOUT_VERSION {
            return Err(HnswError::Corrupt(format!(
                "unsupported layout version {version}"
            )));
        }
        let dims = r.u32()? as usize;
        let metric_tag = r.u8()?;
        let metric = DistanceMetric::from_tag(metric_tag)
            .ok_or_else(|| HnswError::Corrupt(format!("unknown metric tag {metric_tag}")))?;
        let selection_tag = r.u8()?;
        let selection = NeighborSelection::from_tag(selection_tag).ok_or_else(|| {
            HnswError::Corrupt(format!("unknown selection tag {selection_tag}"))
        })?;
        let m = r.u16()? as usize;
        let ef_build = r.u16()? as usize;
        let ef_search = r.u16()? as usize;
        let entry_node = r.u32()?;
        let entry_layer = r.u8()? as usize;
        let _reserved = r.u8()?;
        let node_count = r.u32()?;
        let seed = r.u64()?;

        let options = IndexOptions {
            m,
            ef_build,
            ef_search,
            dims,
            metric,
            selection,
            seed,
        };
        let entry = (entry_node != NO_ENTRY).then_some(EntryPoint {
            node: entry_node,
            layer: entry_layer,
        });
        Ok(Self {
            options,
            entry,
            node_count,
        })
    }
}

/// One stored vector with its node attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub row_id: RowId,
    pub top_layer: u8,
    pub deleted: bool,
    pub data: Vec<f32>,
}

impl VectorRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.data.len() * 4);
        out.extend_from_slice(&self.row_id.0.to_le_bytes());
        out.push(self.top_layer);
        out.push(self.deleted as u8);
        for x in &self.data {
            out.extend_from_slice(&x.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8], dims: usize) -> Result<Self> {
        let expected = 10 + dims * 4;
        if bytes.len() != expected {
            return Err(HnswError::Corrupt(format!(
                "vector record is {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let mut r = Reader::new(bytes);
        let row_id = RowId(r.u64()?);
        let top_layer = r.u8()?;
        let deleted = match r.u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(HnswError::Corrupt(format!("bad tombstone byte {other}")));
            }
        };
        let data = (0..dims).map(|_| r.f32()).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            row_id,
            top_layer,
            deleted,
            data,
        })
    }
}

pub fn encode_adjacency(ids: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + ids.len() * 4);
    out.extend_from_slice(&(ids.len() as u16).to_le_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

pub fn decode_adjacency(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut r = Reader::new(bytes);
    let count = r.u16()? as usize;
    if bytes.len() != 2 + count * 4 {
        return Err(HnswError::Corrupt(format!(
            "adjacency record claims {count} ids in {} bytes",
            bytes.len()
        )));
    }
    (0..count).map(|_| r.u32()).collect()
}

pub fn vector_key(id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(VECTOR_PREFIX);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub fn adjacency_key(layer: usize, id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(6);
    key.push(ADJACENCY_PREFIX);
    key.push(layer as u8);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub fn parse_vector_key(key: &[u8]) -> Option<u32> {
    match key {
        [VECTOR_PREFIX, a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

/// Returns `(layer, id)`.
pub fn parse_adjacency_key(key: &[u8]) -> Option<(usize, u32)> {
    match key {
        [ADJACENCY_PREFIX, layer, a, b, c, d] => {
            Some((*layer as usize, u32::from_be_bytes([*a, *b, *c, *d])))
        }
        _ => None,
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| HnswError::Corrupt(format!("record truncated at byte {}", self.pos)))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }
}
