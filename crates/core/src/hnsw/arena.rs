//! Append-only segmented arena addressed by dense `u32` ids.
//!
//! Segment `k` holds `BASE << k` write-once slots and is allocated the first time
//! an id inside it is published. Published values never move, so readers hold
//! plain `&T` borrows for the arena's lifetime without taking any lock.

use std::sync::OnceLock;

const BASE_SHIFT: u32 = 6;
const BASE: usize = 1 << BASE_SHIFT;
/// Enough segments to address every `u32` id.
const SEGMENTS: usize = 27;

pub(crate) struct AppendArena<T> {
    segments: Box<[OnceLock<Box<[OnceLock<T>]>>]>,
}

impl<T> AppendArena<T> {
    pub(crate) fn new() -> Self {
        Self {
            segments: (0..SEGMENTS).map(|_| OnceLock::new()).collect(),
        }
    }

    #[inline]
    fn locate(id: u32) -> (usize, usize) {
        let n = (id as usize >> BASE_SHIFT) + 1;
        let segment = (usize::BITS - 1 - n.leading_zeros()) as usize;
        let first = BASE * ((1 << segment) - 1);
        (segment, id as usize - first)
    }

    /// Returns the value published at `id`, if any.
    #[inline]
    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        let (segment, offset) = Self::locate(id);
        self.segments[segment].get()?.get(offset)?.get()
    }

    /// Publish `value` at `id`. Gives the value back if the slot was already taken.
    pub(crate) fn set(&self, id: u32, value: T) -> Result<(), T> {
        let (segment, offset) = Self::locate(id);
        let slots = self.segments[segment]
            .get_or_init(|| (0..BASE << segment).map(|_| OnceLock::new()).collect());
        slots[offset].set(value)
    }

    /// Bytes reserved by allocated segments, excluding heap data owned by `T`.
    pub(crate) fn reserved_bytes(&self) -> usize {
        self.segments
            .iter()
            .filter_map(|s| s.get())
            .map(|slots| slots.len() * std::mem::size_of::<OnceLock<T>>())
            .sum()
    }
}
