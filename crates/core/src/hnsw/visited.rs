//! Per-traversal visited marks over internal node ids.
//!
//! Each node id owns one `u16` stamp. A traversal starts by bumping the
//! current epoch, so marks from earlier traversals expire without touching
//! the array; the array is only zeroed when the epoch wraps. Node ids keep
//! growing while traversals run, so marking an id past the end grows the
//! array instead of failing.

#[derive(Debug)]
pub struct VisitedSet {
    stamps: Vec<u16>,
    /// Stamp meaning "seen in the current traversal"; never 0.
    epoch: u16,
}

impl VisitedSet {
    pub fn with_capacity(nodes: usize) -> Self {
        Self {
            stamps: vec![0; nodes],
            epoch: 1,
        }
    }

    /// Make room for ids `0..nodes` up front.
    pub fn reserve_nodes(&mut self, nodes: usize) {
        if nodes > self.stamps.len() {
            self.stamps.resize(nodes, 0);
        }
    }

    /// Start a new traversal; every id becomes unvisited.
    pub fn begin(&mut self) {
        self.epoch = match self.epoch.checked_add(1) {
            Some(next) => next,
            None => {
                self.stamps.fill(0);
                1
            }
        };
    }

    /// Marks `id`; `false` if it was already marked in this traversal.
    #[inline]
    pub fn visit(&mut self, id: u32) -> bool {
        let slot = id as usize;
        if slot >= self.stamps.len() {
            self.reserve_nodes((slot + 1).next_power_of_two());
        }
        let stamp = &mut self.stamps[slot];
        if *stamp == self.epoch {
            return false;
        }
        *stamp = self.epoch;
        true
    }

    pub fn is_visited(&self, id: u32) -> bool {
        self.stamps
            .get(id as usize)
            .is_some_and(|&s| s == self.epoch)
    }
}

impl Default for VisitedSet {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_expire_with_each_traversal() {
        let mut seen = VisitedSet::with_capacity(8);
        seen.begin();
        assert!(seen.visit(3));
        assert!(!seen.visit(3));
        assert!(seen.is_visited(3));
        assert!(!seen.is_visited(4));

        seen.begin();
        assert!(!seen.is_visited(3));
        assert!(seen.visit(3));
    }

    #[test]
    fn test_ids_appended_mid_traversal() {
        let mut seen = VisitedSet::default();
        seen.begin();
        assert!(!seen.is_visited(500));
        assert!(seen.visit(500));
        assert!(seen.stamps.len() > 500);
        assert!(seen.is_visited(500));
        assert!(seen.visit(499));
    }

    #[test]
    fn test_epoch_wrap_zeroes_stamps() {
        let mut seen = VisitedSet::with_capacity(4);
        seen.epoch = u16::MAX;
        assert!(seen.visit(2));

        seen.begin();
        assert_eq!(seen.epoch, 1);
        assert!(seen.stamps.iter().all(|&s| s == 0));
        assert!(seen.visit(2));
    }
}
