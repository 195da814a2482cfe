use std::cmp::Ordering;

use crate::{Error, GrowableArray, GrowthPolicy, Result};

/// One free segment as seen by the [`GapIndex`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct GapEntry {
    /// Size of the free segment in bytes. Primary sort key.
    pub(crate) size: usize,

    /// Byte offset of the free segment inside the pool buffer. Secondary sort key.
    ///
    /// A free segment is always removed from the index before its offset or size changes,
    /// so the cached value cannot go stale.
    pub(crate) offset: usize,

    /// Index of the node in the node store that describes the free segment.
    pub(crate) node: usize,
}

impl GapEntry {
    fn sort_key(&self) -> (usize, usize) {
        (self.size, self.offset)
    }
}

impl Ord for GapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for GapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Size-ordered index over the free segments of a pool.
///
/// Entries are sorted ascending by size and, among equal sizes, ascending by offset. Because
/// of this order the first entry that is large enough for a request is also the smallest
/// entry that is large enough, so first-fit and best-fit searches over the index coincide.
#[derive(Debug)]
pub(crate) struct GapIndex {
    entries: GrowableArray<GapEntry>,
}

impl GapIndex {
    pub(crate) fn new(policy: GrowthPolicy) -> Result<Self> {
        Ok(Self {
            entries: GrowableArray::with_policy(policy, "gap index")?,
        })
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    #[cfg(test)]
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.entries.set_capacity(capacity);
    }

    /// Makes sure the next [`insert()`](Self::insert) cannot fail.
    pub(crate) fn reserve_one(&mut self) -> Result<()> {
        self.entries.reserve_one().map_err(|_oom| Error::IndexFull)
    }

    /// Adds a free segment to the index.
    pub(crate) fn insert(&mut self, size: usize, offset: usize, node: usize) -> Result<()> {
        let mut index = self
            .entries
            .push(GapEntry { size, offset, node })
            .map_err(|_oom| Error::IndexFull)?;

        // Only the new tail entry can be out of order, so a single bubble-up pass suffices.
        while index > 0 {
            // Cannot wrap because index > 0.
            let previous = index.wrapping_sub(1);

            let out_of_order = matches!(
                (self.entries.get(index), self.entries.get(previous)),
                (Some(current), Some(before)) if current < before
            );

            if !out_of_order {
                break;
            }

            self.entries.swap(index, previous);
            index = previous;
        }

        Ok(())
    }

    /// Removes the entry that refers to `node`.
    ///
    /// The size is used as a hint to skip every entry of a smaller size. Sizes may repeat, so
    /// the node index is what identifies the entry.
    pub(crate) fn remove(&mut self, size: usize, node: usize) -> Result<GapEntry> {
        let entries = self.entries.as_slice();
        let start = entries.partition_point(|entry| entry.size < size);

        let position = entries
            .iter()
            .enumerate()
            .skip(start)
            .take_while(|(_, entry)| entry.size == size)
            .find_map(|(position, entry)| (entry.node == node).then_some(position))
            .ok_or(Error::EntryNotFound { size, node })?;

        Ok(self.entries.remove(position))
    }

    /// Returns the first entry in index order that can hold `min_size` bytes.
    #[must_use]
    pub(crate) fn find_first_fit(&self, min_size: usize) -> Option<GapEntry> {
        self.entries
            .iter()
            .find(|entry| entry.size >= min_size)
            .copied()
    }

    /// Returns the smallest entry that can hold `min_size` bytes, lowest offset first among
    /// entries of equal size.
    #[must_use]
    pub(crate) fn find_best_fit(&self, min_size: usize) -> Option<GapEntry> {
        let entries = self.entries.as_slice();
        let position = entries.partition_point(|entry| entry.size < min_size);

        entries.get(position).copied()
    }

    /// Size of the largest gap, if there are any gaps.
    #[must_use]
    pub(crate) fn largest(&self) -> Option<usize> {
        self.entries.as_slice().last().map(|entry| entry.size)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &GapEntry> {
        self.entries.iter()
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn integrity_check(&self) {
        let entries = self.entries.as_slice();

        for pair in entries.windows(2) {
            if let [before, after] = pair {
                assert!(
                    before < after,
                    "gap index out of order: {before:?} is not before {after:?}"
                );
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    fn index() -> GapIndex {
        GapIndex::new(GrowthPolicy::with_initial_capacity(nz!(4))).unwrap()
    }

    fn sizes(index: &GapIndex) -> Vec<usize> {
        index.iter().map(|entry| entry.size).collect()
    }

    #[test]
    fn insert_keeps_size_order() {
        let mut index = index();

        index.insert(300, 0, 0).unwrap();
        index.insert(100, 400, 1).unwrap();
        index.insert(200, 700, 2).unwrap();
        index.insert(50, 1000, 3).unwrap();

        assert_eq!(sizes(&index), vec![50, 100, 200, 300]);
        index.integrity_check();
    }

    #[test]
    fn equal_sizes_order_by_offset() {
        let mut index = index();

        index.insert(64, 512, 0).unwrap();
        index.insert(64, 128, 1).unwrap();
        index.insert(64, 256, 2).unwrap();

        let offsets: Vec<_> = index.iter().map(|entry| entry.offset).collect();
        assert_eq!(offsets, vec![128, 256, 512]);
    }

    #[test]
    fn insert_grows_past_initial_capacity() {
        let mut index = index();

        for node in 0..32 {
            index.insert(1000 - node * 10, node * 1000, node).unwrap();
        }

        assert_eq!(index.len(), 32);
        assert!(index.capacity() >= 32);
        index.integrity_check();
    }

    #[test]
    fn remove_by_node_among_equal_sizes() {
        let mut index = index();

        index.insert(64, 0, 10).unwrap();
        index.insert(64, 100, 11).unwrap();
        index.insert(64, 200, 12).unwrap();

        let removed = index.remove(64, 11).unwrap();
        assert_eq!(removed.node, 11);
        assert_eq!(removed.offset, 100);

        let nodes: Vec<_> = index.iter().map(|entry| entry.node).collect();
        assert_eq!(nodes, vec![10, 12]);
    }

    #[test]
    fn remove_preserves_order() {
        let mut index = index();

        for (node, size) in [5_usize, 1, 4, 2, 3].into_iter().enumerate() {
            index.insert(size, node * 10, node).unwrap();
        }

        index.remove(3, 4).unwrap();

        assert_eq!(sizes(&index), vec![1, 2, 4, 5]);
        index.integrity_check();
    }

    #[test]
    fn remove_missing_entry_fails() {
        let mut index = index();
        index.insert(64, 0, 1).unwrap();

        assert_eq!(
            index.remove(64, 2),
            Err(Error::EntryNotFound { size: 64, node: 2 })
        );

        // A wrong size hint does not find the entry either.
        assert_eq!(
            index.remove(32, 1),
            Err(Error::EntryNotFound { size: 32, node: 1 })
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn first_fit_and_best_fit_agree() {
        let mut index = index();

        index.insert(400, 600, 0).unwrap();
        index.insert(50, 0, 1).unwrap();
        index.insert(200, 100, 2).unwrap();

        for request in [1, 50, 51, 60, 200, 201, 400] {
            assert_eq!(
                index.find_first_fit(request),
                index.find_best_fit(request),
                "request {request}"
            );
        }

        assert_eq!(index.find_best_fit(60).unwrap().size, 200);
        assert!(index.find_best_fit(401).is_none());
        assert!(index.find_first_fit(401).is_none());
    }

    #[test]
    fn largest_is_last_entry() {
        let mut index = index();
        assert_eq!(index.largest(), None);

        index.insert(10, 0, 0).unwrap();
        index.insert(30, 10, 1).unwrap();
        index.insert(20, 40, 2).unwrap();

        assert_eq!(index.largest(), Some(30));
    }
}
