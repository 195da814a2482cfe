use std::num::NonZero;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use new_zealand::nz;
use tracing::{debug, trace};

use crate::{
    AllocPolicy, Allocation, BackingBuffer, DropPolicy, Error, GapIndex, GrowthPolicy, NodeStore,
    Result, Segment, SegmentNode, SegmentPoolBuilder,
};

/// Initial number of node slots for a pool, unless configured otherwise.
pub const DEFAULT_NODE_STORE_CAPACITY: NonZero<usize> = nz!(40);

/// Initial number of gap index entries for a pool, unless configured otherwise.
pub const DEFAULT_GAP_INDEX_CAPACITY: NonZero<usize> = nz!(40);

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique pool ID.
fn generate_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A fixed-size byte arena that hands out variable-size allocations.
///
/// The pool obtains one buffer of the configured capacity when it is built and carves it into
/// segments, each of which is either in use by an allocation or free (a gap). Allocation
/// splits a gap and deallocation merges the freed segment with free neighbors, so two adjacent
/// gaps never exist between operations.
///
/// Where an allocation is placed is governed by the [`AllocPolicy`] of the pool.
///
/// # Handles
///
/// Allocations are identified by [`Allocation`] handles. A handle is only accepted by the pool
/// that issued it and only until it has been deallocated once. Invalid handles are rejected
/// with [`Error::InvalidHandle`] instead of corrupting the pool.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segment_pool::SegmentPool;
///
/// let mut pool = SegmentPool::builder().capacity(nz!(1000)).build().unwrap();
///
/// let a = pool.allocate(nz!(100)).unwrap();
/// let b = pool.allocate(nz!(200)).unwrap();
/// assert_eq!(b.offset(), 100);
///
/// pool.bytes_mut(&a).unwrap().fill(0xAB);
/// assert!(pool.bytes(&a).unwrap().iter().all(|byte| *byte == 0xAB));
///
/// pool.deallocate(a).unwrap();
/// pool.deallocate(b).unwrap();
///
/// assert!(pool.ensure_idle().is_ok());
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
pub struct SegmentPool {
    /// Distinguishes the handles of this pool from those of every other pool.
    pool_id: u64,

    policy: AllocPolicy,
    drop_policy: DropPolicy,

    total_size: usize,

    /// Sum of the sizes of all used segments.
    alloc_size: usize,

    /// Number of used segments.
    num_allocs: usize,

    /// Number of free segments. Always equal to the number of gap index entries.
    num_gaps: usize,

    buffer: BackingBuffer,
    nodes: NodeStore,
    gaps: GapIndex,
}

impl SegmentPool {
    /// Starts building a new pool.
    ///
    /// See [`SegmentPoolBuilder`] for the available settings.
    #[inline]
    pub fn builder() -> SegmentPoolBuilder {
        SegmentPoolBuilder::new()
    }

    pub(crate) fn new_inner(
        capacity: NonZero<usize>,
        policy: AllocPolicy,
        node_growth: GrowthPolicy,
        gap_growth: GrowthPolicy,
        drop_policy: DropPolicy,
    ) -> Result<Self> {
        let buffer = BackingBuffer::new(capacity)?;
        let mut nodes = NodeStore::new(node_growth)?;
        let mut gaps = GapIndex::new(gap_growth)?;

        // The whole buffer starts out as a single gap.
        let head = nodes.acquire_free_slot(SegmentNode::unlinked(0, capacity.get(), false))?;
        nodes.link_as_head(head);
        gaps.insert(capacity.get(), 0, head)?;

        let pool_id = generate_pool_id();

        debug!(pool_id, capacity = capacity.get(), %policy, "opened pool");

        Ok(Self {
            pool_id,
            policy,
            drop_policy,
            total_size: capacity.get(),
            alloc_size: 0,
            num_allocs: 0,
            num_gaps: 1,
            buffer,
            nodes,
            gaps,
        })
    }

    /// Size of the pool buffer in bytes.
    #[must_use]
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of bytes currently handed out to allocations.
    #[must_use]
    #[inline]
    pub fn alloc_size(&self) -> usize {
        self.alloc_size
    }

    /// Number of live allocations.
    #[must_use]
    #[inline]
    pub fn num_allocs(&self) -> usize {
        self.num_allocs
    }

    /// Number of free segments.
    #[must_use]
    #[inline]
    pub fn num_gaps(&self) -> usize {
        self.num_gaps
    }

    /// How the pool chooses a gap for each allocation.
    #[must_use]
    #[inline]
    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// What happens if the pool is dropped while allocations are still live.
    #[must_use]
    #[inline]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// Whether the pool has no live allocations and consists of a single gap.
    #[must_use]
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.num_allocs == 0 && self.num_gaps == 1
    }

    /// Allocates `size` bytes from the pool.
    ///
    /// The gap to allocate from is chosen according to the [`AllocPolicy`] of the pool. The
    /// allocation starts at the beginning of that gap; any remainder stays free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientSpace`] if no gap is large enough. Returns
    /// [`Error::OutOfMemory`] or [`Error::IndexFull`] if the bookkeeping storage needs to grow
    /// and cannot. The pool is unchanged after any error.
    pub fn allocate(&mut self, size: NonZero<usize>) -> Result<Allocation> {
        let requested = size.get();

        if self.num_gaps == 0 {
            return Err(self.insufficient_space(requested));
        }

        let selected = match self.policy {
            AllocPolicy::FirstFit => self
                .nodes
                .iter_list()
                .find(|(_, node)| !node.allocated && node.size >= requested)
                .map(|(index, _)| index),
            AllocPolicy::BestFit => {
                let entry = self.gaps.find_best_fit(requested);

                // The size order of the index makes the first sufficient entry the smallest.
                debug_assert_eq!(entry, self.gaps.find_first_fit(requested));

                entry.map(|entry| entry.node)
            }
        };

        let Some(selected) = selected else {
            return Err(self.insufficient_space(requested));
        };

        let gap = *self.nodes.node(selected);

        // Cannot underflow because the selected gap is at least as large as the request.
        let remainder = gap.size.wrapping_sub(requested);

        if remainder > 0 {
            self.nodes.reserve_one()?;
            self.gaps.reserve_one()?;
        }

        self.gaps.remove(gap.size, selected)?;

        {
            let node = self.nodes.node_mut(selected);
            node.allocated = true;
            node.size = requested;
        }

        if remainder > 0 {
            // Cannot overflow because the remainder ends where the gap ended.
            let remainder_offset = gap.offset.wrapping_add(requested);

            let remainder_node = self
                .nodes
                .acquire_free_slot(SegmentNode::unlinked(remainder_offset, remainder, false))
                .expect("node store capacity was reserved before any mutation");

            self.nodes.insert_after(selected, remainder_node);

            self.gaps
                .insert(remainder, remainder_offset, remainder_node)
                .expect("gap index capacity was reserved before any mutation");
        } else {
            // Cannot underflow because the selected gap was counted.
            self.num_gaps = self.num_gaps.wrapping_sub(1);
        }

        // Cannot overflow because both are bounded by the number of bytes in the pool.
        self.num_allocs = self.num_allocs.wrapping_add(1);
        self.alloc_size = self.alloc_size.wrapping_add(requested);

        let generation = self
            .nodes
            .generation(selected)
            .expect("the selected node slot is occupied");

        trace!(
            pool_id = self.pool_id,
            offset = gap.offset,
            size = requested,
            "allocated"
        );

        #[cfg(debug_assertions)]
        self.integrity_check();

        Ok(Allocation {
            pool_id: self.pool_id,
            node: selected,
            generation,
            offset: gap.offset,
            size: requested,
        })
    }

    /// Returns an allocation to the pool.
    ///
    /// The freed segment is merged with any free neighbors, first the one after it and then
    /// the one before it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the allocation was not made by this pool or has
    /// already been deallocated. Returns [`Error::IndexFull`] if the gap index needs to grow
    /// and cannot. The pool is unchanged after any error.
    pub fn deallocate(&mut self, allocation: Allocation) -> Result<()> {
        let index = self.validate(&allocation)?;

        // Merging can only shrink the index, so one free entry is enough for the survivor.
        self.gaps.reserve_one()?;

        self.nodes.node_mut(index).allocated = false;
        self.nodes.bump_generation(index);

        // Cannot underflow because the allocation was counted when it was made.
        self.num_allocs = self.num_allocs.wrapping_sub(1);
        self.alloc_size = self.alloc_size.wrapping_sub(allocation.size);

        // Cannot overflow because every gap is a distinct segment of the pool.
        self.num_gaps = self.num_gaps.wrapping_add(1);

        let mut survivor = index;

        if let Some(next) = self.nodes.node(survivor).next {
            let next_node = *self.nodes.node(next);

            if !next_node.allocated {
                self.gaps
                    .remove(next_node.size, next)
                    .expect("every free segment has a gap index entry");

                let node = self.nodes.node_mut(survivor);
                // Cannot overflow because both segments lie within the pool.
                node.size = node.size.wrapping_add(next_node.size);

                self.nodes.unlink(next);
                self.nodes.release_slot(next);

                // Cannot underflow because two gaps were counted and one remains.
                self.num_gaps = self.num_gaps.wrapping_sub(1);
            }
        }

        if let Some(prev) = self.nodes.node(survivor).prev {
            let prev_node = *self.nodes.node(prev);

            if !prev_node.allocated {
                self.gaps
                    .remove(prev_node.size, prev)
                    .expect("every free segment has a gap index entry");

                let absorbed = self.nodes.node(survivor).size;
                let node = self.nodes.node_mut(prev);
                // Cannot overflow because both segments lie within the pool.
                node.size = node.size.wrapping_add(absorbed);

                self.nodes.unlink(survivor);
                self.nodes.release_slot(survivor);

                // Cannot underflow because two gaps were counted and one remains.
                self.num_gaps = self.num_gaps.wrapping_sub(1);

                survivor = prev;
            }
        }

        let merged = *self.nodes.node(survivor);

        self.gaps
            .insert(merged.size, merged.offset, survivor)
            .expect("gap index capacity was reserved before any mutation");

        trace!(
            pool_id = self.pool_id,
            offset = allocation.offset,
            size = allocation.size,
            gap_offset = merged.offset,
            gap_size = merged.size,
            "deallocated"
        );

        #[cfg(debug_assertions)]
        self.integrity_check();

        Ok(())
    }

    /// Returns a snapshot of every segment of the pool in address order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the snapshot cannot be allocated.
    pub fn inspect(&self) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();

        segments
            .try_reserve_exact(self.nodes.used_slots())
            .map_err(|_reserve_error| Error::OutOfMemory {
                what: "segment snapshot",
            })?;

        segments.extend(
            self.nodes
                .iter_list()
                .map(|(_, node)| Segment::new(node.offset, node.size, node.allocated)),
        );

        Ok(segments)
    }

    /// Checks that the pool can be closed without losing anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFreed`] if any allocation is still live or the pool is not a single
    /// gap.
    pub fn ensure_idle(&self) -> Result<()> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(Error::NotFreed {
                num_allocs: self.num_allocs,
                num_gaps: self.num_gaps,
            })
        }
    }

    /// The bytes of a live allocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the allocation is not live in this pool.
    pub fn bytes(&self, allocation: &Allocation) -> Result<&[u8]> {
        self.validate(allocation)?;

        Ok(self.buffer.slice(allocation.offset, allocation.size))
    }

    /// The bytes of a live allocation, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the allocation is not live in this pool.
    pub fn bytes_mut(&mut self, allocation: &Allocation) -> Result<&mut [u8]> {
        self.validate(allocation)?;

        Ok(self.buffer.slice_mut(allocation.offset, allocation.size))
    }

    pub(crate) fn id(&self) -> u64 {
        self.pool_id
    }

    /// Resolves an allocation handle to the slot of its node, if the handle is live.
    fn validate(&self, allocation: &Allocation) -> Result<usize> {
        if allocation.pool_id != self.pool_id {
            return Err(Error::InvalidHandle);
        }

        if self.nodes.generation(allocation.node) != Some(allocation.generation) {
            return Err(Error::InvalidHandle);
        }

        match self.nodes.get(allocation.node) {
            Some(node)
                if node.allocated
                    && node.offset == allocation.offset
                    && node.size == allocation.size =>
            {
                Ok(allocation.node)
            }
            _ => Err(Error::InvalidHandle),
        }
    }

    fn insufficient_space(&self, requested: usize) -> Error {
        Error::InsufficientSpace {
            requested,
            largest_gap: self.gaps.largest().unwrap_or(0),
        }
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn integrity_check(&self) {
        self.nodes.integrity_check();
        self.gaps.integrity_check();

        // Number of gap index entries that refer to each node slot.
        let mut entries_per_slot = vec![0_usize; self.nodes.total_slots()];

        for entry in self.gaps.iter() {
            let count = entries_per_slot.get_mut(entry.node).unwrap_or_else(|| {
                panic!("gap index entry {entry:?} refers to an out-of-bounds node slot")
            });
            *count = count.wrapping_add(1);
        }

        let mut expected_offset: usize = 0;
        let mut free_segments: usize = 0;
        let mut used_segments: usize = 0;
        let mut used_bytes: usize = 0;
        let mut previous_was_free = false;

        for (index, node) in self.nodes.iter_list() {
            assert_eq!(
                node.offset, expected_offset,
                "segment in slot {index} starts at {} but the previous segment ends at {expected_offset}",
                node.offset
            );
            assert!(node.size > 0, "segment in slot {index} is empty");

            if node.allocated {
                used_segments = used_segments.wrapping_add(1);
                used_bytes = used_bytes.wrapping_add(node.size);
                previous_was_free = false;
            } else {
                assert!(
                    !previous_was_free,
                    "free segment in slot {index} at offset {} was not merged with its free predecessor",
                    node.offset
                );

                let entries = entries_per_slot.get(index).copied().unwrap_or(0);

                assert_eq!(
                    entries, 1,
                    "free segment in slot {index} has {entries} gap index entries"
                );

                free_segments = free_segments.wrapping_add(1);
                previous_was_free = true;
            }

            expected_offset = node.end();
        }

        assert_eq!(
            expected_offset, self.total_size,
            "segments cover {expected_offset} bytes of a {} byte pool",
            self.total_size
        );
        assert_eq!(free_segments, self.num_gaps, "gap count is out of sync");
        assert_eq!(self.gaps.len(), self.num_gaps, "gap index size is out of sync");
        assert_eq!(used_segments, self.num_allocs, "allocation count is out of sync");
        assert_eq!(used_bytes, self.alloc_size, "allocated byte count is out of sync");

        for entry in self.gaps.iter() {
            let node = self.nodes.get(entry.node).unwrap_or_else(|| {
                panic!("gap index entry {entry:?} refers to a vacant node slot")
            });

            assert!(
                !node.allocated,
                "gap index entry {entry:?} refers to a used segment"
            );
            assert_eq!(
                (node.size, node.offset),
                (entry.size, entry.offset),
                "gap index entry {entry:?} is stale"
            );
        }
    }
}

impl Drop for SegmentPool {
    fn drop(&mut self) {
        debug!(
            pool_id = self.pool_id,
            num_allocs = self.num_allocs,
            "dropping pool"
        );

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropAllocations)
        {
            assert!(
                self.num_allocs == 0,
                "dropped a SegmentPool with {} live allocations - this is forbidden by DropPolicy::MustNotDropAllocations",
                self.num_allocs
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::fmt::Debug;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(SegmentPool: Send, Debug);
    assert_not_impl_any!(SegmentPool: Sync);

    fn pool(capacity: NonZero<usize>, policy: AllocPolicy) -> SegmentPool {
        SegmentPool::builder()
            .capacity(capacity)
            .policy(policy)
            .build()
            .unwrap()
    }

    fn layout(pool: &SegmentPool) -> Vec<(usize, usize, bool)> {
        pool.inspect()
            .unwrap()
            .iter()
            .map(|segment| (segment.offset(), segment.size(), segment.is_allocated()))
            .collect()
    }

    fn gap_sizes(pool: &SegmentPool) -> Vec<usize> {
        let mut sizes: Vec<_> = pool
            .inspect()
            .unwrap()
            .iter()
            .filter(|segment| !segment.is_allocated())
            .map(Segment::size)
            .collect();
        sizes.sort_unstable();
        sizes
    }

    #[test]
    fn new_pool_is_one_gap() {
        let pool = pool(nz!(1000), AllocPolicy::FirstFit);

        assert_eq!(pool.total_size(), 1000);
        assert_eq!(pool.alloc_size(), 0);
        assert_eq!(pool.num_allocs(), 0);
        assert_eq!(pool.num_gaps(), 1);
        assert!(pool.is_idle());
        assert_eq!(layout(&pool), vec![(0, 1000, false)]);
        pool.integrity_check();
    }

    #[test]
    fn pool_ids_are_unique() {
        let a = pool(nz!(10), AllocPolicy::FirstFit);
        let b = pool(nz!(10), AllocPolicy::FirstFit);

        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn split_then_fill_exactly() {
        let mut pool = pool(nz!(1000), AllocPolicy::FirstFit);

        let a = pool.allocate(nz!(100)).unwrap();
        let b = pool.allocate(nz!(200)).unwrap();
        let c = pool.allocate(nz!(300)).unwrap();

        assert_eq!((a.offset(), b.offset(), c.offset()), (0, 100, 300));
        assert_eq!(pool.num_allocs(), 3);
        assert_eq!(pool.alloc_size(), 600);
        assert_eq!(pool.num_gaps(), 1);
        assert_eq!(
            layout(&pool),
            vec![
                (0, 100, true),
                (100, 200, true),
                (300, 300, true),
                (600, 400, false)
            ]
        );

        // An exact fit consumes the last gap.
        let d = pool.allocate(nz!(400)).unwrap();
        assert_eq!(d.offset(), 600);
        assert_eq!(pool.num_gaps(), 0);
        assert_eq!(pool.alloc_size(), 1000);
        pool.integrity_check();
    }

    #[test]
    fn full_pool_reports_insufficient_space() {
        let mut pool = pool(nz!(64), AllocPolicy::FirstFit);

        let _all = pool.allocate(nz!(64)).unwrap();

        assert_eq!(
            pool.allocate(nz!(1)),
            Err(Error::InsufficientSpace {
                requested: 1,
                largest_gap: 0
            })
        );
    }

    #[test]
    fn too_large_request_reports_largest_gap() {
        let mut pool = pool(nz!(100), AllocPolicy::BestFit);

        let _a = pool.allocate(nz!(30)).unwrap();

        assert_eq!(
            pool.allocate(nz!(71)),
            Err(Error::InsufficientSpace {
                requested: 71,
                largest_gap: 70
            })
        );
        assert_eq!(pool.num_allocs(), 1);
        assert_eq!(pool.num_gaps(), 1);
        pool.integrity_check();
    }

    #[test]
    fn freed_segment_between_used_ones_stays_separate() {
        let mut pool = pool(nz!(1000), AllocPolicy::FirstFit);

        let _a = pool.allocate(nz!(100)).unwrap();
        let b = pool.allocate(nz!(200)).unwrap();
        let _c = pool.allocate(nz!(300)).unwrap();

        pool.deallocate(b).unwrap();

        assert_eq!(pool.num_gaps(), 2);
        assert_eq!(pool.num_allocs(), 2);
        assert_eq!(pool.alloc_size(), 400);
        assert_eq!(gap_sizes(&pool), vec![200, 400]);
        pool.integrity_check();
    }

    #[test]
    fn freed_segment_merges_with_free_successor() {
        let mut pool = pool(nz!(1000), AllocPolicy::FirstFit);

        let a = pool.allocate(nz!(100)).unwrap();
        let b = pool.allocate(nz!(200)).unwrap();
        let _c = pool.allocate(nz!(300)).unwrap();

        pool.deallocate(b).unwrap();
        pool.deallocate(a).unwrap();

        assert_eq!(pool.num_gaps(), 2);
        assert_eq!(gap_sizes(&pool), vec![300, 400]);
        assert_eq!(
            layout(&pool),
            vec![(0, 300, false), (300, 300, true), (600, 400, false)]
        );
        pool.integrity_check();
    }

    #[test]
    fn freed_segment_merges_with_both_neighbors() {
        let mut pool = pool(nz!(1000), AllocPolicy::FirstFit);

        let a = pool.allocate(nz!(100)).unwrap();
        let b = pool.allocate(nz!(200)).unwrap();
        let c = pool.allocate(nz!(300)).unwrap();
        let _d = pool.allocate(nz!(400)).unwrap();

        pool.deallocate(a).unwrap();
        pool.deallocate(c).unwrap();
        assert_eq!(pool.num_gaps(), 2);

        pool.deallocate(b).unwrap();

        assert_eq!(pool.num_gaps(), 1);
        assert_eq!(
            layout(&pool),
            vec![(0, 600, false), (600, 400, true)]
        );
        pool.integrity_check();
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_gap() {
        let mut pool = pool(nz!(500), AllocPolicy::BestFit);

        let a = pool.allocate(nz!(50)).unwrap();
        let _separator = pool.allocate(nz!(10)).unwrap();
        let b = pool.allocate(nz!(200)).unwrap();
        let _rest = pool.allocate(nz!(240)).unwrap();

        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();
        assert_eq!(gap_sizes(&pool), vec![50, 200]);

        let chosen = pool.allocate(nz!(60)).unwrap();

        assert_eq!(chosen.offset(), 60);
        assert_eq!(gap_sizes(&pool), vec![50, 140]);
        assert_eq!(
            layout(&pool),
            vec![
                (0, 50, false),
                (50, 10, true),
                (60, 60, true),
                (120, 140, false),
                (260, 240, true)
            ]
        );
        pool.integrity_check();
    }

    #[test]
    fn first_fit_picks_lowest_address() {
        let mut pool = pool(nz!(500), AllocPolicy::FirstFit);

        let a = pool.allocate(nz!(200)).unwrap();
        let _separator = pool.allocate(nz!(10)).unwrap();
        let b = pool.allocate(nz!(50)).unwrap();
        let _rest = pool.allocate(nz!(240)).unwrap();

        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();

        // The 200-byte gap comes first by address even though the 50-byte gap fits better.
        let chosen = pool.allocate(nz!(40)).unwrap();

        assert_eq!(chosen.offset(), 0);
        assert_eq!(gap_sizes(&pool), vec![50, 160]);
    }

    #[test]
    fn round_trip_restores_single_gap() {
        let mut pool = pool(nz!(4096), AllocPolicy::BestFit);

        let allocations: Vec<_> = [16, 1000, 7, 333, 64]
            .into_iter()
            .map(|size| pool.allocate(NonZero::new(size).unwrap()).unwrap())
            .collect();

        // Release in an order that exercises every merge direction.
        for index in [2, 0, 4, 1, 3] {
            pool.deallocate(allocations[index]).unwrap();
        }

        assert!(pool.is_idle());
        assert!(pool.ensure_idle().is_ok());
        assert_eq!(layout(&pool), vec![(0, 4096, false)]);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = pool(nz!(100), AllocPolicy::FirstFit);

        let a = pool.allocate(nz!(10)).unwrap();
        pool.deallocate(a).unwrap();

        assert_eq!(pool.deallocate(a), Err(Error::InvalidHandle));
        assert!(pool.is_idle());
    }

    #[test]
    fn stale_handle_does_not_free_new_occupant() {
        let mut pool = pool(nz!(100), AllocPolicy::FirstFit);

        let first = pool.allocate(nz!(10)).unwrap();
        pool.deallocate(first).unwrap();

        // Same node slot, same offset, same size.
        let second = pool.allocate(nz!(10)).unwrap();
        assert_eq!(second.offset(), first.offset());

        assert_eq!(pool.deallocate(first), Err(Error::InvalidHandle));
        assert_eq!(pool.bytes(&first), Err(Error::InvalidHandle));
        assert_eq!(pool.num_allocs(), 1);

        pool.deallocate(second).unwrap();
    }

    #[test]
    fn foreign_allocation_is_rejected() {
        let mut a = pool(nz!(100), AllocPolicy::FirstFit);
        let mut b = pool(nz!(100), AllocPolicy::FirstFit);

        let from_a = a.allocate(nz!(10)).unwrap();
        let _from_b = b.allocate(nz!(10)).unwrap();

        assert_eq!(b.deallocate(from_a), Err(Error::InvalidHandle));
        assert_eq!(b.num_allocs(), 1);

        a.deallocate(from_a).unwrap();
    }

    #[test]
    fn bytes_are_scoped_to_the_allocation() {
        let mut pool = pool(nz!(64), AllocPolicy::FirstFit);

        let a = pool.allocate(nz!(8)).unwrap();
        let b = pool.allocate(nz!(8)).unwrap();

        pool.bytes_mut(&a).unwrap().fill(1);
        pool.bytes_mut(&b).unwrap().fill(2);

        assert_eq!(pool.bytes(&a).unwrap(), &[1; 8]);
        assert_eq!(pool.bytes(&b).unwrap(), &[2; 8]);
    }

    #[test]
    fn ensure_idle_reports_counts() {
        let mut pool = pool(nz!(100), AllocPolicy::FirstFit);

        let a = pool.allocate(nz!(10)).unwrap();

        assert_eq!(
            pool.ensure_idle(),
            Err(Error::NotFreed {
                num_allocs: 1,
                num_gaps: 1
            })
        );

        pool.deallocate(a).unwrap();
        assert_eq!(pool.ensure_idle(), Ok(()));
    }

    #[test]
    fn bookkeeping_grows_with_fragmentation() {
        let mut pool = SegmentPool::builder()
            .capacity(nz!(1024))
            .node_growth(GrowthPolicy::with_initial_capacity(nz!(1)))
            .gap_growth(GrowthPolicy::with_initial_capacity(nz!(1)))
            .build()
            .unwrap();

        let allocations: Vec<_> = (0..64).map(|_| pool.allocate(nz!(8)).unwrap()).collect();

        // Free every other allocation to produce many separate gaps.
        for allocation in allocations.iter().step_by(2) {
            pool.deallocate(*allocation).unwrap();
        }

        assert_eq!(pool.num_gaps(), 33);
        pool.integrity_check();
    }

    #[test]
    fn integrity_check_handles_thousands_of_gaps() {
        let mut pool = pool(nz!(40_000), AllocPolicy::FirstFit);

        let allocations: Vec<_> = (0..4000).map(|_| pool.allocate(nz!(10)).unwrap()).collect();
        assert_eq!(pool.num_gaps(), 0);

        for allocation in allocations.iter().step_by(2) {
            pool.deallocate(*allocation).unwrap();
        }

        assert_eq!(pool.num_gaps(), 2000);
        assert_eq!(pool.num_allocs(), 2000);
        pool.integrity_check();
    }

    #[test]
    fn best_fit_prefers_lower_address_among_equal_gaps() {
        let mut pool = pool(nz!(500), AllocPolicy::BestFit);

        let a = pool.allocate(nz!(100)).unwrap();
        let _separator = pool.allocate(nz!(10)).unwrap();
        let b = pool.allocate(nz!(100)).unwrap();
        let _rest = pool.allocate(nz!(290)).unwrap();

        // Free the higher one first so insertion order does not decide the tie.
        pool.deallocate(b).unwrap();
        pool.deallocate(a).unwrap();
        assert_eq!(gap_sizes(&pool), vec![100, 100]);

        let chosen = pool.allocate(nz!(50)).unwrap();

        assert_eq!(chosen.offset(), 0);
        assert_eq!(
            layout(&pool),
            vec![
                (0, 50, true),
                (50, 50, false),
                (100, 10, true),
                (110, 100, false),
                (210, 290, true)
            ]
        );
        pool.integrity_check();
    }

    /// A fill factor this small makes every append request growth.
    fn always_growing() -> GrowthPolicy {
        GrowthPolicy::new(nz!(1), f64::MIN_POSITIVE, nz!(2))
    }

    #[test]
    fn allocate_leaves_pool_unchanged_if_gap_index_cannot_grow() {
        let mut pool = SegmentPool::builder()
            .capacity(nz!(100))
            .gap_growth(always_growing())
            .build()
            .unwrap();

        let _a = pool.allocate(nz!(10)).unwrap();

        // Pretend the gap index is at the edge of the address space.
        pool.gaps.set_capacity(usize::MAX);
        let before = layout(&pool);

        assert_eq!(pool.allocate(nz!(20)), Err(Error::IndexFull));

        assert_eq!(layout(&pool), before);
        assert_eq!(pool.num_gaps(), 1);
        assert_eq!(pool.num_allocs(), 1);
        assert_eq!(pool.alloc_size(), 10);
        pool.integrity_check();

        // An exact fit adds no gap index entry.
        let exact = pool.allocate(nz!(90)).unwrap();
        assert_eq!(exact.offset(), 10);
        assert_eq!(pool.num_gaps(), 0);
        pool.integrity_check();
    }

    #[test]
    fn allocate_leaves_pool_unchanged_if_node_store_cannot_grow() {
        let mut pool = SegmentPool::builder()
            .capacity(nz!(100))
            .node_growth(always_growing())
            .build()
            .unwrap();

        let _a = pool.allocate(nz!(10)).unwrap();

        // No slot has been released, so a split needs a new one.
        pool.nodes.set_capacity(usize::MAX);
        let before = layout(&pool);

        assert_eq!(
            pool.allocate(nz!(20)),
            Err(Error::OutOfMemory { what: "node store" })
        );

        assert_eq!(layout(&pool), before);
        assert_eq!(pool.num_gaps(), 1);
        assert_eq!(pool.num_allocs(), 1);
        assert_eq!(pool.alloc_size(), 10);
        pool.integrity_check();
    }

    #[test]
    fn deallocate_leaves_pool_unchanged_if_gap_index_cannot_grow() {
        let mut pool = SegmentPool::builder()
            .capacity(nz!(100))
            .gap_growth(always_growing())
            .build()
            .unwrap();

        let a = pool.allocate(nz!(10)).unwrap();
        let _b = pool.allocate(nz!(20)).unwrap();

        let capacity = pool.gaps.capacity();
        pool.gaps.set_capacity(usize::MAX);
        let before = layout(&pool);

        assert_eq!(pool.deallocate(a), Err(Error::IndexFull));

        assert_eq!(layout(&pool), before);
        assert_eq!(pool.num_gaps(), 1);
        assert_eq!(pool.num_allocs(), 2);
        assert_eq!(pool.alloc_size(), 30);
        assert!(pool.bytes(&a).is_ok());
        pool.integrity_check();

        // The handle is still live and can be freed once the index can grow again.
        pool.gaps.set_capacity(capacity);
        pool.deallocate(a).unwrap();
        assert_eq!(pool.num_gaps(), 2);
        pool.integrity_check();
    }

    #[test]
    fn randomized_operations_preserve_invariants() {
        for policy in [AllocPolicy::FirstFit, AllocPolicy::BestFit] {
            let mut rng = StdRng::seed_from_u64(0x5EED);
            let mut pool = pool(nz!(4096), policy);
            let mut live: Vec<Allocation> = Vec::new();

            for _ in 0..2000 {
                if live.is_empty() || rng.random_bool(0.55) {
                    let size = NonZero::new(rng.random_range(1..=256)).unwrap();

                    match pool.allocate(size) {
                        Ok(allocation) => live.push(allocation),
                        Err(Error::InsufficientSpace { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                } else {
                    let index = rng.random_range(0..live.len());
                    pool.deallocate(live.swap_remove(index)).unwrap();
                }

                pool.integrity_check();
                assert_eq!(pool.num_allocs(), live.len());
                assert_eq!(
                    pool.alloc_size(),
                    live.iter().map(Allocation::size).sum::<usize>()
                );
            }

            for allocation in live.drain(..) {
                pool.deallocate(allocation).unwrap();
            }

            assert!(pool.is_idle());
        }
    }

    #[test]
    fn drop_with_live_allocations_is_allowed_by_default() {
        let mut pool = pool(nz!(100), AllocPolicy::FirstFit);

        _ = pool.allocate(nz!(10)).unwrap();

        drop(pool);
    }

    #[test]
    fn drop_when_idle_does_not_panic_if_policy_must_not_drop() {
        let mut pool = SegmentPool::builder()
            .capacity(nz!(100))
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .build()
            .unwrap();

        let a = pool.allocate(nz!(10)).unwrap();
        pool.deallocate(a).unwrap();

        drop(pool);
    }

    #[test]
    #[should_panic]
    fn drop_with_live_allocations_panics_if_policy_must_not_drop() {
        let mut pool = SegmentPool::builder()
            .capacity(nz!(100))
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .build()
            .unwrap();

        _ = pool.allocate(nz!(10)).unwrap();

        drop(pool);
    }
}
