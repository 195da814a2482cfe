use std::mem;

use crate::{GrowableArray, GrowthPolicy, Result};

/// Bookkeeping record for one contiguous byte range of a pool buffer.
///
/// Nodes form a doubly linked list in address order that partitions the whole buffer. This is
/// the physical layout of the pool, not a free list: used and free segments are both members.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SegmentNode {
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) allocated: bool,

    /// Slot index of the segment immediately before this one in the buffer.
    pub(crate) prev: Option<usize>,

    /// Slot index of the segment immediately after this one in the buffer.
    pub(crate) next: Option<usize>,
}

impl SegmentNode {
    /// A node that is not yet linked into the segment list.
    #[must_use]
    pub(crate) fn unlinked(offset: usize, size: usize, allocated: bool) -> Self {
        Self {
            offset,
            size,
            allocated,
            prev: None,
            next: None,
        }
    }

    /// One past the last byte covered by this node.
    #[must_use]
    pub(crate) fn end(&self) -> usize {
        // Cannot overflow: offset + size is bounded by the pool capacity.
        self.offset.wrapping_add(self.size)
    }
}

#[derive(Debug)]
enum SlotEntry {
    /// The slot holds a node that is a member of the segment list.
    Occupied(SegmentNode),

    /// The slot is available, forming part of the intrusive free chain.
    Vacant { next_free_index: Option<usize> },
}

#[derive(Debug)]
struct NodeSlot {
    /// Incremented every time the slot is released or its segment is freed, so that allocation
    /// handles that refer to an earlier occupant of the slot can be told apart from the current
    /// one.
    generation: u32,

    entry: SlotEntry,
}

/// Reusable storage for the segment nodes of one pool.
///
/// Slots are never moved or compacted, so a slot index is a stable name for a node for as long
/// as the node exists. Released slots are kept on an intrusive free chain and handed out again
/// before the underlying array is extended.
#[derive(Debug)]
pub(crate) struct NodeStore {
    slots: GrowableArray<NodeSlot>,

    /// Head of the free chain. `None` if every slot in the array is occupied.
    next_free_index: Option<usize>,

    /// Number of occupied slots, i.e. the number of segments in the list.
    used_slots: usize,

    /// First segment in address order.
    head: Option<usize>,
}

impl NodeStore {
    pub(crate) fn new(policy: GrowthPolicy) -> Result<Self> {
        Ok(Self {
            slots: GrowableArray::with_policy(policy, "node store")?,
            next_free_index: None,
            used_slots: 0,
            head: None,
        })
    }

    /// Number of slots ever created, occupied or not.
    #[cfg(any(debug_assertions, test))]
    #[must_use]
    pub(crate) fn total_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots that currently hold a segment node.
    #[must_use]
    pub(crate) fn used_slots(&self) -> usize {
        self.used_slots
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    #[cfg(test)]
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.slots.set_capacity(capacity);
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn head(&self) -> Option<usize> {
        self.head
    }

    /// Makes sure the next [`acquire_free_slot()`](Self::acquire_free_slot) cannot fail.
    pub(crate) fn reserve_one(&mut self) -> Result<()> {
        if self.next_free_index.is_some() {
            return Ok(());
        }

        self.slots.reserve_one()
    }

    /// Stores `node` in an unused slot and returns the slot index.
    ///
    /// The node is not linked into the segment list; use [`insert_after()`](Self::insert_after)
    /// or [`link_as_head()`](Self::link_as_head) for that.
    pub(crate) fn acquire_free_slot(&mut self, node: SegmentNode) -> Result<usize> {
        let index = if let Some(index) = self.next_free_index {
            let slot = self
                .slots
                .get_mut(index)
                .expect("free chain only contains indexes of existing slots");

            let previous = mem::replace(&mut slot.entry, SlotEntry::Occupied(node));

            self.next_free_index = match previous {
                SlotEntry::Vacant { next_free_index } => next_free_index,
                SlotEntry::Occupied(_) => {
                    panic!("free chain pointed to occupied node slot {index}")
                }
            };

            index
        } else {
            self.slots.push(NodeSlot {
                generation: 0,
                entry: SlotEntry::Occupied(node),
            })?
        };

        // Cannot overflow because every used slot is backed by memory.
        self.used_slots = self.used_slots.wrapping_add(1);

        Ok(index)
    }

    /// Returns a slot to the free chain and bumps its generation.
    ///
    /// The caller is responsible for unlinking the node from the segment list first.
    ///
    /// # Panics
    ///
    /// Panics if the slot is out of bounds or already vacant.
    pub(crate) fn release_slot(&mut self, index: usize) -> SegmentNode {
        let next_free_index = self.next_free_index;

        let slot = self
            .slots
            .get_mut(index)
            .unwrap_or_else(|| panic!("release_slot({index}) is out of bounds"));

        let node = match mem::replace(&mut slot.entry, SlotEntry::Vacant { next_free_index }) {
            SlotEntry::Occupied(node) => node,
            SlotEntry::Vacant { .. } => panic!("release_slot({index}) slot was already vacant"),
        };

        slot.generation = slot.generation.wrapping_add(1);

        self.next_free_index = Some(index);

        // Cannot wrap because we just released an occupied slot.
        self.used_slots = self.used_slots.wrapping_sub(1);

        node
    }

    /// The node in slot `index`, if the slot is occupied.
    #[must_use]
    pub(crate) fn get(&self, index: usize) -> Option<&SegmentNode> {
        match self.slots.get(index).map(|slot| &slot.entry) {
            Some(SlotEntry::Occupied(node)) => Some(node),
            Some(SlotEntry::Vacant { .. }) | None => None,
        }
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut SegmentNode> {
        match self.slots.get_mut(index).map(|slot| &mut slot.entry) {
            Some(SlotEntry::Occupied(node)) => Some(node),
            Some(SlotEntry::Vacant { .. }) | None => None,
        }
    }

    /// Current generation of slot `index`, if the slot exists.
    #[must_use]
    pub(crate) fn generation(&self, index: usize) -> Option<u32> {
        self.slots.get(index).map(|slot| slot.generation)
    }

    /// Advances the generation of an occupied slot without releasing it.
    ///
    /// A node that turns from used to free keeps its slot, so the generation has to move on
    /// here as well for handles to the former allocation to become stale.
    pub(crate) fn bump_generation(&mut self, index: usize) {
        let slot = self
            .slots
            .get_mut(index)
            .unwrap_or_else(|| panic!("bump_generation({index}) is out of bounds"));

        slot.generation = slot.generation.wrapping_add(1);
    }

    /// The node in slot `index`, which the caller knows to be occupied.
    pub(crate) fn node(&self, index: usize) -> &SegmentNode {
        self.get(index)
            .unwrap_or_else(|| panic!("node slot {index} is not occupied"))
    }

    pub(crate) fn node_mut(&mut self, index: usize) -> &mut SegmentNode {
        self.get_mut(index)
            .unwrap_or_else(|| panic!("node slot {index} is not occupied"))
    }

    /// Makes the node in slot `index` the only member of an empty segment list.
    ///
    /// # Panics
    ///
    /// Panics if the list is not empty.
    pub(crate) fn link_as_head(&mut self, index: usize) {
        assert!(
            self.head.is_none(),
            "link_as_head({index}) called on a non-empty segment list"
        );

        let node = self.node_mut(index);
        node.prev = None;
        node.next = None;

        self.head = Some(index);
    }

    /// Splices the node in slot `new` into the list immediately after the node in slot `existing`.
    pub(crate) fn insert_after(&mut self, existing: usize, new: usize) {
        let following = self.node(existing).next;

        {
            let new_node = self.node_mut(new);
            new_node.prev = Some(existing);
            new_node.next = following;
        }

        self.node_mut(existing).next = Some(new);

        if let Some(following) = following {
            self.node_mut(following).prev = Some(new);
        }
    }

    /// Removes the node in slot `index` from the list, linking its neighbors to each other.
    ///
    /// The slot stays occupied; release it with [`release_slot()`](Self::release_slot).
    pub(crate) fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node_mut(index);
            (node.prev.take(), node.next.take())
        };

        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }

        if let Some(next) = next {
            self.node_mut(next).prev = prev;
        }
    }

    /// Iterates over the segment list in address order, yielding slot indexes and nodes.
    pub(crate) fn iter_list(&self) -> ListIter<'_> {
        ListIter {
            store: self,
            current: self.head,
        }
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn integrity_check(&self) {
        let total = self.slots.len();

        let occupied = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.entry, SlotEntry::Occupied(_)))
            .count();

        assert_eq!(
            occupied, self.used_slots,
            "used_slots {} does not match the observed occupied count {occupied}",
            self.used_slots
        );

        // Every vacant slot must be on the free chain exactly once.
        let mut chain_length: usize = 0;
        let mut cursor = self.next_free_index;

        while let Some(index) = cursor {
            assert!(
                chain_length < total,
                "free chain is longer than the slot array, it must contain a cycle"
            );

            cursor = match self.slots.get(index).map(|slot| &slot.entry) {
                Some(SlotEntry::Vacant { next_free_index }) => *next_free_index,
                Some(SlotEntry::Occupied(_)) => {
                    panic!("free chain points to occupied slot {index}")
                }
                None => panic!("free chain points to out-of-bounds slot {index}"),
            };

            chain_length = chain_length.wrapping_add(1);
        }

        assert_eq!(
            chain_length.wrapping_add(occupied),
            total,
            "free chain length {chain_length} plus occupied {occupied} does not cover {total} slots"
        );

        // The segment list must visit every occupied slot once, with symmetric links.
        let mut visited: usize = 0;
        let mut previous: Option<usize> = None;

        for (index, node) in self.iter_list() {
            assert_eq!(
                node.prev, previous,
                "node {index} has prev {:?} but follows {previous:?}",
                node.prev
            );

            assert!(
                visited < occupied,
                "segment list is longer than the number of occupied slots"
            );

            previous = Some(index);
            visited = visited.wrapping_add(1);
        }

        assert_eq!(
            visited, occupied,
            "segment list visits {visited} nodes but {occupied} slots are occupied"
        );
    }
}

/// Address-order iterator over the segment list of a [`NodeStore`].
#[derive(Debug)]
pub(crate) struct ListIter<'a> {
    store: &'a NodeStore,
    current: Option<usize>,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = (usize, &'a SegmentNode);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.current?;
        let node = self.store.node(index);

        self.current = node.next;

        Some((index, node))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    fn store() -> NodeStore {
        NodeStore::new(GrowthPolicy::with_initial_capacity(nz!(4))).unwrap()
    }

    fn layout(store: &NodeStore) -> Vec<(usize, usize, bool)> {
        store
            .iter_list()
            .map(|(_, node)| (node.offset, node.size, node.allocated))
            .collect()
    }

    #[test]
    fn smoke_test() {
        let mut store = store();

        let a = store
            .acquire_free_slot(SegmentNode::unlinked(0, 100, false))
            .unwrap();
        store.link_as_head(a);

        let b = store
            .acquire_free_slot(SegmentNode::unlinked(40, 60, false))
            .unwrap();
        store.node_mut(a).size = 40;
        store.node_mut(a).allocated = true;
        store.insert_after(a, b);

        assert_eq!(layout(&store), vec![(0, 40, true), (40, 60, false)]);
        assert_eq!(store.used_slots(), 2);
        assert_eq!(store.total_slots(), 2);
        store.integrity_check();
    }

    #[test]
    fn insert_after_middle_relinks_both_sides() {
        let mut store = store();

        let a = store
            .acquire_free_slot(SegmentNode::unlinked(0, 10, true))
            .unwrap();
        store.link_as_head(a);
        let c = store
            .acquire_free_slot(SegmentNode::unlinked(20, 10, true))
            .unwrap();
        store.insert_after(a, c);
        let b = store
            .acquire_free_slot(SegmentNode::unlinked(10, 10, false))
            .unwrap();
        store.insert_after(a, b);

        assert_eq!(store.node(a).next, Some(b));
        assert_eq!(store.node(b).prev, Some(a));
        assert_eq!(store.node(b).next, Some(c));
        assert_eq!(store.node(c).prev, Some(b));
        store.integrity_check();
    }

    #[test]
    fn unlink_head_and_tail() {
        let mut store = store();

        let a = store
            .acquire_free_slot(SegmentNode::unlinked(0, 10, true))
            .unwrap();
        store.link_as_head(a);
        let b = store
            .acquire_free_slot(SegmentNode::unlinked(10, 10, true))
            .unwrap();
        store.insert_after(a, b);
        let c = store
            .acquire_free_slot(SegmentNode::unlinked(20, 10, true))
            .unwrap();
        store.insert_after(b, c);

        store.unlink(a);
        store.release_slot(a);
        assert_eq!(store.head(), Some(b));
        assert_eq!(store.node(b).prev, None);

        store.unlink(c);
        store.release_slot(c);
        assert_eq!(store.node(b).next, None);

        assert_eq!(layout(&store), vec![(10, 10, true)]);
        store.integrity_check();
    }

    #[test]
    fn released_slots_are_reused_before_growing() {
        let mut store = store();

        let a = store
            .acquire_free_slot(SegmentNode::unlinked(0, 10, false))
            .unwrap();
        store.link_as_head(a);
        let b = store
            .acquire_free_slot(SegmentNode::unlinked(10, 10, false))
            .unwrap();
        store.insert_after(a, b);

        store.unlink(b);
        store.release_slot(b);

        let c = store
            .acquire_free_slot(SegmentNode::unlinked(10, 10, false))
            .unwrap();

        assert_eq!(c, b);
        assert_eq!(store.total_slots(), 2);
    }

    #[test]
    fn release_bumps_generation() {
        let mut store = store();

        let a = store
            .acquire_free_slot(SegmentNode::unlinked(0, 10, false))
            .unwrap();
        assert_eq!(store.generation(a), Some(0));

        store.release_slot(a);
        assert_eq!(store.generation(a), Some(1));
        assert!(store.get(a).is_none());

        let again = store
            .acquire_free_slot(SegmentNode::unlinked(0, 10, false))
            .unwrap();
        assert_eq!(again, a);
        assert_eq!(store.generation(a), Some(1));
    }

    #[test]
    fn bump_generation_keeps_slot_occupied() {
        let mut store = store();

        let a = store
            .acquire_free_slot(SegmentNode::unlinked(0, 10, true))
            .unwrap();
        store.bump_generation(a);

        assert_eq!(store.generation(a), Some(1));
        assert!(store.get(a).is_some());
        assert_eq!(store.used_slots(), 1);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut store = store();

        let first = store
            .acquire_free_slot(SegmentNode::unlinked(0, 1, true))
            .unwrap();
        store.link_as_head(first);

        let mut last = first;
        for offset in 1..50 {
            let next = store
                .acquire_free_slot(SegmentNode::unlinked(offset, 1, true))
                .unwrap();
            store.insert_after(last, next);
            last = next;
        }

        assert_eq!(store.used_slots(), 50);
        assert!(store.capacity() >= 50);
        assert_eq!(store.iter_list().count(), 50);
        store.integrity_check();
    }

    #[test]
    fn reserve_one_with_vacant_slot_does_not_grow() {
        let mut store = store();

        for offset in 0..3 {
            _ = store
                .acquire_free_slot(SegmentNode::unlinked(offset, 1, true))
                .unwrap();
        }
        store.release_slot(1);

        let capacity = store.capacity();
        store.reserve_one().unwrap();
        assert_eq!(store.capacity(), capacity);
    }

    #[test]
    #[should_panic]
    fn release_vacant_panics() {
        let mut store = store();

        let a = store
            .acquire_free_slot(SegmentNode::unlinked(0, 10, false))
            .unwrap();
        store.release_slot(a);
        store.release_slot(a);
    }

    #[test]
    #[should_panic]
    fn link_as_head_twice_panics() {
        let mut store = store();

        let a = store
            .acquire_free_slot(SegmentNode::unlinked(0, 10, false))
            .unwrap();
        store.link_as_head(a);
        let b = store
            .acquire_free_slot(SegmentNode::unlinked(10, 10, false))
            .unwrap();
        store.link_as_head(b);
    }

    #[test]
    fn end_is_offset_plus_size() {
        assert_eq!(SegmentNode::unlinked(30, 12, false).end(), 42);
    }
}
