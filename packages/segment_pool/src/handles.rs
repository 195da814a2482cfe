/// Names a pool opened through a [`PoolRegistry`][crate::PoolRegistry].
///
/// The handle is a plain value that can be copied freely. It is validated every time it is
/// presented to the registry: a handle whose pool has been closed, or which was issued by a
/// different registry (or by the same registry before its last teardown), is rejected with
/// [`Error::InvalidHandle`][crate::Error::InvalidHandle].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PoolHandle {
    /// Identifies the registry epoch that issued the handle.
    pub(crate) registry_id: u64,

    /// Index of the registry slot that holds the pool.
    pub(crate) slot: usize,
}

impl PoolHandle {
    /// Index of the registry slot that holds the pool.
    ///
    /// Slots are assigned in the order pools are opened and are never reused.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Names one allocation made inside a pool.
///
/// Returned by [`SegmentPool::allocate()`][crate::SegmentPool::allocate] and consumed by
/// [`SegmentPool::deallocate()`][crate::SegmentPool::deallocate]. The handle is a plain value
/// that can be copied, but only the first deallocation through any copy succeeds; later
/// attempts are rejected with [`Error::InvalidHandle`][crate::Error::InvalidHandle], even if the
/// bookkeeping slot has been reused for a different allocation in the meantime.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segment_pool::SegmentPool;
///
/// let mut pool = SegmentPool::builder().capacity(nz!(1000)).build().unwrap();
///
/// let allocation = pool.allocate(nz!(100)).unwrap();
/// assert_eq!(allocation.offset(), 0);
/// assert_eq!(allocation.size(), 100);
///
/// pool.deallocate(allocation).unwrap();
/// assert!(pool.deallocate(allocation).is_err());
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Allocation {
    /// The pool that made the allocation.
    pub(crate) pool_id: u64,

    /// Slot index of the node that describes the allocated segment.
    pub(crate) node: usize,

    /// Generation of the node slot at the time of allocation.
    pub(crate) generation: u32,

    pub(crate) offset: usize,
    pub(crate) size: usize,
}

impl Allocation {
    /// Byte offset of the allocation from the start of the pool buffer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the allocation in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;
    use std::hash::Hash;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolHandle: Send, Sync, Copy, Debug, Eq, Hash);
    assert_impl_all!(Allocation: Send, Sync, Copy, Debug, Eq, Hash);

    #[test]
    fn allocation_accessors() {
        let allocation = Allocation {
            pool_id: 1,
            node: 2,
            generation: 3,
            offset: 400,
            size: 50,
        };

        assert_eq!(allocation.offset(), 400);
        assert_eq!(allocation.size(), 50);
    }

    #[test]
    fn pool_handle_slot() {
        let handle = PoolHandle {
            registry_id: 9,
            slot: 4,
        };

        assert_eq!(handle.slot(), 4);
    }
}
