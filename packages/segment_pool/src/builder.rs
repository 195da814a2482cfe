use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{
    AllocPolicy, DEFAULT_GAP_INDEX_CAPACITY, DEFAULT_NODE_STORE_CAPACITY, DropPolicy,
    GrowthPolicy, Result, SegmentPool,
};

/// Builder for creating an instance of [`SegmentPool`].
///
/// The capacity of the pool is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segment_pool::{AllocPolicy, SegmentPool};
///
/// let pool = SegmentPool::builder()
///     .capacity(nz!(4096))
///     .policy(AllocPolicy::BestFit)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.total_size(), 4096);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct SegmentPoolBuilder {
    capacity: Option<NonZero<usize>>,
    policy: AllocPolicy,
    node_growth: GrowthPolicy,
    gap_growth: GrowthPolicy,
    drop_policy: DropPolicy,

    _not_sync: PhantomData<Cell<()>>,
}

impl SegmentPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            capacity: None,
            policy: AllocPolicy::default(),
            node_growth: GrowthPolicy::with_initial_capacity(DEFAULT_NODE_STORE_CAPACITY),
            gap_growth: GrowthPolicy::with_initial_capacity(DEFAULT_GAP_INDEX_CAPACITY),
            drop_policy: DropPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the size in bytes of the buffer the pool hands out allocations from.
    ///
    /// The buffer is obtained once when the pool is built and never grows.
    #[inline]
    pub fn capacity(mut self, capacity: NonZero<usize>) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Sets the [placement policy][AllocPolicy] for allocations.
    #[inline]
    pub fn policy(mut self, policy: AllocPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets how the store of segment nodes grows as the pool fragments.
    #[inline]
    pub fn node_growth(mut self, growth: GrowthPolicy) -> Self {
        self.node_growth = growth;
        self
    }

    /// Sets how the index of free segments grows as the pool fragments.
    #[inline]
    pub fn gap_growth(mut self, growth: GrowthPolicy) -> Self {
        self.gap_growth = growth;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how to treat
    /// allocations that are still live when the pool is dropped.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the buffer or the initial
    /// bookkeeping storage cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics if no capacity has been set using [`capacity`](Self::capacity).
    #[inline]
    pub fn build(self) -> Result<SegmentPool> {
        let capacity = self
            .capacity
            .expect("capacity must be set using .capacity() before calling .build()");

        SegmentPool::new_inner(
            capacity,
            self.policy,
            self.node_growth,
            self.gap_growth,
            self.drop_policy,
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(SegmentPoolBuilder: Send);
    assert_not_impl_any!(SegmentPoolBuilder: Sync);

    #[test]
    fn defaults() {
        let pool = SegmentPool::builder().capacity(nz!(128)).build().unwrap();

        assert_eq!(pool.total_size(), 128);
        assert_eq!(pool.policy(), AllocPolicy::FirstFit);
        assert_eq!(pool.drop_policy(), DropPolicy::MayDropAllocations);
    }

    #[test]
    fn all_settings_are_applied() {
        let pool = SegmentPool::builder()
            .capacity(nz!(512))
            .policy(AllocPolicy::BestFit)
            .node_growth(GrowthPolicy::with_initial_capacity(nz!(2)))
            .gap_growth(GrowthPolicy::with_initial_capacity(nz!(3)))
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .build()
            .unwrap();

        assert_eq!(pool.total_size(), 512);
        assert_eq!(pool.policy(), AllocPolicy::BestFit);
        assert_eq!(pool.drop_policy(), DropPolicy::MustNotDropAllocations);
    }

    #[test]
    #[should_panic]
    fn build_without_capacity_panics() {
        _ = SegmentPool::builder().build();
    }
}
