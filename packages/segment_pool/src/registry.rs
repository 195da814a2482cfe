use std::num::NonZero;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::{
    AllocPolicy, Allocation, DropPolicy, Error, GrowableArray, GrowthPolicy, PoolHandle,
    PoolRegistryBuilder, Result, Segment, SegmentPool,
};

/// Global counter for generating unique registry epoch IDs.
///
/// Starts at 1 so that an uninitialized registry (ID 0) never matches a handle.
static REGISTRY_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn generate_registry_id() -> u64 {
    REGISTRY_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Owns a dynamic set of [`SegmentPool`]s and addresses them by [`PoolHandle`].
///
/// A registry is created uninitialized and must be [initialized][Self::init] before pools can
/// be opened. Every initialization begins a new epoch: handles issued before a
/// [teardown][Self::teardown] are never accepted again, even by the same registry.
///
/// Pools are stored in a growable array of slots. Each opened pool gets the next never-used
/// slot and a closed pool leaves its slot empty for the rest of the epoch.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segment_pool::{AllocPolicy, PoolRegistry};
///
/// let mut registry = PoolRegistry::new();
/// registry.init().unwrap();
///
/// let pool = registry.open_pool(nz!(1000), AllocPolicy::FirstFit).unwrap();
///
/// let allocation = registry.allocate(pool, nz!(100)).unwrap();
/// assert_eq!(registry.inspect(pool).unwrap().len(), 2);
///
/// registry.deallocate(pool, allocation).unwrap();
/// registry.close_pool(pool).unwrap();
/// registry.teardown().unwrap();
/// ```
///
/// # Thread safety
///
/// The registry is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
pub struct PoolRegistry {
    /// Identifies the current epoch. Zero while uninitialized.
    registry_id: u64,

    /// `None` while uninitialized. Closed pools leave `None` in their slot.
    pools: Option<GrowableArray<Option<SegmentPool>>>,

    store_growth: GrowthPolicy,
    node_growth: GrowthPolicy,
    gap_growth: GrowthPolicy,
    drop_policy: DropPolicy,
}

impl PoolRegistry {
    /// Creates an uninitialized registry with default settings.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a new registry.
    ///
    /// See [`PoolRegistryBuilder`] for the available settings.
    #[inline]
    pub fn builder() -> PoolRegistryBuilder {
        PoolRegistryBuilder::new()
    }

    pub(crate) fn new_inner(
        store_growth: GrowthPolicy,
        node_growth: GrowthPolicy,
        gap_growth: GrowthPolicy,
        drop_policy: DropPolicy,
    ) -> Self {
        Self {
            registry_id: 0,
            pools: None,
            store_growth,
            node_growth,
            gap_growth,
            drop_policy,
        }
    }

    /// Allocates the slot array and begins a new epoch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] if the registry is already initialized and
    /// [`Error::OutOfMemory`] if the slot array cannot be allocated.
    pub fn init(&mut self) -> Result<()> {
        if self.pools.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let pools = GrowableArray::with_policy(self.store_growth, "pool registry")?;
        let capacity = pools.capacity();

        self.pools = Some(pools);
        self.registry_id = generate_registry_id();

        debug!(registry_id = self.registry_id, capacity, "initialized pool registry");

        Ok(())
    }

    /// Releases the slot array and ends the current epoch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the registry is not initialized and
    /// [`Error::PoolsStillOpen`] if any pool has not been closed. The registry is unchanged
    /// after an error.
    pub fn teardown(&mut self) -> Result<()> {
        let open_pools = count_open(self.slots()?);

        if open_pools > 0 {
            return Err(Error::PoolsStillOpen { open_pools });
        }

        self.pools = None;

        debug!(registry_id = self.registry_id, "tore down pool registry");

        self.registry_id = 0;

        Ok(())
    }

    /// Opens a new pool of `size` bytes that places allocations according to `policy`.
    ///
    /// The pool uses the node store, gap index and drop policy settings of the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the registry is not initialized and
    /// [`Error::OutOfMemory`] if the slot array cannot grow or the pool cannot be allocated.
    /// The registry is unchanged after an error.
    pub fn open_pool(&mut self, size: NonZero<usize>, policy: AllocPolicy) -> Result<PoolHandle> {
        let pools = self.pools.as_mut().ok_or(Error::NotInitialized)?;

        pools.reserve_one()?;

        let pool = SegmentPool::new_inner(
            size,
            policy,
            self.node_growth,
            self.gap_growth,
            self.drop_policy,
        )?;
        let pool_id = pool.id();

        let slot = pools.push(Some(pool))?;

        debug!(
            registry_id = self.registry_id,
            slot,
            pool_id,
            size = size.get(),
            %policy,
            "opened pool in registry"
        );

        Ok(PoolHandle {
            registry_id: self.registry_id,
            slot,
        })
    }

    /// Closes a pool, releasing its buffer and bookkeeping storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the registry is not initialized,
    /// [`Error::InvalidHandle`] if the handle does not name an open pool of the current epoch
    /// and [`Error::NotFreed`] if the pool still has live allocations or is fragmented. After
    /// [`Error::NotFreed`] the pool stays open and usable.
    pub fn close_pool(&mut self, handle: PoolHandle) -> Result<()> {
        let pools = self.pools.as_mut().ok_or(Error::NotInitialized)?;

        if handle.registry_id != self.registry_id {
            return Err(Error::InvalidHandle);
        }

        let slot = pools.get_mut(handle.slot).ok_or(Error::InvalidHandle)?;
        let pool = slot.as_ref().ok_or(Error::InvalidHandle)?;

        pool.ensure_idle()?;
        let pool_id = pool.id();

        *slot = None;

        debug!(
            registry_id = self.registry_id,
            slot = handle.slot,
            pool_id,
            "closed pool in registry"
        );

        Ok(())
    }

    /// The pool named by `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the registry is not initialized and
    /// [`Error::InvalidHandle`] if the handle does not name an open pool of the current epoch.
    pub fn pool(&self, handle: PoolHandle) -> Result<&SegmentPool> {
        let pools = self.slots()?;

        if handle.registry_id != self.registry_id {
            return Err(Error::InvalidHandle);
        }

        pools
            .get(handle.slot)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidHandle)
    }

    /// The pool named by `handle`, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the registry is not initialized and
    /// [`Error::InvalidHandle`] if the handle does not name an open pool of the current epoch.
    pub fn pool_mut(&mut self, handle: PoolHandle) -> Result<&mut SegmentPool> {
        let pools = self.pools.as_mut().ok_or(Error::NotInitialized)?;

        if handle.registry_id != self.registry_id {
            return Err(Error::InvalidHandle);
        }

        pools
            .get_mut(handle.slot)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidHandle)
    }

    /// Allocates `size` bytes from the pool named by `handle`.
    ///
    /// # Errors
    ///
    /// Fails as [`pool_mut()`](Self::pool_mut) and [`SegmentPool::allocate()`] do.
    pub fn allocate(&mut self, handle: PoolHandle, size: NonZero<usize>) -> Result<Allocation> {
        self.pool_mut(handle)?.allocate(size)
    }

    /// Returns an allocation to the pool named by `handle`.
    ///
    /// # Errors
    ///
    /// Fails as [`pool_mut()`](Self::pool_mut) and [`SegmentPool::deallocate()`] do.
    pub fn deallocate(&mut self, handle: PoolHandle, allocation: Allocation) -> Result<()> {
        self.pool_mut(handle)?.deallocate(allocation)
    }

    /// Returns a snapshot of the segments of the pool named by `handle`.
    ///
    /// # Errors
    ///
    /// Fails as [`pool()`](Self::pool) and [`SegmentPool::inspect()`] do.
    pub fn inspect(&self, handle: PoolHandle) -> Result<Vec<Segment>> {
        self.pool(handle)?.inspect()
    }

    /// Number of pools currently open. Zero if the registry is not initialized.
    #[must_use]
    #[inline]
    pub fn open_pools(&self) -> usize {
        self.pools
            .as_ref()
            .map_or(0, count_open)
    }

    /// Number of slots handed out in the current epoch, including those of closed pools.
    /// Zero if the registry is not initialized.
    #[must_use]
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.pools.as_ref().map_or(0, GrowableArray::len)
    }

    /// Number of slots the registry can hold before it has to grow, if initialized.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.pools.as_ref().map(GrowableArray::capacity)
    }

    /// Whether [`init()`](Self::init) has been called since creation or the last teardown.
    #[must_use]
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.pools.is_some()
    }

    fn slots(&self) -> Result<&GrowableArray<Option<SegmentPool>>> {
        self.pools.as_ref().ok_or(Error::NotInitialized)
    }
}

fn count_open(pools: &GrowableArray<Option<SegmentPool>>) -> usize {
    pools.iter().filter(|slot| slot.is_some()).count()
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(PoolRegistry: Send, Default);
    assert_not_impl_any!(PoolRegistry: Sync);

    fn initialized() -> PoolRegistry {
        let mut registry = PoolRegistry::new();
        registry.init().unwrap();
        registry
    }

    #[test]
    fn starts_uninitialized() {
        let registry = PoolRegistry::new();

        assert!(!registry.is_initialized());
        assert_eq!(registry.open_pools(), 0);
        assert_eq!(registry.slot_count(), 0);
        assert_eq!(registry.capacity(), None);
    }

    #[test]
    fn init_twice_fails() {
        let mut registry = initialized();

        assert_eq!(registry.init(), Err(Error::AlreadyInitialized));
        assert!(registry.is_initialized());
    }

    #[test]
    fn operations_before_init_fail() {
        let mut registry = PoolRegistry::new();
        let handle = PoolHandle {
            registry_id: 1,
            slot: 0,
        };

        assert_eq!(registry.teardown(), Err(Error::NotInitialized));
        assert_eq!(
            registry.open_pool(nz!(10), AllocPolicy::FirstFit),
            Err(Error::NotInitialized)
        );
        assert_eq!(registry.close_pool(handle), Err(Error::NotInitialized));
        assert_eq!(registry.inspect(handle), Err(Error::NotInitialized));
        assert_eq!(
            registry.allocate(handle, nz!(1)).unwrap_err(),
            Error::NotInitialized
        );
    }

    #[test]
    fn teardown_twice_fails() {
        let mut registry = initialized();

        registry.teardown().unwrap();

        assert_eq!(registry.teardown(), Err(Error::NotInitialized));
    }

    #[test]
    fn teardown_with_open_pools_fails() {
        let mut registry = initialized();

        let a = registry.open_pool(nz!(10), AllocPolicy::FirstFit).unwrap();
        let _b = registry.open_pool(nz!(10), AllocPolicy::BestFit).unwrap();

        assert_eq!(
            registry.teardown(),
            Err(Error::PoolsStillOpen { open_pools: 2 })
        );

        // The registry is still usable.
        assert!(registry.is_initialized());
        assert!(registry.pool(a).is_ok());
    }

    #[test]
    fn slots_are_not_reused() {
        let mut registry = initialized();

        let a = registry.open_pool(nz!(10), AllocPolicy::FirstFit).unwrap();
        registry.close_pool(a).unwrap();
        let b = registry.open_pool(nz!(10), AllocPolicy::FirstFit).unwrap();

        assert_eq!(a.slot(), 0);
        assert_eq!(b.slot(), 1);
        assert_eq!(registry.slot_count(), 2);
        assert_eq!(registry.open_pools(), 1);
    }

    #[test]
    fn closed_pool_handle_is_rejected() {
        let mut registry = initialized();

        let handle = registry.open_pool(nz!(10), AllocPolicy::FirstFit).unwrap();
        registry.close_pool(handle).unwrap();

        assert_eq!(registry.close_pool(handle), Err(Error::InvalidHandle));
        assert_eq!(registry.inspect(handle), Err(Error::InvalidHandle));
        assert_eq!(
            registry.allocate(handle, nz!(1)).unwrap_err(),
            Error::InvalidHandle
        );
    }

    #[test]
    fn handle_from_previous_epoch_is_rejected() {
        let mut registry = initialized();

        let old = registry.open_pool(nz!(10), AllocPolicy::FirstFit).unwrap();
        registry.close_pool(old).unwrap();
        registry.teardown().unwrap();

        registry.init().unwrap();
        let new = registry.open_pool(nz!(10), AllocPolicy::FirstFit).unwrap();

        // Same slot, different epoch.
        assert_eq!(old.slot(), new.slot());
        assert_eq!(registry.pool(old).unwrap_err(), Error::InvalidHandle);
        assert!(registry.pool(new).is_ok());
    }

    #[test]
    fn handle_from_other_registry_is_rejected() {
        let mut first = initialized();
        let mut second = initialized();

        let handle = first.open_pool(nz!(10), AllocPolicy::FirstFit).unwrap();
        let _other = second.open_pool(nz!(10), AllocPolicy::FirstFit).unwrap();

        assert_eq!(second.pool(handle).unwrap_err(), Error::InvalidHandle);
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let registry = initialized();
        let handle = PoolHandle {
            registry_id: registry.registry_id,
            slot: 5,
        };

        assert_eq!(registry.pool(handle).unwrap_err(), Error::InvalidHandle);
    }

    #[test]
    fn close_with_live_allocation_keeps_pool_usable() {
        let mut registry = initialized();

        let handle = registry.open_pool(nz!(100), AllocPolicy::FirstFit).unwrap();
        let allocation = registry.allocate(handle, nz!(10)).unwrap();

        assert_eq!(
            registry.close_pool(handle),
            Err(Error::NotFreed {
                num_allocs: 1,
                num_gaps: 1
            })
        );

        let second = registry.allocate(handle, nz!(20)).unwrap();
        assert_eq!(second.offset(), 10);

        registry.deallocate(handle, allocation).unwrap();
        registry.deallocate(handle, second).unwrap();
        registry.close_pool(handle).unwrap();
        assert_eq!(registry.open_pools(), 0);
    }

    #[test]
    fn growth_keeps_existing_handles_valid() {
        let mut registry = PoolRegistry::builder()
            .store_growth(GrowthPolicy::with_initial_capacity(nz!(2)))
            .build();
        registry.init().unwrap();

        let handles: Vec<_> = (1..=25_usize)
            .map(|size| {
                registry
                    .open_pool(NonZero::new(size * 10).unwrap(), AllocPolicy::BestFit)
                    .unwrap()
            })
            .collect();

        assert!(registry.capacity().unwrap() >= 25);
        assert_eq!(registry.open_pools(), 25);

        for (index, handle) in handles.iter().enumerate() {
            assert_eq!(handle.slot(), index);
            assert_eq!(registry.pool(*handle).unwrap().total_size(), (index + 1) * 10);

            let allocation = registry.allocate(*handle, nz!(5)).unwrap();
            registry.deallocate(*handle, allocation).unwrap();
            registry.close_pool(*handle).unwrap();
        }

        registry.teardown().unwrap();
    }

    #[test]
    fn allocation_from_other_pool_is_rejected() {
        let mut registry = initialized();

        let a = registry.open_pool(nz!(100), AllocPolicy::FirstFit).unwrap();
        let b = registry.open_pool(nz!(100), AllocPolicy::FirstFit).unwrap();

        let from_a = registry.allocate(a, nz!(10)).unwrap();

        assert_eq!(registry.deallocate(b, from_a), Err(Error::InvalidHandle));
        registry.deallocate(a, from_a).unwrap();
    }
}
