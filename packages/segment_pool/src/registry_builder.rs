use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use new_zealand::nz;

use crate::{
    DEFAULT_GAP_INDEX_CAPACITY, DEFAULT_NODE_STORE_CAPACITY, DropPolicy, GrowthPolicy,
    PoolRegistry,
};

/// Initial number of pool slots in a registry, unless configured otherwise.
pub const DEFAULT_REGISTRY_CAPACITY: NonZero<usize> = nz!(20);

/// Builder for creating an instance of [`PoolRegistry`].
///
/// All settings are optional. The registry is returned uninitialized; call
/// [`PoolRegistry::init()`] before opening pools.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segment_pool::{GrowthPolicy, PoolRegistry};
///
/// let mut registry = PoolRegistry::builder()
///     .store_growth(GrowthPolicy::with_initial_capacity(nz!(4)))
///     .build();
///
/// registry.init().unwrap();
/// assert_eq!(registry.capacity(), Some(4));
/// ```
#[derive(Debug)]
#[must_use]
pub struct PoolRegistryBuilder {
    store_growth: GrowthPolicy,
    node_growth: GrowthPolicy,
    gap_growth: GrowthPolicy,
    drop_policy: DropPolicy,

    _not_sync: PhantomData<Cell<()>>,
}

impl PoolRegistryBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            store_growth: GrowthPolicy::with_initial_capacity(DEFAULT_REGISTRY_CAPACITY),
            node_growth: GrowthPolicy::with_initial_capacity(DEFAULT_NODE_STORE_CAPACITY),
            gap_growth: GrowthPolicy::with_initial_capacity(DEFAULT_GAP_INDEX_CAPACITY),
            drop_policy: DropPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets how the array of pool slots grows as pools are opened.
    #[inline]
    pub fn store_growth(mut self, growth: GrowthPolicy) -> Self {
        self.store_growth = growth;
        self
    }

    /// Sets how the node store of every pool opened by the registry grows.
    #[inline]
    pub fn node_growth(mut self, growth: GrowthPolicy) -> Self {
        self.node_growth = growth;
        self
    }

    /// Sets how the gap index of every pool opened by the registry grows.
    #[inline]
    pub fn gap_growth(mut self, growth: GrowthPolicy) -> Self {
        self.gap_growth = growth;
        self
    }

    /// Sets the [drop policy][DropPolicy] of every pool opened by the registry.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the registry. It starts out uninitialized and allocates nothing until
    /// [`PoolRegistry::init()`] is called.
    #[inline]
    pub fn build(self) -> PoolRegistry {
        PoolRegistry::new_inner(
            self.store_growth,
            self.node_growth,
            self.gap_growth,
            self.drop_policy,
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::AllocPolicy;

    assert_impl_all!(PoolRegistryBuilder: Send);
    assert_not_impl_any!(PoolRegistryBuilder: Sync);

    #[test]
    fn default_registry_capacity() {
        let mut registry = PoolRegistry::builder().build();
        registry.init().unwrap();

        assert_eq!(registry.capacity(), Some(DEFAULT_REGISTRY_CAPACITY.get()));
    }

    #[test]
    fn drop_policy_is_passed_to_pools() {
        let mut registry = PoolRegistry::builder()
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .node_growth(GrowthPolicy::with_initial_capacity(nz!(2)))
            .gap_growth(GrowthPolicy::with_initial_capacity(nz!(2)))
            .build();
        registry.init().unwrap();

        let handle = registry.open_pool(nz!(64), AllocPolicy::FirstFit).unwrap();

        assert_eq!(
            registry.pool(handle).unwrap().drop_policy(),
            DropPolicy::MustNotDropAllocations
        );

        registry.close_pool(handle).unwrap();
    }
}
