use std::num::NonZero;
use std::slice;

use new_zealand::nz;
use tracing::trace;

use crate::{Error, Result};

/// Controls when and by how much an internal array grows.
///
/// The registry, the node store of each pool and the gap index of each pool all grow
/// according to a policy of this type. Before an element is appended, the array checks
/// whether the append would push the fill ratio (`len / capacity`) above `fill_factor`. If it
/// would, the array is reallocated to `capacity * expand_factor` first.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segment_pool::GrowthPolicy;
///
/// let policy = GrowthPolicy::new(nz!(8), 0.5, nz!(4));
///
/// assert_eq!(policy.initial_capacity().get(), 8);
/// assert_eq!(policy.expand_factor().get(), 4);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GrowthPolicy {
    initial_capacity: NonZero<usize>,
    fill_factor: f64,
    expand_factor: NonZero<usize>,
}

/// Fill ratio above which an array grows, unless configured otherwise.
pub const DEFAULT_FILL_FACTOR: f64 = 0.75;

/// Multiplier applied to the capacity when an array grows, unless configured otherwise.
pub const DEFAULT_EXPAND_FACTOR: NonZero<usize> = nz!(2);

impl GrowthPolicy {
    /// Creates a growth policy.
    ///
    /// # Panics
    ///
    /// Panics if `fill_factor` is not in the range `(0.0, 1.0]` or if `expand_factor` is less
    /// than 2 (an array with such a policy could never make room for a new element).
    #[must_use]
    pub fn new(
        initial_capacity: NonZero<usize>,
        fill_factor: f64,
        expand_factor: NonZero<usize>,
    ) -> Self {
        assert!(
            fill_factor > 0.0 && fill_factor <= 1.0,
            "fill factor must be in the range (0.0, 1.0], got {fill_factor}"
        );
        assert!(
            expand_factor.get() >= 2,
            "expand factor must be at least 2, got {expand_factor}"
        );

        Self {
            initial_capacity,
            fill_factor,
            expand_factor,
        }
    }

    /// Creates a policy with the given initial capacity and the default fill and expand factors.
    #[must_use]
    pub fn with_initial_capacity(initial_capacity: NonZero<usize>) -> Self {
        Self::new(initial_capacity, DEFAULT_FILL_FACTOR, DEFAULT_EXPAND_FACTOR)
    }

    /// The number of elements an array has room for when first created.
    #[must_use]
    pub fn initial_capacity(&self) -> NonZero<usize> {
        self.initial_capacity
    }

    /// The fill ratio above which the array grows.
    #[must_use]
    pub fn fill_factor(&self) -> f64 {
        self.fill_factor
    }

    /// The multiplier applied to the capacity on growth.
    #[must_use]
    pub fn expand_factor(&self) -> NonZero<usize> {
        self.expand_factor
    }

    /// Returns `true` if appending one more element to an array with `len` elements and
    /// `capacity` slots would exceed the fill factor.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "element counts are far below the range where f64 loses integer precision"
    )]
    pub(crate) fn needs_growth(&self, len: usize, capacity: usize) -> bool {
        if capacity == 0 {
            return true;
        }

        // Cannot overflow because len is bounded by capacity, which is bounded by memory size.
        let next_len = len.wrapping_add(1);

        (next_len as f64 / capacity as f64) > self.fill_factor
    }

    /// Returns the capacity an array of `capacity` slots grows to, or `None` on overflow.
    #[must_use]
    pub(crate) fn grown_capacity(&self, capacity: usize) -> Option<usize> {
        capacity.checked_mul(self.expand_factor.get())
    }
}

/// A dynamically growing array that follows a [`GrowthPolicy`].
///
/// Elements keep their positions when the array grows; there is no compaction. Every
/// allocation is fallible and a failed growth attempt leaves the array exactly as it was.
#[derive(Debug)]
pub(crate) struct GrowableArray<T> {
    items: Vec<T>,

    /// Logical capacity as dictated by the growth policy. The `Vec` may hold more than this
    /// if the allocator hands out a larger block, which we ignore.
    capacity: usize,

    policy: GrowthPolicy,

    /// Name used in log output and in `OutOfMemory` errors.
    what: &'static str,
}

impl<T> GrowableArray<T> {
    /// Creates an empty array with room for the policy's initial capacity.
    pub(crate) fn with_policy(policy: GrowthPolicy, what: &'static str) -> Result<Self> {
        let capacity = policy.initial_capacity().get();

        let mut items = Vec::new();
        items
            .try_reserve_exact(capacity)
            .map_err(|_reserve_error| Error::OutOfMemory { what })?;

        Ok(Self {
            items,
            capacity,
            policy,
            what,
        })
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overrides the logical capacity, so growth failure can be exercised.
    #[cfg(test)]
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn policy(&self) -> GrowthPolicy {
        self.policy
    }

    /// Makes sure that one more element can be appended without violating the fill factor.
    ///
    /// Grows the array if necessary. On failure, the array is unchanged.
    pub(crate) fn reserve_one(&mut self) -> Result<()> {
        if !self.policy.needs_growth(self.items.len(), self.capacity) {
            return Ok(());
        }

        let new_capacity = self
            .policy
            .grown_capacity(self.capacity)
            .ok_or(Error::OutOfMemory { what: self.what })?;

        // The Vec already holds `len` elements, so we ask for the difference. Vec only swaps
        // in the new allocation once it has been obtained, so failure leaves us intact.
        let additional = new_capacity.saturating_sub(self.items.len());
        self.items
            .try_reserve_exact(additional)
            .map_err(|_reserve_error| Error::OutOfMemory { what: self.what })?;

        trace!(
            what = self.what,
            old_capacity = self.capacity,
            new_capacity,
            "array grown"
        );

        self.capacity = new_capacity;
        Ok(())
    }

    /// Appends an element, growing first if needed. Returns the index of the new element.
    pub(crate) fn push(&mut self, value: T) -> Result<usize> {
        self.reserve_one()?;

        let index = self.items.len();
        self.items.push(value);
        Ok(index)
    }

    /// Removes the element at `index`, shifting all subsequent elements one position left.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub(crate) fn remove(&mut self, index: usize) -> T {
        self.items.remove(index)
    }

    pub(crate) fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
    }

    #[must_use]
    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    #[must_use]
    pub(crate) fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub(crate) fn iter(&self) -> slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<'a, T> IntoIterator for &'a GrowableArray<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_initial_capacity() {
        let array =
            GrowableArray::<u32>::with_policy(GrowthPolicy::with_initial_capacity(nz!(20)), "test")
                .unwrap();

        assert_eq!(array.capacity(), 20);
        assert_eq!(array.len(), 0);
        assert!(array.is_empty());
    }

    #[test]
    fn grows_when_fill_factor_would_be_exceeded() {
        let mut array =
            GrowableArray::with_policy(GrowthPolicy::with_initial_capacity(nz!(4)), "test")
                .unwrap();

        // 3/4 == 0.75 does not exceed the default fill factor.
        for value in 0..3_u32 {
            array.push(value).unwrap();
        }
        assert_eq!(array.capacity(), 4);

        // 4/4 exceeds it, so the array doubles before the fourth element lands.
        array.push(3).unwrap();
        assert_eq!(array.capacity(), 8);
        assert_eq!(array.as_slice(), &[0, 1, 2, 3]);
    }

    #[test]
    fn growth_preserves_order_and_positions() {
        let mut array =
            GrowableArray::with_policy(GrowthPolicy::new(nz!(2), 0.5, nz!(3)), "test").unwrap();

        let mut indexes = Vec::new();
        for value in 0..20_u32 {
            indexes.push(array.push(value * 10).unwrap());
        }

        for (expected, index) in indexes.into_iter().enumerate() {
            assert_eq!(index, expected);
            assert_eq!(*array.get(index).unwrap(), u32::try_from(expected).unwrap() * 10);
        }

        // 2 -> 6 -> 18 -> 54
        assert_eq!(array.capacity(), 54);
    }

    #[test]
    fn full_fill_factor_grows_only_when_full() {
        let mut array =
            GrowableArray::with_policy(GrowthPolicy::new(nz!(2), 1.0, nz!(2)), "test").unwrap();

        array.push(1_u8).unwrap();
        array.push(2).unwrap();
        assert_eq!(array.capacity(), 2);

        array.push(3).unwrap();
        assert_eq!(array.capacity(), 4);
    }

    #[test]
    fn reserve_one_is_idempotent_below_threshold() {
        let mut array =
            GrowableArray::<u8>::with_policy(GrowthPolicy::with_initial_capacity(nz!(40)), "test")
                .unwrap();

        array.reserve_one().unwrap();
        array.reserve_one().unwrap();
        assert_eq!(array.capacity(), 40);
    }

    #[test]
    fn capacity_overflow_is_out_of_memory_and_leaves_array_intact() {
        // A fill factor this small makes every append request growth.
        let mut array = GrowableArray::<u8>::with_policy(
            GrowthPolicy::new(nz!(1), f64::MIN_POSITIVE, nz!(2)),
            "overflowing",
        )
        .unwrap();
        array.push(7).unwrap();

        // Pretend we are at the edge of the address space.
        array.capacity = usize::MAX;

        assert_eq!(
            array.reserve_one(),
            Err(Error::OutOfMemory {
                what: "overflowing"
            })
        );
        assert_eq!(array.capacity(), usize::MAX);
        assert_eq!(array.as_slice(), &[7]);
        assert_eq!(array.policy().expand_factor().get(), 2);
    }

    #[test]
    fn remove_shifts_left() {
        let mut array =
            GrowableArray::with_policy(GrowthPolicy::with_initial_capacity(nz!(8)), "test")
                .unwrap();
        for value in [1, 2, 3, 4] {
            array.push(value).unwrap();
        }

        assert_eq!(array.remove(1), 2);
        assert_eq!(array.as_slice(), &[1, 3, 4]);
    }

    #[test]
    fn needs_growth_thresholds() {
        let policy = GrowthPolicy::with_initial_capacity(nz!(20));

        assert!(!policy.needs_growth(14, 20));
        assert!(policy.needs_growth(15, 20));
        assert!(policy.needs_growth(0, 0));
    }

    #[test]
    #[should_panic]
    fn zero_fill_factor_panics() {
        _ = GrowthPolicy::new(nz!(4), 0.0, nz!(2));
    }

    #[test]
    #[should_panic]
    fn fill_factor_above_one_panics() {
        _ = GrowthPolicy::new(nz!(4), 1.5, nz!(2));
    }

    #[test]
    #[should_panic]
    fn expand_factor_of_one_panics() {
        _ = GrowthPolicy::new(nz!(4), 0.75, nz!(1));
    }
}
