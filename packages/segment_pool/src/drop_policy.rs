/// Determines what happens when a pool is dropped while it still has live allocations.
///
/// Closing a pool through [`PoolRegistry::close_pool()`][crate::PoolRegistry::close_pool]
/// always requires the pool to be idle. The drop policy only governs the case where a
/// [`SegmentPool`][crate::SegmentPool] value is dropped directly (or together with its registry).
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segment_pool::{DropPolicy, SegmentPool};
///
/// let pool = SegmentPool::builder()
///     .capacity(nz!(256))
///     .drop_policy(DropPolicy::MustNotDropAllocations)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The backing buffer is released even if allocations are still outstanding.
    /// This is the default.
    #[default]
    MayDropAllocations,

    /// The pool will panic if it still has allocations when it is dropped.
    ///
    /// Useful when outstanding allocations indicate a leak in the calling code.
    MustNotDropAllocations,
}
