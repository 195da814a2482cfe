use thiserror::Error;

/// Errors that can occur when operating on pools and the registry that owns them.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Memory for one of the internal structures could not be obtained from the global
    /// allocator. The structure that was being grown or created is left untouched.
    #[error("out of memory while allocating {what}")]
    OutOfMemory {
        /// Which structure failed to allocate.
        what: &'static str,
    },

    /// The gap index of a pool needed to grow but the growth could not be satisfied.
    #[error("gap index is full and cannot grow")]
    IndexFull,

    /// The registry was initialized twice without a teardown in between.
    #[error("registry is already initialized")]
    AlreadyInitialized,

    /// The registry was used before `init()` or after `teardown()`.
    #[error("registry is not initialized")]
    NotInitialized,

    /// Teardown was requested while pools were still open.
    #[error("registry cannot be torn down while {open_pools} pools are still open")]
    PoolsStillOpen {
        /// Number of pools that are still open.
        open_pools: usize,
    },

    /// No gap in the pool is large enough to satisfy the request.
    #[error("no gap can fit {requested} bytes (largest gap is {largest_gap} bytes)")]
    InsufficientSpace {
        /// The number of bytes that was requested.
        requested: usize,

        /// The size of the largest gap in the pool at the time of the request.
        largest_gap: usize,
    },

    /// A pool cannot be closed because it still has allocations or is fragmented.
    #[error("pool still has {num_allocs} allocations and {num_gaps} gaps")]
    NotFreed {
        /// Number of outstanding allocations.
        num_allocs: usize,

        /// Number of gaps in the pool.
        num_gaps: usize,
    },

    /// A pool handle or an allocation handle is not valid for the target of the call.
    ///
    /// This covers handles from a different pool or registry, handles whose pool has been
    /// closed and allocations that have already been released.
    #[error("handle is not valid for this pool or registry")]
    InvalidHandle,

    /// The gap index has no entry for the given node.
    #[error("gap index has no entry for node {node} of size {size}")]
    EntryNotFound {
        /// The size that was used as a lookup hint.
        size: usize,

        /// The node slot index that was searched for.
        node: usize,
    },
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug, Clone);

    #[test]
    fn insufficient_space_message_names_sizes() {
        let error = Error::InsufficientSpace {
            requested: 120,
            largest_gap: 64,
        };

        let message = error.to_string();
        assert!(message.contains("120"));
        assert!(message.contains("64"));
    }

    #[test]
    fn not_freed_message_names_counts() {
        let error = Error::NotFreed {
            num_allocs: 2,
            num_gaps: 3,
        };

        assert_eq!(
            error.to_string(),
            "pool still has 2 allocations and 3 gaps"
        );
    }
}
