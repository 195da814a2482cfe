#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Variable-size allocation from fixed-size byte pools.
//!
//! This crate provides [`SegmentPool`], a byte arena of fixed capacity that hands out
//! allocations of any size, and [`PoolRegistry`], which owns a dynamic set of such pools and
//! addresses them by handle.
//!
//! A pool obtains its buffer once, when it is built. Every byte of the buffer belongs to exactly
//! one segment, which is either in use by an allocation or free. Allocating splits a free
//! segment (a gap) and deallocating merges the freed segment with any free neighbors, so the
//! pool never contains two adjacent gaps.
//!
//! # Key Features
//!
//! - **Two placement policies**: [`AllocPolicy::FirstFit`] takes the lowest-addressed gap that
//!   fits, [`AllocPolicy::BestFit`] takes the smallest gap that fits
//! - **Immediate coalescing**: Freed segments are merged with free neighbors on the spot
//! - **Checked handles**: [`Allocation`] and [`PoolHandle`] values are validated on every use,
//!   so stale, foreign and double-freed handles are rejected with [`Error::InvalidHandle`]
//! - **Atomic operations**: An operation that fails leaves the pool or registry unchanged
//! - **Configurable bookkeeping growth**: Internal arrays grow according to a [`GrowthPolicy`]
//! - **Inspection**: [`SegmentPool::inspect()`] returns a snapshot of every segment in address
//!   order
//! - **Thread mobility**: Pools and registries can be moved between threads (but not shared
//!   without synchronization)
//!
//! # Example
//!
//! ```
//! use new_zealand::nz;
//! use segment_pool::{AllocPolicy, PoolRegistry};
//!
//! let mut registry = PoolRegistry::new();
//! registry.init().unwrap();
//!
//! let pool = registry.open_pool(nz!(1000), AllocPolicy::FirstFit).unwrap();
//!
//! let a = registry.allocate(pool, nz!(100)).unwrap();
//! let b = registry.allocate(pool, nz!(200)).unwrap();
//! let c = registry.allocate(pool, nz!(300)).unwrap();
//!
//! // Freeing the middle allocation leaves a gap between two used segments.
//! registry.deallocate(pool, b).unwrap();
//! assert_eq!(registry.pool(pool).unwrap().num_gaps(), 2);
//!
//! // Freeing the first allocation merges it with that gap.
//! registry.deallocate(pool, a).unwrap();
//! let gaps: Vec<_> = registry
//!     .inspect(pool)
//!     .unwrap()
//!     .into_iter()
//!     .filter(|segment| !segment.is_allocated())
//!     .map(|segment| segment.size())
//!     .collect();
//! assert_eq!(gaps, vec![300, 400]);
//!
//! registry.deallocate(pool, c).unwrap();
//! registry.close_pool(pool).unwrap();
//! registry.teardown().unwrap();
//! ```
//!
//! # Standalone pools
//!
//! A [`SegmentPool`] can also be used without a registry:
//!
//! ```
//! use new_zealand::nz;
//! use segment_pool::{AllocPolicy, SegmentPool};
//!
//! let mut pool = SegmentPool::builder()
//!     .capacity(nz!(500))
//!     .policy(AllocPolicy::BestFit)
//!     .build()
//!     .unwrap();
//!
//! let allocation = pool.allocate(nz!(60)).unwrap();
//! pool.bytes_mut(&allocation).unwrap().copy_from_slice(&[7; 60]);
//!
//! pool.deallocate(allocation).unwrap();
//! ```
//!
//! # Logging
//!
//! Lifecycle events (registry initialization and teardown, pools opening and closing) are
//! emitted as `tracing` debug events. Individual allocations and bookkeeping growth are
//! emitted at trace level. The crate does not install a subscriber.

mod alloc_policy;
mod buffer;
mod builder;
mod drop_policy;
mod error;
mod gap_index;
mod growth;
mod handles;
mod node_store;
mod pool;
mod registry;
mod registry_builder;
mod segment;

pub use alloc_policy::*;
pub(crate) use buffer::*;
pub use builder::*;
pub use drop_policy::*;
pub use error::Error;
pub(crate) use error::Result;
pub(crate) use gap_index::*;
pub use growth::{DEFAULT_EXPAND_FACTOR, DEFAULT_FILL_FACTOR, GrowthPolicy};
pub(crate) use growth::GrowableArray;
pub use handles::*;
pub(crate) use node_store::*;
pub use pool::{DEFAULT_GAP_INDEX_CAPACITY, DEFAULT_NODE_STORE_CAPACITY, SegmentPool};
pub use registry::PoolRegistry;
pub use registry_builder::*;
pub use segment::Segment;
