//! Basic usage example for `PoolRegistry` and `SegmentPool`.
//!
//! This example opens a pool through a registry, makes a few allocations, frees some of them
//! and prints the segment layout after every step so that splitting and merging are visible.

use new_zealand::nz;
use segment_pool::{AllocPolicy, PoolHandle, PoolRegistry};

fn print_layout(registry: &PoolRegistry, pool: PoolHandle, title: &str) {
    println!("{title}:");

    for segment in registry.inspect(pool).unwrap() {
        let state = if segment.is_allocated() { "used" } else { "free" };

        println!(
            "  [{:>4}..{:>4}) {state} ({} bytes)",
            segment.offset(),
            segment.offset() + segment.size(),
            segment.size()
        );
    }
}

fn main() {
    let mut registry = PoolRegistry::new();
    registry.init().unwrap();

    let pool = registry.open_pool(nz!(1000), AllocPolicy::FirstFit).unwrap();
    print_layout(&registry, pool, "Opened pool");

    let a = registry.allocate(pool, nz!(100)).unwrap();
    let b = registry.allocate(pool, nz!(200)).unwrap();
    let c = registry.allocate(pool, nz!(300)).unwrap();
    print_layout(&registry, pool, "After allocating 100, 200 and 300 bytes");

    registry
        .pool_mut(pool)
        .unwrap()
        .bytes_mut(&a)
        .unwrap()
        .fill(0x42);

    registry.deallocate(pool, b).unwrap();
    print_layout(&registry, pool, "After freeing the 200-byte allocation");

    registry.deallocate(pool, a).unwrap();
    print_layout(&registry, pool, "After freeing the 100-byte allocation");

    match registry.close_pool(pool) {
        Ok(()) => println!("Closed pool"),
        Err(e) => println!("Cannot close pool yet: {e}"),
    }

    registry.deallocate(pool, c).unwrap();
    print_layout(&registry, pool, "After freeing everything");

    registry.close_pool(pool).unwrap();
    registry.teardown().unwrap();

    println!("Registry torn down");
}
