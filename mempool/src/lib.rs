//! Fixed-capacity, concurrency-safe object pools
//!
//! Pre-sized arenas of same-typed slots recycled through a lock-free
//! ring acting as the free list, for long-running processes that must
//! avoid heap allocation on hot paths while bounding memory to a known
//! object count:
//! - NO ALLOCATIONS after pool creation
//! - NO LOCKS on allocate/release - the free list is a lock-free ring
//! - RAII slot guards make double-release and use-after-release
//!   unrepresentable
//! - Optional per-thread caches batch free-list traffic to amortize
//!   cross-thread contention
//! - Process-wide registry renders per-pool diagnostics

#![deny(warnings)]
#![deny(clippy::all)]

pub mod cache;
pub mod pool;
pub mod registry;

// Re-exports
pub use cache::{CacheRef, DEFAULT_CACHE_SIZE, PoolCache};
pub use pool::{Mempool, PoolError, PoolRef};
pub use registry::{PoolRecord, Registry};
