//! Per-thread cache front for a pool
//!
//! Batches free-list traffic: allocations refill from the shared ring
//! `base` slots at a time, releases park locally and flush only when the
//! cache reaches twice `base`. In steady state a thread touches the
//! shared ring once per `base` operations instead of on every one.

use crate::pool::{Mempool, PoolError};
use std::any::type_name;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use tracing::debug;

/// Default refill batch size.
pub const DEFAULT_CACHE_SIZE: usize = 32;

/// Cache storage is `FLUSH_FACTOR * base`; reaching it triggers a flush
/// back down to `base`.
const FLUSH_FACTOR: usize = 2;

/// Single-threaded cache in front of a shared [`Mempool`].
///
/// The cache is explicit per-thread state: each worker constructs its
/// own over a clone of the pool handle, and its lifetime is visible at
/// the call site. Interior state lives in a `RefCell`, so the type is
/// deliberately not `Sync`.
///
/// The refill/flush hysteresis means slots parked here are invisible to
/// [`Mempool::free_count`] until a flush; an allocation served from the
/// cache of thread A can therefore look "missing" to thread B.
pub struct PoolCache<T> {
    pool: Mempool<T>,
    base: usize,
    parked: RefCell<Vec<u32>>,
}

impl<T> PoolCache<T> {
    /// Create a cache with refill batch `base` (storage `2 * base`).
    ///
    /// # Panics
    /// Panics if `base` is zero.
    pub fn new(pool: &Mempool<T>, base: usize) -> Self {
        assert!(base > 0, "cache base size must be non-zero");
        Self {
            pool: pool.clone(),
            base,
            parked: RefCell::new(Vec::with_capacity(FLUSH_FACTOR * base)),
        }
    }

    /// Create a cache with the default batch size.
    pub fn with_default_size(pool: &Mempool<T>) -> Self {
        Self::new(pool, DEFAULT_CACHE_SIZE)
    }

    /// Take one object, refilling from the shared ring if the cache is
    /// empty.
    ///
    /// A refill moves exactly `base` slots in one bulk dequeue — the
    /// cache never half-fills. If the ring cannot serve a full batch the
    /// allocation fails even though some slots may remain in the ring.
    ///
    /// # Errors
    /// Returns [`PoolError::Exhausted`] when a refill cannot be served.
    pub fn allocate(&self) -> Result<CacheRef<'_, T>, PoolError> {
        let mut parked = self.parked.borrow_mut();
        if parked.is_empty() {
            parked.resize(self.base, 0);
            if self.pool.shared().free.dequeue_bulk(&mut parked[..]).is_err() {
                parked.clear();
                return Err(PoolError::Exhausted {
                    type_name: type_name::<T>(),
                });
            }
        }
        match parked.pop() {
            Some(index) => {
                drop(parked);
                Ok(CacheRef { cache: self, index })
            }
            None => Err(PoolError::Exhausted {
                type_name: type_name::<T>(),
            }),
        }
    }

    /// Slots currently parked in this cache.
    pub fn len(&self) -> usize {
        self.parked.borrow().len()
    }

    /// True when no slots are parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refill batch size.
    pub fn base_size(&self) -> usize {
        self.base
    }

    /// Occupancy at which a release flushes the cache back to `base`.
    pub fn flush_threshold(&self) -> usize {
        FLUSH_FACTOR * self.base
    }

    /// The pool this cache fronts.
    pub fn pool(&self) -> &Mempool<T> {
        &self.pool
    }
}

impl<T> Drop for PoolCache<T> {
    fn drop(&mut self) {
        // Parked slots go back to the shared ring; anything left here
        // would vanish from the pool's accounting.
        let parked = self.parked.get_mut();
        if !parked.is_empty() {
            let n = self.pool.shared().free.enqueue_burst(parked.as_slice());
            debug_assert_eq!(n, parked.len(), "live slots always fit the ring");
            debug!(
                type_name = type_name::<T>(),
                flushed = n,
                "flushed cache on drop"
            );
            parked.clear();
        }
    }
}

impl<T> std::fmt::Debug for PoolCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCache")
            .field("type", &type_name::<T>())
            .field("base", &self.base)
            .field("len", &self.len())
            .finish()
    }
}

/// RAII guard for an object allocated through a [`PoolCache`].
///
/// Dropping the guard parks the slot in the cache; when occupancy
/// reaches the flush threshold, everything above `base` goes back to the
/// shared ring in one bulk enqueue.
pub struct CacheRef<'a, T> {
    cache: &'a PoolCache<T>,
    index: u32,
}

impl<T> Deref for CacheRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the index was taken from the cache, which holds it
        // exclusively; no other guard, cache, or ring entry refers to it.
        unsafe { &*self.cache.pool.shared().slots[self.index as usize].get() }
    }
}

impl<T> DerefMut for CacheRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; `&mut self` gives unique access to the guard.
        unsafe { &mut *self.cache.pool.shared().slots[self.index as usize].get() }
    }
}

impl<T> Drop for CacheRef<'_, T> {
    fn drop(&mut self) {
        let mut parked = self.cache.parked.borrow_mut();
        parked.push(self.index);
        if parked.len() >= self.cache.flush_threshold() {
            let spill = parked.split_off(self.cache.base);
            let flushed = self.cache.pool.shared().free.enqueue_bulk(&spill);
            debug_assert!(flushed.is_ok(), "live slots always fit the ring");
        }
    }
}
