//! Object pool core: arena, free-list ring, RAII slot guards

use crate::registry::{self, PoolRecord};
use ring::{Ring, RingError};
use std::any::type_name;
use std::cell::UnsafeCell;
use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Error types for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A pool must hold at least one usable object
    #[error("invalid pool capacity {0}: at least 2 objects required")]
    InvalidCapacity(usize),

    /// The free list cannot satisfy the request. With a cache in front,
    /// this also covers a refill that the ring could not fully serve.
    #[error("mempool [{type_name}] exhausted")]
    Exhausted {
        /// Pooled object type
        type_name: &'static str,
    },

    /// Free-list ring construction failed
    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Arena plus free-list ring, shared by every handle to one pool.
///
/// The arena is one contiguous slab of `usable` slots; a slot's identity
/// is its position, and its `u32` index is the only token that travels
/// through the free ring and the per-thread caches. At any instant an
/// index lives in exactly one of: the ring, one cache, or one guard.
pub(crate) struct PoolShared<T> {
    pub(crate) slots: Box<[UnsafeCell<T>]>,
    pub(crate) free: Ring<u32>,
    pub(crate) usable: usize,
}

// SAFETY: a slot is only reachable through the index handed out by the
// free ring, and that index is held by at most one guard at a time, so
// no two threads alias a slot. The ring provides the happens-before
// edges between a release and the next allocation of the same slot.
unsafe impl<T: Send> Send for PoolShared<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for PoolShared<T> {}

impl<T> PoolShared<T> {
    pub(crate) fn format_stats(&self, out: &mut String) {
        let total = self.usable;
        let free = self.free.len();
        let used = total - free;
        let pct = used * 100 / total;
        let _ = writeln!(
            out,
            "Mempool [{}]: {}/{} ({}% usage)",
            type_name::<T>(),
            free,
            total,
            pct
        );
    }
}

impl<T> Drop for PoolShared<T> {
    fn drop(&mut self) {
        debug!(
            type_name = type_name::<T>(),
            usable = self.usable,
            "destroying mempool"
        );
    }
}

/// Fixed-capacity object pool over a lock-free free-slot ring.
///
/// `Mempool` is a cheaply cloneable handle; clones share one arena and
/// one free list, so each thread holds its own handle. The pool is
/// destroyed when the last handle drops — there is no separate destroy
/// call, and no way to touch a destroyed pool.
pub struct Mempool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for Mempool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Default + Send + 'static> Mempool<T> {
    /// Create a pool of `count - 1` usable objects.
    ///
    /// The arena is allocated and default-initialized up front; the free
    /// ring is sized to `count` (rounded up to a power of two
    /// internally) and seeded with every slot index. The new pool is
    /// registered with the global [`Registry`](crate::Registry) for
    /// diagnostics.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidCapacity`] for `count < 2`, or a ring
    /// construction error for capacities the ring cannot represent.
    pub fn new(count: usize) -> Result<Self, PoolError> {
        if count < 2 {
            return Err(PoolError::InvalidCapacity(count));
        }
        let usable = count - 1;
        let mut slots = Vec::with_capacity(usable);
        slots.resize_with(usable, || UnsafeCell::new(T::default()));

        let free = Ring::new(count)?;
        let indices: Vec<u32> = (0..usable as u32).collect();
        // The ring was sized for `count`, so seeding `count - 1` indices
        // cannot fail.
        free.enqueue_bulk(&indices)?;

        let shared = Arc::new(PoolShared {
            slots: slots.into_boxed_slice(),
            free,
            usable,
        });

        debug!(
            type_name = type_name::<T>(),
            usable,
            ring_capacity = shared.free.capacity(),
            "created mempool"
        );

        let pool = Self { shared };
        registry::global().register(pool.make_record());
        Ok(pool)
    }
}

impl<T: Send + 'static> Mempool<T> {
    /// Append this pool's descriptor to an additional registry.
    ///
    /// Creation already registers with the global registry; local
    /// registries are for isolated diagnostics and tests.
    pub fn register_in(&self, registry: &registry::Registry) {
        registry.register(self.make_record());
    }

    fn make_record(&self) -> PoolRecord {
        let weak: Weak<PoolShared<T>> = Arc::downgrade(&self.shared);
        PoolRecord::new(
            self.shared.slots.as_ptr() as usize,
            size_of::<T>(),
            self.shared.usable,
            Box::new(move |out| {
                if let Some(shared) = weak.upgrade() {
                    shared.format_stats(out);
                    true
                } else {
                    false
                }
            }),
        )
    }
}

impl<T> Mempool<T> {
    /// Take one object from the pool.
    ///
    /// The returned guard dereferences to the object and returns its slot
    /// to the free list when dropped. Slot contents are recycled as-is:
    /// an object carries whatever state its previous holder left behind.
    ///
    /// # Errors
    /// Returns [`PoolError::Exhausted`] when the free list is empty.
    /// Callers sizing pools for worst-case concurrent demand may treat
    /// that as fatal; the pool itself stays usable.
    pub fn allocate(&self) -> Result<PoolRef<'_, T>, PoolError> {
        let mut index = [0u32; 1];
        if self.shared.free.dequeue_burst(&mut index) == 0 {
            return Err(PoolError::Exhausted {
                type_name: type_name::<T>(),
            });
        }
        Ok(PoolRef {
            shared: &self.shared,
            index: index[0],
        })
    }

    /// Objects currently in the shared free list.
    ///
    /// Slots parked in per-thread caches are invisible here: this counter
    /// reflects only the ring, matching the diagnostic output. Use
    /// [`PoolCache::len`](crate::PoolCache::len) to audit a cache.
    pub fn free_count(&self) -> usize {
        self.shared.free.len()
    }

    /// Usable capacity: the requested object count minus one.
    pub fn size(&self) -> usize {
        self.shared.usable
    }

    /// Append the diagnostic line
    /// `Mempool [<type>]: <free>/<total> (<pct>% usage)` to `out`.
    pub fn format_stats(&self, out: &mut String) {
        self.shared.format_stats(out);
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared<T>> {
        &self.shared
    }
}

impl<T> std::fmt::Debug for Mempool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("type", &type_name::<T>())
            .field("size", &self.size())
            .field("free_count", &self.free_count())
            .finish()
    }
}

/// RAII guard for one pooled object.
///
/// Holding the guard is holding the slot: the guard's move semantics are
/// what make double-release and use-after-release type errors rather
/// than runtime hazards. Dropping it returns the slot to the free ring.
pub struct PoolRef<'a, T> {
    shared: &'a PoolShared<T>,
    index: u32,
}

impl<T> Deref for PoolRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard owns the slot index exclusively until drop;
        // no other guard, cache, or ring entry refers to it.
        unsafe { &*self.shared.slots[self.index as usize].get() }
    }
}

impl<T> DerefMut for PoolRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; `&mut self` gives unique access to the guard.
        unsafe { &mut *self.shared.slots[self.index as usize].get() }
    }
}

impl<T> Drop for PoolRef<'_, T> {
    fn drop(&mut self) {
        let n = self.shared.free.enqueue_burst(&[self.index]);
        debug_assert_eq!(n, 1, "free ring cannot be full while a slot is live");
    }
}
