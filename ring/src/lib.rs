//! Lock-free bounded MP/MC ring buffer
//!
//! Fixed-capacity circular buffer with split producer/consumer cursor
//! pairs, designed as the free-list transport for object pools and other
//! hot-path handoffs:
//! - **Bulk** operations move exactly N elements or nothing at all
//! - **Burst** operations move up to N elements and report the count
//! - Multi-producer/multi-consumer by default; single-producer and
//!   single-consumer fast paths elide the CAS when fixed at creation
//! - No locks, no blocking: a full or empty ring is an immediate result
//!
//! One slot is always kept unoccupied so `head == tail` unambiguously
//! means empty; a ring of capacity `C` therefore holds `C - 1` elements.

#![deny(warnings)]
#![deny(clippy::all)]

use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::debug;

/// Largest accepted capacity. Cursors are 32-bit and wrap modulo 2^32;
/// keeping the capacity well below that bound keeps the window arithmetic
/// unambiguous.
pub const MAX_CAPACITY: usize = 1 << 30;

/// Error types for ring construction and bulk transfers
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// Capacity outside the representable range
    #[error("invalid ring capacity {0}: must be in 2..={MAX_CAPACITY}")]
    InvalidCapacity(usize),

    /// Bulk enqueue rejected: not enough free slots
    #[error("ring full: requested {requested}, free {free}")]
    Full {
        /// Elements the caller asked to enqueue
        requested: usize,
        /// Free slots at the time of the attempt
        free: usize,
    },

    /// Bulk dequeue rejected: not enough occupied slots
    #[error("ring empty: requested {requested}, available {available}")]
    Empty {
        /// Elements the caller asked to dequeue
        requested: usize,
        /// Occupied slots at the time of the attempt
        available: usize,
    },

    /// Watermark must stay below the ring capacity
    #[error("invalid watermark {0}: must be below capacity")]
    InvalidWatermark(usize),
}

/// Producer/consumer synchronization shape, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingMode {
    /// Exactly one thread enqueues; the producer CAS is elided
    pub single_producer: bool,
    /// Exactly one thread dequeues; the consumer CAS is elided
    pub single_consumer: bool,
}

impl RingMode {
    /// Multi-producer, multi-consumer (the default)
    #[must_use]
    pub const fn mpmc() -> Self {
        Self {
            single_producer: false,
            single_consumer: false,
        }
    }

    /// Single-producer, single-consumer: both CAS loops elided
    #[must_use]
    pub const fn spsc() -> Self {
        Self {
            single_producer: true,
            single_consumer: true,
        }
    }
}

/// One side of the ring: a head/tail cursor pair.
///
/// `head` is advanced to reserve a range, `tail` to publish it. Between
/// the two, the range belongs exclusively to the reserving thread.
struct Cursor {
    head: AtomicU32,
    tail: AtomicU32,
    single: bool,
}

impl Cursor {
    fn new(single: bool) -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            single,
        }
    }
}

/// Lock-free bounded ring buffer of `Copy` elements.
///
/// The element type is `Copy` because the ring is a transport, not an
/// owner: elements are small handles (indices, pointers, tokens) that are
/// bitwise-moved through the buffer.
pub struct Ring<T: Copy> {
    prod: CachePadded<Cursor>,
    cons: CachePadded<Cursor>,
    mask: u32,
    watermark: AtomicU32,
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: every storage cell is accessed by exactly one thread at a time:
// a cell belongs to the producer that reserved its cursor range until the
// producer tail passes it, and to the dequeuing consumer afterwards. The
// cursor protocol (Acquire/Release on the tails) provides the
// happens-before edges between those accesses.
unsafe impl<T: Copy + Send> Send for Ring<T> {}
// SAFETY: see above; `&Ring` only exposes the cursor-mediated protocol.
unsafe impl<T: Copy + Send> Sync for Ring<T> {}

impl<T: Copy> std::fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl<T: Copy> Ring<T> {
    /// Create a multi-producer/multi-consumer ring.
    ///
    /// `capacity` is rounded up to the next power of two; one slot stays
    /// reserved, so the ring holds `capacity.next_power_of_two() - 1`
    /// elements at most.
    ///
    /// # Errors
    /// Returns [`RingError::InvalidCapacity`] for capacities below 2 or
    /// above [`MAX_CAPACITY`].
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        Self::with_mode(capacity, RingMode::mpmc())
    }

    /// Create a ring with an explicit synchronization shape.
    ///
    /// # Errors
    /// Returns [`RingError::InvalidCapacity`] for capacities below 2 or
    /// above [`MAX_CAPACITY`].
    pub fn with_mode(capacity: usize, mode: RingMode) -> Result<Self, RingError> {
        if !(2..=MAX_CAPACITY).contains(&capacity) {
            return Err(RingError::InvalidCapacity(capacity));
        }
        let cap = capacity.next_power_of_two();
        let mut storage = Vec::with_capacity(cap);
        storage.resize_with(cap, || UnsafeCell::new(MaybeUninit::uninit()));

        debug!(capacity = cap, ?mode, "created ring");

        Ok(Self {
            prod: CachePadded::new(Cursor::new(mode.single_producer)),
            cons: CachePadded::new(Cursor::new(mode.single_consumer)),
            mask: (cap - 1) as u32,
            // capacity == disabled: occupancy can never exceed cap - 1
            watermark: AtomicU32::new(cap as u32),
            storage: storage.into_boxed_slice(),
        })
    }

    /// Total slot count (power of two). Usable capacity is one less.
    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Occupied entries, as published by both tails.
    pub fn len(&self) -> usize {
        let prod_tail = self.prod.tail.load(Ordering::Acquire);
        let cons_tail = self.cons.tail.load(Ordering::Acquire);
        (prod_tail.wrapping_sub(cons_tail) & self.mask) as usize
    }

    /// Free entries: `capacity - 1 - len`.
    pub fn free_len(&self) -> usize {
        self.mask as usize - self.len()
    }

    /// True when no entries are published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when no further entry can be enqueued.
    pub fn is_full(&self) -> bool {
        self.free_len() == 0
    }

    /// Set the soft occupancy limit; `0` disables it.
    ///
    /// The watermark does not affect transfers. It is advisory state for
    /// back-pressure diagnostics, read back via [`Ring::above_watermark`].
    ///
    /// # Errors
    /// Returns [`RingError::InvalidWatermark`] when `count` is not below
    /// the ring capacity.
    pub fn set_watermark(&self, count: usize) -> Result<(), RingError> {
        if count >= self.capacity() {
            return Err(RingError::InvalidWatermark(count));
        }
        let val = if count == 0 {
            self.capacity() as u32
        } else {
            count as u32
        };
        self.watermark.store(val, Ordering::Relaxed);
        Ok(())
    }

    /// Current watermark, or `None` when disabled.
    pub fn watermark(&self) -> Option<usize> {
        let wm = self.watermark.load(Ordering::Relaxed) as usize;
        (wm != self.capacity()).then_some(wm)
    }

    /// True when occupancy currently exceeds an enabled watermark.
    pub fn above_watermark(&self) -> bool {
        self.len() > self.watermark.load(Ordering::Relaxed) as usize
    }

    /// Enqueue exactly `items.len()` elements, or nothing.
    ///
    /// # Errors
    /// Returns [`RingError::Full`] (with no partial effect) when fewer
    /// than `items.len()` slots are free.
    pub fn enqueue_bulk(&self, items: &[T]) -> Result<(), RingError> {
        self.do_enqueue(items, true).map(|_| ())
    }

    /// Enqueue up to `items.len()` elements; returns the count actually
    /// published. `0` means the ring was full — never an error.
    pub fn enqueue_burst(&self, items: &[T]) -> usize {
        self.do_enqueue(items, false).unwrap_or(0)
    }

    /// Dequeue exactly `out.len()` elements into `out`, or nothing.
    ///
    /// # Errors
    /// Returns [`RingError::Empty`] (with no partial effect) when fewer
    /// than `out.len()` entries are available.
    pub fn dequeue_bulk(&self, out: &mut [T]) -> Result<(), RingError> {
        self.do_dequeue(out, true).map(|_| ())
    }

    /// Dequeue up to `out.len()` elements into the prefix of `out`;
    /// returns the count actually taken. `0` means the ring was empty.
    pub fn dequeue_burst(&self, out: &mut [T]) -> usize {
        self.do_dequeue(out, false).unwrap_or(0)
    }

    /// Reserve a producer window, copy the payload in, publish in
    /// reservation order.
    fn do_enqueue(&self, items: &[T], fixed: bool) -> Result<usize, RingError> {
        if items.is_empty() {
            return Ok(0);
        }
        let mask = self.mask;
        if fixed && items.len() > mask as usize {
            return Err(RingError::Full {
                requested: items.len(),
                free: self.free_len(),
            });
        }
        let mut n = items.len().min(mask as usize) as u32;

        let old_head;
        if self.prod.single {
            let head = self.prod.head.load(Ordering::Relaxed);
            let cons_tail = self.cons.tail.load(Ordering::Acquire);
            let free = mask.wrapping_add(cons_tail).wrapping_sub(head);
            if n > free {
                if fixed {
                    return Err(RingError::Full {
                        requested: n as usize,
                        free: free as usize,
                    });
                }
                n = free;
                if n == 0 {
                    return Ok(0);
                }
            }
            old_head = head;
            self.prod.head.store(head.wrapping_add(n), Ordering::Relaxed);
        } else {
            let mut head = self.prod.head.load(Ordering::Relaxed);
            loop {
                // Acquire pairs with the consumer tail Release: a slot is
                // only reused after its previous occupant was read out.
                let cons_tail = self.cons.tail.load(Ordering::Acquire);
                let free = mask.wrapping_add(cons_tail).wrapping_sub(head);
                let take = if n > free {
                    if fixed {
                        return Err(RingError::Full {
                            requested: n as usize,
                            free: free as usize,
                        });
                    }
                    free
                } else {
                    n
                };
                if take == 0 {
                    return Ok(0);
                }
                match self.prod.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(take),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        n = take;
                        break;
                    }
                    Err(actual) => head = actual,
                }
            }
            old_head = head;
        }

        for (i, item) in items[..n as usize].iter().enumerate() {
            let idx = (old_head.wrapping_add(i as u32) & mask) as usize;
            // SAFETY: the window [old_head, old_head + n) is exclusively
            // ours between head reservation and tail publication; no other
            // thread reads or writes these cells until prod.tail passes.
            unsafe { (*self.storage[idx].get()).write(*item) };
        }

        if !self.prod.single {
            // Publication must follow reservation order so consumers never
            // observe a later window before an earlier one is complete.
            let backoff = Backoff::new();
            while self.prod.tail.load(Ordering::Acquire) != old_head {
                backoff.snooze();
            }
        }
        self.prod
            .tail
            .store(old_head.wrapping_add(n), Ordering::Release);
        Ok(n as usize)
    }

    /// Mirror of [`Ring::do_enqueue`] on the consumer side, bounded by the
    /// producer tail.
    fn do_dequeue(&self, out: &mut [T], fixed: bool) -> Result<usize, RingError> {
        if out.is_empty() {
            return Ok(0);
        }
        let mask = self.mask;
        if fixed && out.len() > mask as usize {
            return Err(RingError::Empty {
                requested: out.len(),
                available: self.len(),
            });
        }
        let mut n = out.len().min(mask as usize) as u32;

        let old_head;
        if self.cons.single {
            let head = self.cons.head.load(Ordering::Relaxed);
            let prod_tail = self.prod.tail.load(Ordering::Acquire);
            let available = prod_tail.wrapping_sub(head);
            if n > available {
                if fixed {
                    return Err(RingError::Empty {
                        requested: n as usize,
                        available: available as usize,
                    });
                }
                n = available;
                if n == 0 {
                    return Ok(0);
                }
            }
            old_head = head;
            self.cons.head.store(head.wrapping_add(n), Ordering::Relaxed);
        } else {
            let mut head = self.cons.head.load(Ordering::Relaxed);
            loop {
                // Acquire pairs with the producer tail Release: entries are
                // only read after their payload writes are visible.
                let prod_tail = self.prod.tail.load(Ordering::Acquire);
                let available = prod_tail.wrapping_sub(head);
                let take = if n > available {
                    if fixed {
                        return Err(RingError::Empty {
                            requested: n as usize,
                            available: available as usize,
                        });
                    }
                    available
                } else {
                    n
                };
                if take == 0 {
                    return Ok(0);
                }
                match self.cons.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(take),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        n = take;
                        break;
                    }
                    Err(actual) => head = actual,
                }
            }
            old_head = head;
        }

        for (i, slot) in out[..n as usize].iter_mut().enumerate() {
            let idx = (old_head.wrapping_add(i as u32) & mask) as usize;
            // SAFETY: prod.tail has passed this window, so every cell in it
            // was initialized by a producer, and the consumer reservation
            // gives us exclusive read access until cons.tail passes.
            *slot = unsafe { (*self.storage[idx].get()).assume_init_read() };
        }

        if !self.cons.single {
            let backoff = Backoff::new();
            while self.cons.tail.load(Ordering::Acquire) != old_head {
                backoff.snooze();
            }
        }
        self.cons
            .tail
            .store(old_head.wrapping_add(n), Ordering::Release);
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let ring = Ring::<u32>::new(33).unwrap();
        assert_eq!(ring.capacity(), 64);
        assert_eq!(ring.free_len(), 63);

        let ring = Ring::<u32>::new(64).unwrap();
        assert_eq!(ring.capacity(), 64);
    }

    #[test]
    fn rejects_degenerate_capacities() {
        assert_eq!(
            Ring::<u32>::new(0).unwrap_err(),
            RingError::InvalidCapacity(0)
        );
        assert_eq!(
            Ring::<u32>::new(1).unwrap_err(),
            RingError::InvalidCapacity(1)
        );
        assert_eq!(
            Ring::<u32>::new(MAX_CAPACITY + 1).unwrap_err(),
            RingError::InvalidCapacity(MAX_CAPACITY + 1)
        );
    }

    #[test]
    fn bulk_is_all_or_nothing() {
        let ring = Ring::<u32>::new(8).unwrap(); // 7 usable

        ring.enqueue_bulk(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(ring.len(), 5);

        // 5 more would need 5 free, only 2 remain: no partial effect
        let err = ring.enqueue_bulk(&[6, 7, 8, 9, 10]).unwrap_err();
        assert_eq!(
            err,
            RingError::Full {
                requested: 5,
                free: 2
            }
        );
        assert_eq!(ring.len(), 5);

        let mut out = [0u32; 7];
        let err = ring.dequeue_bulk(&mut out).unwrap_err();
        assert_eq!(
            err,
            RingError::Empty {
                requested: 7,
                available: 5
            }
        );
        assert_eq!(ring.len(), 5);

        let mut out = [0u32; 5];
        ring.dequeue_bulk(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5]);
        assert!(ring.is_empty());
    }

    #[test]
    fn burst_takes_what_fits() {
        let ring = Ring::<u32>::new(8).unwrap(); // 7 usable

        assert_eq!(ring.enqueue_burst(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(ring.enqueue_burst(&[6, 7, 8, 9, 10]), 2);
        assert!(ring.is_full());
        assert_eq!(ring.enqueue_burst(&[11]), 0);

        let mut out = [0u32; 10];
        assert_eq!(ring.dequeue_burst(&mut out), 7);
        assert_eq!(&out[..7], &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(ring.dequeue_burst(&mut out), 0);
    }

    #[test]
    fn cursors_wrap_around_the_storage() {
        let ring = Ring::<u64>::new(8).unwrap();
        let mut out = [0u64; 3];
        for cycle in 0..10_000u64 {
            ring.enqueue_bulk(&[cycle, cycle + 1, cycle + 2]).unwrap();
            ring.dequeue_bulk(&mut out).unwrap();
            assert_eq!(out, [cycle, cycle + 1, cycle + 2]);
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn watermark_is_advisory_state() {
        let ring = Ring::<u32>::new(8).unwrap();
        assert_eq!(ring.watermark(), None);
        assert!(!ring.above_watermark());

        ring.set_watermark(4).unwrap();
        assert_eq!(ring.watermark(), Some(4));

        ring.enqueue_bulk(&[1, 2, 3, 4]).unwrap();
        assert!(!ring.above_watermark());
        ring.enqueue_bulk(&[5]).unwrap();
        assert!(ring.above_watermark());

        // enqueue behavior itself is unaffected
        assert_eq!(ring.enqueue_burst(&[6, 7]), 2);

        assert_eq!(
            ring.set_watermark(8),
            Err(RingError::InvalidWatermark(8))
        );
        ring.set_watermark(0).unwrap();
        assert_eq!(ring.watermark(), None);
        assert!(!ring.above_watermark());
    }

    #[test]
    fn spsc_mode_transfers_in_order() {
        let ring = Ring::<u64>::with_mode(256, RingMode::spsc()).unwrap();
        const TOTAL: u64 = 100_000;

        std::thread::scope(|s| {
            let r = &ring;
            s.spawn(move || {
                let mut next = 0u64;
                while next < TOTAL {
                    if r.enqueue_burst(&[next]) == 1 {
                        next += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            });
            s.spawn(move || {
                let mut expect = 0u64;
                let mut out = [0u64; 16];
                while expect < TOTAL {
                    let n = r.dequeue_burst(&mut out);
                    for &v in &out[..n] {
                        assert_eq!(v, expect);
                        expect += 1;
                    }
                    if n == 0 {
                        std::thread::yield_now();
                    }
                }
            });
        });
    }

    #[test]
    fn mpmc_transfer_loses_and_duplicates_nothing() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let ring = Ring::<u64>::new(256).unwrap();
        let received = Mutex::new(Vec::with_capacity(TOTAL));
        let consumed = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                let ring = &ring;
                s.spawn(move || {
                    let base = (p * PER_PRODUCER) as u64;
                    let mut sent = 0;
                    while sent < PER_PRODUCER {
                        let end = (sent + 32).min(PER_PRODUCER);
                        let batch: Vec<u64> =
                            (sent..end).map(|i| base + i as u64).collect();
                        let mut off = 0;
                        while off < batch.len() {
                            let n = ring.enqueue_burst(&batch[off..]);
                            off += n;
                            if n == 0 {
                                std::thread::yield_now();
                            }
                        }
                        sent = end;
                    }
                });
            }
            for _ in 0..CONSUMERS {
                let ring = &ring;
                let received = &received;
                let consumed = &consumed;
                s.spawn(move || {
                    let mut out = [0u64; 32];
                    loop {
                        let n = ring.dequeue_burst(&mut out);
                        if n == 0 {
                            if consumed.load(Ordering::Relaxed) >= TOTAL {
                                break;
                            }
                            std::thread::yield_now();
                            continue;
                        }
                        consumed.fetch_add(n, Ordering::Relaxed);
                        received.lock().unwrap().extend_from_slice(&out[..n]);
                    }
                });
            }
        });

        let mut all = received.into_inner().unwrap();
        all.sort_unstable();
        assert_eq!(all.len(), TOTAL);
        for (i, v) in all.iter().enumerate() {
            assert_eq!(*v, i as u64);
        }
    }

    proptest! {
        /// Single-threaded burst sequences behave like a FIFO queue model.
        #[test]
        fn burst_sequences_match_queue_model(
            ops in proptest::collection::vec((any::<bool>(), 1usize..16), 1..200)
        ) {
            let ring = Ring::<u32>::new(64).unwrap();
            let mut model: VecDeque<u32> = VecDeque::new();
            let mut next = 0u32;

            for (is_enqueue, count) in ops {
                if is_enqueue {
                    let items: Vec<u32> = (0..count as u32).map(|i| next + i).collect();
                    let done = ring.enqueue_burst(&items);
                    model.extend(&items[..done]);
                    next += count as u32;
                } else {
                    let mut out = vec![0u32; count];
                    let done = ring.dequeue_burst(&mut out);
                    for &v in &out[..done] {
                        prop_assert_eq!(model.pop_front(), Some(v));
                    }
                }
                prop_assert_eq!(ring.len(), model.len());
                prop_assert_eq!(ring.free_len(), 63 - model.len());
            }
        }
    }
}
