//! Multi-thread pool behavior: exclusivity and accounting under churn

use mempool::{Mempool, PoolCache};
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
struct Slot {
    owner: u64,
    nonce: u64,
}

#[test]
fn no_slot_is_handed_out_twice() {
    const THREADS: u64 = 8;
    const ITERS: u64 = 20_000;

    let pool: Mempool<Slot> = Mempool::new(33).unwrap(); // 32 usable
    let live = Mutex::new(HashSet::new());

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let pool = pool.clone();
            let live = &live;
            s.spawn(move || {
                for i in 0..ITERS {
                    match pool.allocate() {
                        Ok(mut slot) => {
                            let addr = &mut *slot as *mut Slot as usize;
                            // while the guard lives, nobody else may hold
                            // this slot
                            assert!(
                                live.lock().unwrap().insert(addr),
                                "slot handed out twice"
                            );
                            slot.owner = t;
                            slot.nonce = i;
                            assert!(live.lock().unwrap().remove(&addr));
                        }
                        Err(_) => std::thread::yield_now(),
                    }
                    assert!(pool.free_count() <= pool.size());
                }
            });
        }
    });

    assert_eq!(pool.free_count(), pool.size());
}

#[test]
fn contended_churn_preserves_accounting() {
    const THREADS: u64 = 4;
    const ITERS: u64 = 50_000;

    let pool: Mempool<Slot> = Mempool::new(64).unwrap();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let pool = pool.clone();
            s.spawn(move || {
                let mut held = Vec::new();
                for i in 0..ITERS {
                    if held.len() < 4 {
                        if let Ok(mut slot) = pool.allocate() {
                            slot.owner = t;
                            slot.nonce = i;
                            held.push(slot);
                        }
                    } else {
                        held.swap_remove((i % 4) as usize);
                    }
                }
            });
        }
    });

    // every guard dropped with its thread: the ring is whole again
    assert_eq!(pool.free_count(), pool.size());
}

#[test]
fn per_thread_caches_return_everything_on_drop() {
    const THREADS: u64 = 4;
    const ITERS: u64 = 10_000;

    let pool: Mempool<Slot> = Mempool::new(257).unwrap(); // 256 usable

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let pool = pool.clone();
            s.spawn(move || {
                let cache = PoolCache::new(&pool, 16);
                for i in 0..ITERS {
                    match cache.allocate() {
                        Ok(mut slot) => {
                            slot.owner = t;
                            slot.nonce = i;
                        }
                        Err(_) => std::thread::yield_now(),
                    }
                }
                // cache drop flushes its parked slots
            });
        }
    });

    assert_eq!(pool.free_count(), pool.size());
}

#[test]
fn mixed_cached_and_direct_threads_coexist() {
    const ITERS: u64 = 10_000;

    let pool: Mempool<Slot> = Mempool::new(128).unwrap();

    std::thread::scope(|s| {
        for t in 0..2u64 {
            let pool = pool.clone();
            s.spawn(move || {
                let cache = PoolCache::new(&pool, 8);
                for i in 0..ITERS {
                    if let Ok(mut slot) = cache.allocate() {
                        slot.owner = t;
                        slot.nonce = i;
                    }
                }
            });
        }
        for t in 2..4u64 {
            let pool = pool.clone();
            s.spawn(move || {
                for i in 0..ITERS {
                    match pool.allocate() {
                        Ok(mut slot) => {
                            slot.owner = t;
                            slot.nonce = i;
                        }
                        Err(_) => std::thread::yield_now(),
                    }
                }
            });
        }
    });

    assert_eq!(pool.free_count(), pool.size());
}
