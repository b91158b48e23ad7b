//! `mp-perf`: object pool churn and contention benchmarks

#![allow(clippy::print_stdout)] // This is a CLI tool that needs to print output
#![allow(clippy::cast_possible_truncation)] // Acceptable for benchmarking
#![allow(clippy::uninlined_format_args)] // Format args are fine for CLI output

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use hdrhistogram::Histogram;
use mempool::{Mempool, PoolCache, registry};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Synthetic pooled object, shaped like a small order record
#[derive(Default)]
struct Order {
    id: u64,
    qty: u64,
    _pad: [u8; 32],
}

#[derive(Parser, Debug)]
#[command(name = "mp-perf", about = "Object pool churn & contention benchmarks")]
struct Cli {
    #[arg(long, default_value = "info")]
    log: String,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Single-threaded allocate/release churn, optionally through a cache
    Churn {
        #[arg(long, default_value_t = 4096)]
        pool_size: usize,
        #[arg(long, default_value_t = 1_000_000)]
        iters: u64,
        /// enable a per-thread cache with this refill batch size
        #[arg(long)]
        cache: Option<usize>,
        /// objects held live between operations
        #[arg(long, default_value_t = 16)]
        depth: usize,
    },
    /// N threads hammering one shared pool
    Contend {
        #[arg(long, default_value_t = 65_536)]
        pool_size: usize,
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 250_000)]
        iters_per_thread: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log.clone()))
        .init();

    match cli.cmd {
        Cmd::Churn {
            pool_size,
            iters,
            cache,
            depth,
        } => churn(pool_size, iters, cache, depth)?,
        Cmd::Contend {
            pool_size,
            threads,
            iters_per_thread,
        } => contend(pool_size, threads, iters_per_thread)?,
    }

    show_pools();
    Ok(())
}

/// Hold up to `depth` guards, replacing a random one per iteration, and
/// record the per-operation latency.
fn run_churn<G>(
    mut alloc: impl FnMut() -> Option<G>,
    iters: u64,
    depth: usize,
    hist: &mut Histogram<u64>,
) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut held: Vec<G> = Vec::with_capacity(depth);

    for _ in 0..iters {
        let start = Instant::now();
        if held.len() >= depth {
            let victim = rng.gen_range(0..held.len());
            held.swap_remove(victim);
        }
        if let Some(guard) = alloc() {
            held.push(guard);
        }
        let _ = hist.record(start.elapsed().as_nanos() as u64);
    }
}

fn churn(pool_size: usize, iters: u64, cache: Option<usize>, depth: usize) -> Result<()> {
    let pool: Mempool<Order> = Mempool::new(pool_size)?;
    let mut hist = Histogram::<u64>::new(3)?;

    info!(pool_size, iters, ?cache, depth, "starting churn run");
    match cache {
        Some(base) => {
            let cache = PoolCache::new(&pool, base);
            run_churn(|| cache.allocate().ok(), iters, depth, &mut hist);
            info!(parked = cache.len(), "cache state after run");
        }
        None => run_churn(|| pool.allocate().ok(), iters, depth, &mut hist),
    }

    report("churn", &hist);
    info!(
        free = pool.free_count(),
        size = pool.size(),
        "pool state after run"
    );
    Ok(())
}

fn contend(pool_size: usize, threads: usize, iters_per_thread: u64) -> Result<()> {
    let pool: Mempool<Order> = Mempool::new(pool_size)?;
    let mut merged = Histogram::<u64>::new(3)?;

    info!(pool_size, threads, iters_per_thread, "starting contended run");
    std::thread::scope(|s| -> Result<()> {
        let mut workers = Vec::with_capacity(threads);
        for t in 0..threads {
            let pool = pool.clone();
            workers.push(s.spawn(move || -> Result<Histogram<u64>> {
                let mut hist = Histogram::<u64>::new(3)?;
                let mut rng = StdRng::seed_from_u64(t as u64);
                for i in 0..iters_per_thread {
                    let start = Instant::now();
                    match pool.allocate() {
                        Ok(mut order) => {
                            order.id = i;
                            order.qty = rng.gen_range(1..1_000);
                            std::hint::black_box(order.id.wrapping_add(order.qty));
                        }
                        Err(_) => std::thread::yield_now(),
                    }
                    let _ = hist.record(start.elapsed().as_nanos() as u64);
                }
                Ok(hist)
            }));
        }
        for worker in workers {
            let hist = worker.join().map_err(|_| anyhow!("worker panicked"))??;
            merged
                .add(&hist)
                .map_err(|e| anyhow!("merge histograms: {e:?}"))?;
        }
        Ok(())
    })?;

    if pool.free_count() != pool.size() {
        warn!(
            free = pool.free_count(),
            size = pool.size(),
            "slots missing after contended run"
        );
    }
    report("contend", &merged);
    Ok(())
}

fn report(label: &str, hist: &Histogram<u64>) {
    println!("{label}: {} ops", hist.len());
    println!("  p50:   {} ns", hist.value_at_quantile(0.50));
    println!("  p90:   {} ns", hist.value_at_quantile(0.90));
    println!("  p99:   {} ns", hist.value_at_quantile(0.99));
    println!("  p99.9: {} ns", hist.value_at_quantile(0.999));
    println!("  max:   {} ns", hist.max());
}

fn show_pools() {
    let mut out = String::new();
    registry::global().render_all(&mut out, 4096);
    print!("{out}");
}
