//! Microbenchmarks for the pool allocator and the quarantine hot path.
//!
//! Plain binaries with wall-clock timing; run with
//! `cargo run --release -p cagealloc-benches --bin micro`.

use cagealloc::pool::bitmap::Pool;
use cagealloc::quarantine::{
    AllocatorRoot, QuarantineConfig, QuarantineRoot, SharedQuarantineBranch,
};
use cagealloc::util::SUPER_PAGE_SIZE;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

const SLOT: usize = 256;
const ARENA_SLOTS: usize = 4096;

/// Backing root that only counts frees; slot addresses come from a leaked
/// arena so the branch's zap writes land somewhere real.
struct CountingRoot {
    frees: AtomicUsize,
}

#[derive(Clone, Copy)]
struct BenchSpan {
    usable_size: usize,
}

impl AllocatorRoot for CountingRoot {
    type Span = BenchSpan;

    fn object_to_slot_start(&self, object: *mut u8) -> usize {
        object as usize
    }
    fn slot_start_to_object(&self, slot_start: usize) -> *mut u8 {
        slot_start as *mut u8
    }
    fn slot_span_from_object(&self, _object: *mut u8) -> BenchSpan {
        BenchSpan { usable_size: SLOT }
    }
    fn slot_span_from_slot_start(&self, _slot_start: usize) -> BenchSpan {
        BenchSpan { usable_size: SLOT }
    }
    fn slot_usable_size(&self, span: BenchSpan) -> usize {
        span.usable_size
    }
    fn is_direct_mapped(&self, _span: BenchSpan) -> bool {
        false
    }
    fn brp_enabled(&self) -> bool {
        false
    }
    unsafe fn pre_release_ref_count(&self, _slot_start: usize, _span: BenchSpan) {}
    unsafe fn free_immediate(&self, _object: *mut u8, _span: BenchSpan, _slot_start: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }
}

fn bench_pool_alloc_free(iterations: usize) -> f64 {
    let mut pool = Pool::new();
    pool.init(0x4000_0000_0000, 1024 * SUPER_PAGE_SIZE);

    let start = Instant::now();
    for _ in 0..iterations {
        let a = pool.find_chunk(black_box(SUPER_PAGE_SIZE)).unwrap();
        let b = pool.find_chunk(black_box(2 * SUPER_PAGE_SIZE)).unwrap();
        pool.free_chunk(black_box(a), SUPER_PAGE_SIZE);
        pool.free_chunk(black_box(b), 2 * SUPER_PAGE_SIZE);
    }
    start.elapsed().as_nanos() as f64 / (iterations * 4) as f64
}

fn bench_quarantine_throughput(num_threads: usize, ops_per_thread: usize) -> f64 {
    let troot = CountingRoot {
        frees: AtomicUsize::new(0),
    };
    let root = QuarantineRoot::new(&troot);
    let mut branch = SharedQuarantineBranch::new(&troot);
    branch.configure(
        &root,
        QuarantineConfig {
            branch_capacity_in_bytes: 64 * 1024,
            enable_quarantine: true,
            enable_zapping: true,
            leak_on_destruction: false,
        },
    );

    let start = Instant::now();
    std::thread::scope(|scope| {
        for _ in 0..num_threads {
            let branch = &branch;
            let arena: &'static mut [u8] =
                Box::leak(vec![0u8; ARENA_SLOTS * SLOT].into_boxed_slice());
            scope.spawn(move || {
                for i in 0..ops_per_thread {
                    let object = arena[(i % ARENA_SLOTS) * SLOT..].as_mut_ptr();
                    unsafe {
                        branch.quarantine(
                            black_box(object),
                            BenchSpan { usable_size: SLOT },
                            object as usize,
                            SLOT,
                        );
                    }
                }
            });
        }
    });
    let elapsed = start.elapsed();
    branch.purge();
    (num_threads * ops_per_thread) as f64 / elapsed.as_secs_f64()
}

fn main() {
    println!("=== cagealloc microbenchmarks ===\n");

    let ns = bench_pool_alloc_free(200_000);
    println!("pool find_chunk/free_chunk: {:>8.1} ns/op", ns);

    for &threads in &[1usize, 4] {
        let ops = bench_quarantine_throughput(threads, 1_000_000);
        println!(
            "quarantine throughput ({} thread{}): {:>12.0} ops/sec",
            threads,
            if threads == 1 { "" } else { "s" },
            ops
        );
    }
}
