#![no_main]

use cagealloc::pool::bitmap::Pool;
use cagealloc::util::SUPER_PAGE_SIZE;
use libfuzzer_sys::fuzz_target;

/// Fuzz target driving a pool bitmap through alloc/free sequences.
///
/// Each operation is encoded as:
///   byte 0: opcode (bit 0: 0=alloc, 1=free)
///   byte 1: size in super-pages (alloc) or live-chunk index (free)
///
/// Invariant checked after every operation: the number of set occupancy
/// bits equals the total super-pages of all live chunks.
const POOL_PAGES: usize = 256;
const BASE: usize = 0x5000_0000_0000;

fuzz_target!(|data: &[u8]| {
    let mut pool = Pool::new();
    pool.init(BASE, POOL_PAGES * SUPER_PAGE_SIZE);

    // (address, super-pages)
    let mut live: Vec<(usize, usize)> = Vec::new();
    let mut live_pages = 0usize;

    let mut i = 0;
    while i + 2 <= data.len() {
        let opcode = data[i];
        let arg = data[i + 1] as usize;
        i += 2;

        if opcode & 1 == 0 {
            // alloc
            let pages = (arg % 16) + 1;
            if let Some(addr) = pool.find_chunk(pages * SUPER_PAGE_SIZE) {
                assert!(addr >= BASE);
                assert!(addr + pages * SUPER_PAGE_SIZE <= BASE + POOL_PAGES * SUPER_PAGE_SIZE);
                assert_eq!((addr - BASE) % SUPER_PAGE_SIZE, 0);
                // The returned run must not overlap any live chunk.
                for &(a, p) in &live {
                    let disjoint =
                        addr + pages * SUPER_PAGE_SIZE <= a || a + p * SUPER_PAGE_SIZE <= addr;
                    assert!(disjoint, "overlapping chunks");
                }
                live.push((addr, pages));
                live_pages += pages;
            }
        } else if !live.is_empty() {
            // free
            let (addr, pages) = live.swap_remove(arg % live.len());
            pool.free_chunk(addr, pages * SUPER_PAGE_SIZE);
            live_pages -= pages;
        }

        assert_eq!(pool.allocated_bits(), live_pages);
    }

    for (addr, pages) in live {
        pool.free_chunk(addr, pages * SUPER_PAGE_SIZE);
    }
    assert_eq!(pool.allocated_bits(), 0);
});
