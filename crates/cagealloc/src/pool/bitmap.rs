//! First-fit super-page allocator over one pool's reserved region.
//!
//! Occupancy is one bit per super-page: 1 = handed out, 0 = free. A
//! forward-only hint remembers the lowest bit below which everything is
//! known to be allocated, so steady-state scans skip the full front of the
//! pool. The hint may lag behind reality (false "maybe free" is tolerated,
//! false "allocated" is not).

use crate::diag;
use crate::util::{align_up, is_aligned, MAX_POOL_BITS, SUPER_PAGE_SHIFT, SUPER_PAGE_SIZE};

const WORDS: usize = MAX_POOL_BITS / 64;

/// One pool: a contiguous run of super-pages and its occupancy bitmap.
/// Not internally synchronized; the address pool manager wraps each pool in
/// a mutex.
pub struct Pool {
    base: usize,
    total_bits: usize,
    hint: usize,
    words: [u64; WORDS],
}

impl Pool {
    pub const fn new() -> Self {
        Pool {
            base: 0,
            total_bits: 0,
            hint: 0,
            words: [0; WORDS],
        }
    }

    /// (Re)initialize over the region `[base, base + size)`.
    /// Both ends must be super-page aligned and the region must fit the
    /// fixed bitmap.
    pub fn init(&mut self, base: usize, size: usize) {
        if !is_aligned(base, SUPER_PAGE_SIZE) || !is_aligned(size, SUPER_PAGE_SIZE) {
            diag::abort_with_message("pool: base or size not super-page aligned");
        }
        let total_bits = size >> SUPER_PAGE_SHIFT;
        if total_bits == 0 || total_bits > MAX_POOL_BITS {
            diag::abort_with_message("pool: size out of range");
        }
        self.base = base;
        self.total_bits = total_bits;
        self.hint = 0;
        self.words = [0; WORDS];
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn total_bits(&self) -> usize {
        self.total_bits
    }

    /// Number of currently set (allocated) bits. For tests and fuzzing.
    pub fn allocated_bits(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum::<usize>()
    }

    #[inline]
    fn test_bit(&self, i: usize) -> bool {
        self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    #[inline]
    fn set_bit(&mut self, i: usize) {
        self.words[i / 64] |= 1u64 << (i % 64);
    }

    #[inline]
    fn clear_bit(&mut self, i: usize) {
        self.words[i / 64] &= !(1u64 << (i % 64));
    }

    /// Find and claim a run of consecutive free super-pages covering
    /// `requested_size` bytes. Returns the base address of the run, or None
    /// when no run fits.
    pub fn find_chunk(&mut self, requested_size: usize) -> Option<usize> {
        debug_assert!(requested_size > 0);
        let need_bits = align_up(requested_size, SUPER_PAGE_SIZE) >> SUPER_PAGE_SHIFT;

        // First-fit from the hint; everything below it is known allocated.
        let mut beg_bit = self.hint;
        let mut curr_bit = self.hint;
        loop {
            // `end_bit` points one past the last bit that must be 0. Past
            // the pool means no free chunk exists.
            let end_bit = beg_bit + need_bits;
            if end_bit > self.total_bits {
                return None;
            }

            let mut found = true;
            while curr_bit < end_bit {
                if self.test_bit(curr_bit) {
                    // Candidate run is broken; restart just past this set
                    // bit, but keep `curr_bit` moving forward so the next
                    // outer pass never re-checks these bits.
                    beg_bit = curr_bit + 1;
                    found = false;
                    if self.hint == curr_bit {
                        self.hint += 1;
                    }
                }
                curr_bit += 1;
            }

            if found {
                for i in beg_bit..end_bit {
                    debug_assert!(!self.test_bit(i));
                    self.set_bit(i);
                }
                if self.hint == beg_bit {
                    self.hint = end_bit;
                }
                return Some(self.base + (beg_bit << SUPER_PAGE_SHIFT));
            }
        }
    }

    /// Release a run previously returned by `find_chunk`, exactly.
    pub fn free_chunk(&mut self, address: usize, size: usize) {
        if !is_aligned(address, SUPER_PAGE_SIZE) || !is_aligned(size, SUPER_PAGE_SIZE) {
            diag::abort_with_message("pool: freed address or size not super-page aligned");
        }
        if address < self.base || address + size > self.base + (self.total_bits << SUPER_PAGE_SHIFT)
        {
            diag::abort_with_message("pool: freed range outside pool");
        }

        let beg_bit = (address - self.base) >> SUPER_PAGE_SHIFT;
        let end_bit = beg_bit + (size >> SUPER_PAGE_SHIFT);
        for i in beg_bit..end_bit {
            debug_assert!(self.test_bit(i), "pool: freeing a free super-page");
            self.clear_bit(i);
        }
        self.hint = self.hint.min(beg_bit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::SUPER_PAGE_SIZE as SP;

    const BASE: usize = 0x1000_0000_0000;

    fn pool(bits: usize) -> Pool {
        let mut p = Pool::new();
        p.init(BASE, bits * SP);
        p
    }

    #[test]
    fn first_fit_sequence() {
        let mut p = pool(4);
        assert_eq!(p.find_chunk(SP), Some(BASE));
        assert_eq!(p.find_chunk(2 * SP), Some(BASE + SP));
        assert_eq!(p.find_chunk(SP), Some(BASE + 3 * SP));
        assert_eq!(p.find_chunk(SP), None);
        p.free_chunk(BASE + SP, 2 * SP);
        assert_eq!(p.find_chunk(SP), Some(BASE + SP));
    }

    #[test]
    fn request_rounds_up_to_super_pages() {
        let mut p = pool(4);
        assert_eq!(p.find_chunk(1), Some(BASE));
        assert_eq!(p.find_chunk(SP + 1), Some(BASE + SP));
        assert_eq!(p.allocated_bits(), 3);
    }

    #[test]
    fn exact_remaining_succeeds_one_more_fails() {
        let mut p = pool(8);
        assert_eq!(p.find_chunk(3 * SP), Some(BASE));
        // Exactly the remaining space.
        assert_eq!(p.find_chunk(5 * SP), Some(BASE + 3 * SP));
        assert_eq!(p.find_chunk(SP), None);
        p.free_chunk(BASE + 3 * SP, 5 * SP);
        // One super-page more than remains.
        assert_eq!(p.find_chunk(6 * SP), None);
        assert_eq!(p.find_chunk(5 * SP), Some(BASE + 3 * SP));
    }

    #[test]
    fn hole_too_small_is_skipped() {
        let mut p = pool(8);
        for i in 0..8 {
            assert_eq!(p.find_chunk(SP), Some(BASE + i * SP));
        }
        p.free_chunk(BASE + 2 * SP, SP);
        p.free_chunk(BASE + 5 * SP, 2 * SP);
        // The single-page hole at bit 2 cannot hold two pages.
        assert_eq!(p.find_chunk(2 * SP), Some(BASE + 5 * SP));
        assert_eq!(p.find_chunk(SP), Some(BASE + 2 * SP));
    }

    #[test]
    fn hint_rewinds_on_free() {
        let mut p = pool(4);
        assert_eq!(p.find_chunk(4 * SP), Some(BASE));
        p.free_chunk(BASE, SP);
        // The front became free again; first fit must find it.
        assert_eq!(p.find_chunk(SP), Some(BASE));
    }

    #[test]
    fn set_bits_match_live_allocations() {
        let mut p = pool(64);
        let a = p.find_chunk(3 * SP).unwrap();
        let b = p.find_chunk(SP).unwrap();
        let c = p.find_chunk(7 * SP).unwrap();
        assert_eq!(p.allocated_bits(), 11);
        p.free_chunk(b, SP);
        assert_eq!(p.allocated_bits(), 10);
        p.free_chunk(a, 3 * SP);
        p.free_chunk(c, 7 * SP);
        assert_eq!(p.allocated_bits(), 0);
    }
}
