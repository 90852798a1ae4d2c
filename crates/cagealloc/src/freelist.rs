//! Freelist links stored as pool-relative offsets.
//!
//! A raw "next" pointer in a freed slot is a prime target for linear
//! overwrites: one corrupted word steers the freelist anywhere in the
//! address space. Storing the link as an offset into the entry's own pool
//! confines any damage to that pool, and a shadow word holding the bitwise
//! complement catches single-word overwrites before the link is followed.
//!
//! MTE tag bits ride along in the encoded word so a decoded pointer keeps
//! the tag of the slot it refers to.

use crate::cage::{self, PoolInfo};
use crate::diag;
use crate::platform::mte;
use crate::util::{PARTITION_PAGE_SIZE, SUPER_PAGE_BASE_MASK, SUPER_PAGE_OFFSET_MASK};
use core::ptr;

/// A freelist link in its on-slot form: the in-pool offset of the next
/// entry (tag bits preserved), or 0 for the end of the list.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct EncodedPoolOffset(usize);

impl EncodedPoolOffset {
    const NULL: EncodedPoolOffset = EncodedPoolOffset(0);

    fn new(ptr: *const PoolOffsetFreelistEntry) -> Self {
        EncodedPoolOffset(Self::encode(ptr))
    }

    /// Express `ptr` as a tagged offset into its containing pool.
    fn encode(ptr: *const PoolOffsetFreelistEntry) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let addr = ptr as usize;
        let info = match cage::pool_info(addr) {
            Some(info) => info,
            None => diag::abort_with_message("freelist: entry outside any pool"),
        };
        addr & (mte::PTR_TAG_MASK | !info.base_mask)
    }

    /// Rebuild the tagged pointer given the pool of the entry holding this
    /// offset. Well-formedness is the caller's job.
    fn decode(self, pool_info: &PoolInfo) -> *mut PoolOffsetFreelistEntry {
        (pool_info.base | self.0) as *mut PoolOffsetFreelistEntry
    }

    #[inline]
    fn inverted(self) -> usize {
        !self.0
    }

    #[inline]
    fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// The first two words of a freed slot.
#[repr(C)]
pub struct PoolOffsetFreelistEntry {
    encoded_next: EncodedPoolOffset,
    /// Complement of `encoded_next`; a mismatch means the slot was written
    /// after it was freed.
    shadow: usize,
}

impl PoolOffsetFreelistEntry {
    /// Emplace a null-terminated entry at the start of a freed slot.
    ///
    /// # Safety
    /// `slot_start` must point to writable slot memory inside a pool, large
    /// enough for the entry.
    pub unsafe fn emplace_and_init_null(slot_start: usize) -> *mut Self {
        let entry = slot_start as *mut Self;
        (*entry).encoded_next = EncodedPoolOffset::NULL;
        (*entry).shadow = EncodedPoolOffset::NULL.inverted();
        entry
    }

    /// Emplace an entry pointing at `next`. Thread-cache lists may chain
    /// slots across super-pages, so no same-super-page check here, contrary
    /// to `set_next`.
    ///
    /// # Safety
    /// Same as `emplace_and_init_null`; `next` must be null or inside the
    /// same pool as `slot_start`.
    pub unsafe fn emplace_and_init_for_thread_cache(
        slot_start: usize,
        next: *mut Self,
    ) -> *mut Self {
        let entry = slot_start as *mut Self;
        let encoded = EncodedPoolOffset::new(next);
        (*entry).encoded_next = encoded;
        (*entry).shadow = encoded.inverted();
        entry
    }

    /// Emplace an entry whose shadow may deliberately not match. Testing
    /// only.
    ///
    /// # Safety
    /// Same as `emplace_and_init_for_thread_cache`.
    pub unsafe fn emplace_for_test(
        slot_start: usize,
        next: *mut Self,
        make_shadow_match: bool,
    ) -> *mut Self {
        let entry = slot_start as *mut Self;
        let encoded = EncodedPoolOffset::new(next);
        (*entry).encoded_next = encoded;
        (*entry).shadow = if make_shadow_match {
            encoded.inverted()
        } else {
            0x3544E986
        };
        entry
    }

    /// Overwrite the stored offset without touching the shadow. Testing
    /// only.
    pub fn corrupt_next_for_testing(&mut self, encoded: usize) {
        self.encoded_next = EncodedPoolOffset(encoded);
    }

    /// Point this entry at `next`. Regular freelists only ever link within
    /// one super-page; a violation here is a bug in the caller, not slot
    /// corruption.
    pub fn set_next(&mut self, next: *mut Self) {
        #[cfg(debug_assertions)]
        if !next.is_null() {
            let here = mte::untag(self as *const Self as usize);
            let there = mte::untag(next as usize);
            if here & SUPER_PAGE_BASE_MASK != there & SUPER_PAGE_BASE_MASK {
                diag::abort_with_message("freelist: set_next across super-pages");
            }
        }
        let encoded = EncodedPoolOffset::new(next);
        self.encoded_next = encoded;
        self.shadow = encoded.inverted();
    }

    /// Zero both words before the slot is handed to the user, so no
    /// internal state leaks into the allocation.
    pub fn clear_for_allocation(&mut self) -> usize {
        self.encoded_next = EncodedPoolOffset::NULL;
        self.shadow = 0;
        self as *mut Self as usize
    }

    #[inline]
    pub fn is_encoded_next_ptr_zero(&self) -> bool {
        self.encoded_next.is_zero()
    }

    /// Decode and validate the next entry. With `CRASH_ON_CORRUPTION` a
    /// malformed link aborts with the raw words in the crash payload;
    /// otherwise it decodes to null so the caller can degrade.
    ///
    /// # Safety
    /// `self` must be a live freelist entry inside a pool.
    #[inline]
    pub unsafe fn get_next<const CRASH_ON_CORRUPTION: bool>(&self) -> *mut Self {
        self.get_next_internal::<CRASH_ON_CORRUPTION, false>()
    }

    /// Like `get_next`, for thread-cache lists (no same-super-page
    /// constraint).
    ///
    /// # Safety
    /// `self` must be a live freelist entry inside a pool.
    #[inline]
    pub unsafe fn get_next_for_thread_cache<const CRASH_ON_CORRUPTION: bool>(&self) -> *mut Self {
        self.get_next_internal::<CRASH_ON_CORRUPTION, true>()
    }

    /// Walk the whole list, validating every link.
    ///
    /// # Safety
    /// `self` must head a well-formed chain of live entries.
    pub unsafe fn check_free_list(&self) {
        let mut entry = self as *const Self;
        while !entry.is_null() {
            entry = (*entry).get_next::<true>();
        }
    }

    /// # Safety
    /// `self` must head a well-formed thread-cache chain of live entries.
    pub unsafe fn check_free_list_for_thread_cache(&self) {
        let mut entry = self as *const Self;
        while !entry.is_null() {
            entry = (*entry).get_next_for_thread_cache::<true>();
        }
    }

    unsafe fn get_next_internal<const CRASH_ON_CORRUPTION: bool, const FOR_THREAD_CACHE: bool>(
        &self,
    ) -> *mut Self {
        // Decommitted slots read as zero; that is the list terminator, not
        // corruption.
        if self.encoded_next.is_zero() {
            return ptr::null_mut();
        }

        let here = self as *const Self as usize;
        let info = match cage::pool_info(here) {
            Some(info) => info,
            None => return self.corrupt::<CRASH_ON_CORRUPTION>(),
        };
        let next = self.encoded_next.decode(&info);

        if !self.is_well_formed::<FOR_THREAD_CACHE>(&info, next) {
            return self.corrupt::<CRASH_ON_CORRUPTION>();
        }
        next
    }

    fn is_well_formed<const FOR_THREAD_CACHE: bool>(
        &self,
        info: &PoolInfo,
        next: *mut Self,
    ) -> bool {
        let next_addr = mte::untag(next as usize);

        let shadow_ok = self.shadow == self.encoded_next.inverted();
        // The offset must carry no pool-base bits beyond the tag.
        let base_ok = next_addr & info.base_mask == info.base;
        // The head of every super-page is metadata; a link into it is never
        // legitimate.
        let not_in_metadata = next_addr & SUPER_PAGE_OFFSET_MASK >= PARTITION_PAGE_SIZE;

        if FOR_THREAD_CACHE {
            return shadow_ok & base_ok & not_in_metadata;
        }

        let here_addr = mte::untag(self as *const Self as usize);
        let same_super_page =
            here_addr & SUPER_PAGE_BASE_MASK == next_addr & SUPER_PAGE_BASE_MASK;
        shadow_ok & base_ok & not_in_metadata & same_super_page
    }

    #[cold]
    fn corrupt<const CRASH_ON_CORRUPTION: bool>(&self) -> *mut Self {
        if CRASH_ON_CORRUPTION {
            diag::abort_with_payload(
                "freelist corruption detected:",
                &[("next", self.encoded_next.0), ("shadow", self.shadow)],
            );
        }
        ptr::null_mut()
    }
}

const _: () = assert!(
    core::mem::size_of::<PoolOffsetFreelistEntry>() == 2 * core::mem::size_of::<usize>()
);
