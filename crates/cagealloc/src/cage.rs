//! The cage: one oversized virtual-address reservation carved into pools.
//!
//! All pool bases and handles live in a single cacheline-aligned setup
//! block: written once during `init`, read on every pointer classification
//! afterwards. Before `init`, every base address holds its pool's offset
//! mask, an address no real pool base can produce under the base mask, so
//! membership queries are false for every address (including null) without
//! any initialized-check on the hot path.

use crate::config;
use crate::diag::{self, ScopedDisallowAllocations};
use crate::platform::{self, mte};
use crate::pool::{AddressPoolManager, PoolHandle, NO_POOL_HANDLE};
use crate::util::{
    align_up, is_aligned, BRP_POOL_SIZE, CONFIGURABLE_POOL_MAX_SIZE, CONFIGURABLE_POOL_MIN_SIZE,
    DESIRED_ADDRESS_SPACE_SIZE, FORBIDDEN_ZONE_SIZE, NON_BRP_POOL_SIZE, POOL_MAX_SIZE,
    RESERVED_ADDRESS_SPACE_SIZE,
};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const BRP_POOL_OFFSET_MASK: usize = BRP_POOL_SIZE - 1;
const BRP_POOL_BASE_MASK: usize = !BRP_POOL_OFFSET_MASK;
const NON_BRP_POOL_OFFSET_MASK: usize = NON_BRP_POOL_SIZE - 1;
const NON_BRP_POOL_BASE_MASK: usize = !NON_BRP_POOL_OFFSET_MASK;
const CONFIGURABLE_POOL_SENTINEL_BASE: usize = CONFIGURABLE_POOL_MAX_SIZE - 1;
const CONFIGURABLE_POOL_SENTINEL_MASK: usize = !CONFIGURABLE_POOL_SENTINEL_BASE;

/// Which pool, if any, an address belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    None,
    Brp,
    NonBrp,
    Configurable,
}

/// Everything needed to reason about an address's pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolInfo {
    pub kind: PoolKind,
    pub handle: PoolHandle,
    pub base: usize,
    pub base_mask: usize,
    pub offset: usize,
}

// Write-once fields, frequently read thereafter. Keep them on their own
// cacheline so they never share one with writable data.
#[repr(C, align(64))]
struct CageSetup {
    brp_base: AtomicUsize,
    non_brp_base: AtomicUsize,
    configurable_base: AtomicUsize,
    configurable_base_mask: AtomicUsize,
    brp_handle: AtomicUsize,
    non_brp_handle: AtomicUsize,
    configurable_handle: AtomicUsize,
    reserved_start: AtomicUsize,
}

const _: () = assert!(core::mem::size_of::<CageSetup>() % 64 == 0);

static SETUP: CageSetup = CageSetup {
    brp_base: AtomicUsize::new(BRP_POOL_OFFSET_MASK),
    non_brp_base: AtomicUsize::new(NON_BRP_POOL_OFFSET_MASK),
    configurable_base: AtomicUsize::new(CONFIGURABLE_POOL_SENTINEL_BASE),
    configurable_base_mask: AtomicUsize::new(CONFIGURABLE_POOL_SENTINEL_MASK),
    brp_handle: AtomicUsize::new(NO_POOL_HANDLE),
    non_brp_handle: AtomicUsize::new(NO_POOL_HANDLE),
    configurable_handle: AtomicUsize::new(NO_POOL_HANDLE),
    reserved_start: AtomicUsize::new(0),
};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static CAGE_STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// Reserve the cage and carve the BRP and non-BRP pools.
/// Must be called exactly once, from the main thread, before any other
/// thread classifies pointers.
pub fn init() {
    if CAGE_STATE
        .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        diag::abort_with_message("cage: init called twice");
    }
    let _no_alloc = ScopedDisallowAllocations::new();

    // Safe: single-threaded by the init contract.
    unsafe {
        config::read_config();
    }

    let start = unsafe { platform::reserve_inaccessible(RESERVED_ADDRESS_SPACE_SIZE) } as usize;
    if start == 0 {
        diag::abort_with_message("cage: address space reservation failed");
    }

    // The reservation is oversized, so an aligned base with room for every
    // pool always exists in its interior.
    let base = align_up(start, POOL_MAX_SIZE);
    debug_assert!(base + DESIRED_ADDRESS_SPACE_SIZE <= start + RESERVED_ADDRESS_SPACE_SIZE);

    let manager = AddressPoolManager::get();

    // The BRP pool's first super-page is the forbidden zone: the membership
    // mask covers it, but no chunk is ever handed out there, so a
    // one-past-the-end pointer of an allocation just below the pool cannot
    // alias a live BRP slot.
    let brp_handle = manager.add(
        base + FORBIDDEN_ZONE_SIZE,
        BRP_POOL_SIZE - FORBIDDEN_ZONE_SIZE,
    );
    let non_brp_handle = manager.add(base + BRP_POOL_SIZE, NON_BRP_POOL_SIZE);

    SETUP.reserved_start.store(start, Ordering::Release);
    SETUP.brp_base.store(base, Ordering::Release);
    SETUP
        .non_brp_base
        .store(base + BRP_POOL_SIZE, Ordering::Release);
    SETUP.brp_handle.store(brp_handle, Ordering::Release);
    SETUP.non_brp_handle.store(non_brp_handle, Ordering::Release);

    CAGE_STATE.store(READY, Ordering::Release);
}

/// Register the configurable pool inside an embedder-provided mapping,
/// outside the cage. `size` must be a power of two within the configurable
/// bounds and `address` aligned to it.
pub fn init_configurable_pool(address: usize, size: usize) {
    if is_configurable_pool_initialized() {
        diag::abort_with_message("cage: configurable pool already initialized");
    }
    if address == 0
        || !size.is_power_of_two()
        || size < CONFIGURABLE_POOL_MIN_SIZE
        || size > CONFIGURABLE_POOL_MAX_SIZE
        || !is_aligned(address, size)
    {
        diag::abort_with_message("cage: bad configurable pool address or size");
    }

    let handle = AddressPoolManager::get().add(address, size);
    SETUP
        .configurable_base_mask
        .store(!(size - 1), Ordering::Release);
    SETUP.configurable_base.store(address, Ordering::Release);
    SETUP.configurable_handle.store(handle, Ordering::Release);
}

pub fn is_initialized() -> bool {
    CAGE_STATE.load(Ordering::Acquire) == READY
}

pub fn is_configurable_pool_initialized() -> bool {
    SETUP.configurable_base.load(Ordering::Acquire) != CONFIGURABLE_POOL_SENTINEL_BASE
}

/// Release the reservation and reset every pool. Leaves the process as if
/// `init` had never run. Only for tests.
pub fn uninit_for_testing() {
    if !is_initialized() {
        diag::abort_with_message("cage: uninit without init");
    }
    let start = SETUP.reserved_start.load(Ordering::Acquire);
    unsafe {
        platform::unmap(start as *mut u8, RESERVED_ADDRESS_SPACE_SIZE);
    }
    SETUP
        .brp_base
        .store(BRP_POOL_OFFSET_MASK, Ordering::Release);
    SETUP
        .non_brp_base
        .store(NON_BRP_POOL_OFFSET_MASK, Ordering::Release);
    SETUP
        .configurable_base
        .store(CONFIGURABLE_POOL_SENTINEL_BASE, Ordering::Release);
    SETUP
        .configurable_base_mask
        .store(CONFIGURABLE_POOL_SENTINEL_MASK, Ordering::Release);
    SETUP.brp_handle.store(NO_POOL_HANDLE, Ordering::Release);
    SETUP
        .non_brp_handle
        .store(NO_POOL_HANDLE, Ordering::Release);
    SETUP
        .configurable_handle
        .store(NO_POOL_HANDLE, Ordering::Release);
    SETUP.reserved_start.store(0, Ordering::Release);
    AddressPoolManager::get().reset_for_testing();
    CAGE_STATE.store(UNINIT, Ordering::Release);
}

/// Returns false for null by construction of the pre-init sentinels.
#[inline(always)]
pub fn is_in_brp_pool(addr: usize) -> bool {
    mte::untag(addr) & BRP_POOL_BASE_MASK == SETUP.brp_base.load(Ordering::Relaxed)
}

/// Returns false for null by construction of the pre-init sentinels.
#[inline(always)]
pub fn is_in_non_brp_pool(addr: usize) -> bool {
    mte::untag(addr) & NON_BRP_POOL_BASE_MASK == SETUP.non_brp_base.load(Ordering::Relaxed)
}

/// Returns false for null by construction of the pre-init sentinels.
#[inline(always)]
pub fn is_in_configurable_pool(addr: usize) -> bool {
    mte::untag(addr) & SETUP.configurable_base_mask.load(Ordering::Relaxed)
        == SETUP.configurable_base.load(Ordering::Relaxed)
}

/// True when any pool manages `addr`.
#[inline(always)]
pub fn is_managed(addr: usize) -> bool {
    is_in_brp_pool(addr) || is_in_non_brp_pool(addr) || is_in_configurable_pool(addr)
}

#[inline]
pub fn classify(addr: usize) -> PoolKind {
    if is_in_brp_pool(addr) {
        PoolKind::Brp
    } else if is_in_non_brp_pool(addr) {
        PoolKind::NonBrp
    } else if is_in_configurable_pool(addr) {
        PoolKind::Configurable
    } else {
        PoolKind::None
    }
}

/// Pool membership plus base/mask/offset for `addr`, or None when the
/// address is outside every pool.
#[inline]
pub fn pool_info(addr: usize) -> Option<PoolInfo> {
    let untagged = mte::untag(addr);
    if is_in_brp_pool(addr) {
        let base = SETUP.brp_base.load(Ordering::Relaxed);
        Some(PoolInfo {
            kind: PoolKind::Brp,
            handle: SETUP.brp_handle.load(Ordering::Relaxed),
            base,
            base_mask: BRP_POOL_BASE_MASK,
            offset: untagged - base,
        })
    } else if is_in_non_brp_pool(addr) {
        let base = SETUP.non_brp_base.load(Ordering::Relaxed);
        Some(PoolInfo {
            kind: PoolKind::NonBrp,
            handle: SETUP.non_brp_handle.load(Ordering::Relaxed),
            base,
            base_mask: NON_BRP_POOL_BASE_MASK,
            offset: untagged - base,
        })
    } else if is_in_configurable_pool(addr) {
        let base = SETUP.configurable_base.load(Ordering::Relaxed);
        Some(PoolInfo {
            kind: PoolKind::Configurable,
            handle: SETUP.configurable_handle.load(Ordering::Relaxed),
            base,
            base_mask: SETUP.configurable_base_mask.load(Ordering::Relaxed),
            offset: untagged - base,
        })
    } else {
        None
    }
}

/// Offset of `addr` within the pool of the given kind. Aborts when the
/// address is not in that pool: callers are expected to have classified it.
#[inline]
pub fn offset_in(addr: usize, kind: PoolKind) -> usize {
    match pool_info(addr) {
        Some(info) if info.kind == kind => info.offset,
        _ => diag::abort_with_message("cage: offset_in on address outside the pool"),
    }
}

pub fn brp_pool_handle() -> PoolHandle {
    SETUP.brp_handle.load(Ordering::Relaxed)
}

pub fn non_brp_pool_handle() -> PoolHandle {
    SETUP.non_brp_handle.load(Ordering::Relaxed)
}

pub fn configurable_pool_handle() -> PoolHandle {
    SETUP.configurable_handle.load(Ordering::Relaxed)
}

pub fn brp_pool_base() -> usize {
    SETUP.brp_base.load(Ordering::Relaxed)
}

pub fn non_brp_pool_base() -> usize {
    SETUP.non_brp_base.load(Ordering::Relaxed)
}
