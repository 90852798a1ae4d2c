//! Process-wide registry of address pools.
//!
//! Pools are addressed through small stable handles so callers never hold a
//! pointer to pool state. The manager is a const-initialized static whose
//! destructor never runs, so late-running destructors in other threads can
//! still classify and free.

use crate::diag;
use crate::pool::bitmap::Pool;
use crate::sync::Mutex;
use crate::util::MAX_POOLS;

/// 1-based pool handle. 0 means "none".
pub type PoolHandle = usize;

pub const NO_POOL_HANDLE: PoolHandle = 0;

struct PoolSlot {
    in_use: bool,
    pool: Pool,
}

impl PoolSlot {
    const fn new() -> Self {
        PoolSlot {
            in_use: false,
            pool: Pool::new(),
        }
    }
}

pub struct AddressPoolManager {
    slots: [Mutex<PoolSlot>; MAX_POOLS],
}

static MANAGER: AddressPoolManager = AddressPoolManager::new();

impl AddressPoolManager {
    const fn new() -> Self {
        const SLOT: Mutex<PoolSlot> = Mutex::new(PoolSlot::new());
        AddressPoolManager {
            slots: [SLOT; MAX_POOLS],
        }
    }

    pub fn get() -> &'static AddressPoolManager {
        &MANAGER
    }

    /// Register a pool over `[base, base + size)` and return its handle.
    /// Aborts when every handle slot is occupied: the set of pools is fixed
    /// at init time, so running out is a programming error.
    pub fn add(&self, base: usize, size: usize) -> PoolHandle {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock();
            if !slot.in_use {
                slot.pool.init(base, size);
                slot.in_use = true;
                return i + 1;
            }
        }
        diag::abort_with_message("address pool manager: all pool handles in use");
    }

    /// Destroy the pool behind `handle`. The handle becomes reusable.
    pub fn remove(&self, handle: PoolHandle) {
        let mut slot = self.checked_slot(handle);
        slot.in_use = false;
    }

    /// Carve `bytes` (rounded up to super-pages) out of the pool. Returns
    /// None when the pool cannot satisfy the request.
    pub fn alloc(&self, handle: PoolHandle, bytes: usize) -> Option<usize> {
        self.checked_slot(handle).pool.find_chunk(bytes)
    }

    /// Return a chunk previously handed out by `alloc`.
    pub fn free(&self, handle: PoolHandle, address: usize, bytes: usize) {
        self.checked_slot(handle).pool.free_chunk(address, bytes);
    }

    /// Base address of the pool behind `handle`.
    pub fn pool_base(&self, handle: PoolHandle) -> usize {
        self.checked_slot(handle).pool.base()
    }

    /// Drop every registered pool. Only for tests tearing down the cage.
    pub fn reset_for_testing(&self) {
        for slot in &self.slots {
            slot.lock().in_use = false;
        }
    }

    fn checked_slot(&self, handle: PoolHandle) -> crate::sync::MutexGuard<'_, PoolSlot> {
        if handle == NO_POOL_HANDLE || handle > MAX_POOLS {
            diag::abort_with_message("address pool manager: invalid pool handle");
        }
        let slot = self.slots[handle - 1].lock();
        if !slot.in_use {
            diag::abort_with_message("address pool manager: unregistered pool handle");
        }
        slot
    }
}
