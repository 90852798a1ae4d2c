//! Cage reservation, pool carving and pointer classification, plus the
//! address pool manager's contract checks (aborts run as subprocesses).

mod common;

use cagealloc::cage::{self, PoolKind};
use cagealloc::pool::AddressPoolManager;
use cagealloc::util::{FORBIDDEN_ZONE_SIZE, POOL_MAX_SIZE, SUPER_PAGE_SIZE as SP};
use common::expect_abort_subprocess;
use std::sync::Mutex;

// The manager and the cage are process-global; every test touching them
// must hold this.
static GLOBAL_STATE_LOCK: Mutex<()> = Mutex::new(());

// ---------------------------------------------------------------------------
// Scenario driver: when CAGEALLOC_TEST_SCENARIO is set, run the requested
// scenario (which must abort) instead of normal assertions.
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var("CAGEALLOC_TEST_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "misaligned_free" => scenario_misaligned_free(),
        "alloc_with_zero_handle" => scenario_alloc_with_zero_handle(),
        "alloc_with_unregistered_handle" => scenario_alloc_with_unregistered_handle(),
        "double_cage_init" => scenario_double_cage_init(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

fn scenario_misaligned_free() {
    let manager = AddressPoolManager::get();
    let handle = manager.add(0x2000_0000_0000, 4 * SP);
    let addr = manager.alloc(handle, SP).unwrap();
    manager.free(handle, addr + 1, SP);
    unreachable!("misaligned free was not detected");
}

fn scenario_alloc_with_zero_handle() {
    AddressPoolManager::get().alloc(0, SP);
    unreachable!("zero handle was not detected");
}

fn scenario_alloc_with_unregistered_handle() {
    AddressPoolManager::get().alloc(3, SP);
    unreachable!("unregistered handle was not detected");
}

fn scenario_double_cage_init() {
    cage::init();
    cage::init();
    unreachable!("double init was not detected");
}

// ---------------------------------------------------------------------------
// Address pool manager through its handle interface.
// ---------------------------------------------------------------------------

#[test]
fn manager_first_fit_through_handles() {
    let _guard = GLOBAL_STATE_LOCK.lock().unwrap();
    let manager = AddressPoolManager::get();
    const BASE: usize = 0x1000_0000_0000;

    let handle = manager.add(BASE, 4 * SP);
    assert_ne!(handle, 0);
    assert_eq!(manager.pool_base(handle), BASE);

    assert_eq!(manager.alloc(handle, SP), Some(BASE));
    assert_eq!(manager.alloc(handle, 2 * SP), Some(BASE + SP));
    assert_eq!(manager.alloc(handle, SP), Some(BASE + 3 * SP));
    assert_eq!(manager.alloc(handle, SP), None);

    manager.free(handle, BASE + SP, 2 * SP);
    assert_eq!(manager.alloc(handle, SP), Some(BASE + SP));

    manager.remove(handle);
}

#[test]
fn handles_are_reusable_after_remove() {
    let _guard = GLOBAL_STATE_LOCK.lock().unwrap();
    let manager = AddressPoolManager::get();

    let a = manager.add(0x3000_0000_0000, 2 * SP);
    let b = manager.add(0x3100_0000_0000, 2 * SP);
    assert_ne!(a, b);
    manager.remove(a);

    // The freed slot is handed out again.
    let c = manager.add(0x3200_0000_0000, 2 * SP);
    assert_eq!(c, a);
    assert_eq!(manager.pool_base(c), 0x3200_0000_0000);

    manager.remove(b);
    manager.remove(c);
}

#[test]
fn manager_rejects_bad_callers() {
    expect_abort_subprocess("misaligned_free", "not super-page aligned");
    expect_abort_subprocess("alloc_with_zero_handle", "invalid pool handle");
    expect_abort_subprocess(
        "alloc_with_unregistered_handle",
        "unregistered pool handle",
    );
}

// ---------------------------------------------------------------------------
// Cage lifecycle. A single test walks init -> queries -> uninit so the
// "before init" assertions are not raced by other tests in this binary.
// ---------------------------------------------------------------------------

#[test]
fn cage_lifecycle() {
    let _guard = GLOBAL_STATE_LOCK.lock().unwrap();

    // Before init, membership is false for every address, null included.
    assert!(!cage::is_initialized());
    assert_eq!(cage::classify(0), PoolKind::None);
    assert_eq!(cage::classify(0x1234), PoolKind::None);
    assert_eq!(cage::classify(usize::MAX & !0xfff), PoolKind::None);
    assert!(cage::pool_info(0xdead_beef).is_none());

    cage::init();
    assert!(cage::is_initialized());
    assert!(!cage::is_configurable_pool_initialized());

    let brp_base = cage::brp_pool_base();
    let non_brp_base = cage::non_brp_pool_base();
    assert_eq!(brp_base % POOL_MAX_SIZE, 0);
    assert_eq!(non_brp_base, brp_base + POOL_MAX_SIZE);
    assert_ne!(cage::brp_pool_handle(), 0);
    assert_ne!(cage::non_brp_pool_handle(), 0);

    // Null is still nowhere.
    assert_eq!(cage::classify(0), PoolKind::None);

    // Carve a chunk from each pool and classify every corner of it.
    let manager = AddressPoolManager::get();
    let brp_chunk = manager.alloc(cage::brp_pool_handle(), 2 * SP).unwrap();
    assert_eq!(brp_chunk, brp_base + FORBIDDEN_ZONE_SIZE);
    for offset in [0, 1, SP - 1, SP, 2 * SP - 1] {
        assert_eq!(cage::classify(brp_chunk + offset), PoolKind::Brp);
        assert!(cage::is_in_brp_pool(brp_chunk + offset));
        assert!(!cage::is_in_non_brp_pool(brp_chunk + offset));
    }
    assert_eq!(
        cage::offset_in(brp_chunk, PoolKind::Brp),
        FORBIDDEN_ZONE_SIZE
    );

    let non_brp_chunk = manager.alloc(cage::non_brp_pool_handle(), SP).unwrap();
    assert_eq!(non_brp_chunk, non_brp_base);
    assert_eq!(cage::classify(non_brp_chunk), PoolKind::NonBrp);
    assert_eq!(cage::offset_in(non_brp_chunk, PoolKind::NonBrp), 0);

    let info = cage::pool_info(non_brp_chunk + 42).unwrap();
    assert_eq!(info.kind, PoolKind::NonBrp);
    assert_eq!(info.base, non_brp_base);
    assert_eq!(info.offset, 42);
    assert_eq!(info.handle, cage::non_brp_pool_handle());

    // The forbidden zone belongs to the BRP pool by mask, but the manager
    // never hands out chunks there.
    assert_eq!(cage::classify(brp_base), PoolKind::Brp);
    assert_eq!(cage::classify(brp_base + FORBIDDEN_ZONE_SIZE - 1), PoolKind::Brp);

    // One byte outside either end of the cage is unmanaged.
    assert_eq!(cage::classify(brp_base - 1), PoolKind::None);
    assert_eq!(
        cage::classify(non_brp_base + POOL_MAX_SIZE),
        PoolKind::None
    );
    // The last byte of the BRP region flips into the non-BRP pool exactly
    // at the boundary.
    assert_eq!(cage::classify(non_brp_base - 1), PoolKind::Brp);
    assert!(cage::is_managed(brp_chunk));
    assert!(!cage::is_managed(brp_base - 1));

    manager.free(cage::brp_pool_handle(), brp_chunk, 2 * SP);
    manager.free(cage::non_brp_pool_handle(), non_brp_chunk, SP);

    cage::uninit_for_testing();
    assert!(!cage::is_initialized());
    assert_eq!(cage::classify(brp_chunk), PoolKind::None);
    assert_eq!(cage::classify(non_brp_chunk), PoolKind::None);
}

#[test]
fn double_init_aborts() {
    expect_abort_subprocess("double_cage_init", "init called twice");
}
