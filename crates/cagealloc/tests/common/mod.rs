//! Shared test support: a minimal slot-span allocator standing in for the
//! real allocator root, plus the subprocess-abort helper.
#![allow(dead_code)]

use cagealloc::quarantine::AllocatorRoot;
use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const SLOT_ALIGN: usize = 16;

#[derive(Clone, Copy)]
pub struct TestSpan {
    pub usable_size: usize,
    pub direct_mapped: bool,
}

#[derive(Clone, Copy)]
struct SlotInfo {
    usable_size: usize,
    direct_mapped: bool,
}

/// Backing allocator for quarantine tests. Objects and slots coincide
/// (no in-slot metadata), spans are looked up from a live-slot table, and
/// `free_immediate` panics on a double free so eviction bugs surface as
/// test failures.
pub struct TestRoot {
    live: Mutex<HashMap<usize, SlotInfo>>,
    freed: AtomicUsize,
    brp: bool,
    brp_releases: AtomicUsize,
}

impl TestRoot {
    pub fn new() -> Self {
        TestRoot {
            live: Mutex::new(HashMap::new()),
            freed: AtomicUsize::new(0),
            brp: false,
            brp_releases: AtomicUsize::new(0),
        }
    }

    pub fn new_with_brp() -> Self {
        TestRoot {
            brp: true,
            ..TestRoot::new()
        }
    }

    pub fn alloc(&self, usable_size: usize) -> *mut u8 {
        self.alloc_inner(usable_size, false)
    }

    pub fn alloc_direct_mapped(&self, usable_size: usize) -> *mut u8 {
        self.alloc_inner(usable_size, true)
    }

    fn alloc_inner(&self, usable_size: usize, direct_mapped: bool) -> *mut u8 {
        let layout = Layout::from_size_align(usable_size.max(1), SLOT_ALIGN).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null());
        let prev = self.live.lock().unwrap().insert(
            ptr as usize,
            SlotInfo {
                usable_size,
                direct_mapped,
            },
        );
        assert!(prev.is_none());
        ptr
    }

    /// Everything `quarantine` wants for an object: span, slot start,
    /// usable size.
    pub fn quarantine_args(&self, object: *mut u8) -> (TestSpan, usize, usize) {
        let span = self.slot_span_from_object(object);
        (span, object as usize, span.usable_size)
    }

    pub fn freed_count(&self) -> usize {
        self.freed.load(Ordering::Relaxed)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn brp_release_count(&self) -> usize {
        self.brp_releases.load(Ordering::Relaxed)
    }

    fn lookup(&self, slot_start: usize) -> SlotInfo {
        *self
            .live
            .lock()
            .unwrap()
            .get(&slot_start)
            .expect("span lookup for a slot that is not live")
    }
}

impl AllocatorRoot for TestRoot {
    type Span = TestSpan;

    fn object_to_slot_start(&self, object: *mut u8) -> usize {
        object as usize
    }

    fn slot_start_to_object(&self, slot_start: usize) -> *mut u8 {
        slot_start as *mut u8
    }

    fn slot_span_from_object(&self, object: *mut u8) -> TestSpan {
        let info = self.lookup(object as usize);
        TestSpan {
            usable_size: info.usable_size,
            direct_mapped: info.direct_mapped,
        }
    }

    fn slot_span_from_slot_start(&self, slot_start: usize) -> TestSpan {
        self.slot_span_from_object(slot_start as *mut u8)
    }

    fn slot_usable_size(&self, span: TestSpan) -> usize {
        span.usable_size
    }

    fn is_direct_mapped(&self, span: TestSpan) -> bool {
        span.direct_mapped
    }

    fn brp_enabled(&self) -> bool {
        self.brp
    }

    unsafe fn pre_release_ref_count(&self, _slot_start: usize, _span: TestSpan) {
        self.brp_releases.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn free_immediate(&self, object: *mut u8, span: TestSpan, slot_start: usize) {
        let info = self
            .live
            .lock()
            .unwrap()
            .remove(&slot_start)
            .expect("double free or free of unknown slot");
        assert_eq!(info.usable_size, span.usable_size);
        self.freed.fetch_add(1, Ordering::Relaxed);
        dealloc(
            object,
            Layout::from_size_align(info.usable_size.max(1), SLOT_ALIGN).unwrap(),
        );
    }
}

/// Run the current test binary with `CAGEALLOC_TEST_SCENARIO` set to
/// `scenario_name`; the child's scenario driver runs the scenario, which
/// must abort. Verifies the child died abnormally and that its stderr
/// carries `expected_msg`.
pub fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let output = std::process::Command::new(&exe)
        .env("CAGEALLOC_TEST_SCENARIO", scenario_name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have aborted, but exited cleanly. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "subprocess for scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}
