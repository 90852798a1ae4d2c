#![no_main]

use cagealloc::quarantine::{
    AllocatorRoot, QuarantineConfig, QuarantineRoot, SharedQuarantineBranch,
};
use libfuzzer_sys::fuzz_target;
use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::sync::Mutex;

/// Allocator root that panics on double frees and frees of unknown slots,
/// so quarantine accounting bugs become crashes the fuzzer can report.
struct FuzzRoot {
    live: Mutex<HashMap<usize, usize>>,
}

#[derive(Clone, Copy)]
struct FuzzSpan {
    usable_size: usize,
}

impl FuzzRoot {
    fn alloc(&self, usable_size: usize) -> *mut u8 {
        let ptr = unsafe { alloc(Layout::from_size_align(usable_size.max(1), 16).unwrap()) };
        assert!(!ptr.is_null());
        self.live.lock().unwrap().insert(ptr as usize, usable_size);
        ptr
    }
}

impl AllocatorRoot for FuzzRoot {
    type Span = FuzzSpan;

    fn object_to_slot_start(&self, object: *mut u8) -> usize {
        object as usize
    }
    fn slot_start_to_object(&self, slot_start: usize) -> *mut u8 {
        slot_start as *mut u8
    }
    fn slot_span_from_object(&self, object: *mut u8) -> FuzzSpan {
        let usable_size = *self.live.lock().unwrap().get(&(object as usize)).unwrap();
        FuzzSpan { usable_size }
    }
    fn slot_span_from_slot_start(&self, slot_start: usize) -> FuzzSpan {
        self.slot_span_from_object(slot_start as *mut u8)
    }
    fn slot_usable_size(&self, span: FuzzSpan) -> usize {
        span.usable_size
    }
    fn is_direct_mapped(&self, _span: FuzzSpan) -> bool {
        false
    }
    fn brp_enabled(&self) -> bool {
        false
    }
    unsafe fn pre_release_ref_count(&self, _slot_start: usize, _span: FuzzSpan) {}
    unsafe fn free_immediate(&self, object: *mut u8, _span: FuzzSpan, slot_start: usize) {
        let usable_size = self
            .live
            .lock()
            .unwrap()
            .remove(&slot_start)
            .expect("double free");
        dealloc(object, Layout::from_size_align(usable_size.max(1), 16).unwrap());
    }
}

/// Operation stream:
///   byte 0: opcode (0=quarantine, 1=purge, 2=set_capacity)
///   bytes 1-2: size / capacity (little-endian u16)
fuzz_target!(|data: &[u8]| {
    let troot = FuzzRoot {
        live: Mutex::new(HashMap::new()),
    };
    let root = QuarantineRoot::new(&troot);
    let mut branch = SharedQuarantineBranch::new(&troot);
    branch.configure(
        &root,
        QuarantineConfig {
            branch_capacity_in_bytes: 16 * 1024,
            enable_quarantine: true,
            enable_zapping: true,
            leak_on_destruction: false,
        },
    );

    let mut i = 0;
    while i + 3 <= data.len() {
        let opcode = data[i] % 3;
        let arg = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        i += 3;

        match opcode {
            0 => {
                let size = arg.max(1);
                let object = troot.alloc(size);
                let span = troot.slot_span_from_object(object);
                unsafe { branch.quarantine(object, span, object as usize, size) };
            }
            1 => branch.purge(),
            2 => branch.set_capacity_in_bytes(arg),
            _ => unreachable!(),
        }

        let stats = root.stats_snapshot();
        assert_eq!(stats.count, troot.live.lock().unwrap().len());
    }

    branch.purge();
    assert_eq!(root.stats_snapshot().count, 0);
    assert_eq!(root.stats_snapshot().size_in_bytes, 0);
    assert!(troot.live.lock().unwrap().is_empty());
});
