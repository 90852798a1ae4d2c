//! Scheduler-loop quarantine: deferred free with randomized eviction.
//!
//! A root aggregates statistics per partition; branches hold the actual
//! entries. A branch is either thread-bound (lock-free, owned by one
//! thread) or shared (one mutex, two-phase deferred free so slow frees
//! never serialize other quarantining threads).

pub mod branch;
pub mod root;
pub mod stats;

pub use branch::{
    QuarantineBranch, QuarantineConfig, ScopedQuarantineExclusion, SharedQuarantineBranch,
    ThreadBoundQuarantineBranch,
};
pub use root::{QuarantineRoot, QuarantineStats};
pub use stats::{BucketStats, RuntimeStats};

/// The slot-span allocator the quarantine defers frees to. The quarantine
/// only ever sees opaque span metadata and raw slot addresses.
pub trait AllocatorRoot {
    /// Opaque span metadata; the two `slot_span_from_*` lookups must agree
    /// for corresponding object / slot-start pairs.
    type Span: Copy;

    fn object_to_slot_start(&self, object: *mut u8) -> usize;
    fn slot_start_to_object(&self, slot_start: usize) -> *mut u8;
    fn slot_span_from_object(&self, object: *mut u8) -> Self::Span;
    fn slot_span_from_slot_start(&self, slot_start: usize) -> Self::Span;
    fn slot_usable_size(&self, span: Self::Span) -> usize;

    /// Direct-mapped spans bypass the quarantine entirely.
    fn is_direct_mapped(&self, span: Self::Span) -> bool;

    /// Whether slots carry a backup ref-count that must be notified before
    /// release.
    fn brp_enabled(&self) -> bool;

    /// # Safety
    /// `slot_start`/`span` must describe a live, quarantined slot.
    unsafe fn pre_release_ref_count(&self, slot_start: usize, span: Self::Span);

    /// Synchronous free. Must not recurse into the quarantine and must be
    /// safe to call from any thread.
    ///
    /// # Safety
    /// `object`, `span` and `slot_start` must describe the same allocation,
    /// freed exactly once.
    unsafe fn free_immediate(&self, object: *mut u8, span: Self::Span, slot_start: usize);
}
