use crate::config;
use crate::diag;
use crate::platform::{self, InsecureRng};
use crate::quarantine::root::QuarantineRoot;
use crate::quarantine::stats::{bucket_index, RuntimeStats};
use crate::quarantine::AllocatorRoot;
use crate::sync::RawMutex;
use crate::util::ZAP_BYTE;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

/// Victims batched per two-phase purge. Bounds the time spent freeing per
/// call; anything left over is picked up by the next purge.
pub const TO_BE_FREED_CAPACITY: usize = 1024;

type ToBeFreed = [usize; TO_BE_FREED_CAPACITY];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuarantineConfig {
    /// Soft cap on retained bytes; an entry that alone exceeds it is never
    /// retained.
    pub branch_capacity_in_bytes: usize,
    /// Master switch; when false, quarantine requests become direct frees.
    pub enable_quarantine: bool,
    /// Overwrite quarantined payloads with the zap sentinel on insertion.
    pub enable_zapping: bool,
    /// Skip the purge in the destructor. At process exit another thread may
    /// still touch memory a purge would hand back.
    pub leak_on_destruction: bool,
}

impl QuarantineConfig {
    pub fn from_env() -> Self {
        QuarantineConfig {
            branch_capacity_in_bytes: config::quarantine_capacity(),
            enable_quarantine: !config::quarantine_disabled(),
            enable_zapping: !config::zap_disabled(),
            leak_on_destruction: false,
        }
    }
}

#[derive(Clone, Copy)]
struct QuarantineSlot {
    slot_start: usize,
    usable_size: usize,
}

/// State behind the branch's synchronization: the mutex for a shared
/// branch, thread ownership for a thread-bound one.
struct BranchInner {
    rng: InsecureRng,
    slots: Vec<QuarantineSlot>,
    size_in_bytes: usize,
    stats: RuntimeStats,
}

/// A quarantine branch. `THREAD_BOUND = true` binds the branch to one
/// thread and removes every lock acquisition from the hot path; the shared
/// variant takes one mutex and frees victims outside it in two phases.
pub struct QuarantineBranch<'a, R: AllocatorRoot, const THREAD_BOUND: bool> {
    allocator_root: &'a R,
    root: Option<&'a QuarantineRoot<'a, R>>,
    lock: RawMutex,
    inner: UnsafeCell<BranchInner>,

    enable_quarantine: bool,
    enable_zapping: bool,
    leak_on_destruction: bool,

    /// While non-zero, the branch temporarily stops accepting entries.
    pause_depth: AtomicU32,
    capacity_in_bytes: AtomicUsize,
    stats_enabled: AtomicBool,

    /// Working memory for the two-phase purge, reused across threads. A
    /// purge on the stack risks overflow and a heap round-trip per purge is
    /// measurable, so one buffer lives as long as the branch and is rented
    /// out through an atomic exchange; null means "taken". A thread that
    /// finds it taken allocates its own and offers it back afterwards.
    to_be_freed_scratch: AtomicPtr<ToBeFreed>,

    config_for_testing: QuarantineConfig,
}

pub type SharedQuarantineBranch<'a, R> = QuarantineBranch<'a, R, false>;
pub type ThreadBoundQuarantineBranch<'a, R> = QuarantineBranch<'a, R, true>;

// The shared branch guards its inner state with the mutex and everything
// else is atomic. The thread-bound variant keeps the auto !Sync from its
// UnsafeCell.
unsafe impl<'a, R: AllocatorRoot + Sync> Sync for QuarantineBranch<'a, R, false> {}

impl<'a, R: AllocatorRoot, const THREAD_BOUND: bool> QuarantineBranch<'a, R, THREAD_BOUND> {
    pub fn new(allocator_root: &'a R) -> Self {
        QuarantineBranch {
            allocator_root,
            root: None,
            lock: RawMutex::new(),
            inner: UnsafeCell::new(BranchInner {
                rng: InsecureRng::new(),
                slots: Vec::new(),
                size_in_bytes: 0,
                stats: RuntimeStats::new(),
            }),
            enable_quarantine: false,
            enable_zapping: false,
            leak_on_destruction: false,
            pause_depth: AtomicU32::new(0),
            capacity_in_bytes: AtomicUsize::new(0),
            stats_enabled: AtomicBool::new(false),
            to_be_freed_scratch: AtomicPtr::new(ptr::null_mut()),
            config_for_testing: QuarantineConfig::default(),
        }
    }

    pub fn allocator_root(&self) -> &'a R {
        self.allocator_root
    }

    pub fn root(&self) -> &'a QuarantineRoot<'a, R> {
        self.root_or_die()
    }

    /// Install the root and settings. A branch that was already enabled is
    /// drained first so no entry survives under stale settings.
    pub fn configure(&mut self, root: &'a QuarantineRoot<'a, R>, config: QuarantineConfig) {
        if self.pause_depth.load(Ordering::Relaxed) != 0 {
            diag::abort_with_message("quarantine: configure while paused");
        }
        if !ptr::eq(self.allocator_root as *const R, root.allocator_root as *const R) {
            diag::abort_with_message("quarantine: branch and root disagree on allocator");
        }

        if self.enable_quarantine {
            let old_root = self.root_or_die();
            let inner = self.inner.get_mut();
            // The entries were valid freed slots when inserted; draining
            // hands them to the allocator exactly once.
            unsafe { Self::purge_inline(inner, old_root, self.allocator_root, 0) };
            debug_assert!(inner.slots.is_empty());
            inner.slots.shrink_to_fit();
        }

        self.root = Some(root);
        self.enable_quarantine = config.enable_quarantine;
        self.enable_zapping = config.enable_zapping;
        self.leak_on_destruction = config.leak_on_destruction;
        self.capacity_in_bytes
            .store(config.branch_capacity_in_bytes, Ordering::Relaxed);
        self.config_for_testing = config;

        // Pre-allocate the scratch now; the hot path must not be forced
        // into its allocation fallback by a missing buffer.
        let fresh = if config.enable_quarantine && !THREAD_BOUND {
            diag::assert_allocations_allowed();
            Box::into_raw(Box::new([0usize; TO_BE_FREED_CAPACITY]))
        } else {
            ptr::null_mut()
        };
        let old = self.to_be_freed_scratch.swap(fresh, Ordering::AcqRel);
        if !old.is_null() {
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    /// Defer the free of `object`, evicting random victims to stay within
    /// capacity. Falls back to an immediate free when the quarantine is
    /// off, paused, the span is direct-mapped, or the entry alone exceeds
    /// capacity.
    ///
    /// # Safety
    /// `object`, `span` and `slot_start` must describe one allocation that
    /// the caller is freeing exactly once, with `usable_size` matching the
    /// span. For a thread-bound branch the caller must be the owning
    /// thread.
    pub unsafe fn quarantine(
        &self,
        object: *mut u8,
        span: R::Span,
        slot_start: usize,
        usable_size: usize,
    ) {
        if !self.enable_quarantine
            || self.pause_depth.load(Ordering::Relaxed) != 0
            || self.allocator_root.is_direct_mapped(span)
        {
            return self.allocator_root.free_immediate(object, span, slot_start);
        }

        debug_assert_eq!(usable_size, self.allocator_root.slot_usable_size(span));
        let root = self.root_or_die();

        let capacity_in_bytes = self.capacity_in_bytes.load(Ordering::Relaxed);
        if capacity_in_bytes < usable_size {
            // Even a fully drained branch could not hold this entry.
            self.allocator_root.free_immediate(object, span, slot_start);
            root.quarantine_miss_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let stats_enabled = self.stats_enabled.load(Ordering::Relaxed);
        let quarantine_start_ns = if stats_enabled {
            platform::monotonic_now_ns()
        } else {
            0
        };

        // Make room so the branch holds at most `capacity` bytes after the
        // insert.
        let target_size_in_bytes = capacity_in_bytes - usable_size;
        let purge_start_ns = quarantine_start_ns;

        if THREAD_BOUND {
            self.with_inner(|inner| {
                // Entries were valid freed slots when inserted.
                unsafe {
                    Self::purge_inline(inner, root, self.allocator_root, target_size_in_bytes)
                };
                Self::insert_shuffled(inner, slot_start, usable_size);
            });
        } else {
            // Borrow the cached scratch; null marks it as in use.
            let mut to_be_freed = self
                .to_be_freed_scratch
                .swap(ptr::null_mut(), Ordering::Acquire);
            if to_be_freed.is_null() {
                // Another thread holds the cached buffer right now.
                diag::assert_allocations_allowed();
                to_be_freed = Box::into_raw(Box::new([0usize; TO_BE_FREED_CAPACITY]));
            }
            let mut num_to_free = 0;

            self.with_inner(|inner| {
                // The buffer was just taken out of circulation, so this is
                // the only reference to it.
                let buffer = unsafe { &mut *to_be_freed };
                Self::purge_deferred(inner, root, target_size_in_bytes, buffer, &mut num_to_free);
                Self::insert_shuffled(inner, slot_start, usable_size);
            });

            // Phase two, outside the lock: the slow frees never serialize
            // other quarantining threads.
            self.batch_free(&*to_be_freed, num_to_free);

            // Offer the buffer back, whichever one it is; what matters is
            // that the slot is likely non-null for the next borrower. If
            // another thread re-seeded the slot meanwhile, release ours.
            let prev = self.to_be_freed_scratch.swap(to_be_freed, Ordering::Release);
            if !prev.is_null() {
                drop(Box::from_raw(prev));
            }
        }

        root.count.fetch_add(1, Ordering::Relaxed);
        root.size_in_bytes.fetch_add(usable_size, Ordering::Relaxed);
        root.cumulative_count.fetch_add(1, Ordering::Relaxed);
        root.cumulative_size_in_bytes
            .fetch_add(usable_size, Ordering::Relaxed);

        let zap_start_ns = if stats_enabled {
            platform::monotonic_now_ns()
        } else {
            0
        };
        if self.enable_zapping {
            ptr::write_bytes(object, ZAP_BYTE, usable_size);
        }
        if self.allocator_root.brp_enabled() {
            self.allocator_root.pre_release_ref_count(slot_start, span);
        }

        if stats_enabled {
            let quarantine_end_ns = platform::monotonic_now_ns();
            let zap_ns = if self.enable_zapping { zap_start_ns } else { 0 };
            self.with_inner(|inner| {
                inner.stats.add_sample(
                    bucket_index(usable_size),
                    quarantine_start_ns,
                    purge_start_ns,
                    zap_ns,
                    quarantine_end_ns,
                );
            });
        }
    }

    /// Release every entry held by this branch. Entries in other branches
    /// of the same root are untouched.
    pub fn purge(&self) {
        let Some(root) = self.root else {
            return;
        };
        self.with_inner(|inner| {
            // Entries were valid freed slots when inserted.
            unsafe { Self::purge_inline(inner, root, self.allocator_root, 0) };
            inner.slots.shrink_to_fit();
        });
    }

    pub fn capacity_in_bytes(&self) -> usize {
        self.capacity_in_bytes.load(Ordering::Relaxed)
    }

    /// After shrinking, the branch may exceed the new capacity until the
    /// next quarantine or an explicit `purge`.
    pub fn set_capacity_in_bytes(&self, capacity_in_bytes: usize) {
        self.capacity_in_bytes
            .store(capacity_in_bytes, Ordering::Relaxed);
    }

    pub fn is_quarantined_for_testing(&self, object: *mut u8) -> bool {
        let slot_start = self.allocator_root.object_to_slot_start(object);
        self.with_inner(|inner| inner.slots.iter().any(|slot| slot.slot_start == slot_start))
    }

    pub fn config_for_testing(&self) -> QuarantineConfig {
        self.config_for_testing
    }

    /// Enable (or reset) phase timing on this branch.
    pub fn configure_runtime_stats(
        &self,
        long_zap_pause_delta_ns: u64,
        max_above_avg_zap_delta_ns: u64,
    ) {
        self.with_inner(|inner| {
            inner
                .stats
                .init_or_reset(long_zap_pause_delta_ns, max_above_avg_zap_delta_ns)
        });
        self.stats_enabled.store(true, Ordering::Relaxed);
    }

    /// Whether a latency spike recently armed the pause window. Callers use
    /// this to back off quarantining.
    pub fn should_pause(&self) -> bool {
        if !self.stats_enabled.load(Ordering::Relaxed) {
            return false;
        }
        let now_ns = platform::monotonic_now_ns();
        self.with_inner(|inner| inner.stats.should_pause(now_ns))
    }

    /// Mark the runtime stats as exported.
    pub fn runtime_stats_reported(&self) {
        self.with_inner(|inner| inner.stats.reported());
    }

    /// Read-only access to the runtime stats, under the branch's
    /// synchronization.
    pub fn with_runtime_stats<T>(&self, f: impl FnOnce(&RuntimeStats) -> T) -> T {
        self.with_inner(|inner| f(&inner.stats))
    }

    #[inline]
    fn with_inner<T>(&self, f: impl FnOnce(&mut BranchInner) -> T) -> T {
        if THREAD_BOUND {
            // One owning thread; the UnsafeCell access cannot race.
            f(unsafe { &mut *self.inner.get() })
        } else {
            self.lock.lock();
            let result = f(unsafe { &mut *self.inner.get() });
            self.lock.unlock();
            result
        }
    }

    fn root_or_die(&self) -> &'a QuarantineRoot<'a, R> {
        match self.root {
            Some(root) => root,
            None => diag::abort_with_message("quarantine: branch not configured"),
        }
    }

    fn insert_shuffled(inner: &mut BranchInner, slot_start: usize, usable_size: usize) {
        inner.size_in_bytes += usable_size;
        inner.slots.push(QuarantineSlot {
            slot_start,
            usable_size,
        });
        // Swap the newcomer with a random slot so the vector stays
        // shuffled; evicting the tail is then close enough to evicting a
        // uniformly random entry.
        let last = inner.slots.len() - 1;
        let random_index = inner.rng.uniform(inner.slots.len());
        inner.slots.swap(random_index, last);
    }

    /// Evict until the branch holds at most `target_size_in_bytes`, freeing
    /// victims inline.
    ///
    /// # Safety
    /// Every stored slot must still be a valid freed slot of the allocator.
    unsafe fn purge_inline(
        inner: &mut BranchInner,
        root: &QuarantineRoot<'a, R>,
        allocator_root: &R,
        target_size_in_bytes: usize,
    ) {
        let mut freed_count = 0;
        let mut freed_size_in_bytes = 0;

        while target_size_in_bytes < inner.size_in_bytes {
            let Some(&to_free) = inner.slots.last() else {
                break;
            };
            debug_assert!(to_free.slot_start != 0);

            let span = allocator_root.slot_span_from_slot_start(to_free.slot_start);
            let object = allocator_root.slot_start_to_object(to_free.slot_start);
            allocator_root.free_immediate(object, span, to_free.slot_start);

            freed_count += 1;
            freed_size_in_bytes += to_free.usable_size;
            inner.size_in_bytes -= to_free.usable_size;
            inner.slots.pop();
        }

        root.size_in_bytes
            .fetch_sub(freed_size_in_bytes, Ordering::Release);
        root.count.fetch_sub(freed_count, Ordering::Relaxed);
    }

    /// Phase one of the two-phase purge: under the lock, move up to
    /// `TO_BE_FREED_CAPACITY` victims into `to_be_freed` and drop them from
    /// the branch's accounting. The actual frees happen in `batch_free`
    /// after the lock is released.
    fn purge_deferred(
        inner: &mut BranchInner,
        root: &QuarantineRoot<'a, R>,
        target_size_in_bytes: usize,
        to_be_freed: &mut ToBeFreed,
        num_to_free: &mut usize,
    ) {
        *num_to_free = 0;
        let mut freed_size_in_bytes = 0;

        while target_size_in_bytes < inner.size_in_bytes {
            let Some(&to_free) = inner.slots.last() else {
                break;
            };
            to_be_freed[*num_to_free] = to_free.slot_start;
            *num_to_free += 1;
            inner.slots.pop();

            freed_size_in_bytes += to_free.usable_size;
            inner.size_in_bytes -= to_free.usable_size;

            if *num_to_free >= TO_BE_FREED_CAPACITY {
                break;
            }
        }

        root.size_in_bytes
            .fetch_sub(freed_size_in_bytes, Ordering::Release);
        root.count.fetch_sub(*num_to_free, Ordering::Relaxed);
    }

    /// Phase two: free outside the lock.
    ///
    /// # Safety
    /// The slot starts must have been moved out of the branch by
    /// `purge_deferred`, each freed exactly once.
    unsafe fn batch_free(&self, to_be_freed: &ToBeFreed, num_to_free: usize) {
        for &slot_start in &to_be_freed[..num_to_free] {
            debug_assert!(slot_start != 0);
            let span = self.allocator_root.slot_span_from_slot_start(slot_start);
            let object = self.allocator_root.slot_start_to_object(slot_start);
            self.allocator_root.free_immediate(object, span, slot_start);
        }
    }
}

impl<'a, R: AllocatorRoot, const THREAD_BOUND: bool> Drop
    for QuarantineBranch<'a, R, THREAD_BOUND>
{
    fn drop(&mut self) {
        if !self.leak_on_destruction {
            self.purge();
        }
        let buffer = self
            .to_be_freed_scratch
            .swap(ptr::null_mut(), Ordering::AcqRel);
        if !buffer.is_null() {
            unsafe { drop(Box::from_raw(buffer)) };
        }
    }
}

/// While alive, the branch rejects incoming entries (they free
/// immediately). Nests.
pub struct ScopedQuarantineExclusion<'b, 'a, R: AllocatorRoot, const THREAD_BOUND: bool> {
    branch: &'b QuarantineBranch<'a, R, THREAD_BOUND>,
}

impl<'b, 'a, R: AllocatorRoot, const THREAD_BOUND: bool>
    ScopedQuarantineExclusion<'b, 'a, R, THREAD_BOUND>
{
    pub fn new(branch: &'b QuarantineBranch<'a, R, THREAD_BOUND>) -> Self {
        debug_assert!(!branch.enable_quarantine || THREAD_BOUND);
        branch.pause_depth.fetch_add(1, Ordering::Relaxed);
        ScopedQuarantineExclusion { branch }
    }
}

impl<'b, 'a, R: AllocatorRoot, const THREAD_BOUND: bool> Drop
    for ScopedQuarantineExclusion<'b, 'a, R, THREAD_BOUND>
{
    fn drop(&mut self) {
        self.branch.pause_depth.fetch_sub(1, Ordering::Relaxed);
    }
}
