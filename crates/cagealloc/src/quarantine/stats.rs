//! Rolling-window timing of the quarantine phases.
//!
//! Per size-bucket, the tracker keeps the last `STATS_WINDOW` nanosecond
//! samples of each phase (zap, purge, total) with a running sum and integer
//! average. When a zap lands far enough above its bucket's rolling average,
//! the tracker arms a pause window so callers can back off quarantining
//! after a latency spike.
//!
//! Timestamps are plain monotonic nanoseconds with 0 meaning "not taken",
//! so tests can drive a synthetic clock.

/// Samples kept per bucket. A power of two so the integer-average division
/// optimizes to a shift.
pub const STATS_WINDOW: usize = 1024;

/// log2-indexed size buckets.
pub const STATS_BUCKET_COUNT: usize = 64;

/// Bucket for a usable size: floor(log2(size)).
#[inline]
pub fn bucket_index(usable_size: usize) -> usize {
    (usize::BITS - 1 - usable_size.max(1).leading_zeros()) as usize
}

/// One phase's rolling window for one size bucket.
pub struct BucketStats {
    paused: u32,
    cycled: u32,
    valid: bool,
    // Updated on each record.
    idx: usize,
    // Set to the rolling index whenever stats are reported; the window is
    // valid once the rolling index catches it, so it starts at the last
    // slot and the first `STATS_WINDOW` samples don't count as a full
    // window.
    reported_idx: usize,
    sum_ns: i64,
    average_ns: i64,
    times_ns: [i64; STATS_WINDOW],
}

impl BucketStats {
    pub fn new() -> Self {
        BucketStats {
            paused: 0,
            cycled: 0,
            valid: false,
            idx: 0,
            reported_idx: STATS_WINDOW - 1,
            sum_ns: 0,
            average_ns: 0,
            times_ns: [0; STATS_WINDOW],
        }
    }

    /// Back to the initial state, window included.
    pub fn reset(&mut self) {
        self.valid = false;
        self.idx = 0;
        self.sum_ns = 0;
        self.average_ns = 0;
        self.reported_idx = STATS_WINDOW - 1;
    }

    /// Called whenever the stats are exported. Clears the transients
    /// (`paused`, `cycled`) but leaves the window and average intact.
    pub fn reported(&mut self) {
        if self.valid {
            self.paused = 0;
            self.cycled = 0;
            self.reported_idx = self.idx;
        }
    }

    pub fn record_value(&mut self, value_ns: i64) {
        let evicted = if self.valid { self.times_ns[self.idx] } else { 0 };
        self.sum_ns += value_ns.max(1) - evicted;
        self.times_ns[self.idx] = value_ns;
        if self.idx == self.reported_idx {
            self.valid = true;
            self.cycled += 1;
        }
        self.idx = (self.idx + 1) % STATS_WINDOW;
        if self.valid {
            // Integer division loses a little precision but avoids a float
            // divide; the window is a power of two so this is a shift.
            self.average_ns = self.sum_ns / STATS_WINDOW as i64;
        }
    }

    pub fn increase_paused(&mut self) {
        self.paused += 1;
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn cycled(&self) -> u32 {
        self.cycled
    }

    pub fn paused(&self) -> u32 {
        self.paused
    }

    pub fn average_ns(&self) -> i64 {
        self.average_ns
    }

    pub fn sum_ns(&self) -> i64 {
        self.sum_ns
    }
}

impl Default for BucketStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RuntimeStats {
    initialized: bool,
    max_above_avg_zap_delta_ns: u64,
    long_zap_pause_delta_ns: u64,
    pause_until_ns: u64,
    zap_buckets: Vec<BucketStats>,
    purge_buckets: Vec<BucketStats>,
    total_time_buckets: Vec<BucketStats>,
}

impl RuntimeStats {
    pub const fn new() -> Self {
        RuntimeStats {
            initialized: false,
            max_above_avg_zap_delta_ns: 0,
            long_zap_pause_delta_ns: 0,
            pause_until_ns: 0,
            zap_buckets: Vec::new(),
            purge_buckets: Vec::new(),
            total_time_buckets: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Allocate the windows on first use (nothing is paid if stats are
    /// never enabled), or reset every bucket.
    pub fn init_or_reset(&mut self, long_zap_pause_delta_ns: u64, max_above_avg_zap_delta_ns: u64) {
        if !self.initialized {
            self.initialized = true;
            self.zap_buckets.resize_with(STATS_BUCKET_COUNT, BucketStats::new);
            self.purge_buckets.resize_with(STATS_BUCKET_COUNT, BucketStats::new);
            self.total_time_buckets
                .resize_with(STATS_BUCKET_COUNT, BucketStats::new);
        } else {
            for stat in &mut self.zap_buckets {
                stat.reset();
            }
            for stat in &mut self.purge_buckets {
                stat.reset();
            }
            for stat in &mut self.total_time_buckets {
                stat.reset();
            }
        }
        self.long_zap_pause_delta_ns = long_zap_pause_delta_ns;
        self.max_above_avg_zap_delta_ns = max_above_avg_zap_delta_ns;
    }

    /// Record one quarantine call. `purge_start_ns` and `zap_start_ns` are 0
    /// when the phase did not run; the boundary timestamps must be set.
    pub fn add_sample(
        &mut self,
        bucket: usize,
        quarantine_start_ns: u64,
        purge_start_ns: u64,
        zap_start_ns: u64,
        quarantine_end_ns: u64,
    ) {
        if !self.initialized {
            return;
        }
        debug_assert!(quarantine_start_ns != 0 && quarantine_end_ns != 0);
        debug_assert!(bucket < STATS_BUCKET_COUNT);

        self.total_time_buckets[bucket]
            .record_value(quarantine_end_ns.saturating_sub(quarantine_start_ns) as i64);

        // Zap runs last but is separately switchable, so it may be absent.
        let mut zap_time_ns = 0u64;
        let average_ns = self.zap_buckets[bucket].average_ns();
        if zap_start_ns != 0 {
            // A zap implies the quarantine was active, so a purge ran too.
            debug_assert!(purge_start_ns != 0);
            zap_time_ns = quarantine_end_ns.saturating_sub(zap_start_ns);
            self.purge_buckets[bucket]
                .record_value(zap_start_ns.saturating_sub(purge_start_ns) as i64);
            self.zap_buckets[bucket].record_value(zap_time_ns as i64);
        } else if purge_start_ns != 0 {
            // No zap; the purge phase runs to the end.
            self.purge_buckets[bucket]
                .record_value(quarantine_end_ns.saturating_sub(purge_start_ns) as i64);
        }

        let should_pause_on_long_zap = self.max_above_avg_zap_delta_ns != 0 && zap_time_ns != 0;
        if !self.zap_buckets[bucket].valid() || !should_pause_on_long_zap {
            return;
        }
        if zap_time_ns as i64 - average_ns > self.max_above_avg_zap_delta_ns as i64 {
            debug_assert!(self.long_zap_pause_delta_ns != 0);
            self.pause_until_ns = quarantine_end_ns + self.long_zap_pause_delta_ns;
            self.zap_buckets[bucket].increase_paused();
        }
    }

    /// Whether a quarantine starting at `start_ns` falls inside an armed
    /// pause window.
    pub fn should_pause(&self, start_ns: u64) -> bool {
        if !self.initialized || self.pause_until_ns == 0 || start_ns == 0 {
            return false;
        }
        start_ns < self.pause_until_ns
    }

    /// Mark every bucket as reported.
    pub fn reported(&mut self) {
        if !self.initialized {
            return;
        }
        for stat in &mut self.zap_buckets {
            stat.reported();
        }
        for stat in &mut self.purge_buckets {
            stat.reported();
        }
        for stat in &mut self.total_time_buckets {
            stat.reported();
        }
    }

    pub fn zap_buckets(&self) -> &[BucketStats] {
        &self.zap_buckets
    }

    pub fn purge_buckets(&self) -> &[BucketStats] {
        &self.purge_buckets
    }

    pub fn total_time_buckets(&self) -> &[BucketStats] {
        &self.total_time_buckets
    }
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new()
    }
}
