//! The thread-event engine.
//!
//! Two byte accumulators per thread (allocated, deallocated) drive every
//! periodic duty: tcache GC, decay ticks, peak tracking, and the opaque
//! sampling / stats-interval hooks an external collaborator installs.
//! Each event keeps an absolute byte deadline; the minimum of the
//! alloc-side deadlines is shadowed in `fast_threshold` so the fast path
//! checks "any event pending?" with a single comparison. A zero shadow
//! means the thread is non-nominal (initializing, reincarnated, or
//! reentrant) and the slow path is always taken.

use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Bytes between tcache GC passes, each direction.
pub(crate) const TCACHE_GC_BYTES: u64 = 64 * 1024;

/// Bytes between decay-clock ticks.
pub(crate) const DECAY_TICK_BYTES: u64 = 128 * 1024;

/// Bytes between peak-tracker refreshes.
pub(crate) const PEAK_BYTES: u64 = 64 * 1024;

/// Sentinel for "event disabled".
pub(crate) const EVENT_DISABLED: u64 = u64::MAX;

/// Intervals of the externally installed events.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EventIntervals {
    pub sample: u64,
    pub stats: u64,
}

impl Default for EventIntervals {
    fn default() -> Self {
        Self { sample: EVENT_DISABLED, stats: EVENT_DISABLED }
    }
}

/// Which handlers a threshold crossing armed.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Triggered {
    pub tcache_gc: bool,
    pub decay: bool,
    pub peak: bool,
    pub sample: bool,
    pub stats: bool,
}

impl Triggered {
    pub fn any(&self) -> bool {
        self.tcache_gc || self.decay || self.peak || self.sample || self.stats
    }
}

/// Per-thread event state.
pub(crate) struct ThreadEvents {
    allocated: u64,
    deallocated: u64,
    nominal: bool,
    /// Shadow of the nearest alloc-side deadline; 0 forces the slow
    /// path. Written with SeqCst so a remote state flip cannot be missed
    /// indefinitely.
    fast_threshold: AtomicU64,
    next_alloc_event: u64,
    next_dalloc_event: u64,
    gc_alloc_at: u64,
    gc_dalloc_at: u64,
    decay_at: u64,
    peak_at: u64,
    sample_at: u64,
    stats_at: u64,
    peak_max: u64,
}

impl ThreadEvents {
    pub fn new(intervals: EventIntervals) -> Self {
        let mut ev = Self {
            allocated: 0,
            deallocated: 0,
            nominal: true,
            fast_threshold: AtomicU64::new(0),
            next_alloc_event: 0,
            next_dalloc_event: 0,
            gc_alloc_at: TCACHE_GC_BYTES,
            gc_dalloc_at: TCACHE_GC_BYTES,
            decay_at: DECAY_TICK_BYTES,
            peak_at: PEAK_BYTES,
            sample_at: intervals.sample,
            stats_at: intervals.stats,
            peak_max: 0,
        };
        ev.recompute();
        ev
    }

    /// Single-comparison fast-path check: true when `bytes` more
    /// allocated bytes stay below every pending deadline.
    #[inline]
    pub fn fast_check(&self, bytes: usize) -> bool {
        let threshold = self.fast_threshold.load(Ordering::Relaxed);
        self.allocated + (bytes as u64) < threshold
    }

    /// Count `bytes` allocated without consulting the deadlines; valid
    /// only after `fast_check` accepted them.
    #[inline]
    pub fn advance_alloc_fast(&mut self, bytes: usize) {
        debug_assert!(self.allocated + (bytes as u64) < self.fast_threshold.load(Ordering::Relaxed));
        self.allocated += bytes as u64;
    }

    /// Count allocated bytes and collect any events that came due.
    pub fn advance_alloc(&mut self, bytes: usize, intervals: EventIntervals) -> Triggered {
        self.allocated += bytes as u64;
        fence(Ordering::SeqCst);
        if self.allocated < self.next_alloc_event {
            return Triggered::default();
        }

        let mut hit = Triggered::default();
        if self.allocated >= self.gc_alloc_at {
            hit.tcache_gc = true;
            self.gc_alloc_at = self.allocated + TCACHE_GC_BYTES;
        }
        if self.allocated >= self.decay_at {
            hit.decay = true;
            self.decay_at = self.allocated + DECAY_TICK_BYTES;
        }
        if self.allocated >= self.peak_at {
            hit.peak = true;
            self.peak_at = self.allocated + PEAK_BYTES;
            self.note_peak();
        }
        if self.allocated >= self.sample_at {
            hit.sample = true;
            self.sample_at = match intervals.sample {
                EVENT_DISABLED => EVENT_DISABLED,
                n => self.allocated + n,
            };
        } else if intervals.sample != EVENT_DISABLED && self.sample_at == EVENT_DISABLED {
            // A sampler was installed since the last crossing.
            self.sample_at = self.allocated + intervals.sample;
        }
        if self.allocated >= self.stats_at {
            hit.stats = true;
            self.stats_at = match intervals.stats {
                EVENT_DISABLED => EVENT_DISABLED,
                n => self.allocated + n,
            };
        } else if intervals.stats != EVENT_DISABLED && self.stats_at == EVENT_DISABLED {
            self.stats_at = self.allocated + intervals.stats;
        }
        self.recompute();
        hit
    }

    /// Count deallocated bytes; the dalloc side only drives tcache GC
    /// and the peak refresh.
    pub fn advance_dalloc(&mut self, bytes: usize) -> Triggered {
        self.deallocated += bytes as u64;
        let mut hit = Triggered::default();
        if self.deallocated >= self.next_dalloc_event {
            hit.tcache_gc = true;
            self.gc_dalloc_at = self.deallocated + TCACHE_GC_BYTES;
            self.next_dalloc_event = self.gc_dalloc_at;
        }
        hit
    }

    fn recompute(&mut self) {
        self.next_alloc_event = self
            .gc_alloc_at
            .min(self.decay_at)
            .min(self.peak_at)
            .min(self.sample_at)
            .min(self.stats_at);
        self.next_dalloc_event = self.gc_dalloc_at;
        self.publish_threshold();
    }

    fn publish_threshold(&self) {
        let t = if self.nominal { self.next_alloc_event } else { 0 };
        self.fast_threshold.store(t, Ordering::SeqCst);
    }

    /// Flip the thread in or out of the nominal state. A non-nominal
    /// thread always takes the slow path.
    pub fn set_nominal(&mut self, nominal: bool) {
        self.nominal = nominal;
        self.publish_threshold();
        fence(Ordering::SeqCst);
    }

    fn note_peak(&mut self) {
        let live = self.allocated.saturating_sub(self.deallocated);
        self.peak_max = self.peak_max.max(live);
    }

    /// High-water mark of `allocated - deallocated`, refreshed on read.
    pub fn peak(&mut self) -> u64 {
        self.note_peak();
        self.peak_max
    }

    pub fn reset_peak(&mut self) {
        self.peak_max = 0;
        self.note_peak();
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn deallocated(&self) -> u64 {
        self.deallocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> ThreadEvents {
        ThreadEvents::new(EventIntervals::default())
    }

    #[test]
    fn test_fast_path_under_threshold() {
        let ev = events();
        assert!(ev.fast_check(64));
        assert!(!ev.fast_check(TCACHE_GC_BYTES as usize + 1));
    }

    #[test]
    fn test_gc_fires_at_interval() {
        let mut ev = events();
        let hit = ev.advance_alloc(TCACHE_GC_BYTES as usize - 1, EventIntervals::default());
        assert!(!hit.tcache_gc);
        let hit = ev.advance_alloc(1, EventIntervals::default());
        assert!(hit.tcache_gc);
        // Deadline re-arms.
        let hit = ev.advance_alloc(8, EventIntervals::default());
        assert!(!hit.tcache_gc);
    }

    #[test]
    fn test_decay_fires_less_often_than_gc() {
        let mut ev = events();
        let hit = ev.advance_alloc(TCACHE_GC_BYTES as usize, EventIntervals::default());
        assert!(hit.tcache_gc);
        assert!(!hit.decay);
        let hit = ev.advance_alloc(TCACHE_GC_BYTES as usize, EventIntervals::default());
        assert!(hit.decay);
    }

    #[test]
    fn test_dalloc_side_gc() {
        let mut ev = events();
        let hit = ev.advance_dalloc(TCACHE_GC_BYTES as usize);
        assert!(hit.tcache_gc);
        let hit = ev.advance_dalloc(1);
        assert!(!hit.tcache_gc);
    }

    #[test]
    fn test_non_nominal_forces_slow_path() {
        let mut ev = events();
        ev.set_nominal(false);
        assert!(!ev.fast_check(1));
        ev.set_nominal(true);
        assert!(ev.fast_check(1));
    }

    #[test]
    fn test_sampler_installation_arms_event() {
        let mut ev = events();
        let intervals = EventIntervals { sample: 4096, stats: EVENT_DISABLED };
        let hit = ev.advance_alloc(TCACHE_GC_BYTES as usize, intervals);
        assert!(!hit.sample);
        // Next crossing is the sample deadline.
        let hit = ev.advance_alloc(4096, intervals);
        assert!(hit.sample);
    }

    #[test]
    fn test_peak_tracks_high_water() {
        let mut ev = events();
        ev.advance_alloc(100_000, EventIntervals::default());
        ev.advance_dalloc(90_000);
        assert_eq!(ev.peak(), 100_000);
        ev.reset_peak();
        assert_eq!(ev.peak(), 10_000);
    }
}
