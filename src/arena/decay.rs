//! Exponential-half-life decay schedule for purgeable extent caches.
//!
//! Each purgeable cache (dirty, muzzy) carries one `DecayState`. The
//! schedule is the observable contract: a page freed into the cache at
//! time `t0` should be purged once `remaining = start * 2^(-(t - t0) /
//! half_life)` falls below the cache's population. `half_life == 0`
//! purges eagerly; a negative value disables purging.

/// Decay clock for one cache.
#[derive(Debug)]
pub struct DecayState {
    /// Epoch start, milliseconds on the allocator clock.
    start_ms: u64,
    /// Cache population when the epoch started (or last grew).
    start_pages: usize,
}

impl DecayState {
    pub fn new() -> Self {
        Self { start_ms: 0, start_pages: 0 }
    }

    /// Note that the cache grew to `npages`. Newly freed pages join the
    /// running epoch, so they decay on the existing clock.
    pub fn note_grow(&mut self, now_ms: u64, npages: usize) {
        if self.start_pages == 0 {
            self.start_ms = now_ms;
        }
        if npages > self.start_pages {
            self.start_pages = npages;
        }
    }

    /// Note that the cache was drained below the epoch snapshot by
    /// allocation reuse (not by purging).
    pub fn note_shrink(&mut self, npages: usize) {
        if npages < self.start_pages {
            self.start_pages = npages;
        }
        if npages == 0 {
            self.start_pages = 0;
        }
    }

    /// Pages allowed to remain at `now_ms` under half-life `decay_ms`.
    /// Callers purge the cache down to this bound.
    pub fn limit(&mut self, now_ms: u64, decay_ms: i64) -> usize {
        if decay_ms < 0 {
            return usize::MAX;
        }
        if decay_ms == 0 || self.start_pages == 0 {
            return 0;
        }
        let elapsed = now_ms.saturating_sub(self.start_ms);
        // Past ~64 half-lives the remainder is zero in any representation.
        if elapsed / (decay_ms as u64) >= 64 {
            self.start_pages = 0;
            return 0;
        }
        let factor = (-(elapsed as f64) / decay_ms as f64).exp2();
        (self.start_pages as f64 * factor) as usize
    }
}

impl Default for DecayState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_purges() {
        let mut d = DecayState::new();
        d.note_grow(0, 1000);
        assert_eq!(d.limit(1_000_000, -1), usize::MAX);
    }

    #[test]
    fn test_eager_purges_everything() {
        let mut d = DecayState::new();
        d.note_grow(0, 1000);
        assert_eq!(d.limit(0, 0), 0);
    }

    #[test]
    fn test_half_life() {
        let mut d = DecayState::new();
        d.note_grow(1000, 1024);
        assert_eq!(d.limit(1000, 10_000), 1024);
        let half = d.limit(11_000, 10_000);
        assert!(half >= 500 && half <= 524, "one half-life: {}", half);
        let quarter = d.limit(21_000, 10_000);
        assert!(quarter >= 250 && quarter <= 262, "two half-lives: {}", quarter);
    }

    #[test]
    fn test_long_idle_converges_to_zero() {
        let mut d = DecayState::new();
        d.note_grow(0, usize::MAX / 2);
        assert_eq!(d.limit(u64::MAX, 1), 0);
    }

    #[test]
    fn test_grow_restarts_epoch_when_empty() {
        let mut d = DecayState::new();
        d.note_grow(0, 100);
        d.note_shrink(0);
        d.note_grow(50_000, 10);
        // Fresh epoch: nothing has decayed yet.
        assert_eq!(d.limit(50_000, 10_000), 10);
    }
}
