//! The per-thread pointer cache.
//!
//! One bounded LIFO stack per cached size class. All operations here run
//! on the owning thread, so the structure is lock-free by construction;
//! only refill and flush touch shared bin state, and those hand batches
//! to the caller rather than reaching into arenas themselves.

use crate::core::classes::SizeClasses;

/// Pointers cached for a small class: `clamp(8192 / size, 20, 512)`.
const SMALL_CACHE_BYTES: usize = 8192;
const SMALL_CACHE_MIN: usize = 20;
const SMALL_CACHE_MAX: usize = 512;

/// Pointers cached for a tcached large class.
const LARGE_CACHE_SLOTS: usize = 20;

/// One class's stack.
pub(crate) struct CacheBin {
    stack: Vec<*mut u8>,
    ncached_max: usize,
    /// Minimum depth since the last GC pass.
    low_water: usize,
    /// Refill size divisor: fill `ncached_max >> lg_fill_div`.
    lg_fill_div: u32,
}

impl CacheBin {
    fn new(ncached_max: usize) -> Self {
        Self {
            stack: Vec::with_capacity(ncached_max),
            ncached_max,
            low_water: 0,
            lg_fill_div: 1,
        }
    }

    #[inline]
    fn pop(&mut self) -> Option<*mut u8> {
        let p = self.stack.pop()?;
        self.low_water = self.low_water.min(self.stack.len());
        Some(p)
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.stack.len() >= self.ncached_max
    }

    /// Take the oldest `count` pointers (the bottom of the stack),
    /// preserving LIFO order for the rest.
    fn drain_bottom(&mut self, count: usize) -> Vec<*mut u8> {
        let count = count.min(self.stack.len());
        let out: Vec<*mut u8> = self.stack.drain(..count).collect();
        self.low_water = self.low_water.min(self.stack.len());
        out
    }
}

/// The thread cache: stacks for every class at or below the ceiling.
pub(crate) struct Tcache {
    bins: Vec<CacheBin>,
    /// Round-robin GC cursor.
    next_gc: usize,
}

/// A batch evicted from the cache that the caller must return to the
/// owning arena(s).
pub(crate) struct FlushBatch {
    pub szind: usize,
    pub ptrs: Vec<*mut u8>,
}

impl Tcache {
    /// Build stacks for all classes up to `tcache_maxclass`.
    pub fn new(classes: &SizeClasses, tcache_maxclass: usize) -> Self {
        let nhbins = if tcache_maxclass >= classes.max_class() {
            classes.nsizes()
        } else {
            classes.index_of(tcache_maxclass + 1)
        };
        let mut bins = Vec::with_capacity(nhbins);
        for i in 0..nhbins {
            let ncached = if classes.is_binned(i) {
                (SMALL_CACHE_BYTES / classes.size_of(i)).clamp(SMALL_CACHE_MIN, SMALL_CACHE_MAX)
            } else {
                LARGE_CACHE_SLOTS
            };
            bins.push(CacheBin::new(ncached));
        }
        Self { bins, next_gc: 0 }
    }

    /// Number of cached classes.
    #[inline]
    pub fn nhbins(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub fn covers(&self, szind: usize) -> bool {
        szind < self.bins.len()
    }

    /// Pop a cached pointer for `szind`.
    #[inline]
    pub fn alloc(&mut self, szind: usize) -> Option<*mut u8> {
        self.bins[szind].pop()
    }

    /// Push a freed pointer. When the stack is full, returns the bottom
    /// half for the caller to flush, then caches the pointer.
    #[inline]
    pub fn dalloc(&mut self, szind: usize, ptr: *mut u8) -> Option<FlushBatch> {
        let bin = &mut self.bins[szind];
        let batch = if bin.is_full() {
            let count = (bin.ncached_max >> 1).max(1);
            Some(FlushBatch { szind, ptrs: bin.drain_bottom(count) })
        } else {
            None
        };
        self.bins[szind].stack.push(ptr);
        batch
    }

    /// How many pointers a refill of `szind` should fetch.
    pub fn fill_count(&self, szind: usize) -> usize {
        let bin = &self.bins[szind];
        (bin.ncached_max >> bin.lg_fill_div).max(1)
    }

    /// Accept a refill batch; the last pointer is returned to satisfy
    /// the pending allocation.
    pub fn fill(&mut self, szind: usize, mut ptrs: Vec<*mut u8>) -> Option<*mut u8> {
        let out = ptrs.pop();
        let bin = &mut self.bins[szind];
        debug_assert!(bin.stack.is_empty());
        bin.stack = ptrs;
        bin.low_water = bin.low_water.min(bin.stack.len());
        out
    }

    /// One GC step: visit the next class and give back the demonstrably
    /// unused tail (the low-water mark since the previous visit).
    pub fn gc_step(&mut self) -> Option<FlushBatch> {
        if self.bins.is_empty() {
            return None;
        }
        let szind = self.next_gc;
        self.next_gc = (self.next_gc + 1) % self.bins.len();

        let bin = &mut self.bins[szind];
        let batch = if bin.low_water > 0 {
            // Cached pointers that survived a whole GC interval unused;
            // flush three quarters of them and refill less next time.
            let count = (bin.low_water - (bin.low_water >> 2)).max(1);
            let ptrs = bin.drain_bottom(count);
            bin.lg_fill_div = (bin.lg_fill_div + 1).min(8);
            Some(FlushBatch { szind, ptrs })
        } else {
            // The stack ran dry since the last visit; refill more.
            if bin.lg_fill_div > 1 {
                bin.lg_fill_div -= 1;
            }
            None
        };
        let bin = &mut self.bins[szind];
        bin.low_water = bin.stack.len();
        batch
    }

    /// Evict everything; used on thread exit and explicit flush.
    pub fn drain_all(&mut self) -> Vec<FlushBatch> {
        let mut out = Vec::new();
        for (szind, bin) in self.bins.iter_mut().enumerate() {
            if !bin.stack.is_empty() {
                let ptrs = std::mem::take(&mut bin.stack);
                bin.low_water = 0;
                out.push(FlushBatch { szind, ptrs });
            }
        }
        out
    }

    /// Total cached pointers, for stats.
    pub fn ncached(&self) -> usize {
        self.bins.iter().map(|b| b.stack.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcache() -> Tcache {
        let classes = SizeClasses::new(&[]);
        Tcache::new(&classes, 1 << 15)
    }

    #[test]
    fn test_covers_ceiling() {
        let classes = SizeClasses::new(&[]);
        let t = Tcache::new(&classes, 1 << 15);
        assert!(t.covers(classes.index_of(1 << 15)));
        assert!(!t.covers(classes.index_of((1 << 15) + 1)));
    }

    #[test]
    fn test_lifo_reuse() {
        let mut t = tcache();
        assert_eq!(t.alloc(0), None);
        let a = 0x1000 as *mut u8;
        let b = 0x2000 as *mut u8;
        assert!(t.dalloc(0, a).is_none());
        assert!(t.dalloc(0, b).is_none());
        assert_eq!(t.alloc(0), Some(b));
        assert_eq!(t.alloc(0), Some(a));
    }

    #[test]
    fn test_overflow_flushes_bottom_half() {
        let mut t = tcache();
        let cap = t.bins[0].ncached_max;
        for i in 0..cap {
            assert!(t.dalloc(0, (0x1000 + i * 8) as *mut u8).is_none());
        }
        let batch = t.dalloc(0, 0x9000_0000 as *mut u8).expect("overflow should flush");
        assert_eq!(batch.szind, 0);
        assert_eq!(batch.ptrs.len(), cap / 2);
        // The oldest pointers flush first.
        assert_eq!(batch.ptrs[0], 0x1000 as *mut u8);
        // The newly freed pointer is cached, LIFO at the top.
        assert_eq!(t.alloc(0), Some(0x9000_0000 as *mut u8));
    }

    #[test]
    fn test_fill_returns_last() {
        let mut t = tcache();
        let got = t.fill(3, vec![0x10 as *mut u8, 0x20 as *mut u8, 0x30 as *mut u8]);
        assert_eq!(got, Some(0x30 as *mut u8));
        assert_eq!(t.alloc(3), Some(0x20 as *mut u8));
    }

    #[test]
    fn test_gc_shrinks_toward_low_water() {
        let mut t = tcache();
        for i in 0..40 {
            t.dalloc(0, (0x1000 + i * 8) as *mut u8);
        }
        // Touch nothing: the whole stack is "unused" at the next visit.
        let mut flushed = 0;
        for _ in 0..t.nhbins() {
            if let Some(batch) = t.gc_step() {
                flushed += batch.ptrs.len();
            }
        }
        assert!(flushed > 0);
        assert!(t.ncached() < 40);
    }

    #[test]
    fn test_drain_all() {
        let mut t = tcache();
        t.dalloc(1, 0x10 as *mut u8);
        t.dalloc(5, 0x20 as *mut u8);
        let batches = t.drain_all();
        assert_eq!(batches.len(), 2);
        assert_eq!(t.ncached(), 0);
    }
}
