//! Bins: sharded slab collections, one per small size class.
//!
//! A shard owns a current slab, a non-full set ordered by address (lowest
//! first, to keep the VM image compact), and a full set kept for stats
//! traversal. Slab refill from the extent layer happens with the shard
//! lock dropped; the lock only ever guards region bookkeeping.

use std::collections::BTreeMap;

use crate::core::classes::SizeClass;
use crate::error::AllocError;
use crate::extent::pool::{ExtentCtx, ExtentPool};
use crate::extent::rtree::RtreeValue;
use crate::extent::ExtentState;
use crate::sync::{ForkMutex, Rank};

/// Statistics for one bin shard.
#[derive(Debug, Default, Clone)]
pub struct BinStats {
    /// Regions handed out.
    pub nmalloc: u64,
    /// Regions returned.
    pub ndalloc: u64,
    /// Slabs created.
    pub nslabs: u64,
    /// Batched refills served to thread caches.
    pub nfills: u64,
    /// Batched flushes received from thread caches.
    pub nflushes: u64,
    /// Live slabs.
    pub cur_slabs: usize,
    /// Live regions.
    pub cur_regs: usize,
}

struct BinShard {
    current: Option<u32>,
    /// Non-full slabs by base address; the lowest refills first.
    nonfull: BTreeMap<usize, u32>,
    /// Completely full slabs, for stats traversal.
    full: BTreeMap<usize, u32>,
    stats: BinStats,
}

impl BinShard {
    fn new() -> Self {
        Self {
            current: None,
            nonfull: BTreeMap::new(),
            full: BTreeMap::new(),
            stats: BinStats::default(),
        }
    }
}

/// One small size class's sharded slab collection within an arena.
pub struct Bin {
    shards: Vec<ForkMutex<BinShard>>,
}

impl Bin {
    pub fn new(nshards: usize) -> Self {
        let mut shards = Vec::with_capacity(nshards);
        shards.resize_with(nshards, || ForkMutex::new(Rank::BinShard, BinShard::new()));
        Self { shards }
    }

    pub fn nshards(&self) -> usize {
        self.shards.len()
    }

    /// Pop up to `want` regions into `out` in one batched pass,
    /// allocating fresh slabs from the extent layer as needed. Returns
    /// the number of regions delivered; fewer than `want` means the
    /// extent layer ran dry.
    pub fn fill(
        &self,
        ctx: &ExtentCtx,
        pool: &ExtentPool,
        class: &SizeClass,
        shard: usize,
        out: &mut Vec<*mut u8>,
        want: usize,
    ) -> usize {
        let shard_mutex = &self.shards[shard % self.shards.len()];
        let mut filled = 0;
        while filled < want {
            {
                let mut s = shard_mutex.lock();
                while filled < want {
                    let Some(cur) = self.current_with_space(ctx, &mut s) else { break };
                    let e = ctx.registry.get(cur);
                    // SAFETY: the shard lock guards this slab's bitmap.
                    let reg = unsafe { e.slab_alloc_region() }.expect("current slab had space");
                    out.push((e.base() + reg as usize * class.size) as *mut u8);
                    filled += 1;
                }
                if filled == want {
                    s.stats.nmalloc += filled as u64;
                    s.stats.cur_regs += filled;
                    s.stats.nfills += 1;
                    return filled;
                }
            }

            // The shard ran out of slabs; refill with the lock dropped.
            match self.new_slab(ctx, pool, class, shard as u32) {
                Some(slab) => {
                    let mut s = shard_mutex.lock();
                    s.stats.nslabs += 1;
                    s.stats.cur_slabs += 1;
                    match s.current {
                        None => s.current = Some(slab),
                        Some(cur) => {
                            // Another thread installed a slab meanwhile;
                            // keep ours in the non-full set.
                            let e = ctx.registry.get(slab);
                            if ctx.registry.get(cur).nfree() == 0 {
                                self.evict_current(ctx, &mut s);
                                s.current = Some(slab);
                            } else {
                                s.nonfull.insert(e.base(), slab);
                            }
                        }
                    }
                }
                None => {
                    let mut s = shard_mutex.lock();
                    s.stats.nmalloc += filled as u64;
                    s.stats.cur_regs += filled;
                    if filled > 0 {
                        s.stats.nfills += 1;
                    }
                    return filled;
                }
            }
        }
        filled
    }

    /// Make `shard.current` a slab with at least one free region, or
    /// return None when the shard has no usable slab.
    fn current_with_space(
        &self,
        ctx: &ExtentCtx,
        s: &mut BinShard,
    ) -> Option<u32> {
        if let Some(cur) = s.current {
            if ctx.registry.get(cur).nfree() > 0 {
                return Some(cur);
            }
            self.evict_current(ctx, s);
        }
        let (&base, &idx) = s.nonfull.iter().next()?;
        s.nonfull.remove(&base);
        s.current = Some(idx);
        Some(idx)
    }

    fn evict_current(&self, ctx: &ExtentCtx, s: &mut BinShard) {
        if let Some(cur) = s.current.take() {
            let e = ctx.registry.get(cur);
            if e.nfree() == 0 {
                s.full.insert(e.base(), cur);
            } else {
                s.nonfull.insert(e.base(), cur);
            }
        }
    }

    /// Carve a fresh slab for `class` from the extent layer.
    fn new_slab(
        &self,
        ctx: &ExtentCtx,
        pool: &ExtentPool,
        class: &SizeClass,
        shard: u32,
    ) -> Option<u32> {
        let idx = pool.alloc(ctx, class.slab_pages, 1, false).ok()?;
        let e = ctx.registry.get(idx);
        e.set_slab(true);
        e.set_szind(class.index);
        e.set_binshard(shard);
        // SAFETY: the slab is exclusively ours until registered.
        unsafe { e.slab_init(class.nregs) };
        ctx.rtree.register(
            e.base(),
            e.size(),
            RtreeValue {
                index: idx,
                szind: class.index as u32,
                slab: true,
                state: ExtentState::Active,
            },
        );
        Some(idx)
    }

    /// Return one region to its slab. `slab` must be the extent resolved
    /// for `ptr` via the radix tree.
    pub fn dalloc(
        &self,
        ctx: &ExtentCtx,
        pool: &ExtentPool,
        class: &SizeClass,
        slab: u32,
        ptr: *mut u8,
    ) -> Result<(), AllocError> {
        self.flush_batch(ctx, pool, class, &[(slab, ptr)])
    }

    /// Return a batch of regions, all of this bin's class, under one lock
    /// acquisition per shard touched. Used by tcache flush.
    pub fn flush_batch(
        &self,
        ctx: &ExtentCtx,
        pool: &ExtentPool,
        class: &SizeClass,
        items: &[(u32, *mut u8)],
    ) -> Result<(), AllocError> {
        let mut result = Ok(());
        let mut empties: Vec<u32> = Vec::new();
        let mut done = vec![false; items.len()];

        while let Some(first) = done.iter().position(|&d| !d) {
            let shard = ctx.registry.get(items[first].0).binshard();
            let shard_mutex = &self.shards[shard as usize % self.shards.len()];
            let mut s = shard_mutex.lock();
            for (i, &(slab, ptr)) in items.iter().enumerate() {
                if done[i] {
                    continue;
                }
                let e = ctx.registry.get(slab);
                if e.binshard() != shard {
                    continue;
                }
                done[i] = true;

                let offset = (ptr as usize).wrapping_sub(e.base());
                let reg = offset / class.size;
                if offset % class.size != 0 || reg >= class.nregs as usize {
                    result = Err(AllocError::Corruption);
                    continue;
                }
                let was_full = e.nfree() == 0;
                // SAFETY: the shard lock guards this slab's bitmap.
                if let Err(err) = unsafe { e.slab_free_region(reg as u32) } {
                    result = Err(err);
                    continue;
                }
                s.stats.ndalloc += 1;
                s.stats.cur_regs -= 1;

                if was_full && s.current != Some(slab) && s.full.remove(&e.base()).is_some() {
                    s.nonfull.insert(e.base(), slab);
                }
                if e.nfree() == class.nregs && s.current != Some(slab) {
                    s.nonfull.remove(&e.base());
                    s.stats.cur_slabs -= 1;
                    empties.push(slab);
                }
            }
            s.stats.nflushes += 1;
        }

        // Empty slabs go back to the extent layer with no bin lock held.
        for slab in empties {
            #[cfg(feature = "debug")]
            {
                let e = ctx.registry.get(slab);
                // SAFETY: the slab is fully free and exclusively ours.
                unsafe {
                    crate::diagnostics::junk::fill_free(e.base() as *mut u8, e.size());
                }
            }
            pool.dealloc(ctx, slab);
        }
        result
    }

    /// Merged statistics across this bin's shards.
    pub fn stats(&self) -> BinStats {
        let mut total = BinStats::default();
        for shard in &self.shards {
            let s = shard.lock();
            total.nmalloc += s.stats.nmalloc;
            total.ndalloc += s.stats.ndalloc;
            total.nslabs += s.stats.nslabs;
            total.nfills += s.stats.nfills;
            total.nflushes += s.stats.nflushes;
            total.cur_slabs += s.stats.cur_slabs;
            total.cur_regs += s.stats.cur_regs;
        }
        total
    }

    /// Whether any shard still owns a slab.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| {
            let s = shard.lock();
            s.current.is_none() && s.nonfull.is_empty() && s.full.is_empty()
        })
    }

    /// Take every slab out of the bin and zero its statistics. Used by
    /// arena reset/destroy; the caller returns the slabs to the extent
    /// layer with no bin lock held.
    pub(crate) fn drain_slabs(&self) -> Vec<u32> {
        let mut slabs = Vec::new();
        for shard in &self.shards {
            let mut s = shard.lock();
            slabs.extend(s.current.take());
            slabs.extend(s.nonfull.values().copied());
            slabs.extend(s.full.values().copied());
            s.nonfull.clear();
            s.full.clear();
            s.stats = BinStats::default();
        }
        slabs
    }

    pub(crate) fn prefork(&self) {
        for shard in &self.shards {
            shard.prefork();
        }
    }

    pub(crate) fn postfork_parent(&self) {
        for shard in &self.shards {
            shard.postfork_parent();
        }
    }

    pub(crate) fn postfork_child(&self) {
        for shard in &self.shards {
            shard.postfork_child();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::AllocConfig;
    use crate::core::classes::SizeClasses;
    use crate::extent::hooks::SystemHooks;
    use crate::extent::rtree::RadixTree;
    use crate::extent::{base::Base, ExtentRegistry};
    use std::sync::Arc;

    struct Harness {
        registry: ExtentRegistry,
        rtree: RadixTree,
        base: Base,
        pool: ExtentPool,
        classes: SizeClasses,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: ExtentRegistry::new(),
                rtree: RadixTree::new(),
                base: Base::new(Arc::new(SystemHooks)),
                pool: ExtentPool::new(0, &AllocConfig::default()),
                classes: SizeClasses::new(&[]),
            }
        }

        fn ctx(&self) -> ExtentCtx<'_> {
            ExtentCtx {
                registry: &self.registry,
                rtree: &self.rtree,
                base: &self.base,
                hooks: Arc::new(SystemHooks),
                now_ms: 0,
            }
        }
    }

    #[test]
    fn test_fill_ascending_regions() {
        let h = Harness::new();
        let ctx = h.ctx();
        let class = *h.classes.class(h.classes.index_of(64));
        let bin = Bin::new(1);

        let mut out = Vec::new();
        assert_eq!(bin.fill(&ctx, &h.pool, &class, 0, &mut out, 8), 8);
        // Regions come lowest-address-first out of a fresh slab.
        for pair in out.windows(2) {
            assert_eq!(pair[0] as usize + class.size, pair[1] as usize);
        }
        let stats = bin.stats();
        assert_eq!(stats.nmalloc, 8);
        assert_eq!(stats.cur_regs, 8);
        assert_eq!(stats.cur_slabs, 1);
        assert_eq!(stats.nfills, 1);
    }

    #[test]
    fn test_flush_and_empty_slab_retirement() {
        let h = Harness::new();
        let ctx = h.ctx();
        let szind = h.classes.index_of(64);
        let class = *h.classes.class(szind);
        let bin = Bin::new(1);

        let mut out = Vec::new();
        bin.fill(&ctx, &h.pool, &class, 0, &mut out, 4);
        let items: Vec<(u32, *mut u8)> = out
            .iter()
            .map(|&p| {
                let v = h.rtree.lookup_uncached(p as usize).unwrap();
                assert!(v.slab);
                assert_eq!(v.szind as usize, szind);
                (v.index, p)
            })
            .collect();
        bin.flush_batch(&ctx, &h.pool, &class, &items).unwrap();

        let stats = bin.stats();
        assert_eq!(stats.ndalloc, 4);
        assert_eq!(stats.cur_regs, 0);
        // The slab stays current for the next fill rather than bouncing
        // back to the extent layer.
        assert_eq!(stats.cur_slabs, 1);
        assert!(!bin.is_empty());
    }

    #[test]
    fn test_free_slab_returns_to_extent_layer() {
        let h = Harness::new();
        let ctx = h.ctx();
        let szind = h.classes.index_of(64);
        let class = *h.classes.class(szind);
        let bin = Bin::new(1);

        // Two slabs' worth of regions forces a second, non-current slab.
        let want = class.nregs as usize + 1;
        let mut out = Vec::new();
        assert_eq!(bin.fill(&ctx, &h.pool, &class, 0, &mut out, want), want);
        assert_eq!(bin.stats().cur_slabs, 2);

        let items: Vec<(u32, *mut u8)> = out
            .iter()
            .map(|&p| (h.rtree.lookup_uncached(p as usize).unwrap().index, p))
            .collect();
        bin.flush_batch(&ctx, &h.pool, &class, &items).unwrap();
        // One slab (not current) became empty and went back dirty.
        assert_eq!(bin.stats().cur_slabs, 1);
        assert!(h.pool.npages_cached(crate::extent::pool::CacheKind::Dirty) > 0);
    }

    #[test]
    fn test_double_free_is_corruption() {
        let h = Harness::new();
        let ctx = h.ctx();
        let class = *h.classes.class(h.classes.index_of(64));
        let bin = Bin::new(1);

        let mut out = Vec::new();
        bin.fill(&ctx, &h.pool, &class, 0, &mut out, 1);
        let p = out[0];
        let idx = h.rtree.lookup_uncached(p as usize).unwrap().index;
        bin.dalloc(&ctx, &h.pool, &class, idx, p).unwrap();
        assert_eq!(
            bin.dalloc(&ctx, &h.pool, &class, idx, p),
            Err(AllocError::Corruption)
        );
    }

    #[test]
    fn test_lowest_address_slab_refills_first() {
        let h = Harness::new();
        let ctx = h.ctx();
        let class = *h.classes.class(h.classes.index_of(4096));
        let bin = Bin::new(1);

        // 4096-byte regions go one per slab; take three slabs.
        let mut out = Vec::new();
        assert_eq!(bin.fill(&ctx, &h.pool, &class, 0, &mut out, 3), 3);
        let items: Vec<(u32, *mut u8)> = out
            .iter()
            .map(|&p| (h.rtree.lookup_uncached(p as usize).unwrap().index, p))
            .collect();
        // Free only the middle and first; the lowest address comes back
        // first on the next fill.
        bin.flush_batch(&ctx, &h.pool, &class, &items[..2]).unwrap();
        let mut refill = Vec::new();
        assert_eq!(bin.fill(&ctx, &h.pool, &class, 0, &mut refill, 1), 1);
        let lowest = out[..2].iter().map(|&p| p as usize).min().unwrap();
        assert_eq!(refill[0] as usize, lowest);
    }
}
