//! Arenas: the unit of lock-contention isolation.
//!
//! An arena binds a grid of bin shards, an extent pool with its decay
//! state, and an extent-hook table. Threads bind to an arena on first
//! use and stay there; oversized requests can be routed to a dedicated
//! huge arena.

pub mod bin;
pub mod decay;
pub mod large;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::api::config::AllocConfig;
use crate::arena::bin::{Bin, BinStats};
use crate::core::classes::SizeClasses;
use crate::error::AllocError;
use crate::extent::hooks::PageHooks;
use crate::extent::pool::{CacheKind, ExtentCtx, ExtentPool};
use crate::sync::{ForkMutex, Rank};

/// Which population a bound thread counts toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// Application threads allocating user data.
    App,
    /// Internal users (metadata, maintenance).
    Internal,
}

/// One arena.
pub struct Arena {
    ind: u32,
    huge: bool,
    nthreads_app: AtomicU32,
    nthreads_internal: AtomicU32,
    hooks: ForkMutex<Arc<dyn PageHooks>>,
    bins: Vec<Bin>,
    /// Live large extents by base address, for reset/destroy traversal.
    large: ForkMutex<BTreeMap<usize, u32>>,
    pool: ExtentPool,
    nmalloc_large: AtomicU64,
    ndalloc_large: AtomicU64,
    large_allocated: AtomicUsize,
}

impl Arena {
    pub fn new(
        ind: u32,
        huge: bool,
        cfg: &AllocConfig,
        classes: &SizeClasses,
        hooks: Arc<dyn PageHooks>,
    ) -> Self {
        let mut bins = Vec::with_capacity(classes.nbins());
        for i in 0..classes.nbins() {
            bins.push(Bin::new(cfg.shards_for(classes.size_of(i))));
        }
        let pool = ExtentPool::new(ind, cfg);
        let arena = Self {
            ind,
            huge,
            nthreads_app: AtomicU32::new(0),
            nthreads_internal: AtomicU32::new(0),
            hooks: ForkMutex::new(Rank::Hooks, hooks),
            bins,
            large: ForkMutex::new(Rank::LargeList, BTreeMap::new()),
            pool,
            nmalloc_large: AtomicU64::new(0),
            ndalloc_large: AtomicU64::new(0),
            large_allocated: AtomicUsize::new(0),
        };
        if huge {
            // The huge arena recycles aggressively; its pages are cold by
            // definition.
            arena.pool.set_decay_ms(CacheKind::Dirty, 0);
            arena.pool.set_decay_ms(CacheKind::Muzzy, 0);
        }
        arena
    }

    #[inline]
    pub fn ind(&self) -> u32 {
        self.ind
    }

    #[inline]
    pub fn is_huge(&self) -> bool {
        self.huge
    }

    pub fn pool(&self) -> &ExtentPool {
        &self.pool
    }

    // ---------------------------------------------------------------
    // Thread binding
    // ---------------------------------------------------------------

    fn thread_counter(&self, kind: ThreadKind) -> &AtomicU32 {
        match kind {
            ThreadKind::App => &self.nthreads_app,
            ThreadKind::Internal => &self.nthreads_internal,
        }
    }

    pub fn bind(&self, kind: ThreadKind) {
        self.thread_counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    pub fn unbind(&self, kind: ThreadKind) {
        self.thread_counter(kind).fetch_sub(1, Ordering::Relaxed);
    }

    pub fn nthreads(&self, kind: ThreadKind) -> u32 {
        self.thread_counter(kind).load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------
    // Extent hooks
    // ---------------------------------------------------------------

    /// Snapshot the current hook table. Cloned with no other lock held;
    /// an operation chain keeps using the snapshot it started with.
    pub fn hooks(&self) -> Arc<dyn PageHooks> {
        Arc::clone(&self.hooks.lock())
    }

    /// Install a new hook table, returning the previous one. Installed
    /// hooks run under the reentrancy guard.
    pub fn set_hooks(&self, hooks: Arc<dyn PageHooks>) -> Arc<dyn PageHooks> {
        let wrapped: Arc<dyn PageHooks> =
            Arc::new(crate::extent::hooks::CalloutHooks(hooks));
        std::mem::replace(&mut *self.hooks.lock(), wrapped)
    }

    // ---------------------------------------------------------------
    // Small path
    // ---------------------------------------------------------------

    /// Batched refill for a thread cache. Returns regions delivered.
    pub fn fill_small(
        &self,
        ctx: &ExtentCtx,
        classes: &SizeClasses,
        szind: usize,
        shard: usize,
        out: &mut Vec<*mut u8>,
        want: usize,
    ) -> usize {
        let class = classes.class(szind);
        self.bins[szind].fill(ctx, &self.pool, class, shard, out, want)
    }

    /// Allocate a single small region, bypassing the thread cache.
    pub fn alloc_small_one(
        &self,
        ctx: &ExtentCtx,
        classes: &SizeClasses,
        szind: usize,
        shard: usize,
    ) -> Result<*mut u8, AllocError> {
        let mut out = Vec::with_capacity(1);
        if self.fill_small(ctx, classes, szind, shard, &mut out, 1) == 1 {
            Ok(out[0])
        } else {
            Err(AllocError::OutOfMemory)
        }
    }

    /// Return small regions of one class, batched. Items carry the slab
    /// index resolved from the radix tree.
    pub fn flush_small(
        &self,
        ctx: &ExtentCtx,
        classes: &SizeClasses,
        szind: usize,
        items: &[(u32, *mut u8)],
    ) -> Result<(), AllocError> {
        self.bins[szind].flush_batch(ctx, &self.pool, classes.class(szind), items)
    }

    // ---------------------------------------------------------------
    // Large path
    // ---------------------------------------------------------------

    pub fn alloc_large(
        &self,
        ctx: &ExtentCtx,
        classes: &SizeClasses,
        szind: usize,
        alignment: usize,
        zero: bool,
    ) -> Result<*mut u8, AllocError> {
        let idx = large::alloc(ctx, &self.pool, classes, szind, alignment, zero)?;
        let e = ctx.registry.get(idx);
        self.large.lock().insert(e.base(), idx);
        self.nmalloc_large.fetch_add(1, Ordering::Relaxed);
        self.large_allocated.fetch_add(e.size(), Ordering::Relaxed);
        Ok(e.base() as *mut u8)
    }

    pub fn dalloc_large(&self, ctx: &ExtentCtx, idx: u32) {
        let e = ctx.registry.get(idx);
        self.large.lock().remove(&e.base());
        self.ndalloc_large.fetch_add(1, Ordering::Relaxed);
        self.large_allocated.fetch_sub(e.size(), Ordering::Relaxed);
        large::dalloc(ctx, &self.pool, idx);
    }

    /// In-place large resize; adjusts accounting on success.
    pub fn resize_large(
        &self,
        ctx: &ExtentCtx,
        classes: &SizeClasses,
        idx: u32,
        new_szind: usize,
    ) -> bool {
        let e = ctx.registry.get(idx);
        let old_size = e.size();
        if large::resize_in_place(ctx, &self.pool, classes, idx, new_szind) {
            let new_size = e.size();
            if new_size >= old_size {
                self.large_allocated.fetch_add(new_size - old_size, Ordering::Relaxed);
            } else {
                self.large_allocated.fetch_sub(old_size - new_size, Ordering::Relaxed);
            }
            true
        } else {
            false
        }
    }

    // ---------------------------------------------------------------
    // Decay, reset, destroy
    // ---------------------------------------------------------------

    /// Advance the decay clocks; driven by the thread-event engine.
    pub fn decay_tick(&self, ctx: &ExtentCtx) {
        self.pool.decay_tick(ctx);
    }

    /// Purge dirty pages now; with `all`, muzzy pages too.
    pub fn purge(&self, ctx: &ExtentCtx, all: bool) {
        self.pool.purge(ctx, all);
    }

    /// Discard all bound state: slabs, large allocations, and the decay
    /// caches. Callers must guarantee nothing is outstanding.
    pub fn reset(&self, ctx: &ExtentCtx) {
        for bin in &self.bins {
            for slab in bin.drain_slabs() {
                self.pool.dealloc(ctx, slab);
            }
        }
        let larges: Vec<u32> = {
            let mut map = self.large.lock();
            let v = map.values().copied().collect();
            map.clear();
            v
        };
        for idx in larges {
            self.ndalloc_large.fetch_add(1, Ordering::Relaxed);
            large::dalloc(ctx, &self.pool, idx);
        }
        self.large_allocated.store(0, Ordering::Relaxed);
        self.pool.purge(ctx, true);
    }

    /// Reset plus release of every cached extent. The arena must not be
    /// used afterwards; its index is recycled by the arena set.
    pub fn destroy(&self, ctx: &ExtentCtx) {
        self.reset(ctx);
        self.pool.destroy(ctx);
    }

    // ---------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------

    pub fn bin_stats(&self) -> Vec<BinStats> {
        self.bins.iter().map(|b| b.stats()).collect()
    }

    pub fn large_counts(&self) -> (u64, u64, usize) {
        (
            self.nmalloc_large.load(Ordering::Relaxed),
            self.ndalloc_large.load(Ordering::Relaxed),
            self.large_allocated.load(Ordering::Relaxed),
        )
    }

    // ---------------------------------------------------------------
    // Fork
    // ---------------------------------------------------------------

    pub(crate) fn prefork(&self) {
        self.hooks.prefork();
        self.large.prefork();
        self.pool.prefork();
        for bin in &self.bins {
            bin.prefork();
        }
    }

    pub(crate) fn postfork_parent(&self) {
        for bin in self.bins.iter().rev() {
            bin.postfork_parent();
        }
        self.pool.postfork_parent();
        self.large.postfork_parent();
        self.hooks.postfork_parent();
    }

    pub(crate) fn postfork_child(&self) {
        for bin in self.bins.iter().rev() {
            bin.postfork_child();
        }
        self.pool.postfork_child();
        self.large.postfork_child();
        self.hooks.postfork_child();
    }
}
