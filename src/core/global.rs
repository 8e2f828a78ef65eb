//! Process-wide state of one allocator instance.
//!
//! `HeapCore` owns the size-class table, the base (metadata) allocator,
//! the extent record table, the radix tree, and the arena set. It also
//! orchestrates fork safety: every instance registers with a
//! process-global list and takes all of its locks around `fork()`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock, Weak};
use std::time::Instant;

use crossbeam_queue::SegQueue;

use crate::api::config::{AllocConfig, PercpuArena};
use crate::api::stats::{ArenaStats, HeapStats, PointerInfo};
use crate::arena::{Arena, ThreadKind};
use crate::core::classes::SizeClasses;
use crate::core::event::{EventIntervals, EVENT_DISABLED};
use crate::core::tcache::{FlushBatch, Tcache};
use crate::core::tsd;
use crate::diagnostics::hooks::HookTable;
use crate::diagnostics::safety;
use crate::error::AllocError;
use crate::extent::base::Base;
use crate::extent::hooks::{PageHooks, SystemHooks};
use crate::extent::pool::{ExtentCtx, CACHED_SZIND};
use crate::extent::rtree::{RadixTree, RtreeCache};
use crate::extent::{ExtentRegistry, ExtentState};
use crate::sync::{ForkMutex, Rank};

/// Cap on explicitly created arenas beyond the auto set.
const MAX_EXPLICIT_ARENAS: u32 = 1024;

/// Callback installed by an external sampling/stats collaborator;
/// receives the thread's allocated-byte count at the trigger. `Arc` so
/// invocation can happen with no allocator lock held.
pub type EventHook = Arc<dyn Fn(u64) + Send + Sync>;

static NEXT_CORE_ID: AtomicU32 = AtomicU32::new(0);
static FORK_REGISTRY: Mutex<Vec<Weak<HeapCore>>> = Mutex::new(Vec::new());
static FORK_ONCE: Once = Once::new();

/// One allocator instance's shared state.
pub struct HeapCore {
    id: u32,
    config: AllocConfig,
    classes: SizeClasses,
    default_hooks: Arc<dyn PageHooks>,
    base: Base,
    registry: ExtentRegistry,
    rtree: RadixTree,
    auto_arenas: Box<[OnceLock<Arc<Arena>>]>,
    huge_arena: OnceLock<Arc<Arena>>,
    explicit: ForkMutex<BTreeMap<u32, Arc<Arena>>>,
    next_explicit: AtomicU32,
    recycled_arenas: SegQueue<u32>,
    epoch: Instant,
    pub(crate) alloc_hooks: HookTable,
    sample_hook: ForkMutex<Option<EventHook>>,
    sample_interval: AtomicU64,
    stats_hook: ForkMutex<Option<EventHook>>,
    stats_interval: AtomicU64,
}

impl HeapCore {
    pub(crate) fn new(config: AllocConfig) -> Arc<Self> {
        let classes = SizeClasses::new(&config.slab_sizes);
        let default_hooks: Arc<dyn PageHooks> = Arc::new(SystemHooks);
        let narenas = config.narenas_effective();
        let mut auto_arenas = Vec::with_capacity(narenas);
        auto_arenas.resize_with(narenas, OnceLock::new);

        let core = Arc::new(Self {
            id: NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed),
            default_hooks: Arc::clone(&default_hooks),
            base: Base::new(default_hooks),
            registry: ExtentRegistry::new(),
            rtree: RadixTree::new(),
            auto_arenas: auto_arenas.into_boxed_slice(),
            huge_arena: OnceLock::new(),
            explicit: ForkMutex::new(Rank::ArenaSet, BTreeMap::new()),
            next_explicit: AtomicU32::new(narenas as u32 + 1),
            recycled_arenas: SegQueue::new(),
            epoch: Instant::now(),
            alloc_hooks: HookTable::new(),
            sample_hook: ForkMutex::new(Rank::Control, None),
            sample_interval: AtomicU64::new(EVENT_DISABLED),
            stats_hook: ForkMutex::new(Rank::Control, None),
            stats_interval: AtomicU64::new(EVENT_DISABLED),
            classes,
            config,
        });
        register_fork_handlers(&core);
        core
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub(crate) fn config(&self) -> &AllocConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    #[inline]
    pub(crate) fn rtree(&self) -> &RadixTree {
        &self.rtree
    }

    #[inline]
    pub(crate) fn registry(&self) -> &ExtentRegistry {
        &self.registry
    }

    /// Milliseconds since this instance was created; the decay clock.
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn new_tcache(&self) -> Tcache {
        Tcache::new(&self.classes, self.config.tcache_maxclass())
    }

    pub(crate) fn event_intervals(&self) -> EventIntervals {
        EventIntervals {
            sample: self.sample_interval.load(Ordering::Relaxed),
            stats: self.stats_interval.load(Ordering::Relaxed),
        }
    }

    /// Build the shared context for one chain of extent operations.
    pub(crate) fn extent_ctx(&self, arena: &Arena) -> ExtentCtx<'_> {
        ExtentCtx {
            registry: &self.registry,
            rtree: &self.rtree,
            base: &self.base,
            hooks: arena.hooks(),
            now_ms: self.now_ms(),
        }
    }

    // ---------------------------------------------------------------
    // Arena set
    // ---------------------------------------------------------------

    /// Number of auto arenas; the huge arena sits one past them.
    pub(crate) fn narenas_auto(&self) -> usize {
        self.auto_arenas.len()
    }

    pub(crate) fn huge_arena_ind(&self) -> u32 {
        self.auto_arenas.len() as u32
    }

    /// Resolve an arena index. Auto and huge arenas resolve lock-free.
    pub(crate) fn arena(&self, ind: u32) -> Option<Arc<Arena>> {
        let n = self.auto_arenas.len() as u32;
        if ind < n {
            self.auto_arenas[ind as usize].get().cloned()
        } else if ind == n {
            self.huge_arena.get().cloned()
        } else {
            self.explicit.lock().get(&ind).cloned()
        }
    }

    fn init_auto(&self, ind: usize) -> Arc<Arena> {
        Arc::clone(self.auto_arenas[ind].get_or_init(|| {
            log::debug!("initializing arena {}", ind);
            Arc::new(Arena::new(
                ind as u32,
                false,
                &self.config,
                &self.classes,
                Arc::clone(&self.default_hooks),
            ))
        }))
    }

    /// The dedicated arena for oversized allocations.
    pub(crate) fn huge(&self) -> Arc<Arena> {
        Arc::clone(self.huge_arena.get_or_init(|| {
            Arc::new(Arena::new(
                self.huge_arena_ind(),
                true,
                &self.config,
                &self.classes,
                Arc::clone(&self.default_hooks),
            ))
        }))
    }

    /// Arena 0, the fallback for reentrant and reincarnated paths.
    pub(crate) fn arena0(&self) -> Arc<Arena> {
        self.init_auto(0)
    }

    /// Resolve an arena index, initializing auto and huge slots on
    /// demand. Explicit indices resolve only while created.
    pub(crate) fn arena_or_init(&self, ind: u32) -> Option<Arc<Arena>> {
        let n = self.auto_arenas.len() as u32;
        if ind < n {
            Some(self.init_auto(ind as usize))
        } else if ind == n {
            Some(self.huge())
        } else {
            self.explicit.lock().get(&ind).cloned()
        }
    }

    /// Pick an auto arena for a fresh thread binding and count the
    /// thread against it.
    pub(crate) fn choose_arena(&self, kind: ThreadKind) -> u32 {
        let n = self.auto_arenas.len();
        let ind = match self.config.percpu_arena {
            PercpuArena::Percpu => current_cpu() % n,
            PercpuArena::Phycpu => (current_cpu() / 2) % n,
            PercpuArena::Disabled => {
                // Least-loaded initialized arena, creating a new one while
                // slots remain.
                let mut best: Option<(u32, usize)> = None;
                let mut first_uninit = None;
                for (i, slot) in self.auto_arenas.iter().enumerate() {
                    match slot.get() {
                        Some(arena) => {
                            let load = arena.nthreads(kind);
                            if best.map_or(true, |(b, _)| load < b) {
                                best = Some((load, i));
                            }
                        }
                        None => {
                            if first_uninit.is_none() {
                                first_uninit = Some(i);
                            }
                        }
                    }
                }
                match (best, first_uninit) {
                    (Some((0, i)), _) => i,
                    (_, Some(i)) => i,
                    (Some((_, i)), None) => i,
                    (None, None) => 0,
                }
            }
        };
        let arena = self.init_auto(ind);
        arena.bind(kind);
        ind as u32
    }

    /// Create an explicit arena; its index is stable until destroyed.
    pub fn create_arena(&self) -> Result<u32, AllocError> {
        let ind = match self.recycled_arenas.pop() {
            Some(ind) => ind,
            None => {
                let ind = self.next_explicit.fetch_add(1, Ordering::Relaxed);
                if ind >= self.auto_arenas.len() as u32 + 1 + MAX_EXPLICIT_ARENAS {
                    return Err(AllocError::OutOfMemory);
                }
                ind
            }
        };
        let arena = Arc::new(Arena::new(
            ind,
            false,
            &self.config,
            &self.classes,
            Arc::clone(&self.default_hooks),
        ));
        self.explicit.lock().insert(ind, arena);
        Ok(ind)
    }

    /// Destroy an explicit arena after all bound threads detached. Its
    /// index returns to the recycle pool.
    pub fn destroy_arena(&self, ind: u32) -> Result<(), AllocError> {
        if ind <= self.huge_arena_ind() {
            return Err(AllocError::InvalidArgument);
        }
        let arena = {
            let mut explicit = self.explicit.lock();
            let arena = explicit.get(&ind).ok_or(AllocError::InvalidArgument)?;
            if arena.nthreads(ThreadKind::App) > 0 || arena.nthreads(ThreadKind::Internal) > 0 {
                return Err(AllocError::InvalidArgument);
            }
            explicit.remove(&ind).expect("arena vanished")
        };
        let ctx = self.extent_ctx(&arena);
        arena.destroy(&ctx);
        self.recycled_arenas.push(ind);
        log::debug!("destroyed arena {}", ind);
        Ok(())
    }

    /// Discard an arena's bound state (slabs, large allocations, decay
    /// caches). Callers guarantee nothing is outstanding.
    pub fn reset_arena(&self, ind: u32) -> Result<(), AllocError> {
        let arena = self.arena(ind).ok_or(AllocError::InvalidArgument)?;
        let ctx = self.extent_ctx(&arena);
        arena.reset(&ctx);
        Ok(())
    }

    /// Advance an arena's decay clock, or purge outright.
    pub fn decay_arena(&self, ind: u32, purge_all: bool) -> Result<(), AllocError> {
        let arena = self.arena(ind).ok_or(AllocError::InvalidArgument)?;
        let ctx = self.extent_ctx(&arena);
        if purge_all {
            arena.purge(&ctx, true);
        } else {
            arena.decay_tick(&ctx);
        }
        Ok(())
    }

    fn each_arena(&self) -> Vec<Arc<Arena>> {
        let mut out = Vec::new();
        for slot in self.auto_arenas.iter() {
            if let Some(a) = slot.get() {
                out.push(Arc::clone(a));
            }
        }
        if let Some(a) = self.huge_arena.get() {
            out.push(Arc::clone(a));
        }
        out.extend(self.explicit.lock().values().cloned());
        out
    }

    // ---------------------------------------------------------------
    // Tcache spill paths
    // ---------------------------------------------------------------

    /// Return one evicted tcache batch to the owning arenas. Small
    /// batches group per arena so each bin shard is locked once.
    pub(crate) fn flush_batch(&self, rcache: &mut RtreeCache, batch: FlushBatch) {
        let szind = batch.szind;
        if self.classes.is_binned(szind) {
            let mut by_arena: BTreeMap<u32, Vec<(u32, *mut u8)>> = BTreeMap::new();
            for ptr in batch.ptrs {
                let Some(v) = self.rtree.lookup(rcache, ptr as usize) else {
                    safety::fail("cached pointer not managed by this allocator");
                };
                let e = self.registry.get(v.index);
                by_arena.entry(e.arena()).or_default().push((v.index, ptr));
            }
            for (arena_ind, items) in by_arena {
                let Some(arena) = self.arena(arena_ind) else {
                    safety::fail("cached pointer owned by a dead arena");
                };
                let ctx = self.extent_ctx(&arena);
                if arena.flush_small(&ctx, &self.classes, szind, &items).is_err() {
                    safety::fail("double free detected during cache flush");
                }
            }
        } else {
            for ptr in batch.ptrs {
                let Some(v) = self.rtree.lookup(rcache, ptr as usize) else {
                    safety::fail("cached pointer not managed by this allocator");
                };
                let e = self.registry.get(v.index);
                let Some(arena) = self.arena(e.arena()) else {
                    safety::fail("cached pointer owned by a dead arena");
                };
                let ctx = self.extent_ctx(&arena);
                arena.dalloc_large(&ctx, v.index);
            }
        }
    }

    // ---------------------------------------------------------------
    // External event hooks
    // ---------------------------------------------------------------

    /// Install the sampling collaborator's hook, fired every `interval`
    /// allocated bytes per thread.
    pub fn set_sample_hook(&self, interval: u64, hook: Option<EventHook>) {
        *self.sample_hook.lock() = hook;
        let interval = if interval == 0 { EVENT_DISABLED } else { interval };
        self.sample_interval.store(interval, Ordering::Release);
    }

    /// Install the stats-interval hook.
    pub fn set_stats_hook(&self, interval: u64, hook: Option<EventHook>) {
        *self.stats_hook.lock() = hook;
        let interval = if interval == 0 { EVENT_DISABLED } else { interval };
        self.stats_interval.store(interval, Ordering::Release);
    }

    pub(crate) fn run_sample_hook(&self, allocated: u64) {
        let hook = self.sample_hook.lock().clone();
        if let Some(h) = hook {
            let _guard = tsd::enter_callout();
            h(allocated);
        }
    }

    pub(crate) fn run_stats_hook(&self, allocated: u64) {
        let hook = self.stats_hook.lock().clone();
        if let Some(h) = hook {
            let _guard = tsd::enter_callout();
            h(allocated);
        }
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// Classify an arbitrary pointer.
    pub(crate) fn pointer_info(&self, rcache: &mut RtreeCache, addr: usize) -> PointerInfo {
        let Some(v) = self.rtree.lookup(rcache, addr) else {
            return PointerInfo::Unmanaged;
        };
        if v.state != ExtentState::Active || v.szind == CACHED_SZIND {
            return PointerInfo::Unmanaged;
        }
        let usable = self.classes.size_of(v.szind as usize);
        if v.slab {
            let e = self.registry.get(v.index);
            PointerInfo::Small {
                usable_size: usable,
                slab_regions: self.classes.class(v.szind as usize).nregs,
                slab_free: e.nfree(),
            }
        } else {
            PointerInfo::Large { usable_size: usable }
        }
    }

    pub(crate) fn arena_stats(&self, arena: &Arena) -> ArenaStats {
        use crate::extent::pool::CacheKind;
        let bins = arena.bin_stats();
        let allocated_small = bins
            .iter()
            .enumerate()
            .map(|(i, b)| b.cur_regs * self.classes.size_of(i))
            .sum();
        let (nmalloc_large, ndalloc_large, allocated_large) = arena.large_counts();
        ArenaStats {
            ind: arena.ind(),
            bins,
            allocated_small,
            allocated_large,
            nmalloc_large,
            ndalloc_large,
            mapped: arena.pool().mapped(),
            dirty_pages: arena.pool().npages_cached(CacheKind::Dirty),
            muzzy_pages: arena.pool().npages_cached(CacheKind::Muzzy),
            retained_pages: arena.pool().npages_cached(CacheKind::Retained),
            npurges: arena.pool().purge_counts(),
        }
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let mut out = HeapStats { metadata: self.base.mapped(), ..HeapStats::default() };
        for arena in self.each_arena() {
            let s = self.arena_stats(&arena);
            out.allocated_small += s.allocated_small;
            out.allocated_large += s.allocated_large;
            out.mapped += s.mapped;
            out.dirty_pages += s.dirty_pages;
            out.muzzy_pages += s.muzzy_pages;
            out.retained_pages += s.retained_pages;
            out.nmalloc_large += s.nmalloc_large;
            out.ndalloc_large += s.ndalloc_large;
            for b in &s.bins {
                out.nmalloc_small += b.nmalloc;
                out.ndalloc_small += b.ndalloc;
            }
            out.narenas += 1;
        }
        out
    }

    // ---------------------------------------------------------------
    // Fork safety
    // ---------------------------------------------------------------

    fn prefork(&self) {
        // Arena set first (the list must be stable), then each arena in
        // index order, then the shared page structures, then control.
        self.explicit.prefork();
        for arena in self.prefork_arena_list() {
            arena.prefork();
        }
        self.rtree.prefork();
        self.registry.prefork();
        self.base.prefork();
        self.alloc_hooks.prefork();
        self.sample_hook.prefork();
        self.stats_hook.prefork();
    }

    fn prefork_arena_list(&self) -> Vec<Arc<Arena>> {
        let mut out = Vec::new();
        for slot in self.auto_arenas.iter() {
            if let Some(a) = slot.get() {
                out.push(Arc::clone(a));
            }
        }
        if let Some(a) = self.huge_arena.get() {
            out.push(Arc::clone(a));
        }
        // SAFETY: prefork holds the explicit-map lock.
        let explicit = unsafe { self.explicit.data_unsynchronized() };
        out.extend(explicit.values().cloned());
        out
    }

    fn postfork_parent(&self) {
        self.stats_hook.postfork_parent();
        self.sample_hook.postfork_parent();
        self.alloc_hooks.postfork_parent();
        self.base.postfork_parent();
        self.registry.postfork_parent();
        self.rtree.postfork_parent();
        for arena in self.prefork_arena_list().into_iter().rev() {
            arena.postfork_parent();
        }
        self.explicit.postfork_parent();
    }

    fn postfork_child(&self) {
        self.stats_hook.postfork_child();
        self.sample_hook.postfork_child();
        self.alloc_hooks.postfork_child();
        self.base.postfork_child();
        self.registry.postfork_child();
        self.rtree.postfork_child();
        for arena in self.prefork_arena_list().into_iter().rev() {
            arena.postfork_child();
        }
        self.explicit.postfork_child();
    }
}

impl Drop for HeapCore {
    fn drop(&mut self) {
        // Release application address space; the base allocator frees
        // the metadata ranges in its own drop.
        for arena in self.each_arena() {
            let ctx = self.extent_ctx(&arena);
            arena.destroy(&ctx);
        }
    }
}

#[cfg(target_os = "linux")]
fn current_cpu() -> usize {
    // SAFETY: no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> usize {
    0
}

fn register_fork_handlers(core: &Arc<HeapCore>) {
    let mut registry = FORK_REGISTRY.lock().expect("fork registry");
    registry.retain(|w| w.strong_count() > 0);
    registry.push(Arc::downgrade(core));
    drop(registry);

    #[cfg(unix)]
    FORK_ONCE.call_once(|| {
        // SAFETY: handlers are registered once and only touch allocator
        // state through the prefork protocol.
        unsafe {
            libc::pthread_atfork(
                Some(prefork_all),
                Some(postfork_parent_all),
                Some(postfork_child_all),
            );
        }
    });
}

fn live_cores() -> Vec<Arc<HeapCore>> {
    FORK_REGISTRY
        .lock()
        .map(|reg| reg.iter().filter_map(Weak::upgrade).collect())
        .unwrap_or_default()
}

extern "C" fn prefork_all() {
    for core in live_cores() {
        core.prefork();
    }
}

extern "C" fn postfork_parent_all() {
    for core in live_cores() {
        core.postfork_parent();
    }
}

extern "C" fn postfork_child_all() {
    for core in live_cores() {
        core.postfork_child();
    }
}
