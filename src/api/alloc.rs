//! The main allocator type and the malloc-family entry layer.
//!
//! `ShardAlloc` is a cheap-to-clone handle over one allocator instance.
//! Every C-shaped entry point (alloc/calloc/aligned/realloc/free) funnels
//! into one generic slow path parameterized by a zero-sized policy type,
//! so the per-entry differences (zeroing, errno, minimum alignment,
//! empty-size handling) monomorphize instead of branching.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use errno::{set_errno, Errno};

use crate::api::config::AllocConfig;
use crate::api::stats::{ArenaStats, HeapStats, PointerInfo};
use crate::core::classes::{LOOKUP_MAXCLASS, PAGE};
use crate::core::event::Triggered;
use crate::core::global::{EventHook, HeapCore};
use crate::core::tsd::{self, ThreadState};
use crate::diagnostics::hooks::{AllocHooks, HookHandle};
use crate::diagnostics::{junk, safety};
use crate::error::AllocError;
use crate::extent::pool::CACHED_SZIND;
use crate::extent::ExtentState;

/// Per-entry-point policy, monomorphized into the shared slow path.
trait EntryPolicy {
    /// Zero the allocation regardless of the `zero` config.
    const ZERO: bool = false;
    /// Report failures through `errno`.
    const SET_ERRNO: bool = true;
    /// Treat a zero size as one byte.
    const BUMP_EMPTY: bool = true;
    /// Smallest alignment the entry accepts (0 = no aligned semantics).
    const MIN_ALIGNMENT: usize = 0;
}

struct MallocPolicy;
impl EntryPolicy for MallocPolicy {}

struct CallocPolicy;
impl EntryPolicy for CallocPolicy {
    const ZERO: bool = true;
}

struct AlignedPolicy;
impl EntryPolicy for AlignedPolicy {
    const MIN_ALIGNMENT: usize = 1;
}

struct PosixMemalignPolicy;
impl EntryPolicy for PosixMemalignPolicy {
    const SET_ERRNO: bool = false;
    const MIN_ALIGNMENT: usize = mem::size_of::<*mut u8>();
}

struct MallocxPolicy;
impl EntryPolicy for MallocxPolicy {}

/// Flags for the extended entry points, in the spirit of `mallocx`.
#[derive(Debug, Clone, Copy)]
pub struct AllocxFlags {
    /// Zero the allocation.
    pub zero: bool,
    /// Required alignment (0 or a power of two).
    pub alignment: usize,
    /// Permit the thread cache.
    pub tcache: bool,
    /// Pin the allocation to a specific arena.
    pub arena: Option<u32>,
}

impl Default for AllocxFlags {
    fn default() -> Self {
        Self { zero: false, alignment: 0, tcache: true, arena: None }
    }
}

impl AllocxFlags {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The allocator handle. Clones share one instance.
#[derive(Clone)]
pub struct ShardAlloc {
    core: Arc<HeapCore>,
}

impl ShardAlloc {
    /// Create an allocator with the given configuration.
    pub fn new(config: AllocConfig) -> Self {
        Self { core: HeapCore::new(config) }
    }

    /// Create an allocator with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(AllocConfig::default())
    }

    /// Create an allocator configured from `SHARDALLOC_CONF`.
    pub fn from_env() -> Self {
        Self::new(AllocConfig::from_env())
    }

    // ---------------------------------------------------------------
    // malloc family
    // ---------------------------------------------------------------

    /// Allocate `size` writable bytes, QUANTUM-aligned. Null and
    /// `ENOMEM` on failure.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        if let Some(p) = self.fast_alloc(size) {
            self.core.alloc_hooks.fire_alloc(p.as_ptr(), size);
            return p.as_ptr();
        }
        self.entry::<MallocPolicy>(size, 0, false, true, None)
    }

    /// Allocate zeroed memory for `count` items of `item_size` bytes,
    /// overflow-checked.
    pub fn calloc(&self, count: usize, item_size: usize) -> *mut u8 {
        let Some(size) = count.checked_mul(item_size) else {
            set_errno(Errno(libc::ENOMEM));
            return ptr::null_mut();
        };
        self.entry::<CallocPolicy>(size, 0, false, true, None)
    }

    /// Allocate with explicit power-of-two alignment. `EINVAL` on a bad
    /// alignment, `ENOMEM` on exhaustion.
    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
        self.entry::<AlignedPolicy>(size, alignment, false, true, None)
    }

    /// `posix_memalign` shape: alignment must be a power-of-two multiple
    /// of the pointer size. Returns the errno value instead of setting
    /// it.
    pub fn posix_memalign(&self, out: &mut *mut u8, alignment: usize, size: usize) -> i32 {
        if !alignment.is_power_of_two()
            || alignment < PosixMemalignPolicy::MIN_ALIGNMENT
        {
            return libc::EINVAL;
        }
        let p = self.entry::<PosixMemalignPolicy>(size, alignment, false, true, None);
        if p.is_null() {
            libc::ENOMEM
        } else {
            *out = p;
            0
        }
    }

    /// `memalign` shape.
    pub fn memalign(&self, alignment: usize, size: usize) -> *mut u8 {
        self.entry::<AlignedPolicy>(size, alignment, false, true, None)
    }

    /// `valloc` shape: page-aligned allocation.
    pub fn valloc(&self, size: usize) -> *mut u8 {
        self.entry::<AlignedPolicy>(size, PAGE, false, true, None)
    }

    /// Extended allocation with explicit flags (`mallocx` shape).
    pub fn allocx(&self, size: usize, flags: AllocxFlags) -> *mut u8 {
        if flags.alignment != 0 && !flags.alignment.is_power_of_two() {
            if MallocxPolicy::SET_ERRNO {
                set_errno(Errno(libc::EINVAL));
            }
            return ptr::null_mut();
        }
        self.entry::<MallocxPolicy>(size, flags.alignment, flags.zero, flags.tcache, flags.arena)
    }

    /// Extended allocation returning the usable size (`smallocx` shape).
    pub fn try_allocx(
        &self,
        size: usize,
        flags: AllocxFlags,
    ) -> Result<(NonNull<u8>, usize), AllocError> {
        if flags.alignment != 0 && !flags.alignment.is_power_of_two() {
            return Err(AllocError::InvalidArgument);
        }
        let size = if size == 0 { 1 } else { size };
        let (ind, usable) = self.resolve_class(size, flags.alignment)?;
        let p = self.dispatch_alloc(ind, usable, flags.alignment, flags.zero, flags.tcache,
            flags.arena)?;
        self.core.alloc_hooks.fire_alloc(p.as_ptr(), size);
        Ok((p, usable))
    }

    /// Release an allocation. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must have come from this allocator and not be freed twice.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.core.alloc_hooks.fire_dalloc(ptr);
        self.dalloc(ptr, None);
    }

    /// Release with the caller-known size (`sdallocx` shape). `size`
    /// must match the original request; misuse is undefined.
    ///
    /// # Safety
    /// As for [`Self::free`], plus the size contract.
    pub unsafe fn sized_free(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        self.core.alloc_hooks.fire_dalloc(ptr);
        self.dalloc(ptr, Some(size));
    }

    /// Resize an allocation, preferring in-place growth.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            return match self.core.config().zero_realloc {
                crate::api::config::ZeroRealloc::Free => {
                    self.free(ptr);
                    ptr::null_mut()
                }
                crate::api::config::ZeroRealloc::Alloc => self.realloc(ptr, 1),
            };
        }

        let old_usable = self.usable_size(ptr);
        if old_usable == 0 {
            safety::fail("realloc of unmanaged pointer");
        }
        let classes = self.core.classes();
        let new_ind = classes.index_of(size);
        if new_ind >= classes.nsizes() {
            set_errno(Errno(libc::ENOMEM));
            return ptr::null_mut();
        }
        let old_ind = classes.index_of(old_usable);

        // Same class: the region already fits.
        if new_ind == old_ind {
            return ptr;
        }

        // Large-to-large: try to move the boundary instead of the bytes.
        if !classes.is_binned(new_ind) && !classes.is_binned(old_ind) {
            if self.try_resize_large(ptr, new_ind) {
                let new_usable = classes.size_of(new_ind);
                self.core.alloc_hooks.fire_expand(ptr, old_usable, new_usable);
                return ptr;
            }
        }

        // Allocate-copy-free.
        let p = self.entry::<MallocPolicy>(size, 0, false, true, None);
        if p.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, p, old_usable.min(size));
        self.dalloc(ptr, None);
        p
    }

    /// Usable size of `ptr`, or 0 for pointers this allocator does not
    /// manage.
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        self.pointer_info(ptr).usable_size()
    }

    /// Usable size of `ptr`, distinguishing foreign pointers as an
    /// error.
    pub fn try_usable_size(&self, ptr: *const u8) -> Result<usize, AllocError> {
        match self.pointer_info(ptr) {
            PointerInfo::Unmanaged => Err(AllocError::UnmanagedPointer),
            info => Ok(info.usable_size()),
        }
    }

    /// Introspect an arbitrary pointer.
    pub fn pointer_info(&self, ptr: *const u8) -> PointerInfo {
        let addr = ptr as usize;
        if addr == 0 {
            return PointerInfo::Unmanaged;
        }
        tsd::with_tsd(&self.core, |ts| self.core.pointer_info(&mut ts.rtree_cache, addr))
            .unwrap_or_else(|| {
                let mut cache = crate::extent::rtree::RtreeCache::default();
                self.core.pointer_info(&mut cache, addr)
            })
    }

    // ---------------------------------------------------------------
    // Fast path
    // ---------------------------------------------------------------

    /// The allocation fast path: thread cache pop plus one threshold
    /// comparison. Fills and fancy request shapes fall through to the
    /// slow path.
    #[inline]
    fn fast_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > LOOKUP_MAXCLASS {
            return None;
        }
        let cfg = self.core.config();
        if cfg.zero || cfg.junk.on_alloc() {
            return None;
        }
        if tsd::reentrancy_level() != 0 {
            return None;
        }
        tsd::with_tsd(&self.core, |ts| {
            let (ind, usable) = self.core.classes().index_usize_fastpath(size);
            if !ts.events.fast_check(usable) {
                return None;
            }
            if !ts.tcache_enabled {
                return None;
            }
            let tc = ts.tcache.as_mut()?;
            if !tc.covers(ind) {
                return None;
            }
            let p = tc.alloc(ind)?;
            ts.events.advance_alloc_fast(usable);
            NonNull::new(p)
        })
        .flatten()
    }

    // ---------------------------------------------------------------
    // Shared slow path
    // ---------------------------------------------------------------

    /// The one slow path body behind every entry point.
    fn entry<P: EntryPolicy>(
        &self,
        size: usize,
        alignment: usize,
        zero_flag: bool,
        tcache_ok: bool,
        arena: Option<u32>,
    ) -> *mut u8 {
        let result = self.entry_inner::<P>(size, alignment, zero_flag, tcache_ok, arena);
        // No lock survives an entry-layer call at nominal reentrancy.
        crate::sync::witness::assert_none_held();
        match result {
            Ok(p) => {
                self.core.alloc_hooks.fire_alloc(p.as_ptr(), size);
                p.as_ptr()
            }
            Err(err) => {
                if err == AllocError::OutOfMemory && self.core.config().xmalloc {
                    log::error!("allocation of {} bytes failed with xmalloc set", size);
                    std::process::abort();
                }
                if P::SET_ERRNO {
                    let code = match err {
                        AllocError::InvalidArgument => libc::EINVAL,
                        _ => libc::ENOMEM,
                    };
                    set_errno(Errno(code));
                }
                ptr::null_mut()
            }
        }
    }

    fn entry_inner<P: EntryPolicy>(
        &self,
        size: usize,
        alignment: usize,
        zero_flag: bool,
        tcache_ok: bool,
        arena: Option<u32>,
    ) -> Result<NonNull<u8>, AllocError> {
        if P::MIN_ALIGNMENT != 0 {
            if !alignment.is_power_of_two() || alignment < P::MIN_ALIGNMENT {
                return Err(AllocError::InvalidArgument);
            }
        }
        let size = if size == 0 {
            if !P::BUMP_EMPTY {
                return Err(AllocError::InvalidArgument);
            }
            1
        } else {
            size
        };
        let (ind, usable) = self.resolve_class(size, alignment)?;
        let zero = P::ZERO || zero_flag;
        self.dispatch_alloc(ind, usable, alignment, zero, tcache_ok, arena)
    }

    /// Map a (size, alignment) request to its class index and usable
    /// size. Alignment 0 means the natural QUANTUM guarantee.
    fn resolve_class(&self, size: usize, alignment: usize) -> Result<(usize, usize), AllocError> {
        let classes = self.core.classes();
        let usable = if alignment <= 1 {
            classes.round_up(size)
        } else {
            classes.aligned_usable(size, alignment)
        };
        if usable == 0 {
            return Err(AllocError::OutOfMemory);
        }
        Ok((classes.index_of(usable), usable))
    }

    /// Route an allocation to the right engine, honoring reentrancy and
    /// the tcache bypass conditions.
    fn dispatch_alloc(
        &self,
        ind: usize,
        usable: usize,
        alignment: usize,
        zero: bool,
        tcache_ok: bool,
        arena: Option<u32>,
    ) -> Result<NonNull<u8>, AllocError> {
        let zero = zero || self.core.config().zero;
        if tsd::reentrancy_level() != 0 {
            return self.alloc_bypass(ind, usable, alignment, zero, arena);
        }
        tsd::with_tsd(&self.core, |ts| {
            self.alloc_with_state(ts, ind, usable, alignment, zero, tcache_ok, arena)
        })
        .unwrap_or_else(|| self.alloc_bypass(ind, usable, alignment, zero, arena))
    }

    fn alloc_with_state(
        &self,
        ts: &mut ThreadState,
        ind: usize,
        usable: usize,
        alignment: usize,
        zero: bool,
        tcache_ok: bool,
        arena_override: Option<u32>,
    ) -> Result<NonNull<u8>, AllocError> {
        let core = &self.core;
        let classes = core.classes();
        let small = classes.is_binned(ind);

        let arena = match arena_override {
            Some(ind) => core.arena_or_init(ind).ok_or(AllocError::InvalidArgument)?,
            None if usable > core.config().oversize_threshold => core.huge(),
            None => {
                let aind = ts.arena_ind();
                core.arena(aind).unwrap_or_else(|| core.arena0())
            }
        };

        // Pinned-arena requests bypass the cache: cached pointers may
        // have been filled from any arena.
        let may_cache = tcache_ok
            && ts.tcache_enabled
            && arena_override.is_none()
            && (small || alignment <= PAGE);

        // `pool_zeroed` marks memory the extent layer already zeroed;
        // slab regions and tcache-served pointers are finished below.
        let (p, pool_zeroed) = if small {
            let shard = ts.shard_seed;
            let tcache = if may_cache {
                ts.tcache.as_mut().filter(|tc| tc.covers(ind))
            } else {
                None
            };
            let p = match tcache {
                Some(tc) => match tc.alloc(ind) {
                    Some(p) => p,
                    None => {
                        // Batched refill from the bin shard.
                        let want = tc.fill_count(ind);
                        let mut batch = Vec::with_capacity(want);
                        let ctx = core.extent_ctx(&arena);
                        arena.fill_small(&ctx, classes, ind, shard, &mut batch, want);
                        tc.fill(ind, batch).ok_or(AllocError::OutOfMemory)?
                    }
                },
                None => {
                    let ctx = core.extent_ctx(&arena);
                    arena.alloc_small_one(&ctx, classes, ind, shard)?
                }
            };
            (p, false)
        } else {
            // Large classes refill one at a time: a cached pointer is
            // reused, a miss goes straight to the extent layer.
            let cached = if may_cache {
                ts.tcache.as_mut().filter(|tc| tc.covers(ind)).and_then(|tc| tc.alloc(ind))
            } else {
                None
            };
            match cached {
                Some(p) => (p, false),
                None => {
                    let ctx = core.extent_ctx(&arena);
                    (arena.alloc_large(&ctx, classes, ind, alignment, zero)?, zero)
                }
            }
        };

        if zero {
            if !pool_zeroed {
                // SAFETY: p spans `usable` writable bytes.
                unsafe { ptr::write_bytes(p, 0, usable) };
            }
        } else if core.config().junk.on_alloc() {
            // SAFETY: as above.
            unsafe { junk::fill_alloc(p, usable) };
        }

        let triggered = ts.events.advance_alloc(usable, core.event_intervals());
        if triggered.any() {
            self.handle_events(ts, triggered);
        }
        NonNull::new(p).ok_or(AllocError::OutOfMemory)
    }

    /// The tcache-free path for reentrant callouts and reincarnated
    /// threads: arena 0 (or the pinned arena), no events.
    fn alloc_bypass(
        &self,
        ind: usize,
        usable: usize,
        alignment: usize,
        zero: bool,
        arena_override: Option<u32>,
    ) -> Result<NonNull<u8>, AllocError> {
        let core = &self.core;
        let classes = core.classes();
        let arena = match arena_override {
            Some(ind) => core.arena_or_init(ind).ok_or(AllocError::InvalidArgument)?,
            None => core.arena0(),
        };
        let ctx = core.extent_ctx(&arena);
        let p = if classes.is_binned(ind) {
            let p = arena.alloc_small_one(&ctx, classes, ind, 0)?;
            if zero {
                // SAFETY: p spans `usable` writable bytes.
                unsafe { ptr::write_bytes(p, 0, usable) };
            } else if core.config().junk.on_alloc() {
                // SAFETY: as above.
                unsafe { junk::fill_alloc(p, usable) };
            }
            p
        } else {
            let p = arena.alloc_large(&ctx, classes, ind, alignment, zero)?;
            if !zero && core.config().junk.on_alloc() {
                // SAFETY: as above.
                unsafe { junk::fill_alloc(p, usable) };
            }
            p
        };
        NonNull::new(p).ok_or(AllocError::OutOfMemory)
    }

    // ---------------------------------------------------------------
    // Deallocation
    // ---------------------------------------------------------------

    unsafe fn dalloc(&self, ptr: *mut u8, expected_size: Option<usize>) {
        if tsd::reentrancy_level() != 0 {
            self.dalloc_bypass(ptr);
            return;
        }
        let handled = tsd::with_tsd(&self.core, |ts| {
            self.dalloc_with_state(ts, ptr, expected_size);
        });
        if handled.is_none() {
            self.dalloc_bypass(ptr);
        }
        crate::sync::witness::assert_none_held();
    }

    fn dalloc_with_state(
        &self,
        ts: &mut ThreadState,
        ptr: *mut u8,
        expected_size: Option<usize>,
    ) {
        let core = &self.core;
        let Some(v) = core.rtree().lookup(&mut ts.rtree_cache, ptr as usize) else {
            safety::fail("free of a pointer not managed by this allocator");
        };
        if v.state != ExtentState::Active || v.szind == CACHED_SZIND {
            safety::fail("free of an inactive extent (double free?)");
        }
        let ind = v.szind as usize;
        let usable = core.classes().size_of(ind);
        if let Some(size) = expected_size {
            debug_assert_eq!(
                core.classes().round_up(size.max(1)),
                usable,
                "sized_free size does not match the allocation"
            );
        }
        if core.config().junk.on_free() {
            // SAFETY: the region is live and spans `usable` bytes.
            unsafe { junk::fill_free(ptr, usable) };
        }

        let cached = if ts.tcache_enabled {
            match ts.tcache.as_mut().filter(|tc| tc.covers(ind)) {
                Some(tc) => {
                    let overflow = tc.dalloc(ind, ptr);
                    if let Some(batch) = overflow {
                        core.flush_batch(&mut ts.rtree_cache, batch);
                    }
                    true
                }
                None => false,
            }
        } else {
            false
        };
        if !cached {
            self.dalloc_direct(v.index, v.slab, ind, ptr);
        }

        let triggered = ts.events.advance_dalloc(usable);
        if triggered.any() {
            self.handle_events(ts, triggered);
        }
    }

    fn dalloc_direct(&self, index: u32, slab: bool, ind: usize, ptr: *mut u8) {
        let core = &self.core;
        let e = core.registry().get(index);
        let Some(arena) = core.arena(e.arena()) else {
            safety::fail("free into a destroyed arena");
        };
        let ctx = core.extent_ctx(&arena);
        if slab {
            if arena.flush_small(&ctx, core.classes(), ind, &[(index, ptr)]).is_err() {
                safety::fail("double free detected");
            }
        } else {
            arena.dalloc_large(&ctx, index);
        }
    }

    fn dalloc_bypass(&self, ptr: *mut u8) {
        let core = &self.core;
        let Some(v) = core.rtree().lookup_uncached(ptr as usize) else {
            safety::fail("free of a pointer not managed by this allocator");
        };
        if v.state != ExtentState::Active || v.szind == CACHED_SZIND {
            safety::fail("free of an inactive extent (double free?)");
        }
        self.dalloc_direct(v.index, v.slab, v.szind as usize, ptr);
    }

    // ---------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------

    fn handle_events(&self, ts: &mut ThreadState, triggered: Triggered) {
        let core = &self.core;
        if triggered.tcache_gc {
            if let Some(tc) = ts.tcache.as_mut() {
                if let Some(batch) = tc.gc_step() {
                    core.flush_batch(&mut ts.rtree_cache, batch);
                }
            }
        }
        if triggered.decay {
            if let Some(aind) = ts.arena_ind {
                if let Some(arena) = core.arena(aind) {
                    let ctx = core.extent_ctx(&arena);
                    arena.decay_tick(&ctx);
                }
            }
        }
        if triggered.sample {
            core.run_sample_hook(ts.events.allocated());
        }
        if triggered.stats {
            core.run_stats_hook(ts.events.allocated());
        }
    }

    // ---------------------------------------------------------------
    // Large realloc plumbing
    // ---------------------------------------------------------------

    fn try_resize_large(&self, ptr: *mut u8, new_ind: usize) -> bool {
        let core = &self.core;
        let Some(v) = core.rtree().lookup_uncached(ptr as usize) else {
            return false;
        };
        if v.slab || v.state != ExtentState::Active {
            return false;
        }
        let e = core.registry().get(v.index);
        let Some(arena) = core.arena(e.arena()) else {
            return false;
        };
        let ctx = core.extent_ctx(&arena);
        arena.resize_large(&ctx, core.classes(), v.index, new_ind)
    }

    // ---------------------------------------------------------------
    // Thread and arena control
    // ---------------------------------------------------------------

    /// Enable or disable this thread's cache; disabling flushes it.
    pub fn thread_tcache_enable(&self, enabled: bool) {
        tsd::with_tsd(&self.core, |ts| ts.set_tcache_enabled(enabled));
    }

    /// Flush this thread's cache back to the arenas.
    pub fn thread_tcache_flush(&self) {
        tsd::with_tsd(&self.core, |ts| ts.flush_tcache());
    }

    /// This thread's lifetime (allocated, deallocated) byte counters.
    pub fn thread_allocated(&self) -> (u64, u64) {
        tsd::with_tsd(&self.core, |ts| (ts.events.allocated(), ts.events.deallocated()))
            .unwrap_or((0, 0))
    }

    /// High-water mark of this thread's live bytes.
    pub fn thread_peak(&self) -> u64 {
        tsd::with_tsd(&self.core, |ts| ts.events.peak()).unwrap_or(0)
    }

    pub fn thread_peak_reset(&self) {
        tsd::with_tsd(&self.core, |ts| ts.events.reset_peak());
    }

    /// Bind this thread to a specific arena; `None` restores automatic
    /// binding on next use.
    pub fn bind_to_arena(&self, arena: Option<u32>) -> Result<(), AllocError> {
        if let Some(ind) = arena {
            if self.core.arena_or_init(ind).is_none() {
                return Err(AllocError::InvalidArgument);
            }
        }
        tsd::with_tsd(&self.core, |ts| {
            if let Some(old) = ts.arena_ind.take() {
                if let Some(a) = self.core.arena(old) {
                    a.unbind(crate::arena::ThreadKind::App);
                }
            }
            if let Some(ind) = arena {
                if let Some(a) = self.core.arena(ind) {
                    a.bind(crate::arena::ThreadKind::App);
                    ts.arena_ind = Some(ind);
                }
            }
        })
        .ok_or(AllocError::InvalidArgument)
    }

    /// Create an explicit arena and return its index.
    pub fn create_arena(&self) -> Result<u32, AllocError> {
        self.core.create_arena()
    }

    /// Destroy an explicit arena; its index is recycled.
    pub fn destroy_arena(&self, ind: u32) -> Result<(), AllocError> {
        self.core.destroy_arena(ind)
    }

    /// Discard an arena's bound state. Callers must guarantee nothing
    /// allocated from it is still live.
    pub fn reset_arena(&self, ind: u32) -> Result<(), AllocError> {
        self.core.reset_arena(ind)
    }

    /// Advance an arena's decay clock (`all = false`) or purge its
    /// caches outright (`all = true`).
    pub fn decay_arena(&self, ind: u32, all: bool) -> Result<(), AllocError> {
        self.core.decay_arena(ind, all)
    }

    /// The index of the dedicated oversize arena.
    pub fn huge_arena(&self) -> u32 {
        self.core.huge_arena_ind()
    }

    /// Install a page-hook table on one arena, returning the previous
    /// table. The hooks run under the reentrancy guard, so allocation
    /// from inside a hook bypasses the thread cache instead of
    /// recursing.
    pub fn set_arena_hooks(
        &self,
        ind: u32,
        hooks: Arc<dyn crate::extent::hooks::PageHooks>,
    ) -> Result<Arc<dyn crate::extent::hooks::PageHooks>, AllocError> {
        let arena = self.core.arena_or_init(ind).ok_or(AllocError::InvalidArgument)?;
        Ok(arena.set_hooks(hooks))
    }

    // ---------------------------------------------------------------
    // Hooks and stats
    // ---------------------------------------------------------------

    /// Install allocation hooks. Fails when the table is full.
    pub fn install_hooks(&self, hooks: AllocHooks) -> Option<HookHandle> {
        self.core.alloc_hooks.install(hooks)
    }

    pub fn remove_hooks(&self, handle: HookHandle) {
        self.core.alloc_hooks.remove(handle);
    }

    /// Install the external sampling hook, fired every `interval`
    /// allocated bytes per thread.
    pub fn set_sample_hook(&self, interval: u64, hook: Option<EventHook>) {
        self.core.set_sample_hook(interval, hook);
    }

    /// Install the stats-interval hook.
    pub fn set_stats_hook(&self, interval: u64, hook: Option<EventHook>) {
        self.core.set_stats_hook(interval, hook);
    }

    /// Aggregate statistics across all arenas.
    pub fn stats(&self) -> HeapStats {
        self.core.stats()
    }

    /// Statistics for one arena.
    pub fn arena_stats(&self, ind: u32) -> Option<ArenaStats> {
        let arena = self.core.arena(ind)?;
        Some(self.core.arena_stats(&arena))
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &AllocConfig {
        self.core.config()
    }
}
