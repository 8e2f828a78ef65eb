//! Per-arena extent caches: dirty, muzzy, retained.
//!
//! Allocation searches the shelves in that order, splitting a best-fit
//! candidate and returning the remainder to the shelf it came from; on a
//! complete miss the arena grows by a geometrically expanding step.
//! Deallocation lands extents in the dirty shelf, coalesces them with
//! their neighbours, and lets the decay clocks demote the excess
//! (dirty -> muzzy -> retained -> unmapped).
//!
//! Lock discipline: each shelf has its own mutex; page hooks that can
//! block (reserve/commit/purge/release) are only called with no shelf
//! lock held. The split/merge hooks are address-space bookkeeping and are
//! consulted under a shelf lock; implementations must not block.

use std::collections::BTreeMap;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::api::config::AllocConfig;
use crate::arena::decay::DecayState;
use crate::core::classes::{LG_PAGE, PAGE};
use crate::error::AllocError;
use crate::extent::base::Base;
use crate::extent::hooks::PageHooks;
use crate::extent::rtree::{RadixTree, RtreeValue};
use crate::extent::{ExtentRegistry, ExtentState};
use crate::sync::{ForkGuard, ForkMutex, Rank};
use crate::util::layout::align_up;

/// szind stored in radix cells for extents sitting in a cache.
pub const CACHED_SZIND: u32 = 255;

/// First growth step, in pages.
const GROW_FIRST_PAGES: usize = 64;

/// Shared machinery a pool operation needs, captured once per call chain.
/// `hooks` is the owning arena's current hook table, cloned with no locks
/// held.
pub struct ExtentCtx<'a> {
    pub registry: &'a ExtentRegistry,
    pub rtree: &'a RadixTree,
    pub base: &'a Base,
    pub hooks: Arc<dyn PageHooks>,
    /// Milliseconds on the allocator clock, for the decay schedule.
    pub now_ms: u64,
}

/// Which purgeable cache an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Dirty,
    Muzzy,
    Retained,
}

impl CacheKind {
    fn state(self) -> ExtentState {
        match self {
            CacheKind::Dirty => ExtentState::Dirty,
            CacheKind::Muzzy => ExtentState::Muzzy,
            CacheKind::Retained => ExtentState::Retained,
        }
    }
}

struct ShelfState {
    /// Best-fit index: smallest fitting run first, lowest address within
    /// a size.
    by_size: BTreeMap<(usize, usize), u32>,
    npages: usize,
    decay: DecayState,
}

impl ShelfState {
    fn new() -> Self {
        Self { by_size: BTreeMap::new(), npages: 0, decay: DecayState::new() }
    }
}

/// The extent caches and growth state of one arena.
pub struct ExtentPool {
    arena_ind: u32,
    dirty: ForkMutex<ShelfState>,
    muzzy: ForkMutex<ShelfState>,
    retained: ForkMutex<ShelfState>,
    dirty_decay_ms: AtomicI64,
    muzzy_decay_ms: AtomicI64,
    retain: bool,
    retain_grow_limit_pages: usize,
    grow_next_pages: AtomicUsize,
    mapped: AtomicUsize,
    dirty_pages: AtomicUsize,
    muzzy_pages: AtomicUsize,
    retained_pages: AtomicUsize,
    npurges_lazy: AtomicU64,
    npurges_forced: AtomicU64,
}

impl ExtentPool {
    pub fn new(arena_ind: u32, cfg: &AllocConfig) -> Self {
        Self {
            arena_ind,
            dirty: ForkMutex::new(Rank::ExtentShelf, ShelfState::new()),
            muzzy: ForkMutex::new(Rank::ExtentShelf, ShelfState::new()),
            retained: ForkMutex::new(Rank::ExtentShelf, ShelfState::new()),
            dirty_decay_ms: AtomicI64::new(cfg.dirty_decay_ms),
            muzzy_decay_ms: AtomicI64::new(cfg.muzzy_decay_ms),
            retain: cfg.retain,
            retain_grow_limit_pages: (cfg.retain_grow_limit >> LG_PAGE).max(1),
            grow_next_pages: AtomicUsize::new(GROW_FIRST_PAGES),
            mapped: AtomicUsize::new(0),
            dirty_pages: AtomicUsize::new(0),
            muzzy_pages: AtomicUsize::new(0),
            retained_pages: AtomicUsize::new(0),
            npurges_lazy: AtomicU64::new(0),
            npurges_forced: AtomicU64::new(0),
        }
    }

    fn shelf(&self, kind: CacheKind) -> &ForkMutex<ShelfState> {
        match kind {
            CacheKind::Dirty => &self.dirty,
            CacheKind::Muzzy => &self.muzzy,
            CacheKind::Retained => &self.retained,
        }
    }

    fn pages_counter(&self, kind: CacheKind) -> &AtomicUsize {
        match kind {
            CacheKind::Dirty => &self.dirty_pages,
            CacheKind::Muzzy => &self.muzzy_pages,
            CacheKind::Retained => &self.retained_pages,
        }
    }

    fn cached_value(&self, idx: u32, state: ExtentState) -> RtreeValue {
        RtreeValue { index: idx, szind: CACHED_SZIND, slab: false, state }
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    /// Take `npages` pages aligned to `align_pages` pages. The returned
    /// extent is Active and committed; its radix cells are clear, ready
    /// for the caller to register with the final size class.
    pub fn alloc(
        &self,
        ctx: &ExtentCtx,
        npages: usize,
        align_pages: usize,
        zero: bool,
    ) -> Result<u32, AllocError> {
        debug_assert!(npages > 0);
        let idx = match self.take_cached(ctx, npages, align_pages) {
            Some(idx) => idx,
            None => self.grow(ctx, npages, align_pages)?,
        };

        let e = ctx.registry.get(idx);
        debug_assert_eq!(e.state(), ExtentState::Active);
        debug_assert_eq!(e.npages(), npages);
        if !e.committed() {
            if !ctx.hooks.commit(e.base() as *mut u8, 0, e.size()) {
                log::warn!("commit of {} pages failed", npages);
                self.shelve_retained(ctx, idx);
                return Err(AllocError::OutOfMemory);
            }
            e.set_committed(true);
            // A fresh commit of anonymous pages reads as zero.
            e.set_zeroed(true);
        }
        if zero && !e.zeroed() {
            // SAFETY: the extent is committed and exclusively ours.
            unsafe { ptr::write_bytes(e.base() as *mut u8, 0, e.size()) };
        }
        e.set_zeroed(false);
        Ok(idx)
    }

    fn take_cached(&self, ctx: &ExtentCtx, npages: usize, align_pages: usize) -> Option<u32> {
        for kind in [CacheKind::Dirty, CacheKind::Muzzy, CacheKind::Retained] {
            if let Some(idx) = self.take_from(ctx, kind, npages, align_pages) {
                return Some(idx);
            }
        }
        None
    }

    fn take_from(
        &self,
        ctx: &ExtentCtx,
        kind: CacheKind,
        npages: usize,
        align_pages: usize,
    ) -> Option<u32> {
        let align_bytes = (align_pages << LG_PAGE).max(PAGE);
        let need_bytes = npages << LG_PAGE;
        let mut shelf = self.shelf(kind).lock();

        // Best fit: smallest run that fits, lowest address within a size.
        let mut found = None;
        for (&(cand_pages, cand_base), &cand_idx) in shelf.by_size.range((npages, 0usize)..) {
            let aligned = align_up(cand_base, align_bytes);
            if aligned + need_bytes <= cand_base + (cand_pages << LG_PAGE) {
                found = Some(((cand_pages, cand_base), cand_idx));
                break;
            }
        }
        let ((cand_pages, cand_base), idx) = found?;
        shelf.by_size.remove(&(cand_pages, cand_base));
        shelf.npages -= cand_pages;
        let remaining = shelf.npages;
        shelf.decay.note_shrink(remaining);
        self.pages_counter(kind).fetch_sub(cand_pages, Ordering::Relaxed);

        let e = ctx.registry.get(idx);
        ctx.rtree.deregister(e.base(), e.size(), false);

        match self.trim(ctx, &mut shelf, kind, idx, align_bytes, need_bytes) {
            Some(idx) => {
                ctx.registry.get(idx).set_state(ExtentState::Active);
                Some(idx)
            }
            // Split was forbidden; trim already re-shelved the pieces.
            None => None,
        }
    }

    /// Trim `idx` down to `need_bytes` at `align_bytes`, returning lead
    /// and trail remainders to the shelf the candidate came from.
    fn trim(
        &self,
        ctx: &ExtentCtx,
        shelf: &mut ForkGuard<'_, ShelfState>,
        kind: CacheKind,
        idx: u32,
        align_bytes: usize,
        need_bytes: usize,
    ) -> Option<u32> {
        let mut idx = idx;
        let e = ctx.registry.get(idx);
        let lead = align_up(e.base(), align_bytes) - e.base();
        if lead > 0 {
            match self.split(ctx, idx, lead) {
                Some(tail) => {
                    self.shelve_locked(ctx, shelf, kind, idx);
                    idx = tail;
                }
                None => {
                    self.shelve_locked(ctx, shelf, kind, idx);
                    return None;
                }
            }
        }
        let e = ctx.registry.get(idx);
        let trail = e.size() - need_bytes;
        if trail > 0 {
            match self.split(ctx, idx, need_bytes) {
                Some(tail) => self.shelve_locked(ctx, shelf, kind, tail),
                None => {
                    self.shelve_locked(ctx, shelf, kind, idx);
                    return None;
                }
            }
        }
        Some(idx)
    }

    /// Split `head_bytes` off the front of `idx`. The original record
    /// keeps the head; the returned record owns the tail. Radix cells are
    /// the caller's responsibility.
    fn split(&self, ctx: &ExtentCtx, idx: u32, head_bytes: usize) -> Option<u32> {
        let e = ctx.registry.get(idx);
        let (addr, size) = (e.base(), e.size());
        debug_assert!(head_bytes > 0 && head_bytes < size);
        if !ctx.hooks.split(
            addr as *mut u8,
            size,
            head_bytes,
            size - head_bytes,
            e.committed(),
        ) {
            return None;
        }
        let tail_idx = ctx.registry.create(ctx.base).ok()?;
        let t = ctx.registry.get(tail_idx);
        t.set_base(addr + head_bytes);
        t.set_size(size - head_bytes);
        t.set_arena(self.arena_ind);
        t.set_state(e.state());
        t.set_committed(e.committed());
        t.set_zeroed(e.zeroed());
        t.set_szind(CACHED_SZIND as usize);
        e.set_size(head_bytes);
        Some(tail_idx)
    }

    fn grow(
        &self,
        ctx: &ExtentCtx,
        npages: usize,
        align_pages: usize,
    ) -> Result<u32, AllocError> {
        let align_bytes = (align_pages << LG_PAGE).max(PAGE);
        // Geometric growth amortizes the map/index cost; without
        // retention there is nowhere to keep the surplus.
        let mut want = if self.retain {
            self.grow_next_pages
                .load(Ordering::Relaxed)
                .clamp(npages, self.retain_grow_limit_pages.max(npages))
        } else {
            npages
        };

        loop {
            let len = want << LG_PAGE;
            if let Some(r) = ctx.hooks.reserve(ptr::null_mut(), len, align_bytes, false) {
                let addr = r.addr as usize;
                if let Err(err) = ctx.rtree.ensure_mapped(ctx.base, addr, len) {
                    ctx.hooks.release(r.addr, len);
                    return Err(err);
                }
                let idx = match ctx.registry.create(ctx.base) {
                    Ok(idx) => idx,
                    Err(err) => {
                        ctx.hooks.release(r.addr, len);
                        return Err(err);
                    }
                };
                self.mapped.fetch_add(len, Ordering::Relaxed);
                if self.retain {
                    self.grow_next_pages.store(
                        (want * 2).min(self.retain_grow_limit_pages),
                        Ordering::Relaxed,
                    );
                }
                log::debug!("arena {} grew by {} pages", self.arena_ind, want);

                let e = ctx.registry.get(idx);
                e.set_base(addr);
                e.set_size(len);
                e.set_arena(self.arena_ind);
                e.set_state(ExtentState::Active);
                e.set_committed(r.committed);
                e.set_zeroed(r.zeroed);
                e.set_szind(CACHED_SZIND as usize);

                if want > npages {
                    if let Some(tail) = self.split(ctx, idx, npages << LG_PAGE) {
                        self.shelve_retained(ctx, tail);
                    } else {
                        // Split forbidden: fall back to an exact mapping.
                        ctx.hooks.release(r.addr, len);
                        self.mapped.fetch_sub(len, Ordering::Relaxed);
                        ctx.registry.recycle(idx);
                        want = npages;
                        continue;
                    }
                }
                return Ok(idx);
            }
            if want == npages {
                return Err(AllocError::OutOfMemory);
            }
            want = npages.max(want / 2);
        }
    }

    // ---------------------------------------------------------------
    // Deallocation and decay
    // ---------------------------------------------------------------

    /// Return an Active extent to the dirty cache, coalescing with dirty
    /// neighbours and consulting the decay clock.
    pub fn dealloc(&self, ctx: &ExtentCtx, idx: u32) {
        let e = ctx.registry.get(idx);
        debug_assert_eq!(e.state(), ExtentState::Active);
        ctx.rtree.deregister(e.base(), e.size(), e.is_slab());
        e.set_slab(false);
        e.set_szind(CACHED_SZIND as usize);
        e.set_zeroed(false);

        {
            let mut shelf = self.dirty.lock();
            self.shelve_locked(ctx, &mut shelf, CacheKind::Dirty, idx);
            self.coalesce_locked(ctx, &mut shelf, CacheKind::Dirty, idx);
        }
        self.maybe_decay(ctx, CacheKind::Dirty, false);
    }

    /// Advance the decay clocks; called from the thread-event engine.
    pub fn decay_tick(&self, ctx: &ExtentCtx) {
        self.maybe_decay(ctx, CacheKind::Dirty, false);
        self.maybe_decay(ctx, CacheKind::Muzzy, false);
    }

    /// Purge the dirty cache now; with `all`, push muzzy pages out too.
    pub fn purge(&self, ctx: &ExtentCtx, all: bool) {
        self.maybe_decay(ctx, CacheKind::Dirty, true);
        if all {
            self.maybe_decay(ctx, CacheKind::Muzzy, true);
        }
    }

    fn maybe_decay(&self, ctx: &ExtentCtx, kind: CacheKind, force: bool) {
        debug_assert!(kind != CacheKind::Retained);
        let decay_ms = match kind {
            CacheKind::Dirty => self.dirty_decay_ms.load(Ordering::Relaxed),
            _ => self.muzzy_decay_ms.load(Ordering::Relaxed),
        };
        if decay_ms < 0 && !force {
            return;
        }

        let mut victims = Vec::new();
        {
            let mut shelf = self.shelf(kind).lock();
            let limit = if force { 0 } else { shelf.decay.limit(ctx.now_ms, decay_ms) };
            while shelf.npages > limit {
                let Some(&key) = shelf.by_size.keys().next_back() else { break };
                let idx = shelf.by_size.remove(&key).expect("shelf key vanished");
                shelf.npages -= key.0;
                self.pages_counter(kind).fetch_sub(key.0, Ordering::Relaxed);
                victims.push(idx);
            }
            let remaining = shelf.npages;
            shelf.decay.note_shrink(remaining);
        }
        if victims.is_empty() {
            return;
        }

        match kind {
            CacheKind::Dirty => {
                for idx in victims {
                    self.demote_dirty(ctx, idx);
                }
                // Eagerly purging dirty pages can overfill muzzy.
                self.maybe_decay(ctx, CacheKind::Muzzy, force);
            }
            _ => {
                for idx in victims {
                    self.demote_muzzy(ctx, idx);
                }
            }
        }
    }

    /// dirty -> muzzy: lazy purge, falling back to decommit.
    fn demote_dirty(&self, ctx: &ExtentCtx, idx: u32) {
        let e = ctx.registry.get(idx);
        let (addr, size) = (e.base() as *mut u8, e.size());
        if ctx.hooks.purge_lazy(addr, 0, size) {
            self.npurges_lazy.fetch_add(1, Ordering::Relaxed);
        } else if ctx.hooks.decommit(addr, 0, size) {
            e.set_committed(false);
        }
        e.set_zeroed(false);
        let mut shelf = self.muzzy.lock();
        self.shelve_locked(ctx, &mut shelf, CacheKind::Muzzy, idx);
        self.coalesce_locked(ctx, &mut shelf, CacheKind::Muzzy, idx);
    }

    /// muzzy -> retained: forced purge or decommit, then park the address
    /// space (or unmap it when retention is off or over its cap).
    fn demote_muzzy(&self, ctx: &ExtentCtx, idx: u32) {
        let e = ctx.registry.get(idx);
        let (addr, size) = (e.base() as *mut u8, e.size());
        if e.committed() {
            if ctx.hooks.purge_forced(addr, 0, size) {
                self.npurges_forced.fetch_add(1, Ordering::Relaxed);
                e.set_zeroed(true);
            } else if ctx.hooks.decommit(addr, 0, size) {
                e.set_committed(false);
            }
        }
        self.shelve_retained(ctx, idx);
    }

    /// Park an extent in the retained shelf, enforcing the retention cap.
    fn shelve_retained(&self, ctx: &ExtentCtx, idx: u32) {
        if !self.retain {
            self.release(ctx, idx);
            return;
        }
        let mut overflow = Vec::new();
        {
            let mut shelf = self.retained.lock();
            self.shelve_locked(ctx, &mut shelf, CacheKind::Retained, idx);
            self.coalesce_locked(ctx, &mut shelf, CacheKind::Retained, idx);
            while shelf.npages > self.retain_grow_limit_pages {
                let Some(&key) = shelf.by_size.keys().next_back() else { break };
                let idx = shelf.by_size.remove(&key).expect("shelf key vanished");
                shelf.npages -= key.0;
                self.pages_counter(CacheKind::Retained).fetch_sub(key.0, Ordering::Relaxed);
                overflow.push(idx);
            }
        }
        for idx in overflow {
            self.release(ctx, idx);
        }
    }

    /// Unmap an extent and retire its record. Clearing the radix cells is
    /// a no-op for extents that were never shelved.
    fn release(&self, ctx: &ExtentCtx, idx: u32) {
        let e = ctx.registry.get(idx);
        let (addr, size) = (e.base(), e.size());
        ctx.rtree.deregister(addr, size, false);
        ctx.hooks.release(addr as *mut u8, size);
        self.mapped.fetch_sub(size, Ordering::Relaxed);
        ctx.registry.recycle(idx);
    }

    /// Insert an extent into a shelf: sets its state, publishes its radix
    /// cells, and accounts it. Caller holds the shelf lock.
    fn shelve_locked(
        &self,
        ctx: &ExtentCtx,
        shelf: &mut ForkGuard<'_, ShelfState>,
        kind: CacheKind,
        idx: u32,
    ) {
        let e = ctx.registry.get(idx);
        let state = kind.state();
        e.set_state(state);
        ctx.rtree.register(e.base(), e.size(), self.cached_value(idx, state));
        let npages = e.npages();
        shelf.by_size.insert((npages, e.base()), idx);
        shelf.npages += npages;
        let total = shelf.npages;
        shelf.decay.note_grow(ctx.now_ms, total);
        self.pages_counter(kind).fetch_add(npages, Ordering::Relaxed);
    }

    /// Merge `idx` with both neighbours while they sit in the same shelf.
    /// Returns the surviving index.
    fn coalesce_locked(
        &self,
        ctx: &ExtentCtx,
        shelf: &mut ForkGuard<'_, ShelfState>,
        kind: CacheKind,
        idx: u32,
    ) -> u32 {
        let state = kind.state();
        let mut cur = idx;
        loop {
            let mut merged = false;

            // Forward neighbour: its first page sits one past our end.
            let end = ctx.registry.get(cur).end();
            if let Some(n) = ctx.rtree.lookup_uncached(end) {
                if !n.slab && n.state == state && n.index != cur {
                    merged |= self.merge_pair(ctx, shelf, kind, cur, n.index);
                }
            }

            // Backward neighbour: its last page ends at our base.
            let base = ctx.registry.get(cur).base();
            if base >= PAGE {
                if let Some(n) = ctx.rtree.lookup_uncached(base - 1) {
                    if !n.slab && n.state == state && n.index != cur {
                        if self.merge_pair(ctx, shelf, kind, n.index, cur) {
                            cur = n.index;
                            merged = true;
                        }
                    }
                }
            }

            if !merged {
                return cur;
            }
        }
    }

    /// Merge `right` into `left` (both in this shelf, `left.end ==
    /// right.base`). Returns false when the pair is not actually
    /// mergeable.
    fn merge_pair(
        &self,
        ctx: &ExtentCtx,
        shelf: &mut ForkGuard<'_, ShelfState>,
        kind: CacheKind,
        left: u32,
        right: u32,
    ) -> bool {
        let l = ctx.registry.get(left);
        let r = ctx.registry.get(right);
        if l.arena() != self.arena_ind || r.arena() != self.arena_ind {
            return false;
        }
        if l.end() != r.base() || l.committed() != r.committed() {
            return false;
        }
        // Both sides must be resident in this shelf; an extent mid-purge
        // keeps its state but has already left the map.
        if shelf.by_size.get(&(l.npages(), l.base())) != Some(&left)
            || shelf.by_size.get(&(r.npages(), r.base())) != Some(&right)
        {
            return false;
        }
        if !ctx.hooks.merge(
            l.base() as *mut u8,
            l.size(),
            r.base() as *mut u8,
            r.size(),
            l.committed(),
        ) {
            return false;
        }

        shelf.by_size.remove(&(l.npages(), l.base()));
        shelf.by_size.remove(&(r.npages(), r.base()));
        ctx.rtree.deregister(l.base(), l.size(), false);
        ctx.rtree.deregister(r.base(), r.size(), false);

        l.set_size(l.size() + r.size());
        l.set_zeroed(l.zeroed() && r.zeroed());
        ctx.registry.recycle(right);

        ctx.rtree.register(l.base(), l.size(), self.cached_value(left, kind.state()));
        shelf.by_size.insert((l.npages(), l.base()), left);
        true
    }

    // ---------------------------------------------------------------
    // In-place resizing for the large path
    // ---------------------------------------------------------------

    /// Try to grow an Active extent in place by `extra_pages`, consuming
    /// a cached forward neighbour. On success the extent is re-registered
    /// with `szind`.
    pub fn try_extend(&self, ctx: &ExtentCtx, idx: u32, extra_pages: usize, szind: u32) -> bool {
        let e = ctx.registry.get(idx);
        let target = e.end();
        for kind in [CacheKind::Dirty, CacheKind::Muzzy, CacheKind::Retained] {
            let neighbour = {
                let mut shelf = self.shelf(kind).lock();
                let Some(n) = ctx.rtree.lookup_uncached(target) else { continue };
                if n.slab || n.state != kind.state() {
                    continue;
                }
                let nrec = ctx.registry.get(n.index);
                if nrec.base() != target
                    || nrec.arena() != self.arena_ind
                    || nrec.npages() < extra_pages
                {
                    continue;
                }
                if shelf.by_size.get(&(nrec.npages(), nrec.base())) != Some(&n.index) {
                    continue;
                }
                let npages = nrec.npages();
                shelf.by_size.remove(&(npages, nrec.base()));
                shelf.npages -= npages;
                let remaining = shelf.npages;
                shelf.decay.note_shrink(remaining);
                self.pages_counter(kind).fetch_sub(npages, Ordering::Relaxed);
                ctx.rtree.deregister(nrec.base(), nrec.size(), false);
                if npages > extra_pages {
                    match self.split(ctx, n.index, extra_pages << LG_PAGE) {
                        Some(tail) => self.shelve_locked(ctx, &mut shelf, kind, tail),
                        None => {
                            self.shelve_locked(ctx, &mut shelf, kind, n.index);
                            continue;
                        }
                    }
                }
                n.index
            };

            // Blocking hooks run with no shelf lock held.
            let nrec = ctx.registry.get(neighbour);
            if !nrec.committed() {
                if !ctx.hooks.commit(nrec.base() as *mut u8, 0, nrec.size()) {
                    self.shelve_retained(ctx, neighbour);
                    return false;
                }
                nrec.set_committed(true);
            }
            if !ctx.hooks.merge(
                e.base() as *mut u8,
                e.size(),
                nrec.base() as *mut u8,
                nrec.size(),
                true,
            ) {
                nrec.set_zeroed(false);
                let mut shelf = self.dirty.lock();
                self.shelve_locked(ctx, &mut shelf, CacheKind::Dirty, neighbour);
                return false;
            }

            ctx.rtree.deregister(e.base(), e.size(), false);
            e.set_size(e.size() + nrec.size());
            ctx.registry.recycle(neighbour);
            ctx.rtree.register(
                e.base(),
                e.size(),
                RtreeValue { index: idx, szind, slab: false, state: ExtentState::Active },
            );
            return true;
        }
        false
    }

    /// Shrink an Active extent in place to `new_npages`, freeing the tail
    /// into the dirty cache. On success the extent is re-registered with
    /// `szind`.
    pub fn shrink(&self, ctx: &ExtentCtx, idx: u32, new_npages: usize, szind: u32) -> bool {
        let e = ctx.registry.get(idx);
        debug_assert!(new_npages > 0 && new_npages < e.npages());
        ctx.rtree.deregister(e.base(), e.size(), false);
        let tail = match self.split(ctx, idx, new_npages << LG_PAGE) {
            Some(tail) => tail,
            None => {
                ctx.rtree.register(
                    e.base(),
                    e.size(),
                    RtreeValue { index: idx, szind, slab: false, state: ExtentState::Active },
                );
                return false;
            }
        };
        ctx.rtree.register(
            e.base(),
            e.size(),
            RtreeValue { index: idx, szind, slab: false, state: ExtentState::Active },
        );
        ctx.registry.get(tail).set_state(ExtentState::Active);
        self.dealloc(ctx, tail);
        true
    }

    // ---------------------------------------------------------------
    // Teardown, stats, fork
    // ---------------------------------------------------------------

    /// Drop every cached extent back to the OS. Callers must guarantee no
    /// Active extents remain.
    pub fn destroy(&self, ctx: &ExtentCtx) {
        for kind in [CacheKind::Dirty, CacheKind::Muzzy, CacheKind::Retained] {
            let victims: Vec<u32> = {
                let mut shelf = self.shelf(kind).lock();
                let victims = shelf.by_size.values().copied().collect();
                shelf.by_size.clear();
                self.pages_counter(kind).fetch_sub(shelf.npages, Ordering::Relaxed);
                shelf.npages = 0;
                shelf.decay.note_shrink(0);
                victims
            };
            for idx in victims {
                self.release(ctx, idx);
            }
        }
    }

    pub fn set_decay_ms(&self, kind: CacheKind, ms: i64) {
        match kind {
            CacheKind::Dirty => self.dirty_decay_ms.store(ms, Ordering::Relaxed),
            _ => self.muzzy_decay_ms.store(ms, Ordering::Relaxed),
        }
    }

    pub fn decay_ms(&self, kind: CacheKind) -> i64 {
        match kind {
            CacheKind::Dirty => self.dirty_decay_ms.load(Ordering::Relaxed),
            _ => self.muzzy_decay_ms.load(Ordering::Relaxed),
        }
    }

    pub fn npages_cached(&self, kind: CacheKind) -> usize {
        self.pages_counter(kind).load(Ordering::Relaxed)
    }

    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    pub fn purge_counts(&self) -> (u64, u64) {
        (
            self.npurges_lazy.load(Ordering::Relaxed),
            self.npurges_forced.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn prefork(&self) {
        self.dirty.prefork();
        self.muzzy.prefork();
        self.retained.prefork();
    }

    pub(crate) fn postfork_parent(&self) {
        self.retained.postfork_parent();
        self.muzzy.postfork_parent();
        self.dirty.postfork_parent();
    }

    pub(crate) fn postfork_child(&self) {
        self.retained.postfork_child();
        self.muzzy.postfork_child();
        self.dirty.postfork_child();
    }
}
