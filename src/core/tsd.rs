//! Thread-local allocator state.
//!
//! One registry per thread holds a slot per allocator instance: the
//! thread cache, the event accumulators, the radix-tree leaf cache, and
//! the arena binding. Slots initialize lazily on a thread's first
//! allocation and flush back to their arenas when the thread exits.
//!
//! The thread lifecycle mirrors the classic TSD state machine: a live
//! slot is *nominal*; during registry teardown the slot is in
//! *purgatory* (flushing, no caching); after teardown the `thread_local`
//! is gone and any further use of the allocator from this thread runs
//! *reincarnated* (no slot at all, tcache bypassed, arena 0 only).

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::arena::ThreadKind;
use crate::core::event::ThreadEvents;
use crate::core::global::HeapCore;
use crate::core::tcache::Tcache;
use crate::extent::rtree::RtreeCache;

/// Lifecycle tag of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadPhase {
    Nominal,
    /// Teardown in progress; caches are being flushed.
    Purgatory,
}

/// Per-thread, per-instance allocator state.
pub(crate) struct ThreadState {
    pub core: Arc<HeapCore>,
    pub tcache: Option<Tcache>,
    pub tcache_enabled: bool,
    pub events: ThreadEvents,
    pub rtree_cache: RtreeCache,
    pub arena_ind: Option<u32>,
    /// Stable per-thread shard pick.
    pub shard_seed: usize,
    pub phase: ThreadPhase,
}

static SHARD_SEED: AtomicUsize = AtomicUsize::new(0);

impl ThreadState {
    fn new(core: &Arc<HeapCore>) -> Self {
        let tcache_enabled = core.config().tcache;
        let tcache = tcache_enabled.then(|| core.new_tcache());
        Self {
            core: Arc::clone(core),
            tcache,
            tcache_enabled,
            events: ThreadEvents::new(core.event_intervals()),
            rtree_cache: RtreeCache::default(),
            arena_ind: None,
            shard_seed: SHARD_SEED.fetch_add(1, Ordering::Relaxed),
            phase: ThreadPhase::Nominal,
        }
    }

    /// The arena this thread is bound to, binding on first use.
    pub fn arena_ind(&mut self) -> u32 {
        match self.arena_ind {
            Some(ind) => ind,
            None => {
                let ind = self.core.choose_arena(ThreadKind::App);
                self.arena_ind = Some(ind);
                ind
            }
        }
    }

    /// Enable or disable this thread's cache, flushing on disable.
    pub fn set_tcache_enabled(&mut self, enabled: bool) {
        if enabled == self.tcache_enabled {
            return;
        }
        self.tcache_enabled = enabled;
        if enabled {
            if self.tcache.is_none() && self.core.config().tcache {
                self.tcache = Some(self.core.new_tcache());
            }
        } else {
            self.flush_tcache();
        }
    }

    /// Flush every cached pointer back to the owning arenas.
    pub fn flush_tcache(&mut self) {
        if let Some(tcache) = self.tcache.as_mut() {
            let batches = tcache.drain_all();
            let core = Arc::clone(&self.core);
            for batch in batches {
                core.flush_batch(&mut self.rtree_cache, batch);
            }
        }
    }

    fn teardown(&mut self) {
        self.phase = ThreadPhase::Purgatory;
        self.events.set_nominal(false);
        self.flush_tcache();
        self.tcache = None;
        if let Some(ind) = self.arena_ind.take() {
            if let Some(arena) = self.core.arena(ind) {
                arena.unbind(ThreadKind::App);
            }
        }
    }
}

struct TsdRegistry {
    slots: Vec<Option<ThreadState>>,
}

impl Drop for TsdRegistry {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(state) = slot.as_mut() {
                state.teardown();
            }
        }
    }
}

thread_local! {
    static TSD: RefCell<TsdRegistry> = RefCell::new(TsdRegistry { slots: Vec::new() });
    static REENTRANCY: Cell<u32> = const { Cell::new(0) };
}

/// Run `f` with this thread's state for `core`, initializing it on first
/// use. Returns `None` when the state is unavailable: the thread is
/// reincarnated (TLS already destroyed) or the call is a reentrant
/// callout (the registry is already borrowed). Callers fall back to the
/// tcache-free bypass path.
pub(crate) fn with_tsd<R>(
    core: &Arc<HeapCore>,
    f: impl FnOnce(&mut ThreadState) -> R,
) -> Option<R> {
    TSD.try_with(|cell| {
        let mut reg = cell.try_borrow_mut().ok()?;
        let id = core.id() as usize;
        if reg.slots.len() <= id {
            reg.slots.resize_with(id + 1, || None);
        }
        if reg.slots[id].is_none() {
            reg.slots[id] = Some(ThreadState::new(core));
        }
        let state = reg.slots[id].as_mut().expect("slot just initialized");
        if state.phase == ThreadPhase::Purgatory {
            return None;
        }
        Some(f(state))
    })
    .ok()
    .flatten()
}

/// Current callout depth. Above zero the tcache is bypassed, only arena
/// 0 is used, and no further hooks fire.
#[inline]
pub(crate) fn reentrancy_level() -> u32 {
    REENTRANCY.try_with(|c| c.get()).unwrap_or(1)
}

/// Scope guard marking a call out of the allocator (page hooks,
/// allocation hooks). Restores the counter on every exit path.
pub(crate) struct CalloutGuard {
    _private: (),
}

pub(crate) fn enter_callout() -> CalloutGuard {
    let _ = REENTRANCY.try_with(|c| c.set(c.get() + 1));
    CalloutGuard { _private: () }
}

impl Drop for CalloutGuard {
    fn drop(&mut self) {
        let _ = REENTRANCY.try_with(|c| c.set(c.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reentrancy_guard_nesting() {
        assert_eq!(reentrancy_level(), 0);
        {
            let _a = enter_callout();
            assert_eq!(reentrancy_level(), 1);
            {
                let _b = enter_callout();
                assert_eq!(reentrancy_level(), 2);
            }
            assert_eq!(reentrancy_level(), 1);
        }
        assert_eq!(reentrancy_level(), 0);
    }
}
