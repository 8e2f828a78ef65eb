//! Allocation hooks.
//!
//! Embedders can observe every allocation, deallocation, and in-place
//! expansion. Hooks see exactly the pointer the caller got
//! (`result_raw`) and the pointer the caller freed (`address`), in call
//! order. Hooks never fire reentrantly: an allocation made from inside a
//! hook runs with the callout guard held and skips the table.

use crate::core::tsd;
use crate::sync::{ForkMutex, Rank};
use std::sync::atomic::{AtomicBool, Ordering};

/// One installed hook set. Plain function pointers: hooks fire on the
/// hottest paths and must not allocate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocHooks {
    /// Fired after a successful allocation with the returned pointer and
    /// the requested size.
    pub alloc: Option<fn(result: *mut u8, size: usize)>,
    /// Fired before a deallocation with the pointer being freed.
    pub dalloc: Option<fn(address: *mut u8)>,
    /// Fired after an in-place resize with the old and new usable sizes.
    pub expand: Option<fn(address: *mut u8, old_usable: usize, new_usable: usize)>,
}

/// Fixed-capacity hook table.
pub(crate) struct HookTable {
    any: AtomicBool,
    slots: ForkMutex<[Option<AllocHooks>; HOOK_MAX]>,
}

/// Installed hook sets are capped; slots recycle on removal.
pub const HOOK_MAX: usize = 4;

/// Token naming an installed hook set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle(usize);

impl HookTable {
    pub fn new() -> Self {
        Self {
            any: AtomicBool::new(false),
            slots: ForkMutex::new(Rank::Control, [None; HOOK_MAX]),
        }
    }

    /// Install a hook set. Fails when the table is full.
    pub fn install(&self, hooks: AllocHooks) -> Option<HookHandle> {
        let mut slots = self.slots.lock();
        let i = slots.iter().position(|s| s.is_none())?;
        slots[i] = Some(hooks);
        self.any.store(true, Ordering::Release);
        Some(HookHandle(i))
    }

    /// Remove a previously installed hook set.
    pub fn remove(&self, handle: HookHandle) {
        let mut slots = self.slots.lock();
        slots[handle.0] = None;
        let any = slots.iter().any(|s| s.is_some());
        self.any.store(any, Ordering::Release);
    }

    #[inline]
    fn snapshot(&self) -> Option<[Option<AllocHooks>; HOOK_MAX]> {
        if !self.any.load(Ordering::Acquire) || tsd::reentrancy_level() > 0 {
            return None;
        }
        Some(*self.slots.lock())
    }

    /// Fire alloc hooks with the pointer the caller is about to receive.
    pub(crate) fn fire_alloc(&self, result: *mut u8, size: usize) {
        let Some(slots) = self.snapshot() else { return };
        let _guard = tsd::enter_callout();
        for hooks in slots.iter().flatten() {
            if let Some(f) = hooks.alloc {
                f(result, size);
            }
        }
    }

    /// Fire dalloc hooks with the pointer being freed.
    pub(crate) fn fire_dalloc(&self, address: *mut u8) {
        let Some(slots) = self.snapshot() else { return };
        let _guard = tsd::enter_callout();
        for hooks in slots.iter().flatten() {
            if let Some(f) = hooks.dalloc {
                f(address);
            }
        }
    }

    /// Fire expand hooks after an in-place resize.
    pub(crate) fn fire_expand(&self, address: *mut u8, old_usable: usize, new_usable: usize) {
        let Some(slots) = self.snapshot() else { return };
        let _guard = tsd::enter_callout();
        for hooks in slots.iter().flatten() {
            if let Some(f) = hooks.expand {
                f(address, old_usable, new_usable);
            }
        }
    }

    pub(crate) fn prefork(&self) {
        self.slots.prefork();
    }

    pub(crate) fn postfork_parent(&self) {
        self.slots.postfork_parent();
    }

    pub(crate) fn postfork_child(&self) {
        self.slots.postfork_child();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static ALLOC_SEEN: AtomicUsize = AtomicUsize::new(0);

    fn count_alloc(_p: *mut u8, _size: usize) {
        ALLOC_SEEN.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_install_fire_remove() {
        let table = HookTable::new();
        table.fire_alloc(0x10 as *mut u8, 8);
        assert_eq!(ALLOC_SEEN.load(Ordering::Relaxed), 0);

        let h = table
            .install(AllocHooks { alloc: Some(count_alloc), ..Default::default() })
            .unwrap();
        table.fire_alloc(0x10 as *mut u8, 8);
        assert_eq!(ALLOC_SEEN.load(Ordering::Relaxed), 1);

        table.remove(h);
        table.fire_alloc(0x10 as *mut u8, 8);
        assert_eq!(ALLOC_SEEN.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_table_capacity() {
        let table = HookTable::new();
        let mut handles = Vec::new();
        for _ in 0..HOOK_MAX {
            handles.push(table.install(AllocHooks::default()).unwrap());
        }
        assert!(table.install(AllocHooks::default()).is_none());
        table.remove(handles[0]);
        assert!(table.install(AllocHooks::default()).is_some());
    }
}
