//! Radix tree mapping every managed page to its owning extent.
//!
//! Three fixed-fanout levels keyed by the page number of a 48-bit virtual
//! address. A leaf cell is one `AtomicU64` packing the extent index, the
//! size-class index, the is-slab bit and the lifecycle state, so readers
//! are a handful of dependent loads with no locks. Writers are serialized
//! by the owning arena's extent mutexes; only node creation takes the
//! tree's own lock.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::core::classes::LG_PAGE;
use crate::error::AllocError;
use crate::extent::base::Base;
use crate::extent::ExtentState;
use crate::sync::{ForkMutex, Rank};

/// Virtual addresses above 2^48 are not managed.
const LG_VADDR: usize = 48;

const KEY_BITS: usize = LG_VADDR - LG_PAGE;
const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = KEY_BITS - ROOT_BITS - MID_BITS;

const ROOT_FANOUT: usize = 1 << ROOT_BITS;
const MID_FANOUT: usize = 1 << MID_BITS;
const LEAF_FANOUT: usize = 1 << LEAF_BITS;

/// Direct-mapped entries in the per-thread leaf cache.
const CACHE_SLOTS: usize = 16;

// Cell layout: [0..32) extent index + 1 (0 = unmanaged page),
// [32..40) szind, [40] slab, [41..43) state.
const INDEX_BITS: u64 = 32;
const SZIND_SHIFT: u64 = INDEX_BITS;
const SLAB_SHIFT: u64 = 40;
const STATE_SHIFT: u64 = 41;

/// Decoded leaf cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtreeValue {
    pub index: u32,
    pub szind: u32,
    pub slab: bool,
    pub state: ExtentState,
}

#[inline]
fn pack(v: RtreeValue) -> u64 {
    debug_assert!(v.index != u32::MAX && v.szind < 256);
    (v.index as u64 + 1)
        | ((v.szind as u64) << SZIND_SHIFT)
        | ((v.slab as u64) << SLAB_SHIFT)
        | ((v.state as u64) << STATE_SHIFT)
}

#[inline]
fn unpack(cell: u64) -> Option<RtreeValue> {
    if cell == 0 {
        return None;
    }
    Some(RtreeValue {
        index: ((cell & ((1 << INDEX_BITS) - 1)) - 1) as u32,
        szind: ((cell >> SZIND_SHIFT) & 0xff) as u32,
        slab: (cell >> SLAB_SHIFT) & 1 != 0,
        state: ExtentState::from_u8(((cell >> STATE_SHIFT) & 0x3) as u8),
    })
}

/// Per-thread memo of recently used leaves. Leaves are never freed, so
/// cached pointers cannot dangle.
pub struct RtreeCache {
    slots: [(usize, *const AtomicU64); CACHE_SLOTS],
}

// SAFETY: cached leaf pointers target base-allocated nodes that live as
// long as the owning allocator; the cache itself is thread-local.
unsafe impl Send for RtreeCache {}

impl Default for RtreeCache {
    fn default() -> Self {
        Self { slots: [(usize::MAX, ptr::null()); CACHE_SLOTS] }
    }
}

/// The page-to-extent index.
pub struct RadixTree {
    root: Box<[AtomicPtr<AtomicPtr<AtomicU64>>]>,
    nodes_lock: ForkMutex<()>,
}

impl RadixTree {
    pub fn new() -> Self {
        let mut root = Vec::with_capacity(ROOT_FANOUT);
        root.resize_with(ROOT_FANOUT, || AtomicPtr::new(ptr::null_mut()));
        Self {
            root: root.into_boxed_slice(),
            nodes_lock: ForkMutex::new(Rank::RtreeNodes, ()),
        }
    }

    #[inline]
    fn key_of(addr: usize) -> usize {
        debug_assert!(addr < (1 << LG_VADDR));
        addr >> LG_PAGE
    }

    /// Find the leaf for `key` without creating nodes.
    #[inline]
    fn leaf_for(&self, key: usize) -> Option<*const AtomicU64> {
        let root_i = key >> (MID_BITS + LEAF_BITS);
        let mid = self.root[root_i].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }
        let mid_i = (key >> LEAF_BITS) & (MID_FANOUT - 1);
        // SAFETY: interior nodes are MID_FANOUT pointer arrays.
        let leaf = unsafe { (*mid.add(mid_i)).load(Ordering::Acquire) };
        if leaf.is_null() {
            None
        } else {
            Some(leaf as *const AtomicU64)
        }
    }

    /// Find the leaf for `key`, creating interior nodes as needed.
    fn ensure_leaf(&self, base: &Base, key: usize) -> Result<*const AtomicU64, AllocError> {
        if let Some(leaf) = self.leaf_for(key) {
            return Ok(leaf);
        }
        let _guard = self.nodes_lock.lock();

        let root_i = key >> (MID_BITS + LEAF_BITS);
        let mut mid = self.root[root_i].load(Ordering::Acquire);
        if mid.is_null() {
            let node = base.alloc(
                MID_FANOUT * std::mem::size_of::<AtomicPtr<AtomicU64>>(),
                std::mem::align_of::<AtomicPtr<AtomicU64>>(),
            )?;
            // Base memory is zeroed: all child pointers start null.
            mid = node.as_ptr() as *mut AtomicPtr<AtomicU64>;
            self.root[root_i].store(mid, Ordering::Release);
        }

        let mid_i = (key >> LEAF_BITS) & (MID_FANOUT - 1);
        // SAFETY: `mid` is a MID_FANOUT pointer array.
        let slot = unsafe { &*mid.add(mid_i) };
        let mut leaf = slot.load(Ordering::Acquire);
        if leaf.is_null() {
            let node = base.alloc(
                LEAF_FANOUT * std::mem::size_of::<AtomicU64>(),
                std::mem::align_of::<AtomicU64>(),
            )?;
            leaf = node.as_ptr() as *mut AtomicU64;
            slot.store(leaf, Ordering::Release);
        }
        Ok(leaf as *const AtomicU64)
    }

    #[inline]
    fn cell<'a>(leaf: *const AtomicU64, key: usize) -> &'a AtomicU64 {
        // SAFETY: leaves are LEAF_FANOUT cell arrays.
        unsafe { &*leaf.add(key & (LEAF_FANOUT - 1)) }
    }

    /// Pre-create leaves covering `[addr, addr + size)`. Called on growth,
    /// before any cell in the range is written.
    pub fn ensure_mapped(&self, base: &Base, addr: usize, size: usize) -> Result<(), AllocError> {
        let mut key = Self::key_of(addr);
        let last = Self::key_of(addr + size - 1);
        while key <= last {
            self.ensure_leaf(base, key)?;
            // Jump to the first key of the next leaf.
            key = (key | (LEAF_FANOUT - 1)) + 1;
        }
        Ok(())
    }

    /// Write the cells for an extent: every page for slabs, the boundary
    /// pages otherwise. Leaves must already exist.
    pub fn register(&self, addr: usize, size: usize, value: RtreeValue) {
        let cell_value = pack(value);
        let first = Self::key_of(addr);
        let last = Self::key_of(addr + size - 1);
        if value.slab {
            for key in first..=last {
                let leaf = self.leaf_for(key).expect("unmapped slab page");
                Self::cell(leaf, key).store(cell_value, Ordering::Release);
            }
        } else {
            let leaf = self.leaf_for(first).expect("unmapped extent page");
            Self::cell(leaf, first).store(cell_value, Ordering::Release);
            if last != first {
                let leaf = self.leaf_for(last).expect("unmapped extent page");
                Self::cell(leaf, last).store(cell_value, Ordering::Release);
            }
        }
    }

    /// Clear the cells for an extent registered with `slab`.
    pub fn deregister(&self, addr: usize, size: usize, slab: bool) {
        let first = Self::key_of(addr);
        let last = Self::key_of(addr + size - 1);
        if slab {
            for key in first..=last {
                let leaf = self.leaf_for(key).expect("unmapped slab page");
                Self::cell(leaf, key).store(0, Ordering::Release);
            }
        } else {
            let leaf = self.leaf_for(first).expect("unmapped extent page");
            Self::cell(leaf, first).store(0, Ordering::Release);
            if last != first {
                let leaf = self.leaf_for(last).expect("unmapped extent page");
                Self::cell(leaf, last).store(0, Ordering::Release);
            }
        }
    }

    /// Rewrite the state bits of a non-slab extent's boundary cells.
    pub fn update_state(&self, addr: usize, size: usize, state: ExtentState) {
        for key in [Self::key_of(addr), Self::key_of(addr + size - 1)] {
            if let Some(leaf) = self.leaf_for(key) {
                let cell = Self::cell(leaf, key);
                let old = cell.load(Ordering::Acquire);
                if old != 0 {
                    let new = (old & !(0x3 << STATE_SHIFT)) | ((state as u64) << STATE_SHIFT);
                    cell.store(new, Ordering::Release);
                }
            }
        }
    }

    /// Look up the page holding `addr`. Returns `None` for unmanaged
    /// pages. Lock-free.
    pub fn lookup(&self, cache: &mut RtreeCache, addr: usize) -> Option<RtreeValue> {
        if addr >= (1 << LG_VADDR) {
            return None;
        }
        let key = Self::key_of(addr);
        let leaf_key = key >> LEAF_BITS;
        let slot = leaf_key & (CACHE_SLOTS - 1);
        let (cached_key, cached_leaf) = cache.slots[slot];
        let leaf = if cached_key == leaf_key {
            cached_leaf
        } else {
            let leaf = self.leaf_for(key)?;
            cache.slots[slot] = (leaf_key, leaf);
            leaf
        };
        unpack(Self::cell(leaf, key).load(Ordering::Acquire))
    }

    /// Cache-less lookup, for internal probes (coalescing, extension)
    /// that are not on an allocation fast path.
    pub fn lookup_uncached(&self, addr: usize) -> Option<RtreeValue> {
        if addr >= (1 << LG_VADDR) {
            return None;
        }
        let key = Self::key_of(addr);
        let leaf = self.leaf_for(key)?;
        unpack(Self::cell(leaf, key).load(Ordering::Acquire))
    }

    /// Look up a page the caller certifies is managed (e.g. the address
    /// of a live allocation). Skips the existence checks in release.
    #[inline]
    pub fn lookup_dependent(&self, cache: &mut RtreeCache, addr: usize) -> RtreeValue {
        let v = self.lookup(cache, addr);
        debug_assert!(v.is_some(), "dependent lookup of unmanaged address {:#x}", addr);
        // The certification makes the miss unreachable; fall back to a
        // harmless sentinel rather than UB if a caller lied in release.
        v.unwrap_or(RtreeValue {
            index: u32::MAX - 1,
            szind: 0,
            slab: false,
            state: ExtentState::Retained,
        })
    }

    pub(crate) fn prefork(&self) {
        self.nodes_lock.prefork();
    }

    pub(crate) fn postfork_parent(&self) {
        self.nodes_lock.postfork_parent();
    }

    pub(crate) fn postfork_child(&self) {
        self.nodes_lock.postfork_child();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classes::PAGE;
    use crate::extent::hooks::SystemHooks;
    use std::sync::Arc;

    fn tree() -> (RadixTree, Base) {
        (RadixTree::new(), Base::new(Arc::new(SystemHooks)))
    }

    fn value(index: u32, szind: u32, slab: bool) -> RtreeValue {
        RtreeValue { index, szind, slab, state: ExtentState::Active }
    }

    #[test]
    fn test_pack_unpack() {
        for v in [
            value(0, 0, false),
            value(12345, 200, true),
            RtreeValue { index: 7, szind: 31, slab: false, state: ExtentState::Muzzy },
        ] {
            assert_eq!(unpack(pack(v)), Some(v));
        }
        assert_eq!(unpack(0), None);
    }

    #[test]
    fn test_register_lookup_slab() {
        let (tree, base) = tree();
        let mut cache = RtreeCache::default();
        let addr = 0x7000_0000_0000usize - 16 * PAGE;
        tree.ensure_mapped(&base, addr, 4 * PAGE).unwrap();
        tree.register(addr, 4 * PAGE, value(42, 5, true));

        // Every page of a slab resolves, including interior ones.
        for page in 0..4 {
            let v = tree.lookup(&mut cache, addr + page * PAGE + 100).unwrap();
            assert_eq!(v.index, 42);
            assert_eq!(v.szind, 5);
            assert!(v.slab);
        }
        assert_eq!(tree.lookup(&mut cache, addr + 4 * PAGE), None);

        tree.deregister(addr, 4 * PAGE, true);
        assert_eq!(tree.lookup(&mut cache, addr), None);
    }

    #[test]
    fn test_register_lookup_large() {
        let (tree, base) = tree();
        let mut cache = RtreeCache::default();
        let addr = 0x1_0000_0000usize;
        tree.ensure_mapped(&base, addr, 8 * PAGE).unwrap();
        tree.register(addr, 8 * PAGE, value(9, 40, false));

        // Boundary pages resolve for non-slab extents.
        assert_eq!(tree.lookup(&mut cache, addr).unwrap().index, 9);
        assert_eq!(tree.lookup(&mut cache, addr + 7 * PAGE).unwrap().index, 9);
    }

    #[test]
    fn test_unmanaged_lookup_is_clean() {
        let (tree, _base) = tree();
        let mut cache = RtreeCache::default();
        assert_eq!(tree.lookup(&mut cache, 0x5555_0000), None);
    }

    #[test]
    fn test_update_state() {
        let (tree, base) = tree();
        let mut cache = RtreeCache::default();
        let addr = 0x2_0000_0000usize;
        tree.ensure_mapped(&base, addr, 2 * PAGE).unwrap();
        tree.register(addr, 2 * PAGE, value(3, 40, false));
        tree.update_state(addr, 2 * PAGE, ExtentState::Dirty);
        assert_eq!(tree.lookup(&mut cache, addr).unwrap().state, ExtentState::Dirty);
    }

    #[test]
    fn test_leaf_spanning_range() {
        let (tree, base) = tree();
        // A range crossing a leaf boundary maps every leaf it touches.
        let leaf_span = (1usize << LEAF_BITS) << LG_PAGE;
        let addr = leaf_span - 2 * PAGE;
        tree.ensure_mapped(&base, addr, 4 * PAGE).unwrap();
        tree.register(addr, 4 * PAGE, value(1, 6, true));
        let mut cache = RtreeCache::default();
        for page in 0..4 {
            assert!(tree.lookup(&mut cache, addr + page * PAGE).is_some());
        }
    }
}
