//! Extents: page-aligned ranges of managed virtual memory.
//!
//! Records live in chunked, never-moving tables addressed by stable `u32`
//! indices; the radix tree and all containers refer to extents by index.
//! Scalar fields are atomics so a record can be read while another thread
//! owns it; the region bitmap is guarded by the owning bin shard's lock.

pub mod base;
pub mod hooks;
pub mod pool;
pub mod rtree;

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::core::classes::{BITMAP_WORDS, LG_PAGE, SLAB_MAXREGS};
use crate::error::AllocError;
use crate::sync::{ForkMutex, Rank};

/// Sentinel for "no extent".
pub const NO_EXTENT: u32 = u32::MAX;

/// Lifecycle state of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtentState {
    /// Handed out to a bin, the large path, or a tcache flush in flight.
    Active = 0,
    /// Freed, contents undefined, still committed.
    Dirty = 1,
    /// Contents purged or decommitted; address space reserved.
    Muzzy = 2,
    /// Address space held in reserve, not necessarily backed.
    Retained = 3,
}

impl ExtentState {
    pub fn from_u8(v: u8) -> ExtentState {
        match v {
            0 => ExtentState::Active,
            1 => ExtentState::Dirty,
            2 => ExtentState::Muzzy,
            _ => ExtentState::Retained,
        }
    }
}

/// One managed page range.
pub struct Extent {
    /// Page-aligned base address.
    addr: AtomicUsize,
    /// Length in bytes, a page multiple.
    size: AtomicUsize,
    /// Owning arena index.
    arena: AtomicU32,
    /// Size-class index; the table's sentinel when unsized.
    szind: AtomicU32,
    state: AtomicU8,
    slab: AtomicBool,
    committed: AtomicBool,
    zeroed: AtomicBool,
    /// Bin shard serving this slab.
    binshard: AtomicU32,
    /// Free regions remaining (slabs only).
    nfree: AtomicU32,
    /// Free-slot chain through the record table.
    next_free: AtomicU32,
    /// Region bitmap, 1 = free. Guarded by the owning bin shard's lock.
    bitmap: UnsafeCell<[u64; BITMAP_WORDS]>,
}

// SAFETY: scalar fields are atomics; the bitmap is only touched by the
// extent's owner (one collaborator at a time per the lifecycle contract).
unsafe impl Send for Extent {}
unsafe impl Sync for Extent {}

impl Extent {
    fn new_empty() -> Self {
        Self {
            addr: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            arena: AtomicU32::new(0),
            szind: AtomicU32::new(0),
            state: AtomicU8::new(ExtentState::Retained as u8),
            slab: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            zeroed: AtomicBool::new(false),
            binshard: AtomicU32::new(0),
            nfree: AtomicU32::new(0),
            next_free: AtomicU32::new(NO_EXTENT),
            bitmap: UnsafeCell::new([0; BITMAP_WORDS]),
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.addr.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_base(&self, addr: usize) {
        self.addr.store(addr, Ordering::Relaxed);
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base() + self.size()
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.size() >> LG_PAGE
    }

    #[inline]
    pub fn arena(&self) -> u32 {
        self.arena.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_arena(&self, ind: u32) {
        self.arena.store(ind, Ordering::Relaxed);
    }

    #[inline]
    pub fn state(&self) -> ExtentState {
        ExtentState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_state(&self, state: ExtentState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn szind(&self) -> usize {
        self.szind.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn set_szind(&self, szind: usize) {
        self.szind.store(szind as u32, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_slab(&self) -> bool {
        self.slab.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_slab(&self, slab: bool) {
        self.slab.store(slab, Ordering::Relaxed);
    }

    #[inline]
    pub fn committed(&self) -> bool {
        self.committed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_committed(&self, committed: bool) {
        self.committed.store(committed, Ordering::Relaxed);
    }

    #[inline]
    pub fn zeroed(&self) -> bool {
        self.zeroed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_zeroed(&self, zeroed: bool) {
        self.zeroed.store(zeroed, Ordering::Relaxed);
    }

    #[inline]
    pub fn binshard(&self) -> u32 {
        self.binshard.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_binshard(&self, shard: u32) {
        self.binshard.store(shard, Ordering::Relaxed);
    }

    #[inline]
    pub fn nfree(&self) -> u32 {
        self.nfree.load(Ordering::Relaxed)
    }

    /// Initialize the region bitmap for a fresh slab: all `nregs` regions
    /// free.
    ///
    /// # Safety
    /// Caller must own the extent (no concurrent bitmap access).
    pub unsafe fn slab_init(&self, nregs: u32) {
        debug_assert!(nregs as usize <= SLAB_MAXREGS);
        let bitmap = &mut *self.bitmap.get();
        for (i, word) in bitmap.iter_mut().enumerate() {
            let lo = i as u32 * 64;
            *word = if nregs >= lo + 64 {
                u64::MAX
            } else if nregs > lo {
                (1u64 << (nregs - lo)) - 1
            } else {
                0
            };
        }
        self.nfree.store(nregs, Ordering::Relaxed);
    }

    /// Claim the lowest free region. Returns its index.
    ///
    /// # Safety
    /// Caller must hold the owning bin shard's lock.
    pub unsafe fn slab_alloc_region(&self) -> Option<u32> {
        let bitmap = &mut *self.bitmap.get();
        for (i, word) in bitmap.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros();
                *word &= !(1u64 << bit);
                self.nfree.fetch_sub(1, Ordering::Relaxed);
                return Some(i as u32 * 64 + bit);
            }
        }
        None
    }

    /// Release a region. Returns `Err(Corruption)` when the region was
    /// already free (double free).
    ///
    /// # Safety
    /// Caller must hold the owning bin shard's lock.
    pub unsafe fn slab_free_region(&self, reg: u32) -> Result<(), AllocError> {
        let bitmap = &mut *self.bitmap.get();
        let word = &mut bitmap[(reg / 64) as usize];
        let mask = 1u64 << (reg % 64);
        if *word & mask != 0 {
            return Err(AllocError::Corruption);
        }
        *word |= mask;
        self.nfree.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

const CHUNK_RECORDS: usize = 256;
const MAX_CHUNKS: usize = 4096;

struct RegistryInner {
    nchunks: usize,
    len: u32,
    free_head: u32,
}

/// The chunked extent-record table.
///
/// Chunks are carved from the base allocator and never move, so readers
/// index into them lock-free; the mutex only guards slot allocation.
pub struct ExtentRegistry {
    chunks: Box<[AtomicPtr<Extent>]>,
    inner: ForkMutex<RegistryInner>,
    live: AtomicUsize,
}

impl ExtentRegistry {
    pub fn new() -> Self {
        let mut chunks = Vec::with_capacity(MAX_CHUNKS);
        chunks.resize_with(MAX_CHUNKS, || AtomicPtr::new(ptr::null_mut()));
        Self {
            chunks: chunks.into_boxed_slice(),
            inner: ForkMutex::new(
                Rank::Registry,
                RegistryInner { nchunks: 0, len: 0, free_head: NO_EXTENT },
            ),
            live: AtomicUsize::new(0),
        }
    }

    /// Allocate a record slot, reusing a recycled one when available.
    pub fn create(&self, base: &base::Base) -> Result<u32, AllocError> {
        let mut inner = self.inner.lock();

        let idx = if inner.free_head != NO_EXTENT {
            let idx = inner.free_head;
            inner.free_head = self.get(idx).next_free.load(Ordering::Relaxed);
            idx
        } else {
            let idx = inner.len;
            if idx as usize == inner.nchunks * CHUNK_RECORDS {
                if inner.nchunks == MAX_CHUNKS {
                    return Err(AllocError::OutOfMemory);
                }
                let bytes = CHUNK_RECORDS * mem::size_of::<Extent>();
                let chunk = base.alloc(bytes, mem::align_of::<Extent>())?;
                let chunk = chunk.as_ptr() as *mut Extent;
                for i in 0..CHUNK_RECORDS {
                    // SAFETY: the chunk covers CHUNK_RECORDS records.
                    unsafe { ptr::write(chunk.add(i), Extent::new_empty()) };
                }
                self.chunks[inner.nchunks].store(chunk, Ordering::Release);
                inner.nchunks += 1;
            }
            inner.len += 1;
            idx
        };

        let record = self.get(idx);
        record.next_free.store(NO_EXTENT, Ordering::Relaxed);
        record.set_slab(false);
        record.set_zeroed(false);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(idx)
    }

    /// Return a record slot to the free chain.
    pub fn recycle(&self, idx: u32) {
        let record = self.get(idx);
        record.set_base(0);
        record.set_size(0);
        let mut inner = self.inner.lock();
        record.next_free.store(inner.free_head, Ordering::Relaxed);
        inner.free_head = idx;
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Fetch a record by index. Lock-free.
    #[inline]
    pub fn get(&self, idx: u32) -> &Extent {
        let chunk = self.chunks[idx as usize / CHUNK_RECORDS].load(Ordering::Acquire);
        debug_assert!(!chunk.is_null());
        // SAFETY: chunks never move or shrink; idx came from create().
        unsafe { &*chunk.add(idx as usize % CHUNK_RECORDS) }
    }

    /// Number of live records.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn prefork(&self) {
        self.inner.prefork();
    }

    pub(crate) fn postfork_parent(&self) {
        self.inner.postfork_parent();
    }

    pub(crate) fn postfork_child(&self) {
        self.inner.postfork_child();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::hooks::SystemHooks;
    use std::sync::Arc;

    fn registry() -> (ExtentRegistry, base::Base) {
        (ExtentRegistry::new(), base::Base::new(Arc::new(SystemHooks)))
    }

    #[test]
    fn test_create_and_recycle() {
        let (reg, base) = registry();
        let a = reg.create(&base).unwrap();
        let b = reg.create(&base).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.live(), 2);
        reg.recycle(a);
        assert_eq!(reg.live(), 1);
        // Recycled slots are reused before fresh ones.
        let c = reg.create(&base).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_record_fields_roundtrip() {
        let (reg, base) = registry();
        let idx = reg.create(&base).unwrap();
        let e = reg.get(idx);
        e.set_base(0x1000_0000);
        e.set_size(8 * crate::core::classes::PAGE);
        e.set_state(ExtentState::Dirty);
        e.set_szind(7);
        assert_eq!(e.npages(), 8);
        assert_eq!(e.end(), 0x1000_0000 + 8 * crate::core::classes::PAGE);
        assert_eq!(e.state(), ExtentState::Dirty);
        assert_eq!(e.szind(), 7);
    }

    #[test]
    fn test_slab_bitmap_lowest_first() {
        let (reg, base) = registry();
        let idx = reg.create(&base).unwrap();
        let e = reg.get(idx);
        unsafe {
            e.slab_init(130);
            assert_eq!(e.nfree(), 130);
            assert_eq!(e.slab_alloc_region(), Some(0));
            assert_eq!(e.slab_alloc_region(), Some(1));
            e.slab_free_region(0).unwrap();
            // Lowest free region is handed out first.
            assert_eq!(e.slab_alloc_region(), Some(0));
        }
    }

    #[test]
    fn test_slab_bitmap_exhaustion() {
        let (reg, base) = registry();
        let idx = reg.create(&base).unwrap();
        let e = reg.get(idx);
        unsafe {
            e.slab_init(3);
            assert_eq!(e.slab_alloc_region(), Some(0));
            assert_eq!(e.slab_alloc_region(), Some(1));
            assert_eq!(e.slab_alloc_region(), Some(2));
            assert_eq!(e.slab_alloc_region(), None);
            assert_eq!(e.nfree(), 0);
        }
    }

    #[test]
    fn test_double_free_detected() {
        let (reg, base) = registry();
        let idx = reg.create(&base).unwrap();
        let e = reg.get(idx);
        unsafe {
            e.slab_init(8);
            let r = e.slab_alloc_region().unwrap();
            e.slab_free_region(r).unwrap();
            assert_eq!(e.slab_free_region(r), Err(AllocError::Corruption));
        }
    }
}
