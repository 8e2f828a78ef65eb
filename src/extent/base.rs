//! The base allocator: a monotonic metadata arena.
//!
//! Internal records (extent records, radix-tree nodes) are carved from
//! dedicated page ranges that are never handed to callers and never freed
//! before the allocator itself is dropped. The bookkeeping budget is
//! therefore monotonic for the life of the process.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::classes::{PAGE, QUANTUM};
use crate::error::AllocError;
use crate::extent::hooks::PageHooks;
use crate::sync::{ForkMutex, Rank};
use crate::util::layout::align_up;

/// First block: 32 pages; doubles per growth up to [`MAX_BLOCK_PAGES`].
const FIRST_BLOCK_PAGES: usize = 32;
const MAX_BLOCK_PAGES: usize = 2048;

struct BaseBlock {
    addr: NonNull<u8>,
    len: usize,
    cursor: usize,
}

struct BaseInner {
    blocks: Vec<BaseBlock>,
    next_block_pages: usize,
}

// SAFETY: the raw block pointers are only dereferenced for carving, under
// the base mutex.
unsafe impl Send for BaseInner {}

/// Metadata arena. One per allocator instance; single mutex.
///
/// Must not be reentered from within a page-hook call that the base itself
/// drove; the lock is not reentrant.
pub struct Base {
    hooks: Arc<dyn PageHooks>,
    inner: ForkMutex<BaseInner>,
    allocated: AtomicUsize,
    mapped: AtomicUsize,
}

impl Base {
    pub fn new(hooks: Arc<dyn PageHooks>) -> Self {
        Self {
            hooks,
            inner: ForkMutex::new(
                Rank::Base,
                BaseInner { blocks: Vec::new(), next_block_pages: FIRST_BLOCK_PAGES },
            ),
            allocated: AtomicUsize::new(0),
            mapped: AtomicUsize::new(0),
        }
    }

    /// Carve `size` bytes aligned to `align` from the metadata arena.
    /// The memory is zeroed and lives until the allocator is dropped.
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(QUANTUM);
        let mut inner = self.inner.lock();

        if let Some(p) = Self::carve(inner.blocks.last_mut(), size, align) {
            self.allocated.fetch_add(size, Ordering::Relaxed);
            return Ok(p);
        }

        // Grow: geometric block sizing, bumped up to fit oversized
        // requests.
        let want = align_up(size + align, PAGE) / PAGE;
        let pages = inner.next_block_pages.max(want);
        let reserved = self
            .hooks
            .reserve(std::ptr::null_mut(), pages * PAGE, PAGE, true)
            .ok_or(AllocError::OutOfMemory)?;
        let addr = NonNull::new(reserved.addr).ok_or(AllocError::OutOfMemory)?;
        self.mapped.fetch_add(pages * PAGE, Ordering::Relaxed);
        inner.next_block_pages = (inner.next_block_pages * 2).min(MAX_BLOCK_PAGES);
        inner.blocks.push(BaseBlock { addr, len: pages * PAGE, cursor: 0 });

        let p = Self::carve(inner.blocks.last_mut(), size, align)
            .expect("fresh base block too small");
        self.allocated.fetch_add(size, Ordering::Relaxed);
        Ok(p)
    }

    fn carve(block: Option<&mut BaseBlock>, size: usize, align: usize) -> Option<NonNull<u8>> {
        let block = block?;
        let start = align_up(block.addr.as_ptr() as usize + block.cursor, align)
            - block.addr.as_ptr() as usize;
        let end = start.checked_add(size)?;
        if end > block.len {
            return None;
        }
        block.cursor = end;
        // SAFETY: start is in bounds of the block's mapping.
        Some(unsafe { NonNull::new_unchecked(block.addr.as_ptr().add(start)) })
    }

    /// Bytes handed out to internal consumers.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Bytes mapped for metadata.
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
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

impl Drop for Base {
    fn drop(&mut self) {
        // SAFETY: drop has exclusive access.
        let inner = unsafe { self.inner.data_unsynchronized() };
        for block in inner.blocks.drain(..) {
            self.hooks.release(block.addr.as_ptr(), block.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::hooks::SystemHooks;

    fn base() -> Base {
        Base::new(Arc::new(SystemHooks))
    }

    #[test]
    fn test_alloc_alignment_and_zeroing() {
        let b = base();
        let p = b.alloc(100, 64).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);
        for i in 0..100 {
            assert_eq!(unsafe { p.as_ptr().add(i).read() }, 0);
        }
    }

    #[test]
    fn test_monotonic_growth() {
        let b = base();
        let mut last = 0;
        for _ in 0..64 {
            b.alloc(PAGE, QUANTUM).unwrap();
            let now = b.allocated();
            assert!(now > last);
            last = now;
        }
        assert!(b.mapped() >= b.allocated());
    }

    #[test]
    fn test_oversized_request_gets_own_block() {
        let b = base();
        let big = (FIRST_BLOCK_PAGES + 8) * PAGE;
        let p = b.alloc(big, PAGE).unwrap();
        assert_eq!(p.as_ptr() as usize % PAGE, 0);
    }

    #[test]
    fn test_distinct_allocations() {
        let b = base();
        let p1 = b.alloc(40, 16).unwrap();
        let p2 = b.alloc(40, 16).unwrap();
        assert_ne!(p1, p2);
        assert!((p2.as_ptr() as usize) >= (p1.as_ptr() as usize + 40));
    }
}
