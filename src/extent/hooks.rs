//! Page-grant capability set.
//!
//! The extent layer talks to the operating system exclusively through this
//! trait, at page granularity. The default implementation maps to
//! mmap/munmap/madvise; embedders can install their own table per arena.

use std::ptr;

use crate::core::classes::{PAGE, PAGE_MASK};

/// Result of a successful [`PageHooks::reserve`] call.
#[derive(Debug, Clone, Copy)]
pub struct Reserved {
    /// Page-aligned base of the range.
    pub addr: *mut u8,
    /// Whether the range came back committed (readable/writable).
    pub committed: bool,
    /// Whether the range is known to be zero-filled.
    pub zeroed: bool,
}

/// Capability set the extent layer requires from the OS layer.
///
/// All lengths and offsets are multiples of the page size. Operations that
/// return `bool` report success; a `false` purge/decommit leaves the pages
/// committed and the caller falls back to a stronger operation.
pub trait PageHooks: Send + Sync + 'static {
    /// Reserve `len` bytes of address space aligned to `alignment`
    /// (a power-of-two multiple of the page size), optionally committed.
    fn reserve(&self, hint: *mut u8, len: usize, alignment: usize, commit: bool)
        -> Option<Reserved>;

    /// Return a reserved range to the OS.
    fn release(&self, addr: *mut u8, len: usize);

    /// Make `[addr+offset, addr+offset+len)` readable and writable.
    fn commit(&self, addr: *mut u8, offset: usize, len: usize) -> bool;

    /// Drop the backing of the range, keeping the address space.
    fn decommit(&self, addr: *mut u8, offset: usize, len: usize) -> bool;

    /// Advise the OS the range's contents are disposable; pages may remain
    /// resident until memory pressure.
    fn purge_lazy(&self, addr: *mut u8, offset: usize, len: usize) -> bool;

    /// Force the range's contents to be dropped immediately.
    fn purge_forced(&self, addr: *mut u8, offset: usize, len: usize) -> bool;

    /// Split a contiguous range in two. A `false` return forbids the
    /// split.
    fn split(&self, addr: *mut u8, len: usize, len_a: usize, len_b: usize, committed: bool)
        -> bool;

    /// Merge two adjacent ranges. A `false` return forbids the merge.
    fn merge(&self, addr_a: *mut u8, len_a: usize, addr_b: *mut u8, len_b: usize, committed: bool)
        -> bool;
}

/// Default hooks over the platform's virtual-memory calls.
pub struct SystemHooks;

#[cfg(unix)]
impl SystemHooks {
    fn map(&self, hint: *mut u8, len: usize, commit: bool) -> *mut u8 {
        let prot = if commit {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };
        // SAFETY: anonymous private mapping; the hint is advisory.
        let addr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            addr as *mut u8
        }
    }

    fn unmap(&self, addr: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: `addr`/`len` describe a mapping this process owns.
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc != 0 {
            log::warn!("munmap({:p}, {}) failed", addr, len);
        }
    }
}

#[cfg(unix)]
impl PageHooks for SystemHooks {
    fn reserve(
        &self,
        hint: *mut u8,
        len: usize,
        alignment: usize,
        commit: bool,
    ) -> Option<Reserved> {
        debug_assert!(len & PAGE_MASK == 0 && len > 0);
        debug_assert!(alignment.is_power_of_two() && alignment >= PAGE);

        // Fast attempt: most kernels hand back page-aligned addresses that
        // already satisfy small alignments.
        let addr = self.map(hint, len, commit);
        if addr.is_null() {
            return None;
        }
        if addr as usize & (alignment - 1) == 0 {
            return Some(Reserved { addr, committed: commit, zeroed: true });
        }
        self.unmap(addr, len);

        // Over-reserve and trim both ends to carve an aligned range.
        let padded = len.checked_add(alignment - PAGE)?;
        let raw = self.map(ptr::null_mut(), padded, commit);
        if raw.is_null() {
            return None;
        }
        let aligned = crate::util::layout::align_ptr(raw, alignment);
        let lead = aligned as usize - raw as usize;
        let trail = padded - lead - len;
        self.unmap(raw, lead);
        // SAFETY: aligned + len stays within the padded mapping.
        self.unmap(unsafe { aligned.add(len) }, trail);
        Some(Reserved { addr: aligned, committed: commit, zeroed: true })
    }

    fn release(&self, addr: *mut u8, len: usize) {
        self.unmap(addr, len);
    }

    fn commit(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
        // SAFETY: the range lies within a mapping owned by the caller.
        let rc = unsafe {
            libc::mprotect(
                addr.add(offset) as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            log::warn!("commit({:p}+{:#x}, {}) failed", addr, offset, len);
        }
        rc == 0
    }

    fn decommit(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
        // SAFETY: as for commit; PROT_NONE plus DONTNEED drops the backing
        // while keeping the reservation.
        unsafe {
            let p = addr.add(offset) as *mut libc::c_void;
            if libc::mprotect(p, len, libc::PROT_NONE) != 0 {
                return false;
            }
            libc::madvise(p, len, libc::MADV_DONTNEED);
        }
        true
    }

    fn purge_lazy(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const ADVICE: libc::c_int = libc::MADV_FREE;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        const ADVICE: libc::c_int = libc::MADV_DONTNEED;

        // SAFETY: the range lies within a mapping owned by the caller.
        let rc = unsafe { libc::madvise(addr.add(offset) as *mut libc::c_void, len, ADVICE) };
        rc == 0
    }

    fn purge_forced(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
        // SAFETY: as above. DONTNEED on a private anonymous mapping
        // guarantees zero pages on next touch.
        let rc = unsafe {
            libc::madvise(addr.add(offset) as *mut libc::c_void, len, libc::MADV_DONTNEED)
        };
        rc == 0
    }

    fn split(&self, _addr: *mut u8, _len: usize, _len_a: usize, _len_b: usize, _committed: bool)
        -> bool {
        // Anonymous mappings split for free.
        true
    }

    fn merge(&self, addr_a: *mut u8, len_a: usize, addr_b: *mut u8, _len_b: usize,
        _committed: bool) -> bool {
        // Only virtually adjacent ranges merge.
        // SAFETY: pointer arithmetic on the first range's bound.
        unsafe { addr_a.add(len_a) == addr_b }
    }
}

/// Adapter wrapping an embedder-installed hook table so every call into
/// it runs under the reentrancy guard: allocation from inside a hook
/// bypasses the thread cache instead of recursing.
pub(crate) struct CalloutHooks(pub(crate) std::sync::Arc<dyn PageHooks>);

impl PageHooks for CalloutHooks {
    fn reserve(
        &self,
        hint: *mut u8,
        len: usize,
        alignment: usize,
        commit: bool,
    ) -> Option<Reserved> {
        let _guard = crate::core::tsd::enter_callout();
        self.0.reserve(hint, len, alignment, commit)
    }

    fn release(&self, addr: *mut u8, len: usize) {
        let _guard = crate::core::tsd::enter_callout();
        self.0.release(addr, len)
    }

    fn commit(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
        let _guard = crate::core::tsd::enter_callout();
        self.0.commit(addr, offset, len)
    }

    fn decommit(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
        let _guard = crate::core::tsd::enter_callout();
        self.0.decommit(addr, offset, len)
    }

    fn purge_lazy(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
        let _guard = crate::core::tsd::enter_callout();
        self.0.purge_lazy(addr, offset, len)
    }

    fn purge_forced(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
        let _guard = crate::core::tsd::enter_callout();
        self.0.purge_forced(addr, offset, len)
    }

    fn split(&self, addr: *mut u8, len: usize, len_a: usize, len_b: usize, committed: bool)
        -> bool {
        let _guard = crate::core::tsd::enter_callout();
        self.0.split(addr, len, len_a, len_b, committed)
    }

    fn merge(&self, addr_a: *mut u8, len_a: usize, addr_b: *mut u8, len_b: usize, committed: bool)
        -> bool {
        let _guard = crate::core::tsd::enter_callout();
        self.0.merge(addr_a, len_a, addr_b, len_b, committed)
    }
}
