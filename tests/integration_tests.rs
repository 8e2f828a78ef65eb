//! Integration tests for shardalloc.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use shardalloc::{
    AllocConfig, AllocHooks, AllocxFlags, JunkMode, PointerInfo, ShardAlloc, ZeroRealloc, PAGE,
};

#[test]
fn test_basic_alloc_free() {
    let heap = ShardAlloc::with_defaults();

    let p = heap.alloc(100);
    assert!(!p.is_null());
    assert!(heap.usable_size(p) >= 100);

    // Write to verify the memory is usable.
    unsafe {
        p.write(0xAB);
        p.add(99).write(0xCD);
        assert_eq!(p.read(), 0xAB);
        heap.free(p);
    }
}

#[test]
fn test_tiny_alloc_lifo_reuse() {
    let heap = ShardAlloc::with_defaults();

    let p = heap.alloc(1);
    assert!(!p.is_null());
    assert!(heap.usable_size(p) >= 1);
    unsafe { heap.free(p) };

    // Same-thread reuse is LIFO through the thread cache.
    let q = heap.alloc(1);
    assert_eq!(q, p);
    unsafe { heap.free(q) };
}

#[test]
fn test_alignment_small_and_page() {
    let heap = ShardAlloc::with_defaults();

    for &(align, size) in &[(8usize, 1usize), (64, 40), (256, 100), (PAGE, 1)] {
        let p = heap.aligned_alloc(align, size);
        assert!(!p.is_null(), "align {} size {}", align, size);
        assert_eq!(p as usize % align, 0);
        assert!(heap.usable_size(p) >= size.max(1));
        unsafe { heap.free(p) };
    }

    let p = heap.aligned_alloc(PAGE, 1);
    assert_eq!(p as usize % PAGE, 0);
    assert!(heap.usable_size(p) >= PAGE);
    unsafe { heap.free(p) };
}

#[test]
fn test_aligned_alloc_large_alignment() {
    let heap = ShardAlloc::with_defaults();
    let align = 16 * PAGE;
    let p = heap.aligned_alloc(align, 100);
    assert!(!p.is_null());
    assert_eq!(p as usize % align, 0);
    unsafe { heap.free(p) };
}

#[test]
fn test_aligned_alloc_rejects_bad_alignment() {
    let heap = ShardAlloc::with_defaults();
    assert!(heap.aligned_alloc(3, 100).is_null());
    assert_eq!(errno::errno().0, libc::EINVAL);
}

#[test]
fn test_calloc_zeroes_and_overflow_checks() {
    let heap = ShardAlloc::with_defaults();

    let p = heap.calloc(100, 4);
    assert!(!p.is_null());
    for i in 0..400 {
        assert_eq!(unsafe { p.add(i).read() }, 0, "byte {}", i);
    }
    unsafe { heap.free(p) };

    let p = heap.calloc(usize::MAX, 2);
    assert!(p.is_null());
    assert_eq!(errno::errno().0, libc::ENOMEM);
}

#[test]
fn test_oversized_request_fails_cleanly() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(usize::MAX / 2);
    assert!(p.is_null());
    assert_eq!(errno::errno().0, libc::ENOMEM);
}

#[test]
fn test_free_null_is_noop() {
    let heap = ShardAlloc::with_defaults();
    unsafe { heap.free(std::ptr::null_mut()) };
}

#[test]
fn test_sized_free() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(300);
    unsafe { heap.sized_free(p, 300) };
    let q = heap.alloc(300);
    assert_eq!(q, p);
    unsafe { heap.free(q) };
}

#[test]
fn test_realloc_null_is_alloc() {
    let heap = ShardAlloc::with_defaults();
    let p = unsafe { heap.realloc(std::ptr::null_mut(), 64) };
    assert!(!p.is_null());
    unsafe { heap.free(p) };
}

#[test]
fn test_realloc_same_class_in_place() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(200);
    // 200 and 220 share a size class, so the region already fits.
    let q = unsafe { heap.realloc(p, 220) };
    assert_eq!(q, p);
    assert!(heap.usable_size(q) >= 220);
    unsafe { heap.free(q) };
}

#[test]
fn test_realloc_copies_content() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(200);
    for i in 0..200 {
        unsafe { p.add(i).write(i as u8) };
    }
    let q = unsafe { heap.realloc(p, 5000) };
    assert!(!q.is_null());
    assert_ne!(q, p);
    for i in 0..200 {
        assert_eq!(unsafe { q.add(i).read() }, i as u8, "byte {}", i);
    }
    unsafe { heap.free(q) };
}

#[test]
fn test_realloc_large_grows_in_place() {
    let heap = ShardAlloc::with_defaults();
    // Fresh large extents leave their growth surplus as a contiguous
    // retained neighbour, so the first grow moves the boundary, not the
    // bytes.
    let p = heap.alloc(4 * PAGE * 4);
    assert!(!p.is_null());
    let q = unsafe { heap.realloc(p, 4 * PAGE * 4 + PAGE) };
    assert_eq!(q, p);
    unsafe { heap.free(q) };
}

#[test]
fn test_realloc_zero_frees_by_default() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(64);
    let q = unsafe { heap.realloc(p, 0) };
    assert!(q.is_null());

    let heap = ShardAlloc::new(AllocConfig::default().with_zero_realloc(ZeroRealloc::Alloc));
    let p = heap.alloc(64);
    let q = unsafe { heap.realloc(p, 0) };
    assert!(!q.is_null());
    assert!(heap.usable_size(q) >= 1);
    unsafe { heap.free(q) };
}

#[test]
fn test_usable_size_foreign_pointer() {
    let heap = ShardAlloc::with_defaults();
    let local = 0u64;
    let foreign = &local as *const u64 as *const u8;
    assert_eq!(heap.usable_size(foreign), 0);
    assert_eq!(heap.pointer_info(foreign), PointerInfo::Unmanaged);
    assert_eq!(heap.try_usable_size(foreign), Err(shardalloc::AllocError::UnmanagedPointer));
}

#[test]
fn test_pointer_info_small() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(48);
    match heap.pointer_info(p) {
        PointerInfo::Small { usable_size, slab_regions, slab_free } => {
            assert_eq!(usable_size, 48);
            assert!(slab_regions > 0);
            assert!(slab_free < slab_regions);
        }
        other => panic!("expected a slab region, got {:?}", other),
    }
    unsafe { heap.free(p) };
}

#[test]
fn test_size_class_round_trip() {
    let heap = ShardAlloc::with_defaults();
    for size in [1usize, 8, 9, 16, 48, 100, 1000, 4096, 5000, 14000] {
        let p = heap.alloc(size);
        let usable = heap.usable_size(p);
        assert!(usable >= size);
        // A request of exactly the usable size lands in the same class.
        let q = heap.alloc(usable);
        assert_eq!(heap.usable_size(q), usable);
        unsafe {
            heap.free(p);
            heap.free(q);
        }
    }
}

#[test]
fn test_tcache_disabled_instance() {
    let heap = ShardAlloc::new(AllocConfig::default().with_tcache(false));
    let p = heap.alloc(32);
    assert!(!p.is_null());
    unsafe { heap.free(p) };
    // The bin hands out the lowest free region first.
    let q = heap.alloc(32);
    assert_eq!(q, p);
    unsafe { heap.free(q) };
}

#[test]
fn test_thread_tcache_toggle() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(64);
    unsafe { heap.free(p) };
    heap.thread_tcache_enable(false);
    let q = heap.alloc(64);
    assert!(!q.is_null());
    unsafe { heap.free(q) };
    heap.thread_tcache_enable(true);
}

#[test]
fn test_zero_config() {
    let heap = ShardAlloc::new(AllocConfig::default().with_zero(true));
    let p = heap.alloc(512);
    for i in 0..512 {
        assert_eq!(unsafe { p.add(i).read() }, 0);
    }
    unsafe { heap.free(p) };
}

#[test]
fn test_junk_fill_on_alloc() {
    let heap = ShardAlloc::new(AllocConfig::default().with_junk(JunkMode::Alloc));
    let p = heap.alloc(96);
    for i in 0..96 {
        assert_eq!(unsafe { p.add(i).read() }, 0xa5, "byte {}", i);
    }
    unsafe { heap.free(p) };
}

#[test]
fn test_junk_fill_on_free() {
    let heap = ShardAlloc::new(AllocConfig::default().with_junk(JunkMode::Free));
    let p = heap.alloc(96);
    let usable = heap.usable_size(p);
    unsafe {
        heap.free(p);
        // The region sits in the thread cache; its bytes carry the free
        // pattern.
        for i in 0..usable {
            assert_eq!(p.add(i).read(), 0x5a, "byte {}", i);
        }
    }
}

#[test]
fn test_decay_zero_keeps_rss_bounded() {
    let heap = ShardAlloc::new(
        AllocConfig::parse("dirty_decay_ms:0,muzzy_decay_ms:0").expect("valid config"),
    );
    for _ in 0..200 {
        let p = heap.alloc(1024 * 1024);
        assert!(!p.is_null());
        unsafe {
            // Touch a few pages so they really get backed.
            for page in 0..16 {
                p.add(page * PAGE).write(1);
            }
            heap.free(p);
        }
    }
    let stats = heap.stats();
    assert_eq!(stats.dirty_pages, 0, "eager decay leaves no dirty pages");
    assert_eq!(stats.muzzy_pages, 0, "eager decay leaves no muzzy pages");
    assert!(stats.mapped < 64 * 1024 * 1024, "mapped stays bounded: {}", stats.mapped);
}

#[test]
fn test_stats_track_live_bytes() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(100);
    let q = heap.alloc(100_000);
    let stats = heap.stats();
    assert!(stats.allocated() >= 100 + 100_000);
    assert!(stats.allocated_large >= 100_000);
    unsafe {
        heap.free(p);
        heap.free(q);
    }
    heap.thread_tcache_flush();
    assert_eq!(heap.stats().allocated(), 0);
}

#[test]
fn test_thread_counters_and_peak() {
    let heap = ShardAlloc::with_defaults();
    let before = heap.thread_allocated();
    let p = heap.alloc(1000);
    let after = heap.thread_allocated();
    assert!(after.0 >= before.0 + 1000);
    assert!(heap.thread_peak() >= 1000);
    unsafe { heap.free(p) };
    heap.thread_peak_reset();
    assert!(heap.thread_peak() < after.0);
}

#[test]
fn test_oversize_routes_to_huge_arena() {
    let heap = ShardAlloc::new(AllocConfig::default().with_oversize_threshold(1024 * 1024));
    let p = heap.alloc(2 * 1024 * 1024);
    assert!(!p.is_null());
    let huge = heap.arena_stats(heap.huge_arena()).expect("huge arena initialized");
    assert!(huge.nmalloc_large >= 1);
    unsafe { heap.free(p) };
}

#[test]
fn test_explicit_arena_lifecycle() {
    let heap = ShardAlloc::with_defaults();
    let ind = heap.create_arena().expect("create arena");

    let flags = AllocxFlags { arena: Some(ind), ..AllocxFlags::new() };
    let p = heap.allocx(5000, flags);
    assert!(!p.is_null());
    unsafe {
        p.write(7);
        heap.free(p);
    }
    heap.thread_tcache_flush();

    // Reset leaves the arena reusable with zeroed bin stats.
    heap.reset_arena(ind).expect("reset");
    let stats = heap.arena_stats(ind).expect("arena stats");
    assert!(stats.bins.iter().all(|b| b.cur_regs == 0 && b.cur_slabs == 0));
    let p = heap.allocx(64, flags);
    assert!(!p.is_null());
    unsafe { heap.free(p) };
    heap.thread_tcache_flush();

    // Destroy recycles the arena index.
    heap.destroy_arena(ind).expect("destroy");
    assert_eq!(heap.create_arena().expect("recycled"), ind);
    heap.destroy_arena(ind).expect("destroy again");
}

#[test]
fn test_manual_decay_purges() {
    let heap = ShardAlloc::new(
        AllocConfig::parse("dirty_decay_ms:-1,muzzy_decay_ms:-1").expect("valid config"),
    );
    let p = heap.alloc(256 * 1024);
    unsafe { heap.free(p) };
    // With decay disabled the pages stay dirty until an explicit purge.
    assert!(heap.stats().dirty_pages > 0);
    for ind in 0..heap.stats().narenas as u32 {
        let _ = heap.decay_arena(ind, true);
    }
    assert_eq!(heap.stats().dirty_pages, 0);
}

static LAST_ALLOC: AtomicUsize = AtomicUsize::new(0);
static LAST_FREE: AtomicUsize = AtomicUsize::new(0);

fn on_alloc(result: *mut u8, _size: usize) {
    LAST_ALLOC.store(result as usize, Ordering::SeqCst);
}

fn on_free(address: *mut u8) {
    LAST_FREE.store(address as usize, Ordering::SeqCst);
}

#[test]
fn test_hooks_see_caller_pointers() {
    let heap = ShardAlloc::with_defaults();
    let handle = heap
        .install_hooks(AllocHooks { alloc: Some(on_alloc), dalloc: Some(on_free), expand: None })
        .expect("install hooks");

    let p = heap.alloc(123);
    assert_eq!(LAST_ALLOC.load(Ordering::SeqCst), p as usize);
    unsafe { heap.free(p) };
    assert_eq!(LAST_FREE.load(Ordering::SeqCst), p as usize);

    heap.remove_hooks(handle);
}

#[test]
fn test_posix_memalign_contract() {
    let heap = ShardAlloc::with_defaults();
    let mut out = std::ptr::null_mut();
    assert_eq!(heap.posix_memalign(&mut out, 64, 1000), 0);
    assert!(!out.is_null());
    assert_eq!(out as usize % 64, 0);
    unsafe { heap.free(out) };

    // Alignment must be a power-of-two multiple of the pointer size.
    assert_eq!(heap.posix_memalign(&mut out, 3, 8), libc::EINVAL);
    assert_eq!(heap.posix_memalign(&mut out, 2, 8), libc::EINVAL);
}

#[test]
fn test_multithreaded_mixed_sizes() {
    let heap = ShardAlloc::with_defaults();
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let heap = heap.clone();
        handles.push(thread::spawn(move || {
            let mut rng = 0x9e3779b97f4a7c15u64.wrapping_mul(t + 1);
            let mut live: Vec<(*mut u8, usize)> = Vec::new();
            for i in 0..20_000 {
                rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let size = (rng >> 33) as usize % 65536 + 1;
                if live.len() > 64 || (i % 3 == 0 && !live.is_empty()) {
                    let (p, size) = live.swap_remove((rng as usize) % live.len());
                    unsafe {
                        assert_eq!(p.read(), (size % 251) as u8);
                        heap.free(p);
                    }
                } else {
                    let p = heap.alloc(size);
                    assert!(!p.is_null());
                    unsafe { p.write((size % 251) as u8) };
                    live.push((p, size));
                }
            }
            for (p, size) in live {
                unsafe {
                    assert_eq!(p.read(), (size % 251) as u8);
                    heap.free(p);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    // Worker caches flushed at thread exit; nothing should be live.
    assert_eq!(heap.stats().allocated(), 0);
}

mod counting_hooks {
    use shardalloc::{PageHooks, Reserved, SystemHooks};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct CountingHooks {
        inner: SystemHooks,
        pub reserves: AtomicUsize,
    }

    impl CountingHooks {
        pub fn new() -> Self {
            Self { inner: SystemHooks, reserves: AtomicUsize::new(0) }
        }
    }

    impl PageHooks for CountingHooks {
        fn reserve(
            &self,
            hint: *mut u8,
            len: usize,
            alignment: usize,
            commit: bool,
        ) -> Option<Reserved> {
            self.reserves.fetch_add(1, Ordering::Relaxed);
            self.inner.reserve(hint, len, alignment, commit)
        }

        fn release(&self, addr: *mut u8, len: usize) {
            self.inner.release(addr, len)
        }

        fn commit(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
            self.inner.commit(addr, offset, len)
        }

        fn decommit(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
            self.inner.decommit(addr, offset, len)
        }

        fn purge_lazy(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
            self.inner.purge_lazy(addr, offset, len)
        }

        fn purge_forced(&self, addr: *mut u8, offset: usize, len: usize) -> bool {
            self.inner.purge_forced(addr, offset, len)
        }

        fn split(&self, addr: *mut u8, len: usize, len_a: usize, len_b: usize, committed: bool)
            -> bool {
            self.inner.split(addr, len, len_a, len_b, committed)
        }

        fn merge(&self, addr_a: *mut u8, len_a: usize, addr_b: *mut u8, len_b: usize,
            committed: bool) -> bool {
            self.inner.merge(addr_a, len_a, addr_b, len_b, committed)
        }
    }
}

#[test]
fn test_custom_page_hooks_observe_growth() {
    use std::sync::Arc;

    let heap = ShardAlloc::with_defaults();
    let ind = heap.create_arena().expect("create arena");
    let hooks = Arc::new(counting_hooks::CountingHooks::new());
    heap.set_arena_hooks(ind, hooks.clone()).expect("install hooks");

    let flags = AllocxFlags { arena: Some(ind), ..AllocxFlags::new() };
    let p = heap.allocx(256 * 1024, flags);
    assert!(!p.is_null());
    assert!(hooks.reserves.load(std::sync::atomic::Ordering::Relaxed) > 0);
    unsafe { heap.free(p) };
}

#[test]
fn test_clone_shares_instance() {
    let heap1 = ShardAlloc::with_defaults();
    let heap2 = heap1.clone();
    let p = heap1.alloc(100);
    // The clone resolves the same allocation.
    assert_eq!(heap2.usable_size(p), heap1.usable_size(p));
    unsafe { heap2.free(p) };
}
