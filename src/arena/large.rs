//! The large path: page-granular allocations served straight from the
//! extent layer, with the size class recorded in the radix tree.

use crate::core::classes::{SizeClasses, LG_PAGE, PAGE};
use crate::error::AllocError;
use crate::extent::pool::{ExtentCtx, ExtentPool};
use crate::extent::rtree::RtreeValue;
use crate::extent::ExtentState;

/// Allocate one extent for large class `szind`, optionally zeroed and
/// aligned. Returns the extent index; its base is the user pointer.
pub(crate) fn alloc(
    ctx: &ExtentCtx,
    pool: &ExtentPool,
    classes: &SizeClasses,
    szind: usize,
    alignment: usize,
    zero: bool,
) -> Result<u32, AllocError> {
    let size = classes.size_of(szind);
    debug_assert!(!classes.is_binned(szind));
    debug_assert_eq!(size & (PAGE - 1), 0);
    let npages = size >> LG_PAGE;
    let align_pages = (alignment.max(PAGE) >> LG_PAGE).next_power_of_two();

    let idx = pool.alloc(ctx, npages, align_pages, zero)?;
    let e = ctx.registry.get(idx);
    e.set_szind(szind);
    e.set_slab(false);
    ctx.rtree.register(
        e.base(),
        e.size(),
        RtreeValue {
            index: idx,
            szind: szind as u32,
            slab: false,
            state: ExtentState::Active,
        },
    );
    Ok(idx)
}

/// Free a large extent back to the extent layer.
pub(crate) fn dalloc(ctx: &ExtentCtx, pool: &ExtentPool, idx: u32) {
    pool.dealloc(ctx, idx);
}

/// Try to resize a large extent in place to class `new_szind`. Prefers
/// splitting/merging neighbours over copying. Returns true on success.
pub(crate) fn resize_in_place(
    ctx: &ExtentCtx,
    pool: &ExtentPool,
    classes: &SizeClasses,
    idx: u32,
    new_szind: usize,
) -> bool {
    let e = ctx.registry.get(idx);
    let old_size = e.size();
    let new_size = classes.size_of(new_szind);
    debug_assert!(!classes.is_binned(new_szind));

    if new_size == old_size {
        return true;
    }
    let ok = if new_size > old_size {
        let extra_pages = (new_size - old_size) >> LG_PAGE;
        pool.try_extend(ctx, idx, extra_pages, new_szind as u32)
    } else {
        pool.shrink(ctx, idx, new_size >> LG_PAGE, new_szind as u32)
    };
    if ok {
        e.set_szind(new_szind);
    }
    ok
}
