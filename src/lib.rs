//! # shardalloc
//!
//! Arena-sharded, thread-cached memory allocation for Rust.
//!
//! ## Features
//!
//! - Size-class slabs with per-region bitmaps for small objects
//! - Page-level extent layer with dirty/muzzy/retained decay
//! - Lock-free radix tree mapping every managed page to its extent
//! - Bounded per-thread pointer caches with low-water GC
//! - Arenas as the unit of lock-contention isolation, sharded bins
//! - Fork-safe: all locks participate in the prefork protocol
//! - Runtime configuration via an option string (`SHARDALLOC_CONF`)
//! - Allocation hooks, junk fill, and double-free detection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shardalloc::{ShardAlloc, AllocConfig};
//!
//! let heap = ShardAlloc::new(AllocConfig::default());
//!
//! let p = heap.alloc(100);
//! assert!(!p.is_null());
//! assert!(heap.usable_size(p) >= 100);
//! unsafe { heap.free(p) };
//! ```
//!
//! The allocator is a library: it serves application memory from its own
//! mmap'd extents while using the system allocator for its container
//! metadata, so it composes with any global allocator.

#[cfg(not(unix))]
compile_error!("shardalloc currently supports unix platforms only");

// Internal modules (not directly exported)
#[allow(dead_code)]
mod arena;
#[allow(dead_code)]
mod core;
#[allow(dead_code)]
mod diagnostics;
mod error;
#[allow(dead_code)]
mod extent;
#[allow(dead_code)]
mod sync;
#[allow(dead_code)]
mod util;

pub mod api;

pub use crate::api::alloc::{AllocxFlags, ShardAlloc};
pub use crate::api::config::{
    AllocConfig, BinShardRule, ConfigError, ConfigErrors, Dss, JunkMode, PercpuArena, ZeroRealloc,
};
pub use crate::api::stats::{ArenaStats, HeapStats, PointerInfo};
pub use crate::arena::bin::BinStats;
pub use crate::core::classes::{SlabSizeRule, PAGE, QUANTUM};
pub use crate::core::global::EventHook;
pub use crate::diagnostics::hooks::{AllocHooks, HookHandle, HOOK_MAX};
pub use crate::diagnostics::safety::set_safety_abort_hook;
pub use crate::error::AllocError;
pub use crate::extent::hooks::{PageHooks, Reserved, SystemHooks};
