//! Public API: the allocator handle, configuration, and statistics.

pub mod alloc;
pub mod config;
pub mod stats;
