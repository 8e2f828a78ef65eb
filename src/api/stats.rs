//! Allocation statistics.

use crate::arena::bin::BinStats;
use crate::util::size::format_bytes;

/// Merged statistics for one arena.
#[derive(Debug, Clone)]
pub struct ArenaStats {
    pub ind: u32,
    /// Per-class bin stats, merged across shards.
    pub bins: Vec<BinStats>,
    /// Bytes in live small regions.
    pub allocated_small: usize,
    /// Bytes in live large allocations.
    pub allocated_large: usize,
    pub nmalloc_large: u64,
    pub ndalloc_large: u64,
    /// Bytes of address space mapped by this arena.
    pub mapped: usize,
    pub dirty_pages: usize,
    pub muzzy_pages: usize,
    pub retained_pages: usize,
    /// Lazy and forced purge passes.
    pub npurges: (u64, u64),
}

/// Aggregated statistics for a whole allocator instance.
#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    /// Bytes in live small regions.
    pub allocated_small: usize,
    /// Bytes in live large allocations.
    pub allocated_large: usize,
    /// Address space mapped for application data.
    pub mapped: usize,
    /// Bytes of internal metadata (records, radix nodes).
    pub metadata: usize,
    pub dirty_pages: usize,
    pub muzzy_pages: usize,
    pub retained_pages: usize,
    pub nmalloc_small: u64,
    pub ndalloc_small: u64,
    pub nmalloc_large: u64,
    pub ndalloc_large: u64,
    /// Arenas that have been initialized.
    pub narenas: usize,
}

impl HeapStats {
    /// Bytes in live allocations of any size.
    pub fn allocated(&self) -> usize {
        self.allocated_small + self.allocated_large
    }

    /// Allocations minus deallocations.
    pub fn active_allocations(&self) -> u64 {
        (self.nmalloc_small + self.nmalloc_large)
            .saturating_sub(self.ndalloc_small + self.ndalloc_large)
    }
}

impl std::fmt::Display for HeapStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Allocator statistics:")?;
        writeln!(f, "  Allocated:  {} (small {}, large {})",
            format_bytes(self.allocated()),
            format_bytes(self.allocated_small),
            format_bytes(self.allocated_large))?;
        writeln!(f, "  Mapped:     {}", format_bytes(self.mapped))?;
        writeln!(f, "  Metadata:   {}", format_bytes(self.metadata))?;
        writeln!(f, "  Page cache: {} dirty, {} muzzy, {} retained",
            self.dirty_pages, self.muzzy_pages, self.retained_pages)?;
        writeln!(f, "  Ops:        {} malloc, {} free",
            self.nmalloc_small + self.nmalloc_large,
            self.ndalloc_small + self.ndalloc_large)?;
        writeln!(f, "  Arenas:     {}", self.narenas)?;
        Ok(())
    }
}

/// Report on an arbitrary pointer, in the spirit of introspection
/// interfaces: whether the allocator owns it and what backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerInfo {
    /// Not a pointer this allocator manages.
    Unmanaged,
    /// Backed by a slab region.
    Small {
        usable_size: usize,
        /// Regions per slab for its class.
        slab_regions: u32,
        /// Currently free regions in its slab.
        slab_free: u32,
    },
    /// Backed by a dedicated extent.
    Large { usable_size: usize },
}

impl PointerInfo {
    /// Usable size, 0 for unmanaged pointers.
    pub fn usable_size(&self) -> usize {
        match self {
            PointerInfo::Unmanaged => 0,
            PointerInfo::Small { usable_size, .. } => *usable_size,
            PointerInfo::Large { usable_size } => *usable_size,
        }
    }
}
