//! Allocator error kinds.

use std::fmt;

/// Error kinds surfaced by the allocation paths.
///
/// The C-shaped entry points translate these to null-pointer returns plus
/// `errno`; the `try_` variants return them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No pages or address space available.
    OutOfMemory,
    /// Bad alignment, size overflow, or a rejected argument combination.
    InvalidArgument,
    /// The pointer does not belong to this allocator.
    UnmanagedPointer,
    /// Metadata corruption (double free, bad bitmap state).
    Corruption,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
            AllocError::InvalidArgument => write!(f, "invalid argument"),
            AllocError::UnmanagedPointer => write!(f, "pointer not managed by this allocator"),
            AllocError::Corruption => write!(f, "allocator metadata corruption"),
        }
    }
}

impl std::error::Error for AllocError {}
