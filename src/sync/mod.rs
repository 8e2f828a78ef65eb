//! Synchronization primitives: forkable witness-ranked mutexes.

pub mod mutex;
pub mod witness;

pub use mutex::{ForkGuard, ForkMutex};
pub use witness::Rank;
