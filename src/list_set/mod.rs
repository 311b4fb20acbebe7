//! Concurrent sorted list-based sets.

mod lock_free;

pub use lock_free::LockFreeListSet;
