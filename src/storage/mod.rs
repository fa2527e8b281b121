//! Index structures stored on top of the page cache.

/// Integer-to-integer hybrid B-tree index.
///
/// Maps `i32` keys to `i32` values with hashed leaves and top-down splits.
pub mod intmap;

pub use intmap::{IntMapOptions, IntToIntBTree};
