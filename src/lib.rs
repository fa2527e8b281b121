//! Persistent integer-to-integer index over a paged file.
//!
//! The index lives in [`storage::intmap`]; [`primitives`] provides the page
//! cache and file I/O it runs on.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::intmap::{
    ConsistencyReport, IntMapStatistics, IntToIntBTree, IntMapOptions, Lookup, VacantSlot,
};
pub use types::{IntMapError, PageAddress, Result};
