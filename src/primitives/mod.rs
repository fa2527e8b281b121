//! Low-level primitives the index is built on.
//!
//! Includes positioned file I/O and the page cache that hands out pinned
//! page buffers by file offset.

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Page cache and the page-provider boundary.
///
/// Manages fixed-size cached pages, pinning and write-back.
pub mod pager;
