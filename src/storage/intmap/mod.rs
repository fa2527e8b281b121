#![forbid(unsafe_code)]

//! Persistent `i32 -> i32` index built as a hybrid B-tree.
//!
//! Interior nodes hold sorted separators. Leaves start out as hash tables
//! probed with double hashing and split top-down once full. Key 0 is kept
//! in the header because it marks free hashed-leaf slots.

mod engine;
/// Tree header codec and its persistence hook.
pub mod header;
/// Node capacities derived from the node size.
pub mod layout;
mod node;
mod options;
mod stats;
mod tree;
mod verify;

pub use header::{FileHeaderStore, HeaderStore, MemHeaderStore, TreeHeader, HEADER_LEN};
pub use layout::NodeLayout;
pub use options::{IntMapOptions, CACHE_ROOT_ENV, NODE_SIZE_ENV};
pub use stats::IntMapStatistics;
pub use tree::{IntToIntBTree, Lookup, VacantSlot};
pub use verify::ConsistencyReport;
