#![forbid(unsafe_code)]

//! Shared identifiers, error taxonomy and sizing constants.

use std::fmt;
use std::path::PathBuf;

/// Absolute byte offset of a node page inside the index file.
///
/// Offsets are kept below `i32::MAX` so that a child reference can be stored
/// on disk as the negated offset.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageAddress(pub u32);

impl PageAddress {
    /// Largest offset that still round-trips through the negated on-disk form.
    pub const MAX: u32 = i32::MAX as u32;

    /// Returns the offset as a `u64` for file arithmetic.
    pub fn offset(self) -> u64 {
        u64::from(self.0)
    }

    /// Builds an address from a file offset, rejecting offsets that cannot be
    /// encoded as a child reference.
    pub fn from_offset(offset: u64) -> Result<Self> {
        if offset > u64::from(Self::MAX) {
            return Err(IntMapError::Invalid("index file exceeds addressable size"));
        }
        Ok(Self(offset as u32))
    }
}

impl fmt::Display for PageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced by the index and its page collaborators.
#[derive(thiserror::Error, Debug)]
pub enum IntMapError {
    /// I/O failure reported by the backing file.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A structural invariant of the index was violated; the instance is unusable.
    #[error("corrupted index {}: {reason}", file.display())]
    CorruptedIndex {
        /// Identity of the backing file.
        file: PathBuf,
        /// Which invariant failed.
        reason: &'static str,
    },
    /// Caller misuse or an unsatisfiable configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration text could not be parsed.
    #[error("config: {0}")]
    Config(String),
}

impl IntMapError {
    /// Returns true for [`IntMapError::CorruptedIndex`].
    pub fn is_corruption(&self) -> bool {
        matches!(self, IntMapError::CorruptedIndex { .. })
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, IntMapError>;

pub mod page {
    //! Sizing constants shared by the page cache and the node codec.

    /// Default size of a page-cache page.
    pub const DEFAULT_STORAGE_PAGE_SIZE: usize = 1024 * 1024;
    /// Default size of a single index node.
    pub const DEFAULT_NODE_SIZE: u32 = 32 * 1024;
    /// Smallest number of frames the page cache accepts.
    pub const MIN_CACHE_PAGES: usize = 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_address_rejects_offsets_beyond_i32() {
        assert_eq!(PageAddress::from_offset(4096).unwrap(), PageAddress(4096));
        assert!(PageAddress::from_offset(u64::from(PageAddress::MAX) + 1).is_err());
    }

    #[test]
    fn corrupted_index_message_names_file() {
        let err = IntMapError::CorruptedIndex {
            file: PathBuf::from("/tmp/ids.idx"),
            reason: "descent exceeded tree height",
        };
        assert!(err.is_corruption());
        assert_eq!(
            err.to_string(),
            "corrupted index /tmp/ids.idx: descent exceeded tree height"
        );
    }
}
