use crate::types::{IntMapError, Result};

/// Bytes reserved at the start of every node for the header word and the next-page link.
pub const NODE_HEADER_LEN: usize = 8;
/// Header reservation for hashed leaves.
pub const HASHED_LEAF_HEADER_LEN: usize = NODE_HEADER_LEN;
/// One `(value-or-child, key)` slot.
pub const SLOT_LEN: usize = 8;
/// Offset of the key inside a slot.
pub const KEY_OFFSET: usize = 4;
/// Offset of the next-page link inside the node header.
pub const NEXT_PAGE_OFFSET: usize = 4;

/// Per-kind capacities derived once from the node size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeLayout {
    /// Size of one node in bytes.
    pub node_size: usize,
    /// Maximum child pointers of an interior node.
    pub max_interior: u16,
    /// Maximum records of a sorted leaf.
    pub max_leaf: u16,
    /// Number of physical slots in a hashed leaf (prime).
    pub hash_capacity: u16,
    /// Maximum records of a hashed leaf, kept below `hash_capacity`.
    pub max_hashed_leaf: u16,
}

impl NodeLayout {
    /// Computes the capacities for `node_size`.
    pub fn new(node_size: usize) -> Result<Self> {
        if node_size < NODE_HEADER_LEN + 5 * SLOT_LEN {
            return Err(IntMapError::Invalid("node size too small"));
        }
        let interior = (node_size - NODE_HEADER_LEN) / SLOT_LEN - 1;
        if interior % 2 != 0 {
            return Err(IntMapError::Invalid("node size yields an odd interior capacity"));
        }
        if interior >= i16::MAX as usize {
            return Err(IntMapError::Invalid("node size yields more than 32766 slots"));
        }
        let hash_slots = (node_size - HASHED_LEAF_HEADER_LEN) / SLOT_LEN;
        let mut hash_capacity = (interior + 1).min(hash_slots);
        if hash_capacity % 2 == 0 {
            hash_capacity -= 1;
        }
        while !is_prime(hash_capacity) {
            hash_capacity -= 2;
        }
        let mut max_hashed_leaf = hash_capacity * 9 / 10;
        if max_hashed_leaf % 2 == 1 {
            max_hashed_leaf += 1;
        }
        if max_hashed_leaf == 0 || max_hashed_leaf >= hash_capacity {
            return Err(IntMapError::Invalid("node size too small for a hashed leaf"));
        }
        Ok(Self {
            node_size,
            max_interior: interior as u16,
            max_leaf: interior as u16,
            hash_capacity: hash_capacity as u16,
            max_hashed_leaf: max_hashed_leaf as u16,
        })
    }

    /// Node size whose interior capacity is exactly `interior` (must be even).
    pub fn node_size_for_interior(interior: usize) -> usize {
        (interior + 1) * SLOT_LEN + NODE_HEADER_LEN
    }
}

/// Trial division; only odd candidates above 2 are ever asked about.
pub fn is_prime(value: usize) -> bool {
    if value < 2 {
        return false;
    }
    if value % 2 == 0 {
        return value == 2;
    }
    let mut divisor = 3;
    while divisor * divisor <= value {
        if value % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_node_holds_four_hashed_records() -> Result<()> {
        let layout = NodeLayout::new(48)?;
        assert_eq!(layout.max_interior, 4);
        assert_eq!(layout.max_leaf, 4);
        assert_eq!(layout.hash_capacity, 5);
        assert_eq!(layout.max_hashed_leaf, 4);
        assert_eq!(NodeLayout::node_size_for_interior(4), 48);
        Ok(())
    }

    #[test]
    fn default_node_size_capacities() -> Result<()> {
        let layout = NodeLayout::new(32 * 1024)?;
        assert_eq!(layout.max_interior, 4094);
        assert!(is_prime(layout.hash_capacity as usize));
        assert!(layout.hash_capacity <= 4095);
        assert_eq!(layout.max_hashed_leaf % 2, 0);
        assert!(layout.max_hashed_leaf < layout.hash_capacity);
        Ok(())
    }

    #[test]
    fn rejects_odd_interior_and_oversized_nodes() {
        assert!(NodeLayout::new(56).is_err());
        assert!(NodeLayout::new(1024 * 1024).is_err());
        assert!(NodeLayout::new(16).is_err());
    }

    #[test]
    fn primes() {
        let found: Vec<usize> = (0..30).filter(|&n| is_prime(n)).collect();
        assert_eq!(found, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
    }
}
