#![forbid(unsafe_code)]

//! Search, insertion and splitting over [`NodeView`]s.

use smallvec::SmallVec;
use tracing::trace;

use super::header::TreeHeader;
use super::node::{BufferMode, Entry, NodeCtx, NodeKind, NodeView, HASH_FREE};
use crate::types::{IntMapError, PageAddress, Result};

/// Shifts longer than this go through one bulk copy instead of slot by slot.
const LARGE_MOVE_THRESHOLD: usize = 5;

/// Slot of `key` when present, otherwise where it would go.
pub(crate) type SlotSearch = std::result::Result<usize, usize>;

/// One node visited by a descent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PathStep {
    pub(crate) address: PageAddress,
    pub(crate) full: bool,
}

/// Nodes visited from the root down; inline up to a height of 8.
pub(crate) type DescentPath = SmallVec<[PathStep; 8]>;

/// Median and new right half produced by a split.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SplitOutcome {
    pub(crate) median: i32,
    pub(crate) sibling: PageAddress,
}

/// Appends one zeroed node page.
pub(crate) fn allocate_node(ctx: NodeCtx<'_>, header: &mut TreeHeader) -> Result<PageAddress> {
    let node_size = ctx.layout.node_size;
    let offset = ctx.provider.append(node_size)?;
    if offset % node_size as u64 != 0 {
        return Err(ctx.corrupted("index file length is not a multiple of the node size"));
    }
    let address = PageAddress::from_offset(offset)?;
    header.pages_count += 1;
    Ok(address)
}

/// Locates `key` inside one node.
pub(crate) fn search(node: &mut NodeView<'_>, key: i32, header: &TreeHeader) -> Result<SlotSearch> {
    if node.kind() == NodeKind::HashedLeaf {
        return hash_index(node, key, header);
    }
    binary_search(node, key)
}

fn binary_search(node: &mut NodeView<'_>, key: i32) -> Result<SlotSearch> {
    let count = node.children_count() as usize;
    node.with_slots(|slots| {
        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match slots.key(mid).cmp(&key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    })
}

/// Double-hashing probe of a hashed leaf, recording probe statistics.
///
/// `Err` carries the first free slot on the probe sequence.
pub(crate) fn hash_index(node: &mut NodeView<'_>, key: i32, header: &TreeHeader) -> Result<SlotSearch> {
    let (found, steps) = probe(node, key)?;
    header.record_hash_probe(steps);
    Ok(found)
}

/// Probe without touching statistics.
pub(crate) fn probe(node: &mut NodeView<'_>, key: i32) -> Result<(SlotSearch, u32)> {
    let length = node.layout().hash_capacity as usize;
    let outcome = node.with_slots(|slots| {
        let hash = (key & i32::MAX) as usize;
        let mut index = hash % length;
        let mut found = slots.key(index);
        let mut total = 0usize;
        if found != key && found != HASH_FREE {
            // Knuth vol. 3, p. 529
            let step = 1 + hash % (length - 2);
            loop {
                index = if index >= step {
                    index - step
                } else {
                    index + length - step
                };
                found = slots.key(index);
                total += 1;
                if total > length {
                    return None;
                }
                if found == key || found == HASH_FREE {
                    break;
                }
            }
        }
        let slot = if found == HASH_FREE { Err(index) } else { Ok(index) };
        Some((slot, total as u32))
    })?;
    outcome.ok_or_else(|| node.corrupted("hash probe exceeded leaf capacity"))
}

/// Walks from the node `node` is positioned at down to the leaf for `key`.
///
/// Every visited node is appended to `path` when one is supplied. A walk
/// deeper than `height + 1` means the stored structure disagrees with the
/// header.
pub(crate) fn descend(
    node: &mut NodeView<'_>,
    key: i32,
    header: &TreeHeader,
    mut path: Option<&mut DescentPath>,
) -> Result<SlotSearch> {
    let max_depth = header.height as usize + 1;
    let mut depth = 0usize;
    loop {
        let found = search(node, key, header)?;
        depth += 1;
        if let Some(path) = path.as_mut() {
            path.push(PathStep {
                address: node.address(),
                full: node.is_full(),
            });
        }
        if depth > max_depth {
            return Err(node.corrupted("descent exceeded tree height"));
        }
        if node.is_leaf() {
            return Ok(found);
        }
        let child_index = match found {
            Ok(slot) => slot + 1,
            Err(slot) => slot,
        };
        let child = node.child_at(child_index)?;
        trace!(
            target: "sombra_intmap::search",
            from = %node.address(),
            to = %child,
            depth,
            "descend"
        );
        node.set_address(child)?;
    }
}

/// Inserts a key that is known to be absent into a node with room for it.
///
/// An empty plain leaf is promoted to a hashed leaf first when
/// `hashed_leaves` is set.
pub(crate) fn insert(
    node: &mut NodeView<'_>,
    key: i32,
    entry: Entry,
    header: &mut TreeHeader,
    hashed_leaves: bool,
) -> Result<()> {
    if node.is_full() {
        return Err(IntMapError::Invalid("insert into a full node"));
    }
    let count = node.children_count() as usize;
    if node.is_leaf() && count == 0 {
        if node.kind() == NodeKind::Leaf && hashed_leaves {
            node.set_kind(NodeKind::HashedLeaf)?;
        }
        if node.kind() == NodeKind::HashedLeaf {
            header.hashed_pages_count += 1;
        }
    }

    if node.kind() == NodeKind::HashedLeaf {
        if key == HASH_FREE {
            return Err(IntMapError::Invalid("key 0 cannot be stored in a hashed leaf"));
        }
        let slot = match hash_index(node, key, header)? {
            Ok(_) => return Err(IntMapError::Invalid("key already present")),
            Err(slot) => slot,
        };
        node.set_key_at(slot, key)?;
        node.set_entry_at(slot, entry)?;
        return node.set_children_count(count as u16 + 1);
    }

    let index = match binary_search(node, key)? {
        Ok(_) => return Err(IntMapError::Invalid("key already present")),
        Err(index) => index,
    };
    node.set_children_count(count as u16 + 1)?;
    let moved = count - index;
    header.moved_members_count = header.moved_members_count.wrapping_add(moved as u32);

    if node.is_leaf() {
        shift_right(node, index, count)?;
        node.set_key_at(index, key)?;
        return node.set_entry_at(index, entry);
    }

    // slots hold (child[i], key[i]) with child[count] trailing; the new child
    // lands right after the new separator
    let trailing = node.raw_word(count)?;
    node.set_raw_word(count + 1, trailing)?;
    shift_right(node, index + 1, count)?;
    if index < count {
        let separator = node.key_at(index)?;
        node.set_key_at(index + 1, separator)?;
    }
    node.set_key_at(index, key)?;
    node.set_entry_at(index + 1, entry)
}

/// Moves slots `from..to` one slot to the right.
fn shift_right(node: &mut NodeView<'_>, from: usize, to: usize) -> Result<()> {
    if to <= from {
        return Ok(());
    }
    if to - from > LARGE_MOVE_THRESHOLD {
        return node.move_slots(from..to, from + 1);
    }
    for i in (from..to).rev() {
        node.copy_slot(i, i + 1)?;
    }
    Ok(())
}

/// Splits the full node `node` and hangs the new right half off `parent`.
///
/// With no parent the tree grows a new root. `parent` must have room for one
/// more separator.
pub(crate) fn split_node(
    node: &mut NodeView<'_>,
    parent: Option<PageAddress>,
    header: &mut TreeHeader,
    hashed_leaves: bool,
) -> Result<SplitOutcome> {
    if !node.is_full() {
        return Err(IntMapError::Invalid("split of a node with free space"));
    }
    let ctx = node.ctx();
    let kind = node.kind();
    let count = node.children_count() as usize;
    let sibling_address = allocate_node(ctx, header)?;
    let mut sibling = NodeView::open(ctx, sibling_address, BufferMode::Cached)?;
    sibling.set_kind(kind)?;

    let next = node.next_page()?;
    node.set_next_page(sibling_address.0 as i32)?;
    sibling.set_next_page(next)?;

    let median = match kind {
        NodeKind::HashedLeaf => {
            let mut pairs = node.leaf_pairs()?;
            if pairs.len() != count {
                return Err(node.corrupted("hashed leaf occupancy disagrees with its count"));
            }
            pairs.sort_unstable_by_key(|&(key, _)| key);
            let capacity = node.layout().hash_capacity as usize;
            node.clear_slots(0..capacity)?;
            node.set_children_count(0)?;
            header.hashed_pages_count = header.hashed_pages_count.saturating_sub(1);
            let half = pairs.len() / 2;
            for &(key, value) in &pairs[..half] {
                insert(node, key, Entry::Value(value), header, hashed_leaves)?;
            }
            for &(key, value) in &pairs[half..] {
                insert(&mut sibling, key, Entry::Value(value), header, hashed_leaves)?;
            }
            pairs[half].0
        }
        NodeKind::Leaf => {
            let keep = node.max_children() as usize / 2;
            let moved = count - keep;
            let bytes = node.read_slots(keep..count)?;
            sibling.write_slots(0, &bytes)?;
            sibling.set_children_count(moved as u16)?;
            node.set_children_count(keep as u16)?;
            sibling.key_at(0)?
        }
        NodeKind::Interior => {
            let half = node.max_children() as usize / 2;
            let moved = count - half;
            let bytes = node.read_slots(half..count)?;
            sibling.write_slots(0, &bytes)?;
            let trailing = node.raw_word(count)?;
            sibling.set_raw_word(moved, trailing)?;
            sibling.set_children_count(moved as u16)?;
            // odd separator count: the middle one moves up
            let median = node.key_at(half - 1)?;
            node.set_children_count(half as u16 - 1)?;
            median
        }
    };

    trace!(
        target: "sombra_intmap::split",
        node = %node.address(),
        sibling = %sibling_address,
        ?kind,
        median,
        "split node"
    );

    match parent {
        Some(parent) => {
            let mut parent = NodeView::open(ctx, parent, BufferMode::Cached)?;
            if parent.is_leaf() {
                return Err(parent.corrupted("split parent is a leaf"));
            }
            insert(&mut parent, median, Entry::Child(sibling_address), header, hashed_leaves)?;
        }
        None => {
            let root_address = allocate_node(ctx, header)?;
            let mut root = NodeView::open(ctx, root_address, BufferMode::Cached)?;
            root.set_kind(NodeKind::Interior)?;
            root.set_children_count(1)?;
            root.set_key_at(0, median)?;
            root.set_entry_at(0, Entry::Child(node.address()))?;
            root.set_entry_at(1, Entry::Child(sibling_address))?;
            header.root = Some(root_address);
            header.height += 1;
            trace!(
                target: "sombra_intmap::split",
                root = %root_address,
                height = header.height,
                "grew new root"
            );
        }
    }

    Ok(SplitOutcome {
        median,
        sibling: sibling_address,
    })
}

/// Splits the run of full nodes that ends at the leaf of `path`, top-down.
///
/// The node above the run has room by construction, so each split can push
/// its median one level up. After a split the walk continues in whichever
/// half holds `key`.
pub(crate) fn split_full_suffix(
    ctx: NodeCtx<'_>,
    path: &[PathStep],
    key: i32,
    header: &mut TreeHeader,
    hashed_leaves: bool,
) -> Result<()> {
    match path.last() {
        Some(leaf) if leaf.full => {}
        _ => return Ok(()),
    }
    let start = path.iter().rposition(|step| !step.full).map_or(0, |i| i + 1);
    let mut parent = start.checked_sub(1).map(|i| path[i].address);
    for step in &path[start..] {
        let mut node = NodeView::open(ctx, step.address, BufferMode::Cached)?;
        let outcome = split_node(&mut node, parent, header, hashed_leaves)?;
        parent = Some(if key >= outcome.median {
            outcome.sibling
        } else {
            step.address
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::{PageCache, PagerOptions};
    use crate::storage::intmap::layout::NodeLayout;

    struct Fixture {
        cache: PageCache,
        layout: NodeLayout,
        header: TreeHeader,
    }

    impl Fixture {
        fn new(node_size: usize) -> Result<Self> {
            Ok(Self {
                cache: PageCache::in_memory(PagerOptions {
                    page_size: node_size * 8,
                    cache_pages: 8,
                })?,
                layout: NodeLayout::new(node_size)?,
                header: TreeHeader::default(),
            })
        }

        fn ctx(&self) -> NodeCtx<'_> {
            NodeCtx {
                provider: &self.cache,
                layout: &self.layout,
            }
        }
    }

    fn new_leaf(fx: &mut Fixture, kind: NodeKind) -> Result<PageAddress> {
        let ctx = NodeCtx {
            provider: &fx.cache,
            layout: &fx.layout,
        };
        let address = allocate_node(ctx, &mut fx.header)?;
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        node.set_kind(kind)?;
        fx.header.root = Some(address);
        fx.header.height = 1;
        Ok(address)
    }

    #[test]
    fn colliding_keys_share_a_hashed_leaf() -> Result<()> {
        let mut fx = Fixture::new(48)?;
        let address = new_leaf(&mut fx, NodeKind::Leaf)?;
        let ctx = NodeCtx {
            provider: &fx.cache,
            layout: &fx.layout,
        };
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        // 5 slots: 5, 10 and 15 all hash to slot 0
        for key in [5, 10, 15] {
            insert(&mut node, key, Entry::Value(key * 2), &mut fx.header, true)?;
        }
        assert_eq!(node.kind(), NodeKind::HashedLeaf);
        assert_eq!(fx.header.hashed_pages_count, 1);
        for key in [5, 10, 15] {
            let slot = search(&mut node, key, &fx.header)?.expect("present");
            assert_eq!(node.entry_at(slot)?, Entry::Value(key * 2));
        }
        assert!(search(&mut node, 20, &fx.header)?.is_err());
        assert_eq!(fx.header.max_steps_searched_in_hash(), 1);
        assert!(fx.header.total_hash_steps_searched() > 0);
        Ok(())
    }

    #[test]
    fn negative_keys_probe_by_masked_hash() -> Result<()> {
        let mut fx = Fixture::new(48)?;
        let address = new_leaf(&mut fx, NodeKind::Leaf)?;
        let ctx = fx.ctx();
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        let mut header = TreeHeader::default();
        insert(&mut node, -1, Entry::Value(1), &mut header, true)?;
        insert(&mut node, i32::MIN, Entry::Value(2), &mut header, true)?;
        assert_eq!(probe(&mut node, -1)?.0.map(|_| ()), Ok(()));
        assert_eq!(probe(&mut node, i32::MIN)?.0.map(|_| ()), Ok(()));
        Ok(())
    }

    #[test]
    fn plain_leaf_insert_keeps_keys_sorted_and_counts_moves() -> Result<()> {
        let mut fx = Fixture::new(NodeLayout::node_size_for_interior(8))?;
        let address = new_leaf(&mut fx, NodeKind::Leaf)?;
        let ctx = NodeCtx {
            provider: &fx.cache,
            layout: &fx.layout,
        };
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        for key in [50, 40, 30, 20, 10, 5, 1, 45] {
            insert(&mut node, key, Entry::Value(-key), &mut fx.header, false)?;
        }
        assert_eq!(node.kind(), NodeKind::Leaf);
        assert_eq!(node.sorted_keys()?, vec![1, 5, 10, 20, 30, 40, 45, 50]);
        // 0+1+2+3+4+5+6 shifted for the descending run, then 1 for 45
        assert_eq!(fx.header.moved_members_count, 22);
        assert_eq!(fx.header.hashed_pages_count, 0);
        assert!(insert(&mut node, 20, Entry::Value(0), &mut fx.header, false).is_err());
        Ok(())
    }

    #[test]
    fn moved_members_counter_wraps_instead_of_overflowing() -> Result<()> {
        let mut fx = Fixture::new(NodeLayout::node_size_for_interior(8))?;
        let address = new_leaf(&mut fx, NodeKind::Leaf)?;
        fx.header.moved_members_count = u32::MAX;
        let ctx = NodeCtx {
            provider: &fx.cache,
            layout: &fx.layout,
        };
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        insert(&mut node, 2, Entry::Value(2), &mut fx.header, false)?;
        insert(&mut node, 1, Entry::Value(1), &mut fx.header, false)?;
        assert_eq!(fx.header.moved_members_count, 0);
        assert_eq!(node.sorted_keys()?, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn search_through_a_saturated_hash_leaf_is_corruption() -> Result<()> {
        let mut fx = Fixture::new(48)?;
        let address = new_leaf(&mut fx, NodeKind::HashedLeaf)?;
        let ctx = fx.ctx();
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        // every one of the 5 slots taken, so no free slot ends the sequence
        for slot in 0..fx.layout.hash_capacity as usize {
            node.set_key_at(slot, slot as i32 + 1)?;
        }
        let err = search(&mut node, 6, &fx.header).unwrap_err();
        assert!(err.is_corruption(), "{err}");
        Ok(())
    }

    #[test]
    fn root_leaf_split_grows_the_tree() -> Result<()> {
        let mut fx = Fixture::new(48)?;
        let address = new_leaf(&mut fx, NodeKind::Leaf)?;
        let ctx = NodeCtx {
            provider: &fx.cache,
            layout: &fx.layout,
        };
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        for key in 1..=4 {
            insert(&mut node, key, Entry::Value(key * 10), &mut fx.header, true)?;
        }
        assert!(node.is_full());
        let outcome = split_node(&mut node, None, &mut fx.header, true)?;
        assert_eq!(outcome.median, 3);
        assert_eq!(fx.header.height, 2);
        assert_eq!(fx.header.pages_count, 3);
        assert_eq!(fx.header.hashed_pages_count, 2);
        assert_eq!(node.children_count(), 2);
        assert_eq!(node.next_page()?, outcome.sibling.0 as i32);

        let root = fx.header.root.expect("new root");
        let mut root_view = NodeView::open(ctx, root, BufferMode::Regular)?;
        assert_eq!(root_view.kind(), NodeKind::Interior);
        assert_eq!(root_view.sorted_keys()?, vec![3]);
        assert_eq!(root_view.child_addresses()?, vec![address, outcome.sibling]);

        let mut sibling = NodeView::open(ctx, outcome.sibling, BufferMode::Regular)?;
        let mut keys: Vec<i32> = sibling.leaf_pairs()?.into_iter().map(|(k, _)| k).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![3, 4]);
        Ok(())
    }

    #[test]
    fn interior_split_promotes_the_middle_separator() -> Result<()> {
        let mut fx = Fixture::new(48)?;
        let ctx = NodeCtx {
            provider: &fx.cache,
            layout: &fx.layout,
        };
        let address = allocate_node(ctx, &mut fx.header)?;
        fx.header.root = Some(address);
        fx.header.height = 2;
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        node.set_kind(NodeKind::Interior)?;
        node.set_entry_at(0, Entry::Child(PageAddress(480)))?;
        for (i, key) in [10, 20, 30].into_iter().enumerate() {
            let child = PageAddress(480 + 48 * (i as u32 + 1));
            insert(&mut node, key, Entry::Child(child), &mut fx.header, true)?;
        }
        assert!(node.is_full());
        let outcome = split_node(&mut node, None, &mut fx.header, true)?;
        assert_eq!(outcome.median, 20);
        assert_eq!(node.sorted_keys()?, vec![10]);
        assert_eq!(node.child_addresses()?, vec![PageAddress(480), PageAddress(528)]);
        let mut sibling = NodeView::open(ctx, outcome.sibling, BufferMode::Regular)?;
        assert_eq!(sibling.sorted_keys()?, vec![30]);
        assert_eq!(sibling.child_addresses()?, vec![PageAddress(576), PageAddress(624)]);
        assert_eq!(fx.header.height, 3);
        Ok(())
    }

    #[test]
    fn descent_deeper_than_height_is_corruption() -> Result<()> {
        let mut fx = Fixture::new(48)?;
        let address = new_leaf(&mut fx, NodeKind::Leaf)?;
        let ctx = NodeCtx {
            provider: &fx.cache,
            layout: &fx.layout,
        };
        {
            let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
            for key in 1..=4 {
                insert(&mut node, key, Entry::Value(key), &mut fx.header, true)?;
            }
            split_node(&mut node, None, &mut fx.header, true)?;
        }
        let root = fx.header.root.expect("root");
        fx.header.height = 0;
        let mut node = NodeView::open(ctx, root, BufferMode::Cached)?;
        let err = descend(&mut node, 4, &fx.header, None).unwrap_err();
        assert!(err.is_corruption());
        Ok(())
    }
}
