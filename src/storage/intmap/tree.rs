use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::engine::{self, DescentPath};
use super::header::{FileHeaderStore, HeaderStore, MemHeaderStore, TreeHeader};
use super::layout::NodeLayout;
use super::node::{corrupted, BufferMode, Entry, NodeCtx, NodeKind, NodeView};
use super::options::IntMapOptions;
use super::stats::{estimate_leaf_pages, IntMapStatistics};
use super::verify::{self, ConsistencyReport};
use crate::primitives::pager::{PageBuffer, PageCache, PageProvider};
use crate::types::{IntMapError, PageAddress, Result};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Outcome of [`IntToIntBTree::lookup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The key is mapped to this value.
    Found(i32),
    /// The key is absent; the slot can be handed to [`IntToIntBTree::insert_at`].
    Vacant(VacantSlot),
}

/// Where an absent key would go, as seen by one lookup.
///
/// The slot is only trusted while the tree it came from has not been
/// mutated since; otherwise [`IntToIntBTree::insert_at`] takes the regular
/// insertion path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VacantSlot {
    key: i32,
    leaf: Option<PageAddress>,
    leaf_full: bool,
    instance: u64,
    epoch: u64,
}

impl VacantSlot {
    /// Key that was looked up.
    pub fn key(&self) -> i32 {
        self.key
    }
}

/// Pin on the root page held for the duration of one operation.
struct RootPin {
    page: PageBuffer,
}

impl Drop for RootPin {
    fn drop(&mut self) {
        self.page.release();
    }
}

/// Last page handle used for the root; re-pinned while it stays resident.
#[derive(Default)]
struct RootDescriptor {
    cached: Mutex<Option<(PageAddress, PageBuffer)>>,
}

impl RootDescriptor {
    fn pin(&self, provider: &dyn PageProvider, root: PageAddress) -> Result<RootPin> {
        let mut cached = self.cached.lock();
        if let Some((address, page)) = cached.as_ref() {
            if *address == root && page.try_acquire() {
                return Ok(RootPin { page: page.clone() });
            }
        }
        let page = provider.page_for(root.offset(), false)?;
        *cached = Some((root, page.clone()));
        Ok(RootPin { page })
    }

    fn forget(&self) {
        *self.cached.lock() = None;
    }
}

/// Persistent map from `i32` keys to `i32` values.
///
/// Nodes live in fixed-size pages served by a [`PageProvider`]; the counters
/// and root pointer live in a 40-byte header persisted through a
/// [`HeaderStore`] on [`flush`](Self::flush). Key 0 never reaches the tree:
/// it is kept in the header, since 0 marks a free hashed-leaf slot.
///
/// Lookups take `&self`; mutations take `&mut self`, so writers are
/// serialized by the borrow checker.
pub struct IntToIntBTree {
    provider: Arc<dyn PageProvider>,
    header_store: Box<dyn HeaderStore>,
    layout: NodeLayout,
    options: IntMapOptions,
    header: TreeHeader,
    root: RootDescriptor,
    instance: u64,
    epoch: u64,
    optimized_inserts: u64,
}

impl IntToIntBTree {
    /// Opens the index at `path`, creating it when missing.
    ///
    /// The header lives next to it in `<path>.hdr`.
    pub fn open(path: impl AsRef<Path>, options: IntMapOptions) -> Result<Self> {
        let path = path.as_ref();
        options.validate()?;
        let provider = PageCache::open(path, options.pager_options())?;
        let header_store = FileHeaderStore::for_index(path);
        Self::with_parts(Arc::new(provider), Box::new(header_store), options)
    }

    /// Creates an empty index at `path`, discarding any existing one.
    pub fn create(path: impl AsRef<Path>, options: IntMapOptions) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
        FileHeaderStore::for_index(path).remove()?;
        Self::open(path, options)
    }

    /// Creates an index over a volatile in-memory file.
    pub fn in_memory(options: IntMapOptions) -> Result<Self> {
        options.validate()?;
        let provider = PageCache::in_memory(options.pager_options())?;
        Self::with_parts(Arc::new(provider), Box::new(MemHeaderStore::new()), options)
    }

    /// Assembles an index from its collaborators.
    pub fn with_parts(
        provider: Arc<dyn PageProvider>,
        header_store: Box<dyn HeaderStore>,
        options: IntMapOptions,
    ) -> Result<Self> {
        options.validate()?;
        let layout = NodeLayout::new(options.node_size as usize)?;
        if provider.page_size() % layout.node_size != 0 {
            return Err(IntMapError::Invalid(
                "provider page size must be a multiple of the node size",
            ));
        }
        let file_len = provider.len()?;
        let header = match header_store.load()? {
            Some(bytes) => TreeHeader::decode(&bytes),
            None if file_len > 0 => {
                return Err(corrupted(provider.file_id(), "index pages present without a header"))
            }
            None => TreeHeader::default(),
        };
        if let Some(root) = header.root {
            if root.offset() % layout.node_size as u64 != 0 || root.offset() >= file_len {
                return Err(corrupted(provider.file_id(), "root address outside the index file"));
            }
        }
        debug!(
            target: "sombra_intmap::stats",
            file = %provider.file_id().display(),
            node_size = layout.node_size,
            height = header.height,
            count = header.count,
            pages = header.pages_count,
            "intmap opened"
        );
        Ok(Self {
            provider,
            header_store,
            layout,
            options,
            header,
            root: RootDescriptor::default(),
            instance: NEXT_INSTANCE.fetch_add(1, AtomicOrdering::Relaxed),
            epoch: 0,
            optimized_inserts: 0,
        })
    }

    /// Options this index was opened with.
    pub fn options(&self) -> &IntMapOptions {
        &self.options
    }

    /// Current header counters.
    pub fn header(&self) -> &TreeHeader {
        &self.header
    }

    /// Number of keys stored in tree nodes.
    ///
    /// Key 0 lives in the header and is not counted.
    pub fn len(&self) -> u32 {
        self.header.count
    }

    /// True when no key is mapped, key 0 included.
    pub fn is_empty(&self) -> bool {
        self.header.count == 0 && !self.header.has_zero_key
    }

    fn ctx(&self) -> NodeCtx<'_> {
        NodeCtx {
            provider: &*self.provider,
            layout: &self.layout,
        }
    }

    fn pin_root(&self, root: PageAddress) -> Result<Option<RootPin>> {
        if !self.options.cache_root_buffer {
            return Ok(None);
        }
        self.root.pin(&*self.provider, root).map(Some)
    }

    /// Returns the value mapped to `key`.
    pub fn get(&self, key: i32) -> Result<Option<i32>> {
        match self.lookup(key)? {
            Lookup::Found(value) => Ok(Some(value)),
            Lookup::Vacant(_) => Ok(None),
        }
    }

    /// Looks `key` up and, when absent, remembers where it would be inserted.
    pub fn lookup(&self, key: i32) -> Result<Lookup> {
        let vacant = |leaf, leaf_full| {
            Lookup::Vacant(VacantSlot {
                key,
                leaf,
                leaf_full,
                instance: self.instance,
                epoch: self.epoch,
            })
        };
        if key == 0 {
            return Ok(if self.header.has_zero_key {
                Lookup::Found(self.header.zero_key_value)
            } else {
                vacant(None, false)
            });
        }
        let Some(root) = self.header.root else {
            return Ok(vacant(None, false));
        };
        let pin = self.pin_root(root)?;
        let ctx = self.ctx();
        let mut node = match &pin {
            Some(pin) => NodeView::shared(ctx, root, pin.page.clone())?,
            None => NodeView::open(ctx, root, BufferMode::Cached)?,
        };
        match engine::descend(&mut node, key, &self.header, None)? {
            Ok(slot) => match node.entry_at(slot)? {
                Entry::Value(value) => Ok(Lookup::Found(value)),
                Entry::Child(_) => Err(node.corrupted("descent ended in an interior node")),
            },
            Err(_) => Ok(vacant(Some(node.address()), node.is_full())),
        }
    }

    /// Maps the key of `slot` to `value`.
    ///
    /// Writes straight into the remembered leaf when nothing changed since
    /// the lookup and the leaf had room; otherwise behaves like [`put`](Self::put).
    pub fn insert_at(&mut self, slot: VacantSlot, value: i32) -> Result<()> {
        let reusable = slot.instance == self.instance && slot.epoch == self.epoch && !slot.leaf_full;
        let leaf = match slot.leaf {
            Some(leaf) if reusable => leaf,
            _ => return self.put(slot.key, value),
        };
        self.epoch += 1;
        let ctx = NodeCtx {
            provider: &*self.provider,
            layout: &self.layout,
        };
        let mut node = NodeView::open(ctx, leaf, BufferMode::Cached)?;
        if !node.is_leaf() || node.is_full() {
            return Err(node.corrupted("vacant slot no longer points at a leaf with room"));
        }
        engine::insert(
            &mut node,
            slot.key,
            Entry::Value(value),
            &mut self.header,
            self.options.hashed_leaves,
        )?;
        self.header.count = self.header.count.wrapping_add(1);
        self.optimized_inserts += 1;
        trace!(target: "sombra_intmap::search", key = slot.key, leaf = %leaf, "direct insert");
        Ok(())
    }

    /// Maps `key` to `value`, replacing any previous value.
    pub fn put(&mut self, key: i32, value: i32) -> Result<()> {
        self.epoch += 1;
        if key == 0 {
            self.header.has_zero_key = true;
            self.header.zero_key_value = value;
            return Ok(());
        }
        let root = match self.header.root {
            Some(root) => root,
            None => self.allocate_root()?,
        };
        let mut path = DescentPath::new();
        if self.put_along_path(root, key, value, Some(&mut path))? {
            return Ok(());
        }
        let ctx = NodeCtx {
            provider: &*self.provider,
            layout: &self.layout,
        };
        engine::split_full_suffix(ctx, &path, key, &mut self.header, self.options.hashed_leaves)?;
        let root = self.header.root.ok_or(IntMapError::Invalid("split lost the root"))?;
        if self.put_along_path(root, key, value, None)? {
            return Ok(());
        }
        Err(corrupted(self.provider.file_id(), "leaf still full after splitting"))
    }

    /// Descends to the leaf for `key` and writes there if possible.
    ///
    /// Returns false, leaving the tree untouched, when the key is absent and
    /// the leaf is full.
    fn put_along_path(
        &mut self,
        root: PageAddress,
        key: i32,
        value: i32,
        path: Option<&mut DescentPath>,
    ) -> Result<bool> {
        let pin = if self.options.cache_root_buffer {
            Some(self.root.pin(&*self.provider, root)?)
        } else {
            None
        };
        let ctx = NodeCtx {
            provider: &*self.provider,
            layout: &self.layout,
        };
        let mut node = match &pin {
            Some(pin) => NodeView::shared(ctx, root, pin.page.clone())?,
            None => NodeView::open(ctx, root, BufferMode::Cached)?,
        };
        match engine::descend(&mut node, key, &self.header, path)? {
            Ok(slot) => {
                node.set_entry_at(slot, Entry::Value(value))?;
                Ok(true)
            }
            Err(_) if node.is_full() => Ok(false),
            Err(_) => {
                engine::insert(
                    &mut node,
                    key,
                    Entry::Value(value),
                    &mut self.header,
                    self.options.hashed_leaves,
                )?;
                self.header.count = self.header.count.wrapping_add(1);
                Ok(true)
            }
        }
    }

    fn allocate_root(&mut self) -> Result<PageAddress> {
        let ctx = NodeCtx {
            provider: &*self.provider,
            layout: &self.layout,
        };
        let address = engine::allocate_node(ctx, &mut self.header)?;
        let mut node = NodeView::open(ctx, address, BufferMode::Cached)?;
        node.set_kind(NodeKind::Leaf)?;
        self.header.root = Some(address);
        self.header.height = 1;
        Ok(address)
    }

    /// Calls `visitor` for every mapping until it returns false.
    ///
    /// Dirty pages are forced first. Key 0 comes first, then the leaves in
    /// tree order; records inside a hashed leaf come in slot order. Returns
    /// false when the visitor stopped the walk.
    pub fn process_mappings<F>(&self, mut visitor: F) -> Result<bool>
    where
        F: FnMut(i32, i32) -> bool,
    {
        self.provider.force()?;
        if self.header.has_zero_key && !visitor(0, self.header.zero_key_value) {
            return Ok(false);
        }
        let Some(root) = self.header.root else {
            return Ok(true);
        };
        let max_depth = self.header.height + 1;
        visit_leaves(self.ctx(), root, 1, max_depth, &mut visitor)
    }

    /// Snapshot of the usage counters.
    pub fn statistics(&self) -> Result<IntMapStatistics> {
        let root_children = match self.header.root {
            Some(root) if self.header.height >= 3 => {
                NodeView::open(self.ctx(), root, BufferMode::Regular)?.children_count() as u32
            }
            _ => 0,
        };
        Ok(IntMapStatistics {
            pages: self.header.pages_count,
            count: self.header.count,
            height: self.header.height,
            moved_members: self.header.moved_members_count,
            leaf_pages: estimate_leaf_pages(self.header.height, self.header.pages_count, root_children),
            hashed_pages: self.header.hashed_pages_count,
            max_steps_searched_in_hash: self.header.max_steps_searched_in_hash(),
            hash_search_requests: self.header.hash_search_requests(),
            total_hash_steps_searched: self.header.total_hash_steps_searched(),
            optimized_inserts: self.optimized_inserts,
            node_size: self.layout.node_size as u32,
            file_size: self.provider.len()?,
            pager: self.provider.stats(),
        })
    }

    /// Logs [`statistics`](Self::statistics) through `tracing`.
    pub fn emit_stats(&self) -> Result<()> {
        self.statistics()?.emit_tracing();
        Ok(())
    }

    /// Walks every node and checks the structure against the header.
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        verify::check_consistency(self.ctx(), &self.header)
    }

    /// Forces dirty pages, then persists the header.
    ///
    /// A failed force leaves the previously stored header in place, so it
    /// never names pages that did not reach the file.
    pub fn flush(&mut self) -> Result<()> {
        self.provider.force()?;
        self.header_store.store(&self.header.encode())?;
        debug!(
            target: "sombra_intmap::pager",
            file = %self.provider.file_id().display(),
            count = self.header.count,
            pages = self.header.pages_count,
            "intmap flushed"
        );
        Ok(())
    }

    /// Flushes and closes the page provider.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.root.forget();
        self.provider.close()
    }
}

fn visit_leaves(
    ctx: NodeCtx<'_>,
    address: PageAddress,
    depth: u32,
    max_depth: u32,
    visitor: &mut dyn FnMut(i32, i32) -> bool,
) -> Result<bool> {
    if depth > max_depth {
        return Err(ctx.corrupted("descent exceeded tree height"));
    }
    let mut node = NodeView::open(ctx, address, BufferMode::Regular)?;
    if node.is_leaf() {
        return node.for_each_mapping(visitor);
    }
    // the page may be evicted while children are visited
    let children = node.child_addresses()?;
    drop(node);
    for child in children {
        if !visit_leaves(ctx, child, depth + 1, max_depth, visitor)? {
            return Ok(false);
        }
    }
    Ok(true)
}
