use std::ops::Range;
use std::path::Path;

use tracing::error;

use super::layout::{NodeLayout, KEY_OFFSET, NEXT_PAGE_OFFSET, NODE_HEADER_LEN, HASHED_LEAF_HEADER_LEN, SLOT_LEN};
use crate::primitives::pager::{read_i32, PageBuffer, PageProvider};
use crate::types::{IntMapError, PageAddress, Result};

const FLAGS_SHIFT: u32 = 24;
const COUNT_MASK: i32 = 0xFFFF;
const LEAF_FLAG: i32 = 0x1;
const HASHED_FLAG: i32 = 0x2;

/// Key marking an unused hashed-leaf slot.
pub const HASH_FREE: i32 = 0;

/// How a node is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// Sorted separators with `count + 1` child references.
    Interior,
    /// Sorted `(key, value)` records.
    Leaf,
    /// Open-addressed `(key, value)` records.
    HashedLeaf,
}

impl NodeKind {
    /// True for both leaf kinds.
    pub fn is_leaf(self) -> bool {
        !matches!(self, NodeKind::Interior)
    }

    fn from_flags(flags: i32) -> Option<Self> {
        match flags & (LEAF_FLAG | HASHED_FLAG) {
            0 => Some(NodeKind::Interior),
            LEAF_FLAG => Some(NodeKind::Leaf),
            f if f == LEAF_FLAG | HASHED_FLAG => Some(NodeKind::HashedLeaf),
            _ => None,
        }
    }

    fn flags(self) -> i32 {
        match self {
            NodeKind::Interior => 0,
            NodeKind::Leaf => LEAF_FLAG,
            NodeKind::HashedLeaf => LEAF_FLAG | HASHED_FLAG,
        }
    }
}

/// Payload half of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Entry {
    /// Value of a leaf record.
    Value(i32),
    /// Child reference of an interior node.
    Child(PageAddress),
}

/// Buffer lifecycle of a [`NodeView`] that owns its page access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BufferMode {
    /// Pin for every access and release right after; the unpinned handle is
    /// kept and re-acquired while it stays resident.
    Regular,
    /// Pin once and hold until the view moves or is dropped.
    Cached,
}

enum PageSlot {
    Empty,
    Regular(PageBuffer),
    Cached(PageBuffer),
    /// Lent by the owner of the pin; never released here.
    Shared(PageBuffer),
}

/// Scoped access to a node's page.
///
/// Dropping the guard returns the pin taken for it, which only happens for
/// [`BufferMode::Regular`] views.
pub(crate) struct PageAccess {
    page: PageBuffer,
    release: bool,
}

impl std::ops::Deref for PageAccess {
    type Target = PageBuffer;

    fn deref(&self) -> &PageBuffer {
        &self.page
    }
}

impl Drop for PageAccess {
    fn drop(&mut self) {
        if self.release {
            self.page.release();
        }
    }
}

/// Read-only window over a node's slots, valid for one page access.
pub(crate) struct SlotReader<'b> {
    bytes: &'b [u8],
    base: usize,
}

impl SlotReader<'_> {
    pub(crate) fn key(&self, index: usize) -> i32 {
        read_i32(self.bytes, self.base + index * SLOT_LEN + KEY_OFFSET)
    }

    pub(crate) fn word(&self, index: usize) -> i32 {
        read_i32(self.bytes, self.base + index * SLOT_LEN)
    }
}

/// Shared collaborators of every view over one index.
#[derive(Clone, Copy)]
pub(crate) struct NodeCtx<'t> {
    pub(crate) provider: &'t dyn PageProvider,
    pub(crate) layout: &'t NodeLayout,
}

impl<'t> NodeCtx<'t> {
    pub(crate) fn file(&self) -> &'t Path {
        self.provider.file_id()
    }

    pub(crate) fn corrupted(&self, reason: &'static str) -> IntMapError {
        corrupted(self.file(), reason)
    }
}

pub(crate) fn corrupted(file: &Path, reason: &'static str) -> IntMapError {
    error!(
        target: "sombra_intmap::search",
        file = %file.display(),
        reason,
        "index corruption detected"
    );
    IntMapError::CorruptedIndex {
        file: file.to_path_buf(),
        reason,
    }
}

/// Typed view over the bytes of one node page.
///
/// The header word is read once when the view is positioned and kept in
/// sync by the setters; every slot access goes to the page.
pub(crate) struct NodeView<'t> {
    ctx: NodeCtx<'t>,
    mode: BufferMode,
    address: PageAddress,
    offset_in_page: usize,
    page: PageSlot,
    children_count: u16,
    kind: NodeKind,
}

impl<'t> NodeView<'t> {
    /// Positions a new view at `address`.
    pub(crate) fn open(ctx: NodeCtx<'t>, address: PageAddress, mode: BufferMode) -> Result<Self> {
        let mut view = Self::unpositioned(ctx, mode);
        view.set_address(address)?;
        Ok(view)
    }

    /// Positions a new view at `address` using a page pinned by someone else.
    ///
    /// Moving the view elsewhere drops the lent page and falls back to
    /// [`BufferMode::Cached`].
    pub(crate) fn shared(ctx: NodeCtx<'t>, address: PageAddress, lent: PageBuffer) -> Result<Self> {
        let mut view = Self::unpositioned(ctx, BufferMode::Cached);
        view.position(address)?;
        if lent.page_start() + view.offset_in_page as u64 != address.offset() {
            return Err(IntMapError::Invalid("lent page does not contain the node"));
        }
        view.page = PageSlot::Shared(lent);
        view.sync()?;
        Ok(view)
    }

    fn unpositioned(ctx: NodeCtx<'t>, mode: BufferMode) -> Self {
        Self {
            ctx,
            mode,
            address: PageAddress(0),
            offset_in_page: 0,
            page: PageSlot::Empty,
            children_count: 0,
            kind: NodeKind::Interior,
        }
    }

    fn position(&mut self, address: PageAddress) -> Result<()> {
        let node_size = self.ctx.layout.node_size as u64;
        if address.offset() % node_size != 0 {
            return Err(self.ctx.corrupted("node address is not node aligned"));
        }
        self.dispose();
        self.address = address;
        self.offset_in_page = (address.offset() % self.ctx.provider.page_size() as u64) as usize;
        Ok(())
    }

    /// Moves the view to another node, giving up the previous page.
    pub(crate) fn set_address(&mut self, address: PageAddress) -> Result<()> {
        self.position(address)?;
        self.sync()
    }

    /// Re-reads the header word from the page.
    pub(crate) fn sync(&mut self) -> Result<()> {
        let offset = self.offset_in_page;
        let word = self.access()?.get_int(offset);
        let Some(kind) = NodeKind::from_flags(word >> FLAGS_SHIFT) else {
            return Err(self.ctx.corrupted("unknown node flags"));
        };
        let count = (word & COUNT_MASK) as u16;
        self.kind = kind;
        self.children_count = count;
        if self.over_capacity(count) {
            return Err(self.ctx.corrupted("node count exceeds capacity"));
        }
        Ok(())
    }

    fn over_capacity(&self, count: u16) -> bool {
        match self.kind {
            NodeKind::Interior => count >= self.ctx.layout.max_interior,
            _ => count > self.max_children(),
        }
    }

    pub(crate) fn access(&mut self) -> Result<PageAccess> {
        match &self.page {
            PageSlot::Cached(page) | PageSlot::Shared(page) => {
                return Ok(PageAccess {
                    page: page.clone(),
                    release: false,
                })
            }
            PageSlot::Regular(page) if page.try_acquire() => {
                return Ok(PageAccess {
                    page: page.clone(),
                    release: true,
                })
            }
            _ => {}
        }
        let page = self.ctx.provider.page_for(self.address.offset(), false)?;
        match self.mode {
            BufferMode::Regular => {
                self.page = PageSlot::Regular(page.clone());
                Ok(PageAccess {
                    page,
                    release: true,
                })
            }
            BufferMode::Cached => {
                self.page = PageSlot::Cached(page.clone());
                Ok(PageAccess {
                    page,
                    release: false,
                })
            }
        }
    }

    /// Releases a held pin and forgets the page.
    pub(crate) fn dispose(&mut self) {
        if let PageSlot::Cached(page) = std::mem::replace(&mut self.page, PageSlot::Empty) {
            page.release();
        }
    }

    pub(crate) fn address(&self) -> PageAddress {
        self.address
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }

    pub(crate) fn children_count(&self) -> u16 {
        self.children_count
    }

    pub(crate) fn layout(&self) -> &'t NodeLayout {
        self.ctx.layout
    }

    pub(crate) fn ctx(&self) -> NodeCtx<'t> {
        self.ctx
    }

    pub(crate) fn corrupted(&self, reason: &'static str) -> IntMapError {
        self.ctx.corrupted(reason)
    }

    pub(crate) fn max_children(&self) -> u16 {
        match self.kind {
            NodeKind::Interior => self.ctx.layout.max_interior,
            NodeKind::Leaf => self.ctx.layout.max_leaf,
            NodeKind::HashedLeaf => self.ctx.layout.max_hashed_leaf,
        }
    }

    /// Interior nodes count their trailing child reference as well.
    pub(crate) fn is_full(&self) -> bool {
        let mut count = self.children_count;
        if !self.is_leaf() {
            count += 1;
        }
        count == self.max_children()
    }

    fn reservation(&self) -> usize {
        match self.kind {
            NodeKind::HashedLeaf => HASHED_LEAF_HEADER_LEN,
            _ => NODE_HEADER_LEN,
        }
    }

    /// Physical slots available to the current kind.
    pub(crate) fn slot_limit(&self) -> usize {
        match self.kind {
            NodeKind::HashedLeaf => self.ctx.layout.hash_capacity as usize,
            _ => (self.ctx.layout.node_size - NODE_HEADER_LEN) / SLOT_LEN,
        }
    }

    fn slot_offset(&self, index: usize) -> Result<usize> {
        if index >= self.slot_limit() {
            return Err(self.ctx.corrupted("slot index outside node"));
        }
        Ok(self.offset_in_page + self.reservation() + index * SLOT_LEN)
    }

    fn slot_range(&self, slots: Range<usize>) -> Result<Range<usize>> {
        if slots.end > self.slot_limit() || slots.start > slots.end {
            return Err(self.ctx.corrupted("slot range outside node"));
        }
        let base = self.offset_in_page + self.reservation();
        Ok(base + slots.start * SLOT_LEN..base + slots.end * SLOT_LEN)
    }

    fn update_header(&mut self, f: impl FnOnce(i32) -> i32) -> Result<()> {
        let offset = self.offset_in_page;
        let page = self.access()?;
        let word = page.get_int(offset);
        page.put_int(offset, f(word));
        Ok(())
    }

    /// Writes the record count, leaving the flag bits alone.
    pub(crate) fn set_children_count(&mut self, count: u16) -> Result<()> {
        self.update_header(|word| (word & !COUNT_MASK) | i32::from(count))?;
        self.children_count = count;
        Ok(())
    }

    /// Writes the kind flags; the record count is left alone.
    pub(crate) fn set_kind(&mut self, kind: NodeKind) -> Result<()> {
        let mask = (LEAF_FLAG | HASHED_FLAG) << FLAGS_SHIFT;
        self.update_header(|word| (word & !mask) | (kind.flags() << FLAGS_SHIFT))?;
        self.kind = kind;
        Ok(())
    }

    pub(crate) fn next_page(&mut self) -> Result<i32> {
        let offset = self.offset_in_page + NEXT_PAGE_OFFSET;
        Ok(self.access()?.get_int(offset))
    }

    pub(crate) fn set_next_page(&mut self, next: i32) -> Result<()> {
        let offset = self.offset_in_page + NEXT_PAGE_OFFSET;
        self.access()?.put_int(offset, next);
        Ok(())
    }

    pub(crate) fn key_at(&mut self, index: usize) -> Result<i32> {
        let offset = self.slot_offset(index)? + KEY_OFFSET;
        Ok(self.access()?.get_int(offset))
    }

    pub(crate) fn set_key_at(&mut self, index: usize, key: i32) -> Result<()> {
        let offset = self.slot_offset(index)? + KEY_OFFSET;
        self.access()?.put_int(offset, key);
        Ok(())
    }

    fn word_at(&mut self, index: usize) -> Result<i32> {
        let offset = self.slot_offset(index)?;
        Ok(self.access()?.get_int(offset))
    }

    fn set_word_at(&mut self, index: usize, word: i32) -> Result<()> {
        let offset = self.slot_offset(index)?;
        self.access()?.put_int(offset, word);
        Ok(())
    }

    /// Decodes the payload of slot `index` according to the node kind.
    pub(crate) fn entry_at(&mut self, index: usize) -> Result<Entry> {
        let word = self.word_at(index)?;
        if self.is_leaf() {
            return Ok(Entry::Value(word));
        }
        self.decode_child(word).map(Entry::Child)
    }

    pub(crate) fn set_entry_at(&mut self, index: usize, entry: Entry) -> Result<()> {
        let word = match (entry, self.is_leaf()) {
            (Entry::Value(value), true) => value,
            (Entry::Child(address), false) => -(address.0 as i32),
            _ => return Err(IntMapError::Invalid("entry does not match node kind")),
        };
        self.set_word_at(index, word)
    }

    pub(crate) fn child_at(&mut self, index: usize) -> Result<PageAddress> {
        match self.entry_at(index)? {
            Entry::Child(address) => Ok(address),
            Entry::Value(_) => Err(IntMapError::Invalid("leaf has no children")),
        }
    }

    fn decode_child(&self, word: i32) -> Result<PageAddress> {
        if word > 0 {
            return Err(self.ctx.corrupted("child reference is not negated"));
        }
        let address = PageAddress(word.unsigned_abs());
        if address.offset() % self.ctx.layout.node_size as u64 != 0 {
            return Err(self.ctx.corrupted("child reference is not node aligned"));
        }
        Ok(address)
    }

    /// Child references of an interior node, copied out of the page.
    pub(crate) fn child_addresses(&mut self) -> Result<Vec<PageAddress>> {
        if self.is_leaf() {
            return Ok(Vec::new());
        }
        let count = self.children_count as usize + 1;
        let words = self.with_slots(|slots| (0..count).map(|i| slots.word(i)).collect::<Vec<_>>())?;
        words.into_iter().map(|w| self.decode_child(w)).collect()
    }

    /// Separator keys of an interior node or keys of a sorted leaf.
    pub(crate) fn sorted_keys(&mut self) -> Result<Vec<i32>> {
        let count = self.children_count as usize;
        self.with_slots(|slots| (0..count).map(|i| slots.key(i)).collect())
    }

    /// Runs `f` over the slot area under a single page access.
    pub(crate) fn with_slots<R>(&mut self, f: impl FnOnce(SlotReader<'_>) -> R) -> Result<R> {
        let base = self.offset_in_page + self.reservation();
        let page = self.access()?;
        Ok(page.with_bytes(|bytes| f(SlotReader { bytes, base })))
    }

    pub(crate) fn read_slots(&mut self, slots: Range<usize>) -> Result<Vec<u8>> {
        let range = self.slot_range(slots)?;
        Ok(self.access()?.read_bytes(range.start, range.len()))
    }

    pub(crate) fn write_slots(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
        let range = self.slot_range(at..at + bytes.len() / SLOT_LEN)?;
        self.access()?.write_bytes(range.start, bytes);
        Ok(())
    }

    /// Moves `slots` so that they start at slot `dest`.
    pub(crate) fn move_slots(&mut self, slots: Range<usize>, dest: usize) -> Result<()> {
        let len = slots.len();
        let src = self.slot_range(slots)?;
        let dst = self.slot_range(dest..dest + len)?;
        self.access()?.copy_within(src, dst.start);
        Ok(())
    }

    pub(crate) fn clear_slots(&mut self, slots: Range<usize>) -> Result<()> {
        let range = self.slot_range(slots)?;
        self.access()?.zero(range);
        Ok(())
    }

    /// Copies slot `from` onto slot `to`.
    pub(crate) fn copy_slot(&mut self, from: usize, to: usize) -> Result<()> {
        let key = self.key_at(from)?;
        let word = self.word_at(from)?;
        self.set_key_at(to, key)?;
        self.set_word_at(to, word)
    }

    /// Raw payload word of the trailing child reference.
    pub(crate) fn raw_word(&mut self, index: usize) -> Result<i32> {
        self.word_at(index)
    }

    pub(crate) fn set_raw_word(&mut self, index: usize, word: i32) -> Result<()> {
        self.set_word_at(index, word)
    }

    /// Calls `visitor` for every record of a leaf while the page stays pinned.
    ///
    /// Hashed leaves are visited in physical slot order. Returns false as soon
    /// as the visitor does.
    pub(crate) fn for_each_mapping(&mut self, visitor: &mut dyn FnMut(i32, i32) -> bool) -> Result<bool> {
        if !self.is_leaf() {
            return Err(IntMapError::Invalid("mappings live in leaves only"));
        }
        let pairs = self.leaf_pairs()?;
        for (key, value) in pairs {
            if !visitor(key, value) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Records of a leaf in storage order.
    pub(crate) fn leaf_pairs(&mut self) -> Result<Vec<(i32, i32)>> {
        let (scan, hashed) = match self.kind {
            NodeKind::HashedLeaf => (self.ctx.layout.hash_capacity as usize, true),
            _ => (self.children_count as usize, false),
        };
        self.with_slots(|slots| {
            (0..scan)
                .filter(|&i| !hashed || slots.key(i) != HASH_FREE)
                .map(|i| (slots.key(i), slots.word(i)))
                .collect()
        })
    }
}

impl Drop for NodeView<'_> {
    fn drop(&mut self) {
        self.dispose();
    }
}
