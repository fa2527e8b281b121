use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use super::frame::FrameBuf;
use crate::types::Result;

/// Counters describing page-cache behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagerStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of page evictions from cache.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub dirty_writebacks: u64,
    /// Bytes appended to the logical end of the file.
    pub appended_bytes: u64,
}

/// Source of fixed-size page buffers addressed by file offset.
///
/// Buffers come back pinned: the provider will not evict or reuse the
/// underlying frame until the pin is returned through
/// [`PageBuffer::release`].
pub trait PageProvider: Send + Sync + 'static {
    /// Size in bytes of every buffer this provider hands out.
    fn page_size(&self) -> usize;
    /// Identity of the backing file, reported in corruption errors.
    fn file_id(&self) -> &Path;
    /// Returns the page containing `offset`, pinned once.
    fn page_for(&self, offset: u64, for_write: bool) -> Result<PageBuffer>;
    /// Grows the logical file by `len` zeroed bytes and returns where they start.
    fn append(&self, len: usize) -> Result<u64>;
    /// Logical length of the file.
    fn len(&self) -> Result<u64>;
    /// Returns true when nothing has been appended yet.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Writes back every dirty page and syncs the file.
    fn force(&self) -> Result<()>;
    /// Forces and stops serving pages.
    fn close(&self) -> Result<()>;
    /// Snapshot of cache counters.
    fn stats(&self) -> PagerStats {
        PagerStats::default()
    }
}

/// Pin bookkeeping a [`PageBuffer`] reports back to.
pub trait PinTable: Send + Sync {
    /// Pins `frame` again if it still holds `page_no` at `epoch`.
    fn try_pin(&self, frame: usize, page_no: u64, epoch: u64) -> bool;
    /// Returns one pin on `frame`.
    fn unpin(&self, frame: usize, epoch: u64);
}

/// Handle to one cached page.
///
/// The handle itself does not own a pin; whoever obtained it from
/// [`PageProvider::page_for`] or a successful [`PageBuffer::try_acquire`]
/// must call [`PageBuffer::release`] exactly once for that pin. Clones share
/// the same frame and are how a pinned buffer is lent to another reader.
#[derive(Clone)]
pub struct PageBuffer {
    pins: Arc<dyn PinTable>,
    buf: Arc<FrameBuf>,
    frame: usize,
    page_no: u64,
    epoch: u64,
    page_start: u64,
}

impl PageBuffer {
    pub(crate) fn new(
        pins: Arc<dyn PinTable>,
        buf: Arc<FrameBuf>,
        frame: usize,
        page_no: u64,
        epoch: u64,
        page_size: usize,
    ) -> Self {
        Self {
            pins,
            buf,
            frame,
            page_no,
            epoch,
            page_start: page_no * page_size as u64,
        }
    }

    /// File offset of the first byte of this page.
    pub fn page_start(&self) -> u64 {
        self.page_start
    }

    /// Re-pins the page; false means it was evicted and must be fetched again.
    pub fn try_acquire(&self) -> bool {
        self.pins.try_pin(self.frame, self.page_no, self.epoch)
    }

    /// Returns one pin.
    pub fn release(&self) {
        self.pins.unpin(self.frame, self.epoch);
    }

    /// Reads a little-endian word at `offset`.
    pub fn get_int(&self, offset: usize) -> i32 {
        let bytes = self.buf.bytes.read();
        read_i32(&bytes, offset)
    }

    /// Writes a little-endian word at `offset`.
    pub fn put_int(&self, offset: usize, value: i32) {
        let mut bytes = self.buf.bytes.write();
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.buf.mark_dirty();
    }

    /// Copies `len` bytes starting at `offset` out of the page.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.buf.bytes.read()[offset..offset + len].to_vec()
    }

    /// Copies `src` into the page at `offset`.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.buf.bytes.write();
        bytes[offset..offset + src.len()].copy_from_slice(src);
        self.buf.mark_dirty();
    }

    /// Moves a byte range inside the page; ranges may overlap.
    pub fn copy_within(&self, src: Range<usize>, dest: usize) {
        self.buf.bytes.write().copy_within(src, dest);
        self.buf.mark_dirty();
    }

    /// Fills a byte range with zeros.
    pub fn zero(&self, range: Range<usize>) {
        self.buf.bytes.write()[range].fill(0);
        self.buf.mark_dirty();
    }

    /// Runs `f` over the raw page bytes under a single read lock.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.buf.bytes.read();
        f(&bytes)
    }
}

/// Decodes a little-endian word from raw page bytes.
#[inline]
pub fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
