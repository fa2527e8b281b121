use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::frame::Frame;
use super::provider::{PageBuffer, PageProvider, PagerStats, PinTable};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::types::{page, IntMapError, Result};

/// Configuration for a [`PageCache`].
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each cached page in bytes.
    pub page_size: usize,
    /// Number of pages to keep resident.
    pub cache_pages: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_STORAGE_PAGE_SIZE,
            cache_pages: 64,
        }
    }
}

struct CacheState {
    frames: Vec<Frame>,
    page_table: HashMap<u64, usize>,
    clock_hand: usize,
    next_epoch: u64,
    len: u64,
    stats: PagerStats,
}

struct CacheCore {
    io: Arc<dyn FileIo>,
    file_id: PathBuf,
    page_size: usize,
    state: Mutex<CacheState>,
    closed: AtomicBool,
}

/// Fixed-size frame pool over a [`FileIo`], evicting with a second-chance clock.
///
/// Pinned frames are never chosen for eviction. Dirty frames are written
/// back when evicted and on [`PageProvider::force`].
pub struct PageCache {
    core: Arc<CacheCore>,
}

impl PageCache {
    /// Opens (or creates) `path` behind a page cache.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let path = path.as_ref();
        let io = Arc::new(StdFileIo::open(path)?);
        Self::with_io(io, path.to_path_buf(), options)
    }

    /// Creates a cache over a volatile in-memory file.
    pub fn in_memory(options: PagerOptions) -> Result<Self> {
        Self::with_io(
            Arc::new(MemFileIo::new()),
            PathBuf::from(":memory:"),
            options,
        )
    }

    /// Wraps an arbitrary [`FileIo`].
    pub fn with_io(io: Arc<dyn FileIo>, file_id: PathBuf, options: PagerOptions) -> Result<Self> {
        if options.page_size < 8 {
            return Err(IntMapError::Invalid("page size smaller than a node header"));
        }
        if options.cache_pages < page::MIN_CACHE_PAGES {
            return Err(IntMapError::Invalid("page cache needs at least 8 frames"));
        }
        let len = io.len()?;
        let frames = (0..options.cache_pages)
            .map(|_| Frame::new(options.page_size))
            .collect();
        debug!(
            target: "sombra_intmap::pager",
            file = %file_id.display(),
            len,
            page_size = options.page_size,
            cache_pages = options.cache_pages,
            "page cache opened"
        );
        Ok(Self {
            core: Arc::new(CacheCore {
                io,
                file_id,
                page_size: options.page_size,
                state: Mutex::new(CacheState {
                    frames,
                    page_table: HashMap::new(),
                    clock_hand: 0,
                    next_epoch: 1,
                    len,
                    stats: PagerStats::default(),
                }),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Number of frames currently holding at least one pin.
    pub fn pinned_frames(&self) -> usize {
        let state = self.core.state.lock();
        state.frames.iter().filter(|f| f.pin_count > 0).count()
    }
}

impl CacheCore {
    fn lookup_or_load(&self, state: &mut CacheState, page_no: u64) -> Result<(usize, bool)> {
        if let Some(&idx) = state.page_table.get(&page_no) {
            return Ok((idx, true));
        }
        let idx = self.obtain_available_frame(state)?;
        self.load_page_into_frame(state, idx, page_no)?;
        state.page_table.insert(page_no, idx);
        Ok((idx, false))
    }

    fn obtain_available_frame(&self, state: &mut CacheState) -> Result<usize> {
        if let Some(idx) = state
            .frames
            .iter()
            .position(|frame| frame.id.is_none() && frame.pin_count == 0)
        {
            return Ok(idx);
        }
        self.run_clock(state)
    }

    fn run_clock(&self, state: &mut CacheState) -> Result<usize> {
        let len = state.frames.len();
        for _ in 0..len * 2 {
            let idx = state.clock_hand;
            state.clock_hand = (state.clock_hand + 1) % len;
            let frame = &mut state.frames[idx];
            if frame.id.is_none() || frame.pin_count > 0 {
                continue;
            }
            if frame.reference {
                frame.reference = false;
                continue;
            }
            self.evict_frame(state, idx)?;
            return Ok(idx);
        }
        Err(IntMapError::Invalid("no eviction candidate available"))
    }

    fn evict_frame(&self, state: &mut CacheState, idx: usize) -> Result<()> {
        self.flush_frame(state, idx)?;
        if let Some(old) = state.frames[idx].id.take() {
            state.page_table.remove(&old);
            trace!(target: "sombra_intmap::pager", page = old, frame = idx, "evicted page");
        }
        let frame = &mut state.frames[idx];
        frame.reference = false;
        frame.pin_count = 0;
        state.stats.evictions += 1;
        Ok(())
    }

    fn load_page_into_frame(&self, state: &mut CacheState, idx: usize, page_no: u64) -> Result<()> {
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        let page_start = page_no * self.page_size as u64;
        let available = state.len.saturating_sub(page_start).min(self.page_size as u64) as usize;
        let frame = &mut state.frames[idx];
        frame.id = Some(page_no);
        frame.epoch = epoch;
        frame.reference = true;
        frame.pin_count = 0;
        let mut bytes = frame.buf.bytes.write();
        bytes.fill(0);
        if available > 0 {
            let readable = self.io.len()?.saturating_sub(page_start).min(available as u64) as usize;
            if readable > 0 {
                self.io.read_at(page_start, &mut bytes[..readable])?;
            }
        }
        Ok(())
    }

    fn flush_frame(&self, state: &mut CacheState, idx: usize) -> Result<()> {
        let frame = &state.frames[idx];
        let Some(page_no) = frame.id else {
            return Ok(());
        };
        if !frame.buf.take_dirty() {
            return Ok(());
        }
        let page_start = page_no * self.page_size as u64;
        let valid = state.len.saturating_sub(page_start).min(self.page_size as u64) as usize;
        let result = {
            let bytes = frame.buf.bytes.read();
            self.io.write_at(page_start, &bytes[..valid])
        };
        if let Err(err) = result {
            frame.buf.mark_dirty();
            return Err(err);
        }
        state.stats.dirty_writebacks += 1;
        Ok(())
    }

    fn force(&self) -> Result<()> {
        let mut state = self.state.lock();
        for idx in 0..state.frames.len() {
            if state.frames[idx].buf.is_dirty() {
                self.flush_frame(&mut state, idx)?;
            }
        }
        if self.io.len()? < state.len {
            self.io.truncate(state.len)?;
        }
        self.io.sync_all()
    }
}

impl PinTable for CacheCore {
    fn try_pin(&self, frame: usize, page_no: u64, epoch: u64) -> bool {
        let mut state = self.state.lock();
        match state.frames.get_mut(frame) {
            Some(f) if f.id == Some(page_no) && f.epoch == epoch => {
                f.pin_count += 1;
                f.reference = true;
                true
            }
            _ => false,
        }
    }

    fn unpin(&self, frame: usize, epoch: u64) {
        let mut state = self.state.lock();
        if let Some(f) = state.frames.get_mut(frame) {
            if f.epoch == epoch && f.pin_count > 0 {
                f.pin_count -= 1;
            }
        }
    }
}

impl PageProvider for PageCache {
    fn page_size(&self) -> usize {
        self.core.page_size
    }

    fn file_id(&self) -> &Path {
        &self.core.file_id
    }

    fn page_for(&self, offset: u64, for_write: bool) -> Result<PageBuffer> {
        if self.core.closed.load(AtomicOrdering::Acquire) {
            return Err(IntMapError::Invalid("page cache is closed"));
        }
        let page_no = offset / self.core.page_size as u64;
        let mut state = self.core.state.lock();
        if offset >= state.len {
            return Err(IntMapError::Invalid("page offset beyond end of file"));
        }
        let (idx, hit) = self.core.lookup_or_load(&mut state, page_no)?;
        if hit {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        let frame = &mut state.frames[idx];
        frame.reference = true;
        frame.pin_count += 1;
        if for_write {
            frame.buf.mark_dirty();
        }
        let pins: Arc<dyn PinTable> = self.core.clone();
        Ok(PageBuffer::new(
            pins,
            Arc::clone(&frame.buf),
            idx,
            page_no,
            frame.epoch,
            self.core.page_size,
        ))
    }

    fn append(&self, len: usize) -> Result<u64> {
        let mut state = self.core.state.lock();
        let start = state.len;
        let end = start + len as u64;
        let page_size = self.core.page_size as u64;
        // resident frames may hold bytes past the old end; the new range must read as zero
        let mut page_no = start / page_size;
        while page_no * page_size < end {
            if let Some(&idx) = state.page_table.get(&page_no) {
                let page_start = page_no * page_size;
                let from = start.max(page_start) - page_start;
                let to = end.min(page_start + page_size) - page_start;
                let frame = &state.frames[idx];
                frame.buf.bytes.write()[from as usize..to as usize].fill(0);
                frame.buf.mark_dirty();
            }
            page_no += 1;
        }
        state.len = end;
        state.stats.appended_bytes += len as u64;
        Ok(start)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.core.state.lock().len)
    }

    fn force(&self) -> Result<()> {
        self.core.force()
    }

    fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        self.core.force()?;
        debug!(
            target: "sombra_intmap::pager",
            file = %self.core.file_id.display(),
            "page cache closed"
        );
        Ok(())
    }

    fn stats(&self) -> PagerStats {
        self.core.state.lock().stats
    }
}
