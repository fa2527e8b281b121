use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bytes of one cached storage page plus its dirty bit.
pub(crate) struct FrameBuf {
    pub bytes: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl FrameBuf {
    pub fn new(page_size: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

pub(crate) struct Frame {
    /// Storage page number held by this frame.
    pub id: Option<u64>,
    pub buf: Arc<FrameBuf>,
    pub reference: bool,
    pub pin_count: u32,
    /// Bumped every time the frame is reassigned so stale handles can tell.
    pub epoch: u64,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            id: None,
            buf: Arc::new(FrameBuf::new(page_size)),
            reference: false,
            pin_count: 0,
            epoch: 0,
        }
    }
}
