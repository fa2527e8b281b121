use std::convert::TryInto;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::intmap::node::corrupted;
use crate::types::{PageAddress, Result};

/// Length of the persisted header area.
pub const HEADER_LEN: usize = 40;

const HDR_HEIGHT: Range<usize> = 0..4;
const HDR_PAGES: Range<usize> = 4..8;
const HDR_MOVED_MEMBERS: Range<usize> = 8..12;
const HDR_MAX_HASH_STEPS: Range<usize> = 12..16;
const HDR_COUNT: Range<usize> = 16..20;
const HDR_HASH_REQUESTS: Range<usize> = 20..24;
const HDR_HASH_STEPS: Range<usize> = 24..28;
const HDR_HASHED_PAGES: Range<usize> = 28..32;
const HDR_ROOT: Range<usize> = 32..36;
const HDR_ZERO_VALUE: Range<usize> = 36..40;

const HAS_ZERO_KEY_MASK: u32 = 0xFF00_0000;
const UNDEFINED_ADDRESS: i32 = -1;

/// Counters and root pointer of one index.
///
/// Structural fields change only under `&mut`; the hash-probe counters are
/// bumped by lookups and therefore live in relaxed atomics.
#[derive(Debug, Default)]
pub struct TreeHeader {
    /// Levels from the root to the leaves; 0 while there is no root.
    pub height: u32,
    /// Node pages appended so far.
    pub pages_count: u32,
    /// Records moved by sorted insertions.
    pub moved_members_count: u32,
    /// Records stored in tree nodes; key 0 is not counted.
    pub count: u32,
    /// Leaves currently organised as hash tables.
    pub hashed_pages_count: u32,
    /// Root node, if any record has been stored outside the header.
    pub root: Option<PageAddress>,
    /// Whether key 0 is mapped.
    pub has_zero_key: bool,
    /// Value of key 0 when `has_zero_key` is set.
    pub zero_key_value: i32,
    max_steps_searched_in_hash: AtomicU32,
    hash_search_requests: AtomicU32,
    total_hash_steps_searched: AtomicU32,
}

impl TreeHeader {
    /// Decodes a persisted header.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let height_word = read_u32(bytes, HDR_HEIGHT);
        let root = read_u32(bytes, HDR_ROOT) as i32;
        Self {
            height: height_word & !HAS_ZERO_KEY_MASK,
            has_zero_key: height_word & HAS_ZERO_KEY_MASK != 0,
            pages_count: read_u32(bytes, HDR_PAGES),
            moved_members_count: read_u32(bytes, HDR_MOVED_MEMBERS),
            count: read_u32(bytes, HDR_COUNT),
            hashed_pages_count: read_u32(bytes, HDR_HASHED_PAGES),
            root: (root != UNDEFINED_ADDRESS).then(|| PageAddress(root as u32)),
            zero_key_value: read_u32(bytes, HDR_ZERO_VALUE) as i32,
            max_steps_searched_in_hash: AtomicU32::new(read_u32(bytes, HDR_MAX_HASH_STEPS)),
            hash_search_requests: AtomicU32::new(read_u32(bytes, HDR_HASH_REQUESTS)),
            total_hash_steps_searched: AtomicU32::new(read_u32(bytes, HDR_HASH_STEPS)),
        }
    }

    /// Encodes the header in its persisted form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        let zero_mask = if self.has_zero_key { HAS_ZERO_KEY_MASK } else { 0 };
        write_u32(&mut bytes, HDR_HEIGHT, self.height | zero_mask);
        write_u32(&mut bytes, HDR_PAGES, self.pages_count);
        write_u32(&mut bytes, HDR_MOVED_MEMBERS, self.moved_members_count);
        write_u32(&mut bytes, HDR_MAX_HASH_STEPS, self.max_steps_searched_in_hash());
        write_u32(&mut bytes, HDR_COUNT, self.count);
        write_u32(&mut bytes, HDR_HASH_REQUESTS, self.hash_search_requests());
        write_u32(&mut bytes, HDR_HASH_STEPS, self.total_hash_steps_searched());
        write_u32(&mut bytes, HDR_HASHED_PAGES, self.hashed_pages_count);
        let root = self.root.map_or(UNDEFINED_ADDRESS, |a| a.0 as i32);
        write_u32(&mut bytes, HDR_ROOT, root as u32);
        write_u32(&mut bytes, HDR_ZERO_VALUE, self.zero_key_value as u32);
        bytes
    }

    /// Longest probe sequence seen in a hashed leaf.
    pub fn max_steps_searched_in_hash(&self) -> u32 {
        self.max_steps_searched_in_hash.load(AtomicOrdering::Relaxed)
    }

    /// Number of hashed-leaf probes.
    pub fn hash_search_requests(&self) -> u32 {
        self.hash_search_requests.load(AtomicOrdering::Relaxed)
    }

    /// Sum of probe steps beyond the first slot.
    pub fn total_hash_steps_searched(&self) -> u32 {
        self.total_hash_steps_searched.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn record_hash_probe(&self, steps: u32) {
        self.hash_search_requests.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_hash_steps_searched
            .fetch_add(steps, AtomicOrdering::Relaxed);
        self.max_steps_searched_in_hash
            .fetch_max(steps, AtomicOrdering::Relaxed);
    }
}

fn read_u32(bytes: &[u8; HEADER_LEN], range: Range<usize>) -> u32 {
    let word: [u8; 4] = bytes[range].try_into().unwrap_or([0; 4]);
    u32::from_le_bytes(word)
}

fn write_u32(bytes: &mut [u8; HEADER_LEN], range: Range<usize>, value: u32) {
    bytes[range].copy_from_slice(&value.to_le_bytes());
}

/// Persistence hook for the header area.
pub trait HeaderStore: Send + Sync {
    /// Returns the last stored header, or `None` for a fresh index.
    fn load(&self) -> Result<Option<[u8; HEADER_LEN]>>;
    /// Replaces the stored header.
    fn store(&self, bytes: &[u8; HEADER_LEN]) -> Result<()>;
}

/// Keeps the header in a sidecar file next to the index.
///
/// Writes go to a temporary file that is synced and renamed over the
/// sidecar, so a reader sees either the old or the new header.
#[derive(Clone, Debug)]
pub struct FileHeaderStore {
    path: PathBuf,
}

impl FileHeaderStore {
    /// Store at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<index>.hdr`.
    pub fn for_index(index_path: &Path) -> Self {
        Self::new(sidecar(index_path, "hdr"))
    }

    /// Location of the sidecar file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the sidecar; a missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

fn sidecar(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

impl HeaderStore for FileHeaderStore {
    fn load(&self) -> Result<Option<[u8; HEADER_LEN]>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let header: [u8; HEADER_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| corrupted(&self.path, "header file has the wrong length"))?;
        Ok(Some(header))
    }

    fn store(&self, bytes: &[u8; HEADER_LEN]) -> Result<()> {
        let tmp = sidecar(&self.path, "tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Header kept in memory; clones share the same slot.
#[derive(Clone, Debug, Default)]
pub struct MemHeaderStore {
    slot: Arc<Mutex<Option<[u8; HEADER_LEN]>>>,
}

impl MemHeaderStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stored bytes.
    pub fn bytes(&self) -> Option<[u8; HEADER_LEN]> {
        *self.slot.lock()
    }

    /// Overwrites the stored bytes.
    pub fn set_bytes(&self, bytes: [u8; HEADER_LEN]) {
        *self.slot.lock() = Some(bytes);
    }
}

impl HeaderStore for MemHeaderStore {
    fn load(&self) -> Result<Option<[u8; HEADER_LEN]>> {
        Ok(self.bytes())
    }

    fn store(&self, bytes: &[u8; HEADER_LEN]) -> Result<()> {
        self.set_bytes(*bytes);
        Ok(())
    }
}
