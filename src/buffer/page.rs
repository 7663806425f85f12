//! A single memory-mapped buffer page.
//!
//! Each page is a fixed-capacity file mapped read-write:
//!
//! ```text
//! head:4 | (len:4 | write bytes)*
//! ```
//!
//! The first four bytes persist the **head cursor** — the index of the
//! smallest write not yet durably transported. The remainder is an
//! append-only run of length-prefixed [`Write`]s; the untouched tail of
//! the file is zero, so a zero length prefix marks the end of valid
//! data during recovery.
//!
//! A page moves through three states: *active* (the newest page,
//! accepting appends), *sealed* (full, awaiting transport), and
//! *exhausted* (every write transported — the file is deleted). The
//! page itself only tracks its cursors; the buffer decides which page
//! is active.

use crate::encoding::{Decode, encode_to_vec};
use crate::model::Write;
use memmap2::MmapMut;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use super::BufferError;

/// Bytes reserved for the head cursor at the start of the file.
pub(crate) const HEAD_SIZE: usize = 4;

/// Bytes of the per-record length prefix.
const LEN_SIZE: usize = 4;

/// Extension of buffer page files.
pub const PAGE_EXT: &str = "buf";

/// One memory-mapped, append-only run of writes.
pub(crate) struct Page {
    id: u64,
    path: PathBuf,
    mmap: MmapMut,
    capacity: usize,

    /// Next append offset within the file.
    append_at: usize,

    /// Parsed writes, in append order.
    writes: Vec<Write>,

    /// Index of the next write to hand to transport. At least
    /// `durable_head`; runs ahead of it between transports.
    head: usize,

    /// The head cursor as persisted in the file.
    durable_head: usize,
}

impl Page {
    /// Creates a fresh page of `capacity` bytes.
    pub(crate) fn create(
        directory: &Path,
        id: u64,
        capacity: usize,
    ) -> Result<Self, BufferError> {
        let path = page_path(directory, id);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(capacity as u64)?;
        // SAFETY: the mapping is private to this process; the buffer
        // serialises all mutation behind its page lock.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        debug!(id, capacity, "buffer page created");
        Ok(Self {
            id,
            path,
            mmap,
            capacity,
            append_at: HEAD_SIZE,
            writes: Vec::new(),
            head: 0,
            durable_head: 0,
        })
    }

    /// Loads an existing page, replaying its records from the persisted
    /// head cursor.
    pub(crate) fn load(directory: &Path, id: u64) -> Result<Self, BufferError> {
        let path = page_path(directory, id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let capacity = file.metadata()?.len() as usize;
        if capacity < HEAD_SIZE {
            return Err(BufferError::Internal(format!(
                "page {id} shorter than its head cursor"
            )));
        }
        // SAFETY: see `create`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let durable_head = u32::from_be_bytes([mmap[0], mmap[1], mmap[2], mmap[3]]) as usize;

        let mut writes = Vec::new();
        let mut offset = HEAD_SIZE;
        while offset + LEN_SIZE <= capacity {
            let len =
                u32::from_be_bytes([mmap[offset], mmap[offset + 1], mmap[offset + 2], mmap[offset + 3]])
                    as usize;
            if len == 0 {
                break;
            }
            if offset + LEN_SIZE + len > capacity {
                // A torn append at the tail; everything before it is
                // intact.
                warn!(id, offset, "torn record at page tail ignored");
                break;
            }
            let record = &mmap[offset + LEN_SIZE..offset + LEN_SIZE + len];
            match Write::decode_from(record) {
                Ok((write, _)) => writes.push(write),
                Err(e) => {
                    warn!(id, offset, error = %e, "undecodable record ends page replay");
                    break;
                }
            }
            offset += LEN_SIZE + len;
        }

        if durable_head > writes.len() {
            return Err(BufferError::Internal(format!(
                "page {id} head cursor {durable_head} beyond its {} writes",
                writes.len()
            )));
        }

        debug!(
            id,
            writes = writes.len(),
            head = durable_head,
            "buffer page loaded"
        );
        Ok(Self {
            id,
            path,
            mmap,
            capacity,
            append_at: offset,
            writes,
            head: durable_head,
            durable_head,
        })
    }

    /// The page id (creation timestamp).
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Appends a write, flushing the touched region to storage.
    ///
    /// Returns `BufferError::Capacity` when the record does not fit —
    /// the buffer recovers by rolling a new page.
    pub(crate) fn append(&mut self, write: &Write) -> Result<(), BufferError> {
        let bytes = encode_to_vec(write)?;
        let needed = LEN_SIZE + bytes.len();
        if self.append_at + needed > self.capacity {
            return Err(BufferError::Capacity {
                needed,
                available: self.capacity.saturating_sub(self.append_at),
            });
        }
        let start = self.append_at;
        self.mmap[start..start + LEN_SIZE]
            .copy_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.mmap[start + LEN_SIZE..start + needed].copy_from_slice(&bytes);
        self.mmap.flush_range(start, needed)?;
        self.append_at += needed;
        self.writes.push(write.clone());
        trace!(id = self.id, offset = start, "write appended to page");
        Ok(())
    }

    /// The writes not yet handed to transport.
    pub(crate) fn untransported(&self) -> &[Write] {
        &self.writes[self.head..]
    }

    /// Number of writes awaiting transport.
    pub(crate) fn pending(&self) -> usize {
        self.writes.len() - self.head
    }

    /// Total writes on the page.
    pub(crate) fn len(&self) -> usize {
        self.writes.len()
    }

    /// The write at the in-memory head, if any remains.
    pub(crate) fn peek(&self) -> Option<&Write> {
        self.writes.get(self.head)
    }

    /// Advances the in-memory head past one transported write.
    pub(crate) fn advance(&mut self) {
        debug_assert!(self.head < self.writes.len());
        self.head += 1;
    }

    /// Advances the in-memory head past `count` transported writes.
    pub(crate) fn advance_by(&mut self, count: usize) {
        debug_assert!(self.head + count <= self.writes.len());
        self.head += count;
    }

    /// Persists the in-memory head into the file's head cursor.
    pub(crate) fn persist_head(&mut self) -> Result<(), BufferError> {
        let head = u32::try_from(self.head)
            .map_err(|_| BufferError::Internal("page head exceeds u32".into()))?;
        self.mmap[..HEAD_SIZE].copy_from_slice(&head.to_be_bytes());
        self.mmap.flush_range(0, HEAD_SIZE)?;
        self.durable_head = self.head;
        Ok(())
    }

    /// Whether every write on the page has been transported.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.head == self.writes.len()
    }

    /// Deletes the page file. Consumes the page; the mapping drops
    /// first.
    pub(crate) fn delete(self) -> Result<(), BufferError> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "exhausted page deleted");
        Ok(())
    }
}

/// The file path of page `id` in `directory`.
pub(crate) fn page_path(directory: &Path, id: u64) -> PathBuf {
    directory.join(format!("{id}.{PAGE_EXT}"))
}

/// Lists the ids of all page files in `directory`, ascending (creation
/// order).
pub(crate) fn list_page_ids(directory: &Path) -> Result<Vec<u64>, BufferError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(PAGE_EXT)
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            && let Ok(id) = stem.parse::<u64>()
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
