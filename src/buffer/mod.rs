//! # Buffer — the paged, memory-mapped write-ahead overlay
//!
//! The buffer journals every accepted [`Write`] into fixed-capacity
//! memory-mapped pages (see [`page`]) and serves as the in-memory
//! overlay for data that has not yet been transported into the
//! database's indexed blocks. It is the durable half of the write path:
//! a write acknowledged by the buffer survives a crash.
//!
//! ## Concurrency
//!
//! Two locks with distinct disciplines:
//!
//! - the **transport lock** — shared by readers, exclusive for
//!   transport, batch extraction, and purge. A composite read (database
//!   + buffer) holds the shared side for its whole duration so that a
//!   transport cannot move writes between the two halves mid-read.
//! - the **page lock** — guards the page list itself; appends take it
//!   exclusively, iteration takes it shared. Appends are therefore
//!   invisible to the transport discipline: an iterator started before
//!   an append may or may not observe the new write.
//!
//! ## Transport
//!
//! Writes leave the buffer strictly FIFO per page, and pages leave in
//! creation order. Two disciplines exist (mutually exclusive at
//! runtime, selected by the engine):
//!
//! - [`Buffer::transport`] — streaming: move up to `rate` writes from
//!   the oldest page directly into `Database::accept`, sealing database
//!   blocks at page boundaries.
//! - [`Buffer::take_batch`] / [`Buffer::purge`] — batching: snapshot a
//!   run of writes (without advancing cursors), let the engine build an
//!   immutable segment off the critical path, then purge the snapshot
//!   after the segment merges.
//!
//! ## Crash recovery
//!
//! At startup the buffer enumerates page files in creation order,
//! replays each from its persisted head cursor, and repopulates the
//! verify bloom filter. Replay can resurface writes whose transport
//! completed but whose purge did not — the database's deduplication
//! pass reconciles those.

#[cfg(test)]
mod tests;

pub mod page;

use crate::clock::Clock;
use crate::database::{Database, DatabaseError};
use crate::encoding::EncodingError;
use crate::limbo::Limbo;
use crate::model::{Id, Value, Write};
use bloomfilter::Bloom;
use page::Page;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Target false-positive rate for the verify filter.
const BUFFER_FILTER_FP_RATE: f64 = 0.03;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by buffer operations.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Underlying I/O or mmap error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The current page cannot fit the record. Recovered internally by
    /// rolling a new page; never surfaces to callers.
    #[error("page full (need {needed} bytes, {available} available)")]
    Capacity {
        /// Bytes the append needs.
        needed: usize,
        /// Bytes the page has left.
        available: usize,
    },

    /// A single write exceeds an entire empty page.
    #[error("write of {0} bytes exceeds the page capacity")]
    OversizedWrite(usize),

    /// An error surfaced from the database during streaming transport.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn poisoned(_: impl std::fmt::Debug) -> BufferError {
    BufferError::Internal("buffer lock poisoned".into())
}

// ------------------------------------------------------------------------------------------------
// Batch receipt
// ------------------------------------------------------------------------------------------------

/// Identifies the writes a [`Buffer::take_batch`] snapshot covered, so
/// [`Buffer::purge`] can advance exactly those cursors after the
/// corresponding segment merges.
#[derive(Debug, Clone)]
pub struct BatchReceipt {
    /// `(page id, writes taken)` pairs in page order.
    taken: Vec<(u64, usize)>,
}

impl BatchReceipt {
    /// Total writes covered by the receipt.
    pub fn write_count(&self) -> usize {
        self.taken.iter().map(|(_, n)| n).sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Buffer
// ------------------------------------------------------------------------------------------------

/// The paged append-only write-ahead overlay.
pub struct Buffer {
    directory: PathBuf,
    page_size: usize,
    clock: Arc<Clock>,
    pages: RwLock<VecDeque<Page>>,
    transport_lock: RwLock<()>,
    /// Short-circuits `verify` misses; covers every write currently in
    /// the buffer (and, harmlessly, writes since transported).
    filter: Mutex<Option<Bloom<[u8]>>>,
}

impl Buffer {
    /// Opens the buffer rooted at `directory`, replaying any pages left
    /// by a previous process.
    pub fn open(
        directory: impl AsRef<Path>,
        page_size: usize,
        expected_insertions: usize,
        clock: Arc<Clock>,
    ) -> Result<Self, BufferError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;

        let mut filter = Bloom::new_for_fp_rate(expected_insertions.max(1), BUFFER_FILTER_FP_RATE).ok();
        let mut pages = VecDeque::new();
        let mut recovered = 0usize;
        let mut max_version = 0u64;

        for id in page::list_page_ids(&directory)? {
            // Page ids come from the clock; fresh pages must not
            // collide with ids minted by a previous process.
            clock.advance_past(id);
            let page = Page::load(&directory, id)?;
            if let Some(filter) = &mut filter {
                for write in page.untransported() {
                    filter.set(&write.datum_composite());
                }
            }
            for write in page.untransported() {
                max_version = max_version.max(write.version());
            }
            recovered += page.pending();
            if page.is_exhausted() {
                page.delete()?;
            } else {
                pages.push_back(page);
            }
        }
        clock.advance_past(max_version);

        if pages.is_empty() {
            pages.push_back(Page::create(&directory, clock.next(), page_size)?);
        }

        info!(
            pages = pages.len(),
            writes = recovered,
            "buffer opened"
        );

        Ok(Self {
            directory,
            page_size,
            clock,
            pages: RwLock::new(pages),
            transport_lock: RwLock::new(()),
            filter: Mutex::new(filter),
        })
    }

    /// Appends a write to the current page, rolling a new page when the
    /// current one is full. The append is flushed to storage before the
    /// call returns.
    pub fn insert(&self, write: Write) -> Result<(), BufferError> {
        let mut pages = self.pages.write().map_err(poisoned)?;
        let active = pages
            .back_mut()
            .ok_or_else(|| BufferError::Internal("buffer has no active page".into()))?;
        match active.append(&write) {
            Ok(()) => {}
            Err(BufferError::Capacity { needed, .. }) => {
                trace!(needed, "rolling buffer page");
                let mut fresh = Page::create(&self.directory, self.clock.next(), self.page_size)?;
                match fresh.append(&write) {
                    Ok(()) => {}
                    Err(BufferError::Capacity { needed, .. }) => {
                        // Roll back: the empty page stays usable for
                        // ordinary writes, but this one can never fit.
                        pages.push_back(fresh);
                        return Err(BufferError::OversizedWrite(needed));
                    }
                    Err(e) => return Err(e),
                }
                pages.push_back(fresh);
            }
            Err(e) => return Err(e),
        }
        if let Some(filter) = self.filter.lock().map_err(poisoned)?.as_mut() {
            filter.set(&write.datum_composite());
        }
        Ok(())
    }

    /// Takes the shared side of the transport lock. Hold the guard for
    /// the duration of any composite (database + buffer) read.
    pub fn read_guard(&self) -> Result<RwLockReadGuard<'_, ()>, BufferError> {
        self.transport_lock.read().map_err(poisoned)
    }

    /// Number of writes awaiting transport.
    pub fn pending(&self) -> Result<usize, BufferError> {
        Ok(self
            .pages
            .read()
            .map_err(poisoned)?
            .iter()
            .map(Page::pending)
            .sum())
    }

    /// Streaming transport: moves up to `rate` writes from the oldest
    /// page into `db.accept`, sealing database blocks and deleting
    /// pages at page boundaries. Returns the number of writes moved.
    pub fn transport(&self, db: &Database, rate: usize) -> Result<usize, BufferError> {
        let _exclusive = self.transport_lock.write().map_err(poisoned)?;
        let mut pages = self.pages.write().map_err(poisoned)?;

        let mut moved = 0usize;
        while moved < rate {
            let is_active = pages.len() == 1;
            let Some(oldest) = pages.front_mut() else {
                break;
            };
            match oldest.peek() {
                Some(write) => {
                    db.accept(write.clone())?;
                    oldest.advance();
                    moved += 1;
                }
                None => {
                    if is_active {
                        // The active page is drained but keeps
                        // accepting appends.
                        break;
                    }
                    // Sealed and exhausted: make its writes durable in
                    // block form, then delete it.
                    db.sync()?;
                    if let Some(page) = pages.pop_front() {
                        page.delete()?;
                    }
                }
            }
        }
        if moved > 0 {
            trace!(moved, "streaming transport pass");
        }
        Ok(moved)
    }

    /// Snapshots up to `max` writes from the oldest pages without
    /// advancing any cursor. Returns `None` when nothing is pending.
    ///
    /// The caller builds a segment from the snapshot and then calls
    /// [`Buffer::purge`] with the receipt once the segment has merged.
    /// Only one batch may be in flight at a time.
    pub fn take_batch(
        &self,
        max: usize,
    ) -> Result<Option<(Vec<Write>, BatchReceipt)>, BufferError> {
        let _exclusive = self.transport_lock.write().map_err(poisoned)?;
        let pages = self.pages.read().map_err(poisoned)?;

        let mut writes = Vec::new();
        let mut taken = Vec::new();
        for page in pages.iter() {
            if writes.len() >= max {
                break;
            }
            let available = page.untransported();
            let take = available.len().min(max - writes.len());
            if take > 0 {
                writes.extend_from_slice(&available[..take]);
                taken.push((page.id(), take));
            }
        }
        if writes.is_empty() {
            return Ok(None);
        }
        trace!(writes = writes.len(), "batch extracted");
        Ok(Some((writes, BatchReceipt { taken })))
    }

    /// Advances the cursors a batch covered and deletes exhausted
    /// pages. Must be called under the same transport-exclusive
    /// critical section as the segment merge so readers never observe a
    /// write in both halves.
    pub fn purge(&self, receipt: &BatchReceipt) -> Result<(), BufferError> {
        let mut pages = self.pages.write().map_err(poisoned)?;
        for (page_id, count) in &receipt.taken {
            let Some(index) = pages.iter().position(|p| p.id() == *page_id) else {
                return Err(BufferError::Internal(format!(
                    "purge receipt names unknown page {page_id}"
                )));
            };
            let page = &mut pages[index];
            page.advance_by(*count);
            page.persist_head()?;
        }
        while pages.len() > 1 {
            let Some(front) = pages.front() else {
                break;
            };
            if !front.is_exhausted() {
                break;
            }
            if let Some(page) = pages.pop_front() {
                page.delete()?;
            }
        }
        debug!(writes = receipt.write_count(), "batch purged");
        Ok(())
    }

    /// Takes the exclusive side of the transport lock for a critical
    /// section the caller composes (segment merge + purge).
    pub fn transport_guard(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, ()>, BufferError> {
        self.transport_lock.write().map_err(poisoned)
    }

    /// Startup reconciliation: advances past buffered writes whose
    /// transport demonstrably completed before the last shutdown
    /// (their primary revisions already live in sealed blocks), so
    /// replay does not double-count them. Returns the number skipped.
    ///
    /// Durably transported writes always form a prefix of the buffer's
    /// global order, so scanning stops at the first write the database
    /// does not contain.
    pub fn reconcile(&self, db: &Database) -> Result<usize, BufferError> {
        let _exclusive = self.transport_lock.write().map_err(poisoned)?;
        let mut pages = self.pages.write().map_err(poisoned)?;

        let mut skipped = 0usize;
        'pages: for page in pages.iter_mut() {
            while let Some(write) = page.peek() {
                if db.contains_write(write)? {
                    page.advance();
                    skipped += 1;
                } else {
                    break 'pages;
                }
            }
        }
        if skipped > 0 {
            for page in pages.iter_mut() {
                page.persist_head()?;
            }
            while pages.len() > 1 {
                let Some(front) = pages.front() else {
                    break;
                };
                if !front.is_exhausted() {
                    break;
                }
                if let Some(page) = pages.pop_front() {
                    page.delete()?;
                }
            }
            info!(skipped, "reconciled already-transported writes after restart");
        }
        Ok(skipped)
    }

    /// Persists every page's in-memory head cursor and deletes
    /// exhausted pages — the graceful-shutdown checkpoint after a final
    /// transport pass.
    pub fn checkpoint(&self) -> Result<(), BufferError> {
        let _exclusive = self.transport_lock.write().map_err(poisoned)?;
        let mut pages = self.pages.write().map_err(poisoned)?;
        for page in pages.iter_mut() {
            page.persist_head()?;
        }
        while pages.len() > 1 {
            let Some(front) = pages.front() else {
                break;
            };
            if !front.is_exhausted() {
                break;
            }
            if let Some(page) = pages.pop_front() {
                page.delete()?;
            }
        }
        Ok(())
    }

}

impl Limbo for Buffer {
    fn for_each_write(&self, f: &mut dyn FnMut(&Write)) {
        let Ok(pages) = self.pages.read() else {
            return;
        };
        for page in pages.iter() {
            for write in page.untransported() {
                f(write);
            }
        }
    }

    fn verify(&self, key: &str, value: &Value, record: Id, ts: u64) -> bool {
        if let Ok(guard) = self.filter.lock()
            && let Some(filter) = guard.as_ref()
        {
            let composite = crate::model::composite_three(&key.to_string(), value, &record);
            if !filter.check(&composite) {
                return false;
            }
        }
        let mut present = false;
        self.for_each_write(&mut |w| {
            if w.version() <= ts && w.is_datum(key, value, record) {
                present = !present;
            }
        });
        present
    }
}
