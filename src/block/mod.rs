//! # Block — sorted immutable runs of revisions
//!
//! A [`Block`] is a collection of [`Revision`]s from one family. It is
//! born **mutable** — an in-memory sorted set accepting inserts — and
//! becomes **immutable** exactly once, when [`Block::sync`] serialises
//! it to disk. Thereafter the same `Block` value serves reads from a
//! memory-mapped file and rejects inserts.
//!
//! ## On-disk layout
//!
//! Three sibling files share the block id:
//!
//! ```text
//! <id>.blk    (len:4 | revision bytes)*      canonical sort order
//! <id>.fltr   serialized bloom filter
//! <id>.indx   stats header | manifest entry table
//! ```
//!
//! Canonical sort order is `locator ascending → key ascending → version
//! ascending`. The bloom filter holds the `(locator)`, `(locator, key)`
//! and `(locator, key, value)` composites of every revision; the
//! manifest maps each distinct `locator` and `(locator, key)` prefix to
//! its `[start, end)` byte range in the `.blk` file.
//!
//! `sync` fsyncs the filter and manifest **before** the block file; a
//! block is durable only once all three files are.
//!
//! ## Concurrency
//!
//! A reader/writer master lock guards each block: `might_contain`,
//! `seek`, and `len` take the shared side; `insert` and `sync` take the
//! exclusive side. Sealed blocks are effectively lock-free — the shared
//! side never contends once no writer exists.
//!
//! ## Deduplication
//!
//! Crash recovery can replay a buffer page whose writes had already
//! been transported, producing the same `(locator, key, value, version,
//! action)` tuple in two blocks. [`Block::rewrite_omitting`] rewrites a
//! sealed block without a set of such tuples, swapping the files
//! atomically via a temporary sibling and rename.

#[cfg(test)]
mod tests;

pub mod manifest;

pub use manifest::{BlockStats, Manifest};

use crate::encoding::{Decode, Encode, EncodingError, decode_from_slice, encode_to_vec};
use crate::model::{Action, Component, Revision, composite_one, composite_three, composite_two};
use bloomfilter::Bloom;
use memmap2::Mmap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Target false-positive rate for block bloom filters.
const BLOCK_FILTER_FP_RATE: f64 = 0.03;

/// Extension of the revision data file.
pub const BLOCK_EXT: &str = "blk";

/// Extension of the bloom filter file.
pub const FILTER_EXT: &str = "fltr";

/// Extension of the stats + manifest file.
pub const MANIFEST_EXT: &str = "indx";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block operations.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Insert or sync was attempted on a block in the wrong state — a
    /// programmer error, not a recoverable condition.
    #[error("Block {0} is immutable")]
    Immutable(u64),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// State
// ------------------------------------------------------------------------------------------------

enum State<L, K, V> {
    /// Accepting inserts; nothing on disk yet.
    Mutable {
        revisions: BTreeSet<Revision<L, K, V>>,
        filter: Option<Bloom<[u8]>>,
        min_version: u64,
        max_version: u64,
    },

    /// Sealed; reads go through the mmap and manifest.
    Immutable {
        mmap: Mmap,
        manifest: Manifest,
        filter: Option<Bloom<[u8]>>,
        stats: BlockStats,
    },
}

// ------------------------------------------------------------------------------------------------
// Block
// ------------------------------------------------------------------------------------------------

/// A sorted, filter-indexed, manifest-indexed run of revisions.
///
/// See the [module-level documentation](self) for layout, concurrency,
/// and lifecycle details.
pub struct Block<L, K, V> {
    id: u64,
    directory: PathBuf,
    expected_insertions: usize,
    state: RwLock<State<L, K, V>>,
}

impl<L: Component, K: Component, V: Component> Block<L, K, V> {
    /// Creates a fresh mutable block with the given id.
    pub fn create(directory: impl AsRef<Path>, id: u64, expected_insertions: usize) -> Self {
        Self {
            id,
            directory: directory.as_ref().to_path_buf(),
            expected_insertions,
            state: RwLock::new(State::Mutable {
                revisions: BTreeSet::new(),
                filter: new_filter(expected_insertions),
                min_version: u64::MAX,
                max_version: 0,
            }),
        }
    }

    /// Opens a sealed block from its three on-disk files.
    pub fn open(
        directory: impl AsRef<Path>,
        id: u64,
        streaming_threshold: usize,
    ) -> Result<Self, BlockError> {
        let directory = directory.as_ref().to_path_buf();
        let blk = block_path(&directory, id, BLOCK_EXT);
        let fltr = block_path(&directory, id, FILTER_EXT);
        let indx = block_path(&directory, id, MANIFEST_EXT);

        let file = File::open(&blk)?;
        // SAFETY: sealed block files are never modified after the
        // rename that publishes them, and the mapping is read-only.
        let mmap = unsafe { Mmap::map(&file)? };

        let filter_bytes = fs::read(&fltr)?;
        let filter = match Bloom::from_slice(&filter_bytes) {
            Ok(f) => Some(f),
            Err(e) => {
                // A corrupt filter only loses the short-circuit; seeks
                // still answer correctly through the manifest.
                warn!(id, error = %e, "block filter unreadable, disabling");
                None
            }
        };

        let indx_bytes = fs::read(&indx)?;
        let (stats, header_len) = BlockStats::decode_from(&indx_bytes)?;
        if stats.schema_version != manifest::SCHEMA_VERSION {
            return Err(BlockError::Internal(format!(
                "block {id} has unsupported schema version {}",
                stats.schema_version
            )));
        }
        let manifest = Manifest::load(indx_bytes[header_len..].to_vec(), streaming_threshold)?;

        debug!(id, revisions = stats.count, "block opened");

        Ok(Self {
            id,
            directory,
            expected_insertions: 0,
            state: RwLock::new(State::Immutable {
                mmap,
                manifest,
                filter,
                stats,
            }),
        })
    }

    /// The block id (a monotonic timestamp assigned at creation).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the block still accepts inserts.
    pub fn is_mutable(&self) -> bool {
        matches!(
            self.state.read().ok().as_deref(),
            Some(State::Mutable { .. })
        )
    }

    /// Number of revisions in the block.
    pub fn len(&self) -> Result<u64, BlockError> {
        match &*read_state(&self.state)? {
            State::Mutable { revisions, .. } => Ok(revisions.len() as u64),
            State::Immutable { stats, .. } => Ok(stats.count),
        }
    }

    /// Whether the block holds no revisions.
    pub fn is_empty(&self) -> Result<bool, BlockError> {
        Ok(self.len()? == 0)
    }

    /// The sealed block's stats, or the running min/max for a mutable
    /// block.
    pub fn stats(&self) -> Result<BlockStats, BlockError> {
        match &*read_state(&self.state)? {
            State::Mutable {
                revisions,
                min_version,
                max_version,
                ..
            } => Ok(BlockStats {
                schema_version: manifest::SCHEMA_VERSION,
                count: revisions.len() as u64,
                min_version: *min_version,
                max_version: *max_version,
            }),
            State::Immutable { stats, .. } => Ok(*stats),
        }
    }

    /// Appends a revision. Only legal while mutable.
    ///
    /// Returns a copy of the inserted revision — the receipt consumed
    /// by segment merges for cache invalidation.
    pub fn insert(
        &self,
        locator: L,
        key: K,
        value: V,
        version: u64,
        action: Action,
    ) -> Result<Revision<L, K, V>, BlockError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| BlockError::Internal("block lock poisoned".into()))?;
        match &mut *state {
            State::Mutable {
                revisions,
                filter,
                min_version,
                max_version,
            } => {
                let revision = Revision::new(locator, key, value, version, action);
                if let Some(filter) = filter {
                    filter.set(&revision.locator_composite());
                    filter.set(&revision.prefix_composite());
                    filter.set(&revision.datum_composite());
                }
                *min_version = (*min_version).min(version);
                *max_version = (*max_version).max(version);
                revisions.insert(revision.clone());
                Ok(revision)
            }
            State::Immutable { .. } => Err(BlockError::Immutable(self.id)),
        }
    }

    /// Whether the block might contain any revision for `locator`.
    /// `false` is authoritative; `true` requires a seek.
    pub fn might_contain_locator(&self, locator: &L) -> Result<bool, BlockError> {
        self.check_filter(&composite_one(locator))
    }

    /// Whether the block might contain any revision for `(locator, key)`.
    pub fn might_contain_prefix(&self, locator: &L, key: &K) -> Result<bool, BlockError> {
        self.check_filter(&composite_two(locator, key))
    }

    /// Whether the block might contain a revision for the full datum.
    pub fn might_contain_datum(
        &self,
        locator: &L,
        key: &K,
        value: &V,
    ) -> Result<bool, BlockError> {
        self.check_filter(&composite_three(locator, key, value))
    }

    fn check_filter(&self, composite: &[u8]) -> Result<bool, BlockError> {
        match &*read_state(&self.state)? {
            State::Mutable { filter, .. } | State::Immutable { filter, .. } => {
                Ok(filter.as_ref().is_none_or(|f| f.check(composite)))
            }
        }
    }

    /// Returns the revisions matching `locator` (and `key`, when given)
    /// in canonical sort order.
    ///
    /// Mutable blocks walk the in-memory sorted set; sealed blocks map
    /// the manifest-identified byte range and parse it.
    pub fn seek(&self, locator: &L, key: Option<&K>) -> Result<Vec<Revision<L, K, V>>, BlockError> {
        match &*read_state(&self.state)? {
            State::Mutable { revisions, .. } => Ok(revisions
                .iter()
                .filter(|r| r.locator() == locator && key.is_none_or(|k| r.key() == k))
                .cloned()
                .collect()),
            State::Immutable { mmap, manifest, .. } => {
                let composite = match key {
                    Some(key) => composite_two(locator, key),
                    None => composite_one(locator),
                };
                let Some((start, end)) = manifest.lookup(&composite) else {
                    return Ok(Vec::new());
                };
                let slice = range_slice(mmap, start, end, self.id)?;
                let mut out = Vec::new();
                for revision in RevisionSlice::new(slice) {
                    let revision: Revision<L, K, V> = revision?;
                    // Guard against the (vanishing) chance of a
                    // manifest hash collision pointing at a foreign
                    // range.
                    if revision.locator() == locator && key.is_none_or(|k| revision.key() == k) {
                        out.push(revision);
                    }
                }
                trace!(id = self.id, matched = out.len(), "block seek");
                Ok(out)
            }
        }
    }

    /// Every revision in the block in canonical order. Used by the
    /// deduplication pass and by tests; linear in block size.
    pub fn revisions(&self) -> Result<Vec<Revision<L, K, V>>, BlockError> {
        match &*read_state(&self.state)? {
            State::Mutable { revisions, .. } => Ok(revisions.iter().cloned().collect()),
            State::Immutable { mmap, .. } => {
                let mut out = Vec::new();
                for revision in RevisionSlice::new(&mmap[..]) {
                    out.push(revision?);
                }
                Ok(out)
            }
        }
    }

    /// Serialises the block to disk and transitions it to immutable.
    ///
    /// Once-only; a second call (or a sync of an empty block) is a
    /// programmer error. The in-memory revision set is dropped after
    /// the swap so its memory can be reclaimed while the `Block` value
    /// lives on as a read handle.
    pub fn sync(&self) -> Result<(), BlockError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| BlockError::Internal("block lock poisoned".into()))?;
        let State::Mutable {
            revisions,
            min_version,
            max_version,
            ..
        } = &*state
        else {
            return Err(BlockError::Immutable(self.id));
        };
        if revisions.is_empty() {
            return Err(BlockError::Internal(format!(
                "cannot sync empty block {}",
                self.id
            )));
        }

        let stats = BlockStats {
            schema_version: manifest::SCHEMA_VERSION,
            count: revisions.len() as u64,
            min_version: *min_version,
            max_version: *max_version,
        };
        let sorted: Vec<&Revision<L, K, V>> = revisions.iter().collect();
        let (mmap, manifest, filter) = write_files(
            &self.directory,
            self.id,
            &sorted,
            stats,
            revisions.len().max(1) * 3,
        )?;

        info!(id = self.id, revisions = stats.count, "block sealed");

        *state = State::Immutable {
            mmap,
            manifest,
            filter,
            stats,
        };
        Ok(())
    }

    /// Rewrites this sealed block omitting every revision whose encoded
    /// bytes appear in `omit`, atomically swapping the files. Returns
    /// the number of revisions dropped.
    ///
    /// Rewriting away *all* revisions is not supported here; callers
    /// detect that case via [`Block::revisions`] and delete the block
    /// instead.
    pub fn rewrite_omitting(&self, omit: &HashSet<Vec<u8>>) -> Result<usize, BlockError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| BlockError::Internal("block lock poisoned".into()))?;
        let State::Immutable { mmap, .. } = &*state else {
            return Err(BlockError::Internal(format!(
                "cannot rewrite mutable block {}",
                self.id
            )));
        };

        let mut kept: Vec<Revision<L, K, V>> = Vec::new();
        let mut dropped = 0usize;
        let mut min_version = u64::MAX;
        let mut max_version = 0u64;
        for revision in RevisionSlice::new(&mmap[..]) {
            let revision: Revision<L, K, V> = revision?;
            let encoded = encode_to_vec(&revision)?;
            if omit.contains(&encoded) {
                dropped += 1;
            } else {
                min_version = min_version.min(revision.version());
                max_version = max_version.max(revision.version());
                kept.push(revision);
            }
        }
        if dropped == 0 {
            return Ok(0);
        }
        if kept.is_empty() {
            return Err(BlockError::Internal(format!(
                "rewrite would empty block {}",
                self.id
            )));
        }

        let stats = BlockStats {
            schema_version: manifest::SCHEMA_VERSION,
            count: kept.len() as u64,
            min_version,
            max_version,
        };
        let refs: Vec<&Revision<L, K, V>> = kept.iter().collect();
        let (mmap, manifest, filter) =
            write_files(&self.directory, self.id, &refs, stats, kept.len().max(1) * 3)?;

        info!(id = self.id, dropped, "block rewritten without duplicates");

        *state = State::Immutable {
            mmap,
            manifest,
            filter,
            stats,
        };
        Ok(dropped)
    }

    /// Deletes the block's files. The block must be sealed; the caller
    /// is responsible for having removed it from service first.
    pub fn delete_files(&self) -> Result<(), BlockError> {
        for ext in [BLOCK_EXT, FILTER_EXT, MANIFEST_EXT] {
            let path = block_path(&self.directory, self.id, ext);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// File construction
// ------------------------------------------------------------------------------------------------

/// Serialises `revisions` (already in canonical order) into the three
/// block files, writing to temporaries and renaming into place, with
/// the filter and manifest fsynced before the block file.
fn write_files<L: Component, K: Component, V: Component>(
    directory: &Path,
    id: u64,
    revisions: &[&Revision<L, K, V>],
    stats: BlockStats,
    filter_insertions: usize,
) -> Result<(Mmap, Manifest, Option<Bloom<[u8]>>), BlockError> {
    // 1. Encode the data file, tracking prefix ranges and the filter.
    let mut data = Vec::new();
    let mut ranges: BTreeMap<[u8; 16], (u64, u64)> = BTreeMap::new();
    let mut filter = new_filter(filter_insertions);
    let mut open_locator: Option<(Vec<u8>, u64)> = None;
    let mut open_prefix: Option<(Vec<u8>, u64)> = None;

    for revision in revisions {
        let offset = data.len() as u64;
        let locator_composite = revision.locator_composite();
        let prefix_composite = revision.prefix_composite();

        close_if_changed(&mut ranges, &mut open_locator, &locator_composite, offset);
        close_if_changed(&mut ranges, &mut open_prefix, &prefix_composite, offset);

        if let Some(filter) = &mut filter {
            filter.set(&locator_composite);
            filter.set(&prefix_composite);
            filter.set(&revision.datum_composite());
        }

        let bytes = encode_to_vec(*revision)?;
        crate::encoding::len_to_u32(bytes.len())?.encode_to(&mut data)?;
        data.extend_from_slice(&bytes);
    }
    let end = data.len() as u64;
    close_if_changed(&mut ranges, &mut open_locator, &[], end);
    close_if_changed(&mut ranges, &mut open_prefix, &[], end);

    let manifest = Manifest::from_ranges(&ranges);

    // 2. Filter and manifest become durable before the data file.
    let fltr_path = block_path(directory, id, FILTER_EXT);
    let filter_bytes = filter.as_ref().map(|f| f.as_slice().to_vec());
    write_atomically(&fltr_path, filter_bytes.as_deref().unwrap_or(&[]))?;

    let indx_path = block_path(directory, id, MANIFEST_EXT);
    let mut indx = encode_to_vec(&stats)?;
    indx.extend_from_slice(manifest.raw_bytes());
    write_atomically(&indx_path, &indx)?;

    // 3. The data file last.
    let blk_path = block_path(directory, id, BLOCK_EXT);
    write_atomically(&blk_path, &data)?;

    let file = File::open(&blk_path)?;
    // SAFETY: the just-renamed file is never modified again; the
    // mapping is read-only.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok((mmap, manifest, filter))
}

/// Closes the open range when the composite changes, then opens a range
/// for the new composite. An empty `next` closes without reopening.
fn close_if_changed(
    ranges: &mut BTreeMap<[u8; 16], (u64, u64)>,
    open: &mut Option<(Vec<u8>, u64)>,
    next: &[u8],
    offset: u64,
) {
    match open {
        Some((composite, _)) if composite.as_slice() == next => {}
        _ => {
            if let Some((composite, start)) = open.take() {
                ranges.insert(manifest::composite_hash(&composite), (start, offset));
            }
            if !next.is_empty() {
                *open = Some((next.to_vec(), offset));
            }
        }
    }
}

/// Writes `bytes` to a temporary sibling, fsyncs, and renames over
/// `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), BlockError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn new_filter(expected_insertions: usize) -> Option<Bloom<[u8]>> {
    Bloom::new_for_fp_rate(expected_insertions.max(1), BLOCK_FILTER_FP_RATE).ok()
}

fn block_path(directory: &Path, id: u64, ext: &str) -> PathBuf {
    directory.join(format!("{id}.{ext}"))
}

/// Lists the ids of all sealed blocks in `directory`, ascending.
pub fn list_block_ids(directory: &Path) -> Result<Vec<u64>, BlockError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(BLOCK_EXT)
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            && let Ok(id) = stem.parse::<u64>()
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn range_slice<'a>(mmap: &'a Mmap, start: u64, end: u64, id: u64) -> Result<&'a [u8], BlockError> {
    let start = usize::try_from(start)
        .map_err(|_| BlockError::Internal(format!("block {id} range start overflow")))?;
    let end = usize::try_from(end)
        .map_err(|_| BlockError::Internal(format!("block {id} range end overflow")))?;
    if start > end || end > mmap.len() {
        return Err(BlockError::Internal(format!(
            "block {id} manifest range [{start}, {end}) outside file of {} bytes",
            mmap.len()
        )));
    }
    Ok(&mmap[start..end])
}

fn read_state<'a, L, K, V>(
    lock: &'a RwLock<State<L, K, V>>,
) -> Result<std::sync::RwLockReadGuard<'a, State<L, K, V>>, BlockError> {
    lock.read()
        .map_err(|_| BlockError::Internal("block lock poisoned".into()))
}

// ------------------------------------------------------------------------------------------------
// RevisionSlice — parse (len:4 | revision)* records
// ------------------------------------------------------------------------------------------------

/// Iterator over length-prefixed revision records in a byte slice.
struct RevisionSlice<'a, L, K, V> {
    bytes: &'a [u8],
    offset: usize,
    _marker: std::marker::PhantomData<(L, K, V)>,
}

impl<'a, L, K, V> RevisionSlice<'a, L, K, V> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<L: Component, K: Component, V: Component> Iterator for RevisionSlice<'_, L, K, V> {
    type Item = Result<Revision<L, K, V>, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        let (len, n) = match u32::decode_from(&self.bytes[self.offset..]) {
            Ok(ok) => ok,
            Err(e) => return Some(Err(e.into())),
        };
        self.offset += n;
        let len = len as usize;
        if self.offset + len > self.bytes.len() {
            return Some(Err(BlockError::Internal(
                "truncated revision record".into(),
            )));
        }
        let record = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        match decode_from_slice::<Revision<L, K, V>>(record) {
            Ok((revision, _)) => Some(Ok(revision)),
            Err(e) => Some(Err(e.into())),
        }
    }
}
