//! # Database — the permanent, block-indexed store
//!
//! The database owns the three block families and answers every read
//! that the buffer overlay cannot: it is the destination of transport
//! and the durable home of all indexed data.
//!
//! ```text
//! db/
//!   cpb/ <id>.blk|.fltr|.indx    primary blocks  (record → key → value)
//!   csb/ <id>.blk|.fltr|.indx    index  blocks   (key → value → record)
//!   ctb/ <id>.blk|.fltr|.indx    search blocks   (key → token → position)
//! ```
//!
//! Each family holds an ordered list of sealed blocks plus one mutable
//! block currently open for `accept`. When the mutable block crosses
//! the configured size threshold (or [`Database::sync`] is called) it
//! is sealed and a fresh one opens.
//!
//! ## Records
//!
//! Reads dispatch into [`Record`] aggregates built lazily per locator:
//! walk the sealed blocks in creation order, skip any whose bloom
//! filter excludes the locator, seek the rest, then fold in the open
//! mutable block. Records live in a per-family cache invalidated
//! whenever a write or merge touches their locator.
//!
//! ## Deduplication
//!
//! Crash recovery can replay buffered writes whose transport already
//! reached sealed blocks, so [`Database::open`] runs a deduplication
//! pass: any two blocks whose version ranges overlap are compared, and
//! the newer block is rewritten without the tuples it shares with the
//! older (or deleted outright when nothing remains). Version ranges of
//! blocks produced by ordinary operation never overlap, so the pass is
//! free except after a crash.

#[cfg(test)]
mod tests;

pub mod segment;

pub use segment::{Segment, SegmentReceipts};

use crate::block::{self, Block, BlockError};
use crate::clock::Clock;
use crate::model::{
    Action, Component, Id, Operator, Position, Revision, Text, Value, Write,
};
use crate::record::Record;
use crate::tokenizer;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Directory of primary blocks under the database root.
pub const PRIMARY_DIR: &str = "cpb";

/// Directory of index blocks under the database root.
pub const INDEX_DIR: &str = "csb";

/// Directory of search blocks under the database root.
pub const SEARCH_DIR: &str = "ctb";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Error originating from a block.
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] crate::encoding::EncodingError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn poisoned(_: impl std::fmt::Debug) -> DatabaseError {
    DatabaseError::Internal("database lock poisoned".into())
}

// ------------------------------------------------------------------------------------------------
// Family
// ------------------------------------------------------------------------------------------------

/// One block family: sealed blocks, the open mutable block, and the
/// record cache.
struct Family<L, K, V> {
    directory: PathBuf,
    sealed: RwLock<Vec<Arc<Block<L, K, V>>>>,
    mutable: RwLock<Arc<Block<L, K, V>>>,
    cache: Mutex<HashMap<L, Arc<Record<L, K, V>>>>,
    expected_insertions: usize,
    streaming_threshold: usize,
}

impl<L: Component, K: Component, V: Component> Family<L, K, V> {
    fn open(
        directory: PathBuf,
        clock: &Clock,
        expected_insertions: usize,
        streaming_threshold: usize,
    ) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(&directory)?;
        let mut sealed = Vec::new();
        for id in block::list_block_ids(&directory)? {
            sealed.push(Arc::new(Block::open(&directory, id, streaming_threshold)?));
        }
        let mutable = Arc::new(Block::create(&directory, clock.next(), expected_insertions));
        Ok(Self {
            directory,
            sealed: RwLock::new(sealed),
            mutable: RwLock::new(mutable),
            cache: Mutex::new(HashMap::new()),
            expected_insertions,
            streaming_threshold,
        })
    }

    /// Inserts a revision into the open mutable block and invalidates
    /// the locator's cached record.
    fn insert(
        &self,
        locator: L,
        key: K,
        value: V,
        version: u64,
        action: Action,
    ) -> Result<(), DatabaseError> {
        let mutable = self.mutable.read().map_err(poisoned)?;
        mutable.insert(locator.clone(), key, value, version, action)?;
        self.cache.lock().map_err(poisoned)?.remove(&locator);
        Ok(())
    }

    /// Revisions currently in the open mutable block.
    fn mutable_len(&self) -> Result<u64, DatabaseError> {
        Ok(self.mutable.read().map_err(poisoned)?.len()?)
    }

    /// Seals the open mutable block (if non-empty) and opens a fresh
    /// one.
    fn seal(&self, clock: &Clock) -> Result<(), DatabaseError> {
        let mut mutable = self.mutable.write().map_err(poisoned)?;
        if mutable.is_empty()? {
            return Ok(());
        }
        mutable.sync()?;
        let sealed_block = Arc::clone(&mutable);
        *mutable = Arc::new(Block::create(
            &self.directory,
            clock.next(),
            self.expected_insertions,
        ));
        self.sealed.write().map_err(poisoned)?.push(sealed_block);
        Ok(())
    }

    /// Installs an externally built sealed block (a segment member).
    fn install(&self, block: Arc<Block<L, K, V>>) -> Result<(), DatabaseError> {
        self.sealed.write().map_err(poisoned)?.push(block);
        Ok(())
    }

    /// Drops the cached records for `locators`.
    fn invalidate<'a>(&self, locators: impl Iterator<Item = &'a L>) -> Result<(), DatabaseError> {
        let mut cache = self.cache.lock().map_err(poisoned)?;
        for locator in locators {
            cache.remove(locator);
        }
        Ok(())
    }

    /// Returns the record for `locator`, building it from the admitting
    /// blocks on a cache miss.
    fn record(&self, locator: &L) -> Result<Arc<Record<L, K, V>>, DatabaseError> {
        if let Some(record) = self.cache.lock().map_err(poisoned)?.get(locator) {
            return Ok(Arc::clone(record));
        }

        let mut record = Record::new(locator.clone());
        let sealed = self.sealed.read().map_err(poisoned)?;
        for block in sealed.iter() {
            if block.might_contain_locator(locator)? {
                for revision in block.seek(locator, None)? {
                    record.append(revision);
                }
            }
        }
        drop(sealed);
        let mutable = self.mutable.read().map_err(poisoned)?;
        if mutable.might_contain_locator(locator)? {
            for revision in mutable.seek(locator, None)? {
                record.append(revision);
            }
        }
        drop(mutable);

        let record = Arc::new(record);
        self.cache
            .lock()
            .map_err(poisoned)?
            .insert(locator.clone(), Arc::clone(&record));
        Ok(record)
    }

    /// Whether any block might contain the full datum; used to
    /// short-circuit verifies before a record build.
    fn might_contain_datum(&self, locator: &L, key: &K, value: &V) -> Result<bool, DatabaseError> {
        let sealed = self.sealed.read().map_err(poisoned)?;
        for block in sealed.iter() {
            if block.might_contain_datum(locator, key, value)? {
                return Ok(true);
            }
        }
        drop(sealed);
        Ok(self
            .mutable
            .read()
            .map_err(poisoned)?
            .might_contain_datum(locator, key, value)?)
    }

    /// Whether a revision identical to `revision` exists in some sealed
    /// block (bloom-gated datum seek plus version match).
    fn contains_revision(&self, revision: &Revision<L, K, V>) -> Result<bool, DatabaseError> {
        let sealed = self.sealed.read().map_err(poisoned)?;
        for block in sealed.iter() {
            if !block.might_contain_datum(revision.locator(), revision.key(), revision.value())? {
                continue;
            }
            for candidate in block.seek(revision.locator(), Some(revision.key()))? {
                if candidate == *revision {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// The largest version across all blocks, or zero.
    fn max_version(&self) -> Result<u64, DatabaseError> {
        let mut max = 0u64;
        let sealed = self.sealed.read().map_err(poisoned)?;
        for block in sealed.iter() {
            let stats = block.stats()?;
            if stats.count > 0 {
                max = max.max(stats.max_version);
            }
        }
        drop(sealed);
        let mutable = self.mutable.read().map_err(poisoned)?;
        let stats = mutable.stats()?;
        if stats.count > 0 {
            max = max.max(stats.max_version);
        }
        Ok(max)
    }

    /// Rewrites newer blocks to drop tuples they share with older
    /// blocks. Returns the number of duplicate revisions removed.
    fn dedupe(&self) -> Result<usize, DatabaseError> {
        let mut sealed = self.sealed.write().map_err(poisoned)?;
        let mut removed_total = 0usize;
        let mut emptied: Vec<usize> = Vec::new();

        for newer_idx in 1..sealed.len() {
            let newer = Arc::clone(&sealed[newer_idx]);
            let newer_stats = newer.stats()?;
            let mut shared: HashSet<Vec<u8>> = HashSet::new();

            for older in sealed.iter().take(newer_idx) {
                let older_stats = older.stats()?;
                // Disjoint version ranges cannot share tuples.
                if older_stats.max_version < newer_stats.min_version
                    || newer_stats.max_version < older_stats.min_version
                {
                    continue;
                }
                let older_identities: HashSet<Vec<u8>> = older
                    .revisions()?
                    .iter()
                    .map(crate::encoding::encode_to_vec)
                    .collect::<Result<_, _>>()?;
                for revision in newer.revisions()? {
                    let encoded = crate::encoding::encode_to_vec(&revision)?;
                    if older_identities.contains(&encoded) {
                        shared.insert(encoded);
                    }
                }
            }

            if shared.is_empty() {
                continue;
            }
            if shared.len() as u64 == newer_stats.count {
                // Every revision is a duplicate: delete the block.
                emptied.push(newer_idx);
                removed_total += shared.len();
                continue;
            }
            removed_total += newer.rewrite_omitting(&shared)?;
        }

        for idx in emptied.into_iter().rev() {
            let block = sealed.remove(idx);
            warn!(id = block.id(), "fully duplicated block deleted");
            block.delete_files()?;
        }

        if removed_total > 0 {
            self.cache.lock().map_err(poisoned)?.clear();
            info!(removed = removed_total, "deduplication pass rewrote blocks");
        }
        Ok(removed_total)
    }
}

// ------------------------------------------------------------------------------------------------
// Database
// ------------------------------------------------------------------------------------------------

/// The permanent store: three block families plus their record caches.
pub struct Database {
    primary: Family<Id, Text, Value>,
    index: Family<Text, Value, Id>,
    search: Family<Text, Text, Position>,
    clock: Arc<Clock>,
    block_size_threshold: usize,
    stopwords: Vec<String>,
}

impl Database {
    /// Opens (or creates) the database under `directory`, loading every
    /// sealed block and running the deduplication pass.
    pub fn open(
        directory: impl AsRef<Path>,
        config: &crate::config::Config,
        clock: Arc<Clock>,
    ) -> Result<Self, DatabaseError> {
        let root = directory.as_ref().to_path_buf();

        // Block ids come from the clock; make sure fresh mutable blocks
        // cannot collide with ids minted by a previous process.
        for dir in [
            root.join(PRIMARY_DIR),
            root.join(INDEX_DIR),
            root.join(SEARCH_DIR),
        ] {
            std::fs::create_dir_all(&dir)?;
            if let Some(max) = block::list_block_ids(&dir)?.last() {
                clock.advance_past(*max);
            }
        }

        let primary = Family::open(
            root.join(PRIMARY_DIR),
            &clock,
            config.expected_insertions,
            config.manifest_streaming_threshold,
        )?;
        let index = Family::open(
            root.join(INDEX_DIR),
            &clock,
            config.expected_insertions,
            config.manifest_streaming_threshold,
        )?;
        let search = Family::open(
            root.join(SEARCH_DIR),
            &clock,
            config.expected_insertions,
            config.manifest_streaming_threshold,
        )?;

        let db = Self {
            primary,
            index,
            search,
            clock: Arc::clone(&clock),
            block_size_threshold: config.block_size_threshold,
            stopwords: config.stopwords.clone(),
        };

        clock.advance_past(db.max_version()?);

        let removed =
            db.primary.dedupe()? + db.index.dedupe()? + db.search.dedupe()?;
        if removed > 0 {
            warn!(removed, "duplicate revisions reconciled after crash recovery");
        }

        info!("database opened");
        Ok(db)
    }

    /// Accepts one write, fanning it out into the three families'
    /// mutable blocks. Seals blocks that crossed the size threshold.
    pub fn accept(&self, write: Write) -> Result<(), DatabaseError> {
        let primary = write.primary_revision();
        self.primary.insert(
            primary.locator().clone(),
            primary.key().clone(),
            primary.value().clone(),
            primary.version(),
            primary.action(),
        )?;

        let index = write.index_revision();
        self.index.insert(
            index.locator().clone(),
            index.key().clone(),
            index.value().clone(),
            index.version(),
            index.action(),
        )?;

        if let Value::Text(text) = write.value() {
            for token in tokenizer::tokenize(text, &self.stopwords) {
                for substring in tokenizer::substrings(&token.token) {
                    self.search.insert(
                        write.key().clone(),
                        substring,
                        Position::new(write.record(), token.index),
                        write.version(),
                        write.action(),
                    )?;
                }
            }
        }

        if self.primary.mutable_len()? as usize >= self.block_size_threshold {
            self.sync()?;
        }
        Ok(())
    }

    /// Seals every family's non-empty mutable block and opens fresh
    /// ones.
    pub fn sync(&self) -> Result<(), DatabaseError> {
        self.primary.seal(&self.clock)?;
        self.index.seal(&self.clock)?;
        self.search.seal(&self.clock)?;
        Ok(())
    }

    /// Builds a sealed segment from a batch of writes, off the critical
    /// path: nothing is installed until [`Database::merge`].
    pub fn build_segment(&self, writes: &[Write]) -> Result<Segment, DatabaseError> {
        let mut receipts = SegmentReceipts::default();

        let primary = Block::create(
            &self.primary.directory,
            self.clock.next(),
            self.primary.expected_insertions,
        );
        let index = Block::create(
            &self.index.directory,
            self.clock.next(),
            self.index.expected_insertions,
        );
        let search = Block::create(
            &self.search.directory,
            self.clock.next(),
            self.search.expected_insertions,
        );

        for write in writes {
            receipts.primary_locators.insert(write.record());
            receipts.index_locators.insert(write.key().clone());
            primary.insert(
                write.record(),
                write.key().clone(),
                write.value().clone(),
                write.version(),
                write.action(),
            )?;
            index.insert(
                write.key().clone(),
                write.value().clone(),
                write.record(),
                write.version(),
                write.action(),
            )?;
            if let Value::Text(text) = write.value() {
                receipts.search_locators.insert(write.key().clone());
                for token in tokenizer::tokenize(text, &self.stopwords) {
                    for substring in tokenizer::substrings(&token.token) {
                        search.insert(
                            write.key().clone(),
                            substring,
                            Position::new(write.record(), token.index),
                            write.version(),
                            write.action(),
                        )?;
                    }
                }
            }
        }

        let primary = seal_segment_block(primary)?;
        let index = seal_segment_block(index)?;
        let search = seal_segment_block(search)?;

        debug!(
            writes = writes.len(),
            "segment built"
        );
        Ok(Segment {
            primary,
            index,
            search,
            receipts,
        })
    }

    /// Atomically installs a built segment and invalidates the record
    /// caches its receipts name.
    ///
    /// The caller must hold the buffer's exclusive transport lock
    /// across this merge and the subsequent purge so that readers never
    /// observe a write on both sides.
    pub fn merge(&self, segment: Segment) -> Result<(), DatabaseError> {
        let Segment {
            primary,
            index,
            search,
            receipts,
        } = segment;
        if let Some(block) = primary {
            self.primary.install(block)?;
        }
        if let Some(block) = index {
            self.index.install(block)?;
        }
        if let Some(block) = search {
            self.search.install(block)?;
        }
        self.primary.invalidate(receipts.primary_locators.iter())?;
        self.index.invalidate(receipts.index_locators.iter())?;
        self.search.invalidate(receipts.search_locators.iter())?;
        Ok(())
    }

    /// The largest version across all families, or zero.
    pub fn max_version(&self) -> Result<u64, DatabaseError> {
        Ok(self
            .primary
            .max_version()?
            .max(self.index.max_version()?)
            .max(self.search.max_version()?))
    }

    /// Whether a primary revision identical to `write`'s exists in a
    /// sealed block — used at startup to recognise buffered writes
    /// whose transport completed before a crash.
    pub fn contains_write(&self, write: &Write) -> Result<bool, DatabaseError> {
        self.primary.contains_revision(&write.primary_revision())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// The values present for `(key, record)` at `ts`.
    pub fn select(&self, key: &str, record: Id, ts: u64) -> Result<BTreeSet<Value>, DatabaseError> {
        let rec = self.primary.record(&record)?;
        Ok(rec.get_at(&key.to_string(), ts))
    }

    /// The full `key → values` view of `record` at `ts`.
    pub fn select_fields(
        &self,
        record: Id,
        ts: u64,
    ) -> Result<BTreeMap<Text, BTreeSet<Value>>, DatabaseError> {
        Ok(self.primary.record(&record)?.all_at(ts))
    }

    /// The keys of `record` with at least one present value at `ts`.
    pub fn describe(&self, record: Id, ts: u64) -> Result<BTreeSet<Text>, DatabaseError> {
        Ok(self.primary.record(&record)?.keys_at(ts))
    }

    /// Whether `(key, value, record)` is present at `ts`.
    pub fn verify(
        &self,
        key: &str,
        value: &Value,
        record: Id,
        ts: u64,
    ) -> Result<bool, DatabaseError> {
        // A bloom miss across every block is authoritative absence.
        if !self
            .primary
            .might_contain_datum(&record, &key.to_string(), value)?
        {
            return Ok(false);
        }
        Ok(self.select(key, record, ts)?.contains(value))
    }

    /// The `value → records` view of `key` at `ts`.
    pub fn browse(
        &self,
        key: &str,
        ts: u64,
    ) -> Result<BTreeMap<Value, BTreeSet<Id>>, DatabaseError> {
        Ok(self.index.record(&key.to_string())?.all_at(ts))
    }

    /// The records whose `key` values satisfy `operator` at `ts`.
    pub fn find(
        &self,
        key: &str,
        operator: Operator,
        operands: &[Value],
        ts: u64,
    ) -> Result<BTreeSet<Id>, DatabaseError> {
        let record = self.index.record(&key.to_string())?;
        let mut out = BTreeSet::new();
        for (value, records) in record.all_at(ts) {
            if operator.evaluate(&value, operands) {
                out.extend(records);
            }
        }
        Ok(out)
    }

    /// The per-record value views of `key` at `ts` — the context the
    /// engine hands to the buffer overlay for a composite `find`.
    pub fn find_context(
        &self,
        key: &str,
        ts: u64,
    ) -> Result<BTreeMap<Id, BTreeSet<Value>>, DatabaseError> {
        let record = self.index.record(&key.to_string())?;
        let mut context: BTreeMap<Id, BTreeSet<Value>> = BTreeMap::new();
        for (value, records) in record.all_at(ts) {
            for r in records {
                context.entry(r).or_default().insert(value.clone());
            }
        }
        Ok(context)
    }

    /// Records where the indexed text of `key` matches `query` as a
    /// phrase, per the search family.
    pub fn search(&self, key: &str, query: &str) -> Result<BTreeSet<Id>, DatabaseError> {
        let query_tokens = tokenizer::tokenize(query, &self.stopwords);
        let Some(first) = query_tokens.first() else {
            return Ok(BTreeSet::new());
        };
        let record = self.search.record(&key.to_string())?;

        let anchors = record.get(&first.token);
        let mut out = BTreeSet::new();
        'anchor: for anchor in &anchors {
            for qt in &query_tokens {
                let delta = qt.index - first.index;
                let wanted = Position::new(anchor.record, anchor.index + delta);
                if !record.get(&qt.token).contains(&wanted) {
                    continue 'anchor;
                }
            }
            out.insert(anchor.record);
        }
        Ok(out)
    }

    /// Every primary revision of `record` at or before `ts`, in version
    /// order.
    pub fn audit_record(
        &self,
        record: Id,
        ts: u64,
    ) -> Result<Vec<Revision<Id, Text, Value>>, DatabaseError> {
        Ok(self
            .primary
            .record(&record)?
            .audit_all()
            .into_iter()
            .filter(|r| r.version() <= ts)
            .collect())
    }

    /// Every primary revision of `(key, record)` at or before `ts`, in
    /// version order.
    pub fn audit_field(
        &self,
        key: &str,
        record: Id,
        ts: u64,
    ) -> Result<Vec<Revision<Id, Text, Value>>, DatabaseError> {
        Ok(self
            .primary
            .record(&record)?
            .audit(&key.to_string())
            .into_iter()
            .filter(|r| r.version() <= ts)
            .collect())
    }
}

/// Seals a freshly-built segment block, or discards it when empty.
fn seal_segment_block<L: Component, K: Component, V: Component>(
    block: Block<L, K, V>,
) -> Result<Option<Arc<Block<L, K, V>>>, DatabaseError> {
    if block.is_empty()? {
        return Ok(None);
    }
    block.sync()?;
    Ok(Some(Arc::new(block)))
}
