//! # Engine — the buffered store
//!
//! The engine composes the [`Buffer`] (recent, unindexed writes) and
//! the [`Database`] (transported, block-indexed writes) behind one
//! thread-safe read/write API. Every read consults both halves under
//! the buffer's shared transport lock and combines them:
//!
//! - `verify` — XOR: the database's answer flipped once per matching
//!   buffered write (odd count ⇒ present).
//! - `select` / `find` / `describe` / `browse` — the database view with
//!   buffered writes folded on top, toggling set membership.
//! - `search` — the union of both halves' candidates, re-verified
//!   against the composite current values.
//!
//! Every write verifies the current state first (a redundant ADD or
//! REMOVE is a silent no-op reported as `false`), stamps a version from
//! the monotonic clock, journals into the buffer, and announces itself
//! to the version-change registry.
//!
//! ## Background threads
//!
//! A single transporter thread moves writes from the buffer into the
//! database (see [`transport`]); a watchdog inspects its progress every
//! `hung_detection_frequency`, restarts it after
//! `hung_detection_threshold` of no progress with work pending, and
//! nudges it awake after `allowable_inactivity_threshold` of idleness.
//!
//! ## Startup
//!
//! `Engine::open` recovers in a fixed order: open the database (which
//! runs block deduplication), replay the buffer pages, reconcile
//! buffered writes whose transport had already completed, replay any
//! lingering transaction backups, and only then start the background
//! threads.

#[cfg(test)]
pub mod tests;

pub mod lock;
pub mod listeners;
pub mod transport;

pub use lock::{LockIntent, StripeGuard, TokenLocks};
pub use listeners::{ListenerHandle, ListenerRegistry};

use crate::atomic::{AtomicOperation, AtomicSupport, Transaction};
use crate::buffer::{Buffer, BufferError};
use crate::clock::Clock;
use crate::config::Config;
use crate::database::{Database, DatabaseError};
use crate::limbo::Limbo;
use crate::model::{Action, Id, Operator, Text, Token, Value, Write};
use crate::tokenizer;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use transport::{Signal, TransportProgress, Transporter};

/// Buffer pages directory under the engine root.
pub const BUFFER_DIR: &str = "buffer";

/// Database directory under the engine root.
pub const DB_DIR: &str = "db";

/// Transaction backups directory under the engine root.
pub const TRANSACTIONS_DIR: &str = "transactions";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the buffer.
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Error originating from the database.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] crate::encoding::EncodingError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Audit entries
// ------------------------------------------------------------------------------------------------

/// One step of a record's history, as reported by the audit reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// The revision's version.
    pub version: u64,

    /// Whether the datum was asserted or retracted.
    pub action: Action,

    /// The field name.
    pub key: Text,

    /// The value.
    pub value: Value,
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Writes buffered and awaiting transport.
    pub pending_writes: usize,

    /// Writes transported since the engine opened.
    pub transported_writes: u64,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct Watchdog {
    thread: JoinHandle<()>,
    tx: crossbeam::channel::Sender<()>,
}

pub(crate) struct EngineInner {
    buffer: Arc<Buffer>,
    database: Arc<Database>,
    clock: Arc<Clock>,
    config: Config,
    locks: TokenLocks,
    registry: ListenerRegistry,
    transactions_dir: PathBuf,
    progress: Arc<TransportProgress>,
    transporter: Mutex<Option<Transporter>>,
    watchdog: Mutex<Option<Watchdog>>,
    running: AtomicBool,
}

/// The top-level storage engine handle.
///
/// Thread-safe and cheaply cloneable; clones share one engine.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine {
    /// Opens (or creates) an engine rooted at `path` and starts its
    /// background threads.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self, EngineError> {
        let root = path.as_ref().to_path_buf();
        let transactions_dir = root.join(TRANSACTIONS_DIR);
        std::fs::create_dir_all(&transactions_dir)?;

        let clock = Arc::new(Clock::new());
        let database = Arc::new(Database::open(
            root.join(DB_DIR),
            &config,
            Arc::clone(&clock),
        )?);
        let buffer = Arc::new(Buffer::open(
            root.join(BUFFER_DIR),
            config.buffer_page_size,
            config.expected_insertions,
            Arc::clone(&clock),
        )?);
        buffer.reconcile(&database)?;

        let inner = Arc::new(EngineInner {
            buffer,
            database,
            clock,
            config,
            locks: TokenLocks::new(),
            registry: ListenerRegistry::new(),
            transactions_dir,
            progress: Arc::new(TransportProgress::new()),
            transporter: Mutex::new(None),
            watchdog: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        let engine = Self { inner };

        engine.restore_transactions()?;
        engine.spawn_transporter()?;
        engine.spawn_watchdog()?;

        info!(root = %root.display(), "engine started");
        Ok(engine)
    }

    /// Stops the background threads, makes one final transport
    /// checkpoint, and seals the database's mutable blocks.
    pub fn stop(&self) -> Result<(), EngineError> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(watchdog) = self
            .inner
            .watchdog
            .lock()
            .map_err(|_| EngineError::Internal("watchdog lock poisoned".into()))?
            .take()
        {
            let _ = watchdog.tx.send(());
            let _ = watchdog.thread.join();
        }
        if let Some(transporter) = self
            .inner
            .transporter
            .lock()
            .map_err(|_| EngineError::Internal("transporter lock poisoned".into()))?
            .take()
        {
            transporter.stop();
            let _ = transporter.thread.join();
        }
        self.inner.database.sync()?;
        self.inner.buffer.checkpoint()?;
        info!("engine stopped");
        Ok(())
    }

    /// Current engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            pending_writes: self.inner.buffer.pending()?,
            transported_writes: self.inner.progress.total_moved(),
        })
    }

    /// The engine's version clock.
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Adds `value` to `(key, record)`.
    ///
    /// Returns `false` — without writing — when the value is already
    /// present.
    pub fn add(&self, key: &str, value: Value, record: Id) -> Result<bool, EngineError> {
        let tokens = Token::for_write(key, record);
        let _guards = self
            .inner
            .locks
            .write_guards(&tokens)
            .map_err(EngineError::Internal)?;
        if self.verify(key, &value, record)? {
            return Ok(false);
        }
        let write = Write::add(key, value, record, self.inner.clock.next());
        self.inner.buffer.insert(write.clone())?;
        self.inner.registry.announce(&write, None);
        debug!(key, record, version = write.version(), "value added");
        Ok(true)
    }

    /// Removes `value` from `(key, record)`.
    ///
    /// Returns `false` — without writing — when the value is not
    /// present.
    pub fn remove(&self, key: &str, value: Value, record: Id) -> Result<bool, EngineError> {
        let tokens = Token::for_write(key, record);
        let _guards = self
            .inner
            .locks
            .write_guards(&tokens)
            .map_err(EngineError::Internal)?;
        if !self.verify(key, &value, record)? {
            return Ok(false);
        }
        let write = Write::remove(key, value, record, self.inner.clock.next());
        self.inner.buffer.insert(write.clone())?;
        self.inner.registry.announce(&write, None);
        debug!(key, record, version = write.version(), "value removed");
        Ok(true)
    }

    /// Journals a pre-validated write on behalf of a committing atomic
    /// operation or transaction. The caller holds the relevant token
    /// locks; `exclude` suppresses self-preemption.
    pub(crate) fn deliver(&self, write: Write, exclude: Option<u64>) -> Result<(), EngineError> {
        self.inner.buffer.insert(write.clone())?;
        self.inner.registry.announce(&write, exclude);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Whether `(key, value, record)` is currently present.
    pub fn verify(&self, key: &str, value: &Value, record: Id) -> Result<bool, EngineError> {
        self.verify_at(key, value, record, u64::MAX)
    }

    /// Whether `(key, value, record)` was present at `ts`.
    pub fn verify_at(
        &self,
        key: &str,
        value: &Value,
        record: Id,
        ts: u64,
    ) -> Result<bool, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        let stored = self.inner.database.verify(key, value, record, ts)?;
        Ok(stored ^ self.inner.buffer.verify(key, value, record, ts))
    }

    /// The values currently present for `(key, record)`.
    pub fn select(&self, key: &str, record: Id) -> Result<BTreeSet<Value>, EngineError> {
        self.select_at(key, record, u64::MAX)
    }

    /// The values present for `(key, record)` at `ts`.
    pub fn select_at(
        &self,
        key: &str,
        record: Id,
        ts: u64,
    ) -> Result<BTreeSet<Value>, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        self.select_locked(key, record, ts)
    }

    fn select_locked(&self, key: &str, record: Id, ts: u64) -> Result<BTreeSet<Value>, EngineError> {
        let mut values = self.inner.database.select(key, record, ts)?;
        self.inner.buffer.select(key, record, ts, &mut values);
        Ok(values)
    }

    /// The keys of `record` with at least one present value.
    pub fn describe(&self, record: Id) -> Result<BTreeSet<Text>, EngineError> {
        self.describe_at(record, u64::MAX)
    }

    /// The keys of `record` with at least one value present at `ts`.
    pub fn describe_at(&self, record: Id, ts: u64) -> Result<BTreeSet<Text>, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        let mut fields = self.inner.database.select_fields(record, ts)?;
        self.inner.buffer.select_fields(record, ts, &mut fields);
        Ok(fields.into_keys().collect())
    }

    /// The full `key → values` view of `record`.
    pub fn select_record(&self, record: Id) -> Result<BTreeMap<Text, BTreeSet<Value>>, EngineError> {
        self.select_record_at(record, u64::MAX)
    }

    /// The full `key → values` view of `record` at `ts`.
    pub fn select_record_at(
        &self,
        record: Id,
        ts: u64,
    ) -> Result<BTreeMap<Text, BTreeSet<Value>>, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        let mut fields = self.inner.database.select_fields(record, ts)?;
        self.inner.buffer.select_fields(record, ts, &mut fields);
        Ok(fields)
    }

    /// The `value → records` view of `key`.
    pub fn browse(&self, key: &str) -> Result<BTreeMap<Value, BTreeSet<Id>>, EngineError> {
        self.browse_at(key, u64::MAX)
    }

    /// The `value → records` view of `key` at `ts`.
    pub fn browse_at(
        &self,
        key: &str,
        ts: u64,
    ) -> Result<BTreeMap<Value, BTreeSet<Id>>, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        let mut view = self.inner.database.browse(key, ts)?;
        self.inner.buffer.browse(key, ts, &mut view);
        Ok(view)
    }

    /// The records whose `key` values currently satisfy `operator`.
    pub fn find(
        &self,
        key: &str,
        operator: Operator,
        operands: &[Value],
    ) -> Result<BTreeSet<Id>, EngineError> {
        self.find_at(key, operator, operands, u64::MAX)
    }

    /// The records whose `key` values satisfied `operator` at `ts`.
    pub fn find_at(
        &self,
        key: &str,
        operator: Operator,
        operands: &[Value],
        ts: u64,
    ) -> Result<BTreeSet<Id>, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        let mut context = self.inner.database.find_context(key, ts)?;
        self.inner.buffer.fold_key(key, ts, &mut context);
        Ok(context
            .into_iter()
            .filter(|(_, values)| values.iter().any(|v| operator.evaluate(v, operands)))
            .map(|(record, _)| record)
            .collect())
    }

    /// The per-record value views of `key` — the base context for
    /// atomic `find` evaluation.
    pub(crate) fn find_context(
        &self,
        key: &str,
    ) -> Result<BTreeMap<Id, BTreeSet<Value>>, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        let mut context = self.inner.database.find_context(key, u64::MAX)?;
        self.inner.buffer.fold_key(key, u64::MAX, &mut context);
        Ok(context)
    }

    /// Records whose current text under `key` matches `query` as a
    /// phrase.
    ///
    /// The inverted indexes of both halves supply candidates; each
    /// candidate is confirmed against its composite current values so
    /// that half-transported adds and removes cannot skew the result.
    pub fn search(&self, key: &str, query: &str) -> Result<BTreeSet<Id>, EngineError> {
        let query_tokens = tokenizer::tokenize(query, &self.inner.config.stopwords);
        if query_tokens.is_empty() {
            return Ok(BTreeSet::new());
        }
        let _guard = self.inner.buffer.read_guard()?;
        let mut candidates = self.inner.database.search(key, query)?;
        candidates.extend(
            self.inner
                .buffer
                .search(key, query, &self.inner.config.stopwords),
        );

        let mut out = BTreeSet::new();
        for record in candidates {
            let values = self.select_locked(key, record, u64::MAX)?;
            let matched = values.iter().any(|value| {
                if let Value::Text(text) = value {
                    let value_tokens =
                        tokenizer::tokenize(text, &self.inner.config.stopwords);
                    tokenizer::phrase_matches(&value_tokens, &query_tokens)
                } else {
                    false
                }
            });
            if matched {
                out.insert(record);
            }
        }
        Ok(out)
    }

    /// The full history of `record`, version-ascending.
    pub fn audit_record(&self, record: Id) -> Result<Vec<AuditEntry>, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        let mut entries: Vec<AuditEntry> = self
            .inner
            .database
            .audit_record(record, u64::MAX)?
            .into_iter()
            .map(|r| AuditEntry {
                version: r.version(),
                action: r.action(),
                key: r.key().clone(),
                value: r.value().clone(),
            })
            .collect();
        entries.extend(
            self.inner
                .buffer
                .audit_record(record, u64::MAX)
                .into_iter()
                .map(write_entry),
        );
        entries.sort_by_key(|e| e.version);
        Ok(entries)
    }

    /// The history of `(key, record)`, version-ascending.
    pub fn audit_field(&self, key: &str, record: Id) -> Result<Vec<AuditEntry>, EngineError> {
        let _guard = self.inner.buffer.read_guard()?;
        let mut entries: Vec<AuditEntry> = self
            .inner
            .database
            .audit_field(key, record, u64::MAX)?
            .into_iter()
            .map(|r| AuditEntry {
                version: r.version(),
                action: r.action(),
                key: r.key().clone(),
                value: r.value().clone(),
            })
            .collect();
        entries.extend(
            self.inner
                .buffer
                .audit_field(key, record, u64::MAX)
                .into_iter()
                .map(write_entry),
        );
        entries.sort_by_key(|e| e.version);
        Ok(entries)
    }

    // --------------------------------------------------------------------------------------------
    // Atomic operations and transactions
    // --------------------------------------------------------------------------------------------

    /// Starts a short-lived optimistic atomic operation against this
    /// engine.
    pub fn start_atomic_operation(&self) -> AtomicOperation<'_> {
        AtomicOperation::new(self)
    }

    /// Starts a long-lived transaction against this engine.
    pub fn start_transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    pub(crate) fn locks_ref(&self) -> &TokenLocks {
        &self.inner.locks
    }

    pub(crate) fn registry_ref(&self) -> &ListenerRegistry {
        &self.inner.registry
    }

    pub(crate) fn clock_ref(&self) -> &Clock {
        &self.inner.clock
    }

    pub(crate) fn stopwords(&self) -> &[String] {
        &self.inner.config.stopwords
    }

    pub(crate) fn transactions_dir(&self) -> &Path {
        &self.inner.transactions_dir
    }

    // --------------------------------------------------------------------------------------------
    // Background threads
    // --------------------------------------------------------------------------------------------

    fn spawn_transporter(&self) -> Result<(), EngineError> {
        let generation = self.inner.progress.generation();
        let transporter = Transporter::spawn(
            generation,
            Arc::clone(&self.inner.buffer),
            Arc::clone(&self.inner.database),
            self.inner.config.clone(),
            Arc::clone(&self.inner.progress),
        );
        *self
            .inner
            .transporter
            .lock()
            .map_err(|_| EngineError::Internal("transporter lock poisoned".into()))? =
            Some(transporter);
        Ok(())
    }

    fn spawn_watchdog(&self) -> Result<(), EngineError> {
        let (tx, rx) = crossbeam::channel::unbounded::<()>();
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let frequency = self.inner.config.hung_detection_frequency;
        let thread = std::thread::Builder::new()
            .name("transport-watchdog".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(frequency) {
                        Ok(()) => break,
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    if !inner.running.load(Ordering::Acquire) {
                        break;
                    }
                    watchdog_tick(&inner);
                }
            })
            .map_err(|e| EngineError::Internal(format!("watchdog spawn failed: {e}")))?;
        *self
            .inner
            .watchdog
            .lock()
            .map_err(|_| EngineError::Internal("watchdog lock poisoned".into()))? =
            Some(Watchdog { thread, tx });
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Transaction restore
    // --------------------------------------------------------------------------------------------

    /// Replays and deletes any transaction backups left by a previous
    /// process — each represents a transaction that had validated and
    /// begun its write-through.
    fn restore_transactions(&self) -> Result<(), EngineError> {
        let mut backups: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&self.inner.transactions_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(crate::atomic::BACKUP_EXT) {
                backups.push(path);
            }
        }
        backups.sort();

        for path in backups {
            match crate::atomic::read_backup(&path) {
                Ok(writes) => {
                    let count = writes.len();
                    for write in writes {
                        self.inner.clock.advance_past(write.version());
                        self.deliver(write, None)?;
                    }
                    info!(path = %path.display(), writes = count, "transaction backup restored");
                }
                Err(e) => {
                    // An unreadable backup is a transaction that never
                    // finished validating its write-through; discard.
                    warn!(path = %path.display(), error = %e, "corrupt transaction backup discarded");
                }
            }
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn write_entry(write: Write) -> AuditEntry {
    AuditEntry {
        version: write.version(),
        action: write.action(),
        key: write.key().clone(),
        value: write.value().clone(),
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // Best-effort shutdown for engines dropped without `stop()`.
        if let Ok(mut transporter) = self.transporter.lock()
            && let Some(transporter) = transporter.take()
        {
            let _ = transporter.tx.send(Signal::Stop);
        }
        if let Ok(mut watchdog) = self.watchdog.lock()
            && let Some(watchdog) = watchdog.take()
        {
            let _ = watchdog.tx.send(());
        }
    }
}

/// One watchdog inspection: restart a hung transporter, nudge an idle
/// one.
fn watchdog_tick(inner: &Arc<EngineInner>) {
    let pending = match inner.buffer.pending() {
        Ok(pending) => pending,
        Err(e) => {
            error!(error = %e, "watchdog could not inspect the buffer");
            return;
        }
    };
    if pending == 0 {
        return;
    }
    if inner.progress.stalled_for() > inner.config.hung_detection_threshold {
        warn!(
            pending,
            stalled = ?inner.progress.stalled_for(),
            "transporter hung, restarting"
        );
        restart_transporter(inner);
    } else if inner.progress.idle_for() > inner.config.allowable_inactivity_threshold {
        debug!(pending, "nudging idle transporter");
        if let Ok(guard) = inner.transporter.lock()
            && let Some(transporter) = guard.as_ref()
        {
            let _ = transporter.tx.send(Signal::Nudge);
        }
    }
}

/// Abandons the current transporter and spawns a replacement under a
/// fresh generation.
fn restart_transporter(inner: &Arc<EngineInner>) {
    let Ok(mut guard) = inner.transporter.lock() else {
        return;
    };
    if let Some(old) = guard.take() {
        debug!(generation = old.generation, "abandoning transporter");
        old.stop();
    }
    let generation = inner.progress.bump_generation();
    *guard = Some(Transporter::spawn(
        generation,
        Arc::clone(&inner.buffer),
        Arc::clone(&inner.database),
        inner.config.clone(),
        Arc::clone(&inner.progress),
    ));
}

// ------------------------------------------------------------------------------------------------
// AtomicSupport
// ------------------------------------------------------------------------------------------------

impl AtomicSupport for Engine {
    fn registry(&self) -> &ListenerRegistry {
        &self.inner.registry
    }

    fn locks(&self) -> &TokenLocks {
        &self.inner.locks
    }

    fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    fn stopword_list(&self) -> &[String] {
        &self.inner.config.stopwords
    }

    fn deliver_write(&self, write: Write, exclude: Option<u64>) -> Result<(), EngineError> {
        self.deliver(write, exclude)
    }

    fn adopt_intents(&self, _intents: &[LockIntent]) {
        // The engine is the lock authority; nothing to inherit.
    }

    fn base_verify(&self, key: &str, value: &Value, record: Id) -> Result<bool, EngineError> {
        self.verify(key, value, record)
    }

    fn base_select(&self, key: &str, record: Id) -> Result<BTreeSet<Value>, EngineError> {
        self.select(key, record)
    }

    fn base_describe(&self, record: Id) -> Result<BTreeSet<Text>, EngineError> {
        self.describe(record)
    }

    fn base_browse(&self, key: &str) -> Result<BTreeMap<Value, BTreeSet<Id>>, EngineError> {
        self.browse(key)
    }

    fn base_find_context(&self, key: &str) -> Result<BTreeMap<Id, BTreeSet<Value>>, EngineError> {
        self.find_context(key)
    }

    fn base_search(&self, key: &str, query: &str) -> Result<BTreeSet<Id>, EngineError> {
        self.search(key, query)
    }
}
