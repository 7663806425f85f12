//! # Atomic operations — short-lived optimistic isolation
//!
//! An [`AtomicOperation`] is a small optimistic transaction spawned
//! from an [`AtomicSupport`] destination — the engine itself, or a
//! [`Transaction`] for nested operations. It runs a three-state machine:
//!
//! ```text
//! OPEN ──commit()──► COMMITTED
//!   └──conflicting write observed──► PREEMPTED
//! ```
//!
//! Point reads register the operation as a version-change listener on
//! the tokens they touch and record a shared lock intent; ranged reads
//! register the value ranges they observe, so only an intersecting
//! write preempts them. Every write verifies through the operation's
//! composite view, records exclusive intents, and stages into a
//! private [`Queue`]. Nothing touches the destination until
//! `commit()`:
//!
//! 1. refuse unless the state is OPEN;
//! 2. acquire every intent in canonical token order (exclusive wins
//!    when a scope was both read and written — the lock upgrade);
//! 3. re-check the preemption flag — a conflicting write observed at
//!    any point fails the commit;
//! 4. deliver the staged writes to the destination (which announces
//!    them, preempting other observers) and release.
//!
//! A preempted operation reports [`AtomicError::Preempted`]; callers
//! are expected to retry in a loop. Dropping an operation unregisters
//! its listeners.

#[cfg(test)]
mod tests;

pub mod transaction;

pub use transaction::{Transaction, TransactionError};

use crate::clock::Clock;
use crate::engine::lock::{LockIntent, TokenLocks};
use crate::engine::listeners::{ListenerHandle, ListenerRegistry};
use crate::engine::EngineError;
use crate::limbo::{Limbo, Queue};
use crate::model::{
    Id, Operator, RangeScope, Text, Token, Value, ValueRange, Write,
};
use crate::tokenizer;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Extension of transaction backup files.
pub(crate) const BACKUP_EXT: &str = "txn";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Failures of the atomic state machine.
#[derive(Debug, Error)]
pub enum AtomicError {
    /// A conflicting write invalidated the operation's read set; the
    /// caller should retry from scratch.
    #[error("the operation was preempted by a conflicting write")]
    Preempted,

    /// The operation already committed or aborted.
    #[error("the operation has already finished")]
    Finished,

    /// An error surfaced from the underlying engine.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// AtomicSupport
// ------------------------------------------------------------------------------------------------

/// A destination that can host atomic operations: the engine, or a
/// transaction (for nested operations).
///
/// The `base_*` reads expose the destination's composite current view;
/// an operation overlays its private queue on top of them.
pub trait AtomicSupport: Send + Sync {
    /// The registry the operation registers its listeners with.
    fn registry(&self) -> &ListenerRegistry;

    /// The lock table commits acquire from.
    fn locks(&self) -> &TokenLocks;

    /// The version clock for staged writes.
    fn clock(&self) -> &Clock;

    /// The stopword list for search reads.
    fn stopword_list(&self) -> &[String];

    /// Accepts one committed write. The committing operation holds the
    /// relevant locks; `exclude` suppresses self-preemption.
    fn deliver_write(&self, write: Write, exclude: Option<u64>) -> Result<(), EngineError>;

    /// Inherits a committed nested operation's lock intents, so an
    /// enclosing transaction re-acquires them at its own commit.
    fn adopt_intents(&self, intents: &[LockIntent]);

    /// Records a ranged read at the destination's own isolation
    /// boundary. An enclosing transaction registers the scope with the
    /// engine's registry, so an external write intersecting it
    /// invalidates the transaction; the engine itself needs no extra
    /// recording (operations register with its registry directly).
    fn record_range_read(&self, _scope: &RangeScope) {}

    /// Whether the destination itself can no longer commit (a
    /// preempted or finished enclosing transaction). Operations on a
    /// doomed destination fail fast.
    fn is_doomed(&self) -> bool {
        false
    }

    /// Composite `verify` of the destination.
    fn base_verify(&self, key: &str, value: &Value, record: Id) -> Result<bool, EngineError>;

    /// Composite `select` of the destination.
    fn base_select(&self, key: &str, record: Id) -> Result<BTreeSet<Value>, EngineError>;

    /// Composite `describe` of the destination.
    fn base_describe(&self, record: Id) -> Result<BTreeSet<Text>, EngineError>;

    /// Composite `browse` of the destination.
    fn base_browse(&self, key: &str) -> Result<BTreeMap<Value, BTreeSet<Id>>, EngineError>;

    /// Composite per-record value views of `key`, for `find`.
    fn base_find_context(&self, key: &str)
    -> Result<BTreeMap<Id, BTreeSet<Value>>, EngineError>;

    /// Composite `search` candidates of the destination.
    fn base_search(&self, key: &str, query: &str) -> Result<BTreeSet<Id>, EngineError>;
}

// ------------------------------------------------------------------------------------------------
// AtomicOperation
// ------------------------------------------------------------------------------------------------

/// The state of an atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationState {
    Open,
    Committed,
    Preempted,
    Aborted,
}

/// A short-lived optimistic transaction over an [`AtomicSupport`]
/// destination.
pub struct AtomicOperation<'a> {
    dest: &'a dyn AtomicSupport,
    handle: Arc<ListenerHandle>,
    queue: Queue,
    intents: Vec<LockIntent>,
    state: OperationState,
}

impl<'a> AtomicOperation<'a> {
    /// Opens an operation against `dest`.
    pub fn new(dest: &'a dyn AtomicSupport) -> Self {
        let handle = dest.registry().new_handle();
        trace!(id = handle.id(), "atomic operation opened");
        Self {
            dest,
            handle,
            queue: Queue::new(),
            intents: Vec::new(),
            state: OperationState::Open,
        }
    }

    /// Whether the operation is still open and unpreempted.
    pub fn is_open(&self) -> bool {
        self.state == OperationState::Open && !self.handle.is_preempted() && !self.dest.is_doomed()
    }

    fn check_open(&mut self) -> Result<(), AtomicError> {
        match self.state {
            OperationState::Open => {
                if self.handle.is_preempted() || self.dest.is_doomed() {
                    self.finish(OperationState::Preempted);
                    Err(AtomicError::Preempted)
                } else {
                    Ok(())
                }
            }
            OperationState::Preempted => Err(AtomicError::Preempted),
            OperationState::Committed | OperationState::Aborted => Err(AtomicError::Finished),
        }
    }

    fn finish(&mut self, state: OperationState) {
        self.dest.registry().unregister(self.handle.id());
        self.state = state;
    }

    fn observe_point(&mut self, token: Token) {
        self.dest.registry().register_point(token, &self.handle);
        self.intents.push(LockIntent {
            token,
            exclusive: false,
        });
    }

    fn intend_write(&mut self, key: &str, record: Id) {
        for token in Token::for_write(key, record) {
            self.intents.push(LockIntent {
                token,
                exclusive: true,
            });
        }
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Whether `(key, value, record)` is present in the operation's
    /// view.
    pub fn verify(&mut self, key: &str, value: &Value, record: Id) -> Result<bool, AtomicError> {
        self.check_open()?;
        self.observe_point(Token::for_field(key, record));
        let base = self.dest.base_verify(key, value, record)?;
        Ok(base ^ self.queue.verify(key, value, record, u64::MAX))
    }

    /// The values present for `(key, record)` in the operation's view.
    pub fn select(&mut self, key: &str, record: Id) -> Result<BTreeSet<Value>, AtomicError> {
        self.check_open()?;
        self.observe_point(Token::for_field(key, record));
        let mut values = self.dest.base_select(key, record)?;
        self.queue.select(key, record, u64::MAX, &mut values);
        Ok(values)
    }

    /// The keys of `record` with present values in the operation's
    /// view.
    pub fn describe(&mut self, record: Id) -> Result<BTreeSet<Text>, AtomicError> {
        self.check_open()?;
        self.observe_point(Token::for_record(record));
        let mut keys = self.dest.base_describe(record)?;
        let touched: BTreeSet<Text> = {
            let mut touched = BTreeSet::new();
            self.queue.for_each_write(&mut |w| {
                if w.record() == record {
                    touched.insert(w.key().clone());
                }
            });
            touched
        };
        for key in touched {
            if self.select(&key, record)?.is_empty() {
                keys.remove(&key);
            } else {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    /// The `value → records` view of `key` in the operation's view.
    pub fn browse(&mut self, key: &str) -> Result<BTreeMap<Value, BTreeSet<Id>>, AtomicError> {
        self.check_open()?;
        self.observe_point(Token::for_key(key));
        let mut view = self.dest.base_browse(key)?;
        self.queue.browse(key, u64::MAX, &mut view);
        Ok(view)
    }

    /// The records whose `key` values satisfy `operator` in the
    /// operation's view.
    ///
    /// Registers only the observed value ranges — not the whole-key
    /// point token — so a concurrent write preempts the operation iff
    /// it intersects the queried ranges.
    pub fn find(
        &mut self,
        key: &str,
        operator: Operator,
        operands: &[Value],
    ) -> Result<BTreeSet<Id>, AtomicError> {
        self.check_open()?;
        let scope = RangeScope {
            key: key.to_string(),
            ranges: ValueRange::from_operator(operator, operands),
        };
        self.dest.registry().register_range(scope.clone(), &self.handle);
        self.dest.record_range_read(&scope);
        let mut context = self.dest.base_find_context(key)?;
        Ok(self
            .queue
            .find(key, operator, operands, u64::MAX, &mut context))
    }

    /// Records whose text under `key` matches `query` in the
    /// operation's view.
    pub fn search(&mut self, key: &str, query: &str) -> Result<BTreeSet<Id>, AtomicError> {
        self.check_open()?;
        self.observe_point(Token::for_key(key));
        let query_tokens = tokenizer::tokenize(query, self.dest.stopword_list());
        if query_tokens.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut candidates = self.dest.base_search(key, query)?;
        candidates.extend(self.queue.search(key, query, self.dest.stopword_list()));

        let mut out = BTreeSet::new();
        for record in candidates {
            let values = self.select(key, record)?;
            let matched = values.iter().any(|value| match value {
                Value::Text(text) => {
                    let value_tokens = tokenizer::tokenize(text, self.dest.stopword_list());
                    tokenizer::phrase_matches(&value_tokens, &query_tokens)
                }
                _ => false,
            });
            if matched {
                out.insert(record);
            }
        }
        Ok(out)
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Stages an add of `value` to `(key, record)`.
    ///
    /// Returns `false` when the value is already present in the
    /// operation's view (nothing is staged).
    pub fn add(&mut self, key: &str, value: Value, record: Id) -> Result<bool, AtomicError> {
        if self.verify(key, &value, record)? {
            return Ok(false);
        }
        self.intend_write(key, record);
        let write = Write::add(key, value, record, self.dest.clock().next());
        self.queue.insert(write);
        Ok(true)
    }

    /// Stages a removal of `value` from `(key, record)`.
    ///
    /// Returns `false` when the value is not present in the operation's
    /// view (nothing is staged).
    pub fn remove(&mut self, key: &str, value: Value, record: Id) -> Result<bool, AtomicError> {
        if !self.verify(key, &value, record)? {
            return Ok(false);
        }
        self.intend_write(key, record);
        let write = Write::remove(key, value, record, self.dest.clock().next());
        self.queue.insert(write);
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Completion
    // --------------------------------------------------------------------------------------------

    /// Attempts to commit the staged writes.
    ///
    /// Acquires every lock intent in canonical order, re-validates the
    /// read set via the preemption flag, and delivers the writes to the
    /// destination. On preemption the operation transitions to
    /// PREEMPTED and the caller should retry from scratch.
    pub fn commit(&mut self) -> Result<(), AtomicError> {
        if self.state != OperationState::Open {
            return Err(match self.state {
                OperationState::Preempted => AtomicError::Preempted,
                _ => AtomicError::Finished,
            });
        }

        let guards = self
            .dest
            .locks()
            .acquire(&self.intents)
            .map_err(|e| AtomicError::Engine(EngineError::Internal(e)))?;

        if self.handle.is_preempted() || self.dest.is_doomed() {
            drop(guards);
            self.finish(OperationState::Preempted);
            return Err(AtomicError::Preempted);
        }

        let writes = self.queue.drain();
        let count = writes.len();
        for write in writes {
            if let Err(e) = self.dest.deliver_write(write, Some(self.handle.id())) {
                // A delivery failure is a storage-level fault; the
                // operation cannot be retried against a half-applied
                // destination.
                drop(guards);
                self.finish(OperationState::Aborted);
                return Err(AtomicError::Engine(e));
            }
        }
        self.dest.adopt_intents(&self.intents);
        drop(guards);

        self.finish(OperationState::Committed);
        debug!(id = self.handle.id(), writes = count, "atomic operation committed");
        Ok(())
    }

    /// Abandons the operation, discarding its staged writes.
    pub fn abort(&mut self) {
        if self.state == OperationState::Open {
            self.finish(OperationState::Aborted);
            debug!(id = self.handle.id(), "atomic operation aborted");
        }
    }
}

impl Drop for AtomicOperation<'_> {
    fn drop(&mut self) {
        // Unregistering twice is harmless; this covers operations
        // dropped while still open.
        self.dest.registry().unregister(self.handle.id());
    }
}

// ------------------------------------------------------------------------------------------------
// Transaction backup files
// ------------------------------------------------------------------------------------------------

/// Serialises a transaction's locks and writes into its backup file:
/// `crc:4 | locksSize:4 | (token:16 | exclusive:1)* | (len:4 | write)*`.
/// The CRC covers everything after itself; restore discards files that
/// fail it (the transaction never finished validating).
pub(crate) fn write_backup(
    path: &std::path::Path,
    intents: &[LockIntent],
    writes: &[Write],
) -> Result<(), EngineError> {
    use crate::encoding::{Encode, encode_to_vec, len_to_u32};
    use std::io::Write as _;

    let mut body = Vec::new();
    len_to_u32(intents.len())?.encode_to(&mut body)?;
    for intent in intents {
        body.extend_from_slice(&intent.token.to_bytes());
        body.push(u8::from(intent.exclusive));
    }
    for write in writes {
        let bytes = encode_to_vec(write)?;
        len_to_u32(bytes.len())?.encode_to(&mut body)?;
        body.extend_from_slice(&bytes);
    }
    let crc = crc32fast::hash(&body);

    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    file.write_all(&crc.to_be_bytes())?;
    file.write_all(&body)?;
    file.sync_all()?;
    Ok(())
}

/// Parses a backup file, returning its writes. Fails on a CRC mismatch
/// or any structural error.
pub(crate) fn read_backup(path: &std::path::Path) -> Result<Vec<Write>, EngineError> {
    use crate::encoding::{Decode, require};

    let bytes = std::fs::read(path)?;
    require(&bytes, 4).map_err(EngineError::Encoding)?;
    let stored_crc = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let body = &bytes[4..];
    if crc32fast::hash(body) != stored_crc {
        return Err(EngineError::Internal(
            "transaction backup checksum mismatch".into(),
        ));
    }

    let (lock_count, mut offset) = u32::decode_from(body).map_err(EngineError::Encoding)?;
    offset += lock_count as usize * 17;
    require(body, offset).map_err(EngineError::Encoding)?;

    let mut writes = Vec::new();
    while offset < body.len() {
        let (len, n) = u32::decode_from(&body[offset..]).map_err(EngineError::Encoding)?;
        offset += n;
        let len = len as usize;
        require(&body[offset..], len).map_err(EngineError::Encoding)?;
        let (write, _) = Write::decode_from(&body[offset..offset + len])
            .map_err(EngineError::Encoding)?;
        offset += len;
        writes.push(write);
    }
    Ok(writes)
}
