//! # Transaction — long-lived atomic operation with a durable backup
//!
//! A [`Transaction`] buffers its writes in a private
//! [`TransactionQueue`] and serves every read from the composite of
//! that queue and the engine's current view. Reads register the
//! transaction as a version-change listener with the **engine's**
//! registry, so any external write that intersects the transaction's
//! read set preempts it; the failure surfaces at commit.
//!
//! Nested [`AtomicOperation`](crate::atomic::AtomicOperation)s spawn
//! from the transaction via [`AtomicSupport`]: they see the
//! transaction's staged writes (through the `base_*` view), register
//! their listeners with the transaction's **local** registry (so
//! sibling operations and direct transaction writes preempt them), and
//! on commit their writes and lock intents fold into the transaction.
//! A nested operation failing locally does not kill the transaction; a
//! preempted transaction dooms all of its nested operations.
//!
//! ## Commit
//!
//! 1. refuse unless OPEN and not preempted;
//! 2. acquire every accumulated lock intent in canonical order;
//! 3. re-check the preemption flag;
//! 4. durably back the locks + writes to `transactions/<version>.txn`;
//! 5. write through to the engine (announcing each write);
//! 6. delete the backup and release.
//!
//! A crash between 4 and 6 leaves the backup behind; the engine
//! restores it on startup by replaying the writes and deleting the
//! file.

use crate::atomic::{AtomicError, AtomicSupport, BACKUP_EXT, write_backup};
use crate::clock::Clock;
use crate::engine::lock::{LockIntent, TokenLocks};
use crate::engine::listeners::{ListenerHandle, ListenerRegistry};
use crate::engine::{Engine, EngineError};
use crate::limbo::{Limbo, TransactionQueue};
use crate::model::{
    Id, Operator, RangeScope, Text, Token, Value, ValueRange, Write,
};
use crate::tokenizer;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Failures specific to transactions; the state-machine failures reuse
/// [`AtomicError`].
#[derive(Debug, Error)]
pub enum TransactionError {
    /// An external write invalidated the transaction's read set.
    #[error("the transaction was invalidated by a conflicting write")]
    Invalidated,

    /// The transaction already committed or aborted.
    #[error("the transaction has already finished")]
    Finished,

    /// An error surfaced from the underlying engine.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl From<TransactionError> for AtomicError {
    fn from(e: TransactionError) -> Self {
        match e {
            TransactionError::Invalidated => AtomicError::Preempted,
            TransactionError::Finished => AtomicError::Finished,
            TransactionError::Engine(inner) => AtomicError::Engine(inner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    Aborted,
    Invalidated,
}

// ------------------------------------------------------------------------------------------------
// Transaction
// ------------------------------------------------------------------------------------------------

/// A long-lived, durably-backed atomic operation over an [`Engine`].
pub struct Transaction {
    engine: Engine,
    handle: Arc<ListenerHandle>,
    local_registry: ListenerRegistry,
    queue: Mutex<TransactionQueue>,
    intents: Mutex<Vec<LockIntent>>,
    state: Mutex<TxState>,
}

impl Transaction {
    /// Opens a transaction against `engine`.
    pub(crate) fn new(engine: Engine) -> Self {
        let handle = engine.registry_ref().new_handle();
        trace!(id = handle.id(), "transaction opened");
        Self {
            engine,
            handle,
            local_registry: ListenerRegistry::new(),
            queue: Mutex::new(TransactionQueue::new()),
            intents: Mutex::new(Vec::new()),
            state: Mutex::new(TxState::Open),
        }
    }

    /// Starts a nested atomic operation that sees this transaction's
    /// staged writes.
    pub fn start_atomic_operation(&self) -> crate::atomic::AtomicOperation<'_> {
        crate::atomic::AtomicOperation::new(self)
    }

    fn check_open(&self) -> Result<(), TransactionError> {
        let state = self
            .state
            .lock()
            .map_err(|_| internal("transaction state lock poisoned"))?;
        match *state {
            TxState::Open => {
                if self.handle.is_preempted() {
                    Err(TransactionError::Invalidated)
                } else {
                    Ok(())
                }
            }
            TxState::Invalidated => Err(TransactionError::Invalidated),
            TxState::Committed | TxState::Aborted => Err(TransactionError::Finished),
        }
    }

    /// Records a point read at the transaction level: listener in the
    /// engine registry plus a shared lock intent.
    fn observe_point(&self, token: Token) -> Result<(), TransactionError> {
        self.engine.registry_ref().register_point(token, &self.handle);
        self.intents
            .lock()
            .map_err(|_| internal("transaction intents lock poisoned"))?
            .push(LockIntent {
                token,
                exclusive: false,
            });
        Ok(())
    }

    fn push_write_intents(&self, key: &str, record: Id) -> Result<(), TransactionError> {
        let mut intents = self
            .intents
            .lock()
            .map_err(|_| internal("transaction intents lock poisoned"))?;
        for token in Token::for_write(key, record) {
            intents.push(LockIntent {
                token,
                exclusive: true,
            });
        }
        Ok(())
    }

    fn with_queue<R>(
        &self,
        f: impl FnOnce(&TransactionQueue) -> R,
    ) -> Result<R, TransactionError> {
        let queue = self
            .queue
            .lock()
            .map_err(|_| internal("transaction queue lock poisoned"))?;
        Ok(f(&queue))
    }

    // --------------------------------------------------------------------------------------------
    // Reads — the composite engine ∪ queue view
    // --------------------------------------------------------------------------------------------

    /// Whether `(key, value, record)` is present in the transaction's
    /// view.
    pub fn verify(&self, key: &str, value: &Value, record: Id) -> Result<bool, TransactionError> {
        self.check_open()?;
        self.observe_point(Token::for_field(key, record))?;
        let base = self.engine.verify(key, value, record)?;
        Ok(base ^ self.with_queue(|q| q.verify(key, value, record, u64::MAX))?)
    }

    /// The values present for `(key, record)` in the transaction's
    /// view.
    pub fn select(&self, key: &str, record: Id) -> Result<BTreeSet<Value>, TransactionError> {
        self.check_open()?;
        self.observe_point(Token::for_field(key, record))?;
        let mut values = self.engine.select(key, record)?;
        self.with_queue(|q| q.select(key, record, u64::MAX, &mut values))?;
        Ok(values)
    }

    /// The keys of `record` with present values in the transaction's
    /// view.
    pub fn describe(&self, record: Id) -> Result<BTreeSet<Text>, TransactionError> {
        self.check_open()?;
        self.observe_point(Token::for_record(record))?;
        let mut fields = self.engine.select_record(record)?;
        self.with_queue(|q| q.select_fields(record, u64::MAX, &mut fields))?;
        Ok(fields.into_keys().collect())
    }

    /// The `value → records` view of `key` in the transaction's view.
    pub fn browse(&self, key: &str) -> Result<BTreeMap<Value, BTreeSet<Id>>, TransactionError> {
        self.check_open()?;
        self.observe_point(Token::for_key(key))?;
        let mut view = self.engine.browse(key)?;
        self.with_queue(|q| q.browse(key, u64::MAX, &mut view))?;
        Ok(view)
    }

    /// The records whose `key` values satisfy `operator` in the
    /// transaction's view.
    ///
    /// Registers only the observed value ranges — not the whole-key
    /// point token — so an external write invalidates the transaction
    /// iff it intersects the queried ranges.
    pub fn find(
        &self,
        key: &str,
        operator: Operator,
        operands: &[Value],
    ) -> Result<BTreeSet<Id>, TransactionError> {
        self.check_open()?;
        self.engine.registry_ref().register_range(
            RangeScope {
                key: key.to_string(),
                ranges: ValueRange::from_operator(operator, operands),
            },
            &self.handle,
        );
        let mut context = self.engine.find_context(key)?;
        self.with_queue(|q| q.find(key, operator, operands, u64::MAX, &mut context))
    }

    /// Records whose text under `key` matches `query` in the
    /// transaction's view.
    pub fn search(&self, key: &str, query: &str) -> Result<BTreeSet<Id>, TransactionError> {
        self.check_open()?;
        self.observe_point(Token::for_key(key))?;
        let stopwords = self.engine.stopwords().to_vec();
        let query_tokens = tokenizer::tokenize(query, &stopwords);
        if query_tokens.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut candidates = self.engine.search(key, query)?;
        candidates.extend(self.with_queue(|q| q.search(key, query, &stopwords))?);

        let mut out = BTreeSet::new();
        for record in candidates {
            let values = self.select(key, record)?;
            let matched = values.iter().any(|value| match value {
                Value::Text(text) => {
                    let value_tokens = tokenizer::tokenize(text, &stopwords);
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
    /// transaction's view.
    pub fn add(&self, key: &str, value: Value, record: Id) -> Result<bool, TransactionError> {
        if self.verify(key, &value, record)? {
            return Ok(false);
        }
        self.push_write_intents(key, record)?;
        let write = Write::add(key, value, record, self.engine.clock_ref().next());
        self.stage(write)?;
        Ok(true)
    }

    /// Stages a removal of `value` from `(key, record)`.
    ///
    /// Returns `false` when the value is not present in the
    /// transaction's view.
    pub fn remove(&self, key: &str, value: Value, record: Id) -> Result<bool, TransactionError> {
        if !self.verify(key, &value, record)? {
            return Ok(false);
        }
        self.push_write_intents(key, record)?;
        let write = Write::remove(key, value, record, self.engine.clock_ref().next());
        self.stage(write)?;
        Ok(true)
    }

    /// Stages a write and announces it to the local registry, so nested
    /// operations observing the scope are preempted.
    fn stage(&self, write: Write) -> Result<(), TransactionError> {
        self.queue
            .lock()
            .map_err(|_| internal("transaction queue lock poisoned"))?
            .insert(write.clone());
        self.local_registry.announce(&write, None);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Completion
    // --------------------------------------------------------------------------------------------

    /// Attempts to commit the transaction.
    ///
    /// See the [module docs](self) for the durable-backup protocol. On
    /// invalidation the transaction transitions terminally and the
    /// caller must start a new one.
    pub fn commit(&self) -> Result<(), TransactionError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| internal("transaction state lock poisoned"))?;
        match *state {
            TxState::Open => {}
            TxState::Invalidated => return Err(TransactionError::Invalidated),
            _ => return Err(TransactionError::Finished),
        }
        if self.handle.is_preempted() {
            *state = TxState::Invalidated;
            self.engine.registry_ref().unregister(self.handle.id());
            return Err(TransactionError::Invalidated);
        }

        let intents = self
            .intents
            .lock()
            .map_err(|_| internal("transaction intents lock poisoned"))?
            .clone();
        let guards = self
            .engine
            .locks_ref()
            .acquire(&intents)
            .map_err(|e| TransactionError::Engine(EngineError::Internal(e)))?;

        if self.handle.is_preempted() {
            drop(guards);
            *state = TxState::Invalidated;
            self.engine.registry_ref().unregister(self.handle.id());
            return Err(TransactionError::Invalidated);
        }

        let writes: Vec<Write> = self
            .queue
            .lock()
            .map_err(|_| internal("transaction queue lock poisoned"))?
            .writes()
            .to_vec();

        if writes.is_empty() {
            drop(guards);
            *state = TxState::Committed;
            self.engine.registry_ref().unregister(self.handle.id());
            return Ok(());
        }

        // Durable point of no return: a backup that survives a crash is
        // replayed into the engine on the next startup.
        let backup = self
            .engine
            .transactions_dir()
            .join(format!("{}.{BACKUP_EXT}", self.engine.clock_ref().next()));
        write_backup(&backup, &intents, &writes)?;

        for write in &writes {
            if let Err(e) = self.engine.deliver(write.clone(), Some(self.handle.id())) {
                // Storage-level fault mid write-through. The durable
                // backup stays behind; startup restore completes the
                // commit on the next open.
                drop(guards);
                *state = TxState::Aborted;
                self.engine.registry_ref().unregister(self.handle.id());
                return Err(TransactionError::Engine(e));
            }
        }

        std::fs::remove_file(&backup).map_err(EngineError::Io)?;
        drop(guards);

        *state = TxState::Committed;
        self.engine.registry_ref().unregister(self.handle.id());
        info!(
            id = self.handle.id(),
            writes = writes.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Abandons the transaction, discarding its staged writes.
    pub fn abort(&self) {
        if let Ok(mut state) = self.state.lock()
            && *state == TxState::Open
        {
            *state = TxState::Aborted;
            self.engine.registry_ref().unregister(self.handle.id());
            debug!(id = self.handle.id(), "transaction aborted");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.engine.registry_ref().unregister(self.handle.id());
    }
}

fn internal(message: &str) -> TransactionError {
    TransactionError::Engine(EngineError::Internal(message.into()))
}

// ------------------------------------------------------------------------------------------------
// AtomicSupport — nested operations
// ------------------------------------------------------------------------------------------------

impl AtomicSupport for Transaction {
    fn registry(&self) -> &ListenerRegistry {
        &self.local_registry
    }

    fn locks(&self) -> &TokenLocks {
        self.engine.locks_ref()
    }

    fn clock(&self) -> &Clock {
        self.engine.clock_ref()
    }

    fn stopword_list(&self) -> &[String] {
        self.engine.stopwords()
    }

    fn deliver_write(&self, write: Write, exclude: Option<u64>) -> Result<(), EngineError> {
        self.check_open()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        self.queue
            .lock()
            .map_err(|_| EngineError::Internal("transaction queue lock poisoned".into()))?
            .insert(write.clone());
        self.local_registry.announce(&write, exclude);
        Ok(())
    }

    fn adopt_intents(&self, intents: &[LockIntent]) {
        if let Ok(mut own) = self.intents.lock() {
            own.extend_from_slice(intents);
        }
    }

    fn record_range_read(&self, scope: &RangeScope) {
        // A nested ranged read is a transaction-level ranged read: an
        // external write intersecting it must invalidate the
        // transaction, not just the nested operation.
        self.engine
            .registry_ref()
            .register_range(scope.clone(), &self.handle);
    }

    fn is_doomed(&self) -> bool {
        self.handle.is_preempted()
            || !matches!(self.state.lock().as_deref(), Ok(TxState::Open))
    }

    fn base_verify(&self, key: &str, value: &Value, record: Id) -> Result<bool, EngineError> {
        // Nested reads record at the transaction level too: an external
        // write invalidating them must doom the transaction.
        self.verify(key, value, record).map_err(flatten)
    }

    fn base_select(&self, key: &str, record: Id) -> Result<BTreeSet<Value>, EngineError> {
        self.select(key, record).map_err(flatten)
    }

    fn base_describe(&self, record: Id) -> Result<BTreeSet<Text>, EngineError> {
        self.describe(record).map_err(flatten)
    }

    fn base_browse(&self, key: &str) -> Result<BTreeMap<Value, BTreeSet<Id>>, EngineError> {
        self.browse(key).map_err(flatten)
    }

    fn base_find_context(
        &self,
        key: &str,
    ) -> Result<BTreeMap<Id, BTreeSet<Value>>, EngineError> {
        // The ranged-read recording happens via `record_range_read`;
        // this only supplies the composite context.
        self.check_open().map_err(flatten)?;
        let mut context = self.engine.find_context(key)?;
        let queue = self
            .queue
            .lock()
            .map_err(|_| EngineError::Internal("transaction queue lock poisoned".into()))?;
        queue.fold_key(key, u64::MAX, &mut context);
        Ok(context)
    }

    fn base_search(&self, key: &str, query: &str) -> Result<BTreeSet<Id>, EngineError> {
        self.search(key, query).map_err(flatten)
    }
}

fn flatten(e: TransactionError) -> EngineError {
    match e {
        TransactionError::Engine(inner) => inner,
        other => EngineError::Internal(other.to_string()),
    }
}
