//! # Limbo — unindexed in-memory write logs
//!
//! Limbo is the abstraction over any store of raw [`Write`]s that has
//! not been indexed into blocks: the transaction write sets and, at a
//! higher layer, the buffer overlay. Reads are **naive linear scans**
//! with toggle semantics — an ADD inserts a value into the running view,
//! a REMOVE deletes it — truncated at the requested timestamp.
//!
//! Linear reads are the point, not a shortcut: limbo data is small
//! (a transaction's staged writes, one buffer's pages) and is replaced
//! by indexed block reads the moment it is transported.
//!
//! ## Implementations
//!
//! - [`Queue`] — a plain `Vec`-backed log; the private write set of an
//!   atomic operation.
//! - [`TransactionQueue`] — a [`Queue`] plus a bloom filter over
//!   `(key, value, record)` composites that short-circuits `verify`
//!   misses, sized for long-lived transactions.
//! - `Buffer` (in [`crate::buffer`]) — the durable, paged variant.

#[cfg(test)]
mod tests;

use crate::model::{Action, Id, Operator, Text, Value, Write};
use crate::tokenizer;
use bloomfilter::Bloom;
use std::collections::{BTreeMap, BTreeSet};

/// Bloom sizing for a transaction's write set.
const TRANSACTION_FILTER_INSERTIONS: usize = 65_536;
const TRANSACTION_FILTER_FP_RATE: f64 = 0.03;

// ------------------------------------------------------------------------------------------------
// Limbo
// ------------------------------------------------------------------------------------------------

/// Read operations over an unindexed write log.
///
/// Every provided method is a linear scan over [`Limbo::for_each_write`]
/// in insertion order, honouring the alternating ADD/REMOVE invariant:
/// the state at time `ts` is the fold of all writes with
/// `version <= ts`.
pub trait Limbo {
    /// Visits every write in insertion order.
    fn for_each_write(&self, f: &mut dyn FnMut(&Write));

    /// Whether `(key, value, record)` is present at `ts` **within this
    /// log alone** — i.e. whether the log contains an odd number of
    /// matching writes. Callers combine this with a base store by XOR.
    fn verify(&self, key: &str, value: &Value, record: Id, ts: u64) -> bool {
        let mut present = false;
        self.for_each_write(&mut |w| {
            if w.version() <= ts && w.is_datum(key, value, record) {
                present = !present;
            }
        });
        present
    }

    /// Applies this log's writes for `(key, record)` at `ts` on top of
    /// `base`, toggling set membership per write.
    fn select(&self, key: &str, record: Id, ts: u64, base: &mut BTreeSet<Value>) {
        self.for_each_write(&mut |w| {
            if w.version() <= ts && w.record() == record && w.key() == key {
                toggle_value(base, w);
            }
        });
    }

    /// Applies this log's writes for `record` at `ts` on top of `base`,
    /// one value set per key. Keys whose sets empty out are removed.
    fn select_fields(&self, record: Id, ts: u64, base: &mut BTreeMap<Text, BTreeSet<Value>>) {
        self.for_each_write(&mut |w| {
            if w.version() <= ts && w.record() == record {
                let set = base.entry(w.key().clone()).or_default();
                toggle_value(set, w);
            }
        });
        base.retain(|_, set| !set.is_empty());
    }

    /// Applies this log's writes for `key` at `ts` on top of `base`,
    /// mapping each value to the records holding it.
    fn browse(&self, key: &str, ts: u64, base: &mut BTreeMap<Value, BTreeSet<Id>>) {
        self.for_each_write(&mut |w| {
            if w.version() <= ts && w.key() == key {
                let records = base.entry(w.value().clone()).or_default();
                if records.contains(&w.record()) {
                    records.remove(&w.record());
                } else {
                    records.insert(w.record());
                }
            }
        });
        base.retain(|_, records| !records.is_empty());
    }

    /// Applies this log's writes for `key` at `ts` on top of the
    /// per-record value views in `context`. Records whose sets empty
    /// out are dropped.
    fn fold_key(&self, key: &str, ts: u64, context: &mut BTreeMap<Id, BTreeSet<Value>>) {
        self.for_each_write(&mut |w| {
            if w.version() <= ts && w.key() == key {
                let set = context.entry(w.record()).or_default();
                toggle_value(set, w);
            }
        });
        context.retain(|_, values| !values.is_empty());
    }

    /// Applies this log's writes for `key` at `ts` on top of the
    /// per-record value views in `context`, then evaluates `operator`
    /// against each record's remaining values.
    fn find(
        &self,
        key: &str,
        operator: Operator,
        operands: &[Value],
        ts: u64,
        context: &mut BTreeMap<Id, BTreeSet<Value>>,
    ) -> BTreeSet<Id> {
        self.fold_key(key, ts, context);
        context
            .iter()
            .filter(|(_, values)| values.iter().any(|v| operator.evaluate(v, operands)))
            .map(|(record, _)| *record)
            .collect()
    }

    /// Records whose **log-local** present text values for `key` match
    /// `query` as a phrase. Callers use this as a candidate set to
    /// re-verify against the composite view.
    fn search(&self, key: &str, query: &str, stopwords: &[String]) -> BTreeSet<Id> {
        let query_tokens = tokenizer::tokenize(query, stopwords);
        if query_tokens.is_empty() {
            return BTreeSet::new();
        }

        // Fold to the log-local present (value, record) pairs first;
        // tokenizing removed values would resurrect them.
        let mut present: BTreeSet<(Id, String)> = BTreeSet::new();
        self.for_each_write(&mut |w| {
            if w.key() == key
                && let Value::Text(text) = w.value()
            {
                let entry = (w.record(), text.clone());
                if present.contains(&entry) {
                    present.remove(&entry);
                } else {
                    present.insert(entry);
                }
            }
        });

        present
            .into_iter()
            .filter(|(_, text)| {
                let value_tokens = tokenizer::tokenize(text, stopwords);
                tokenizer::phrase_matches(&value_tokens, &query_tokens)
            })
            .map(|(record, _)| record)
            .collect()
    }

    /// Every write touching `record` at or before `ts`, in version
    /// order — the raw material of an audit.
    fn audit_record(&self, record: Id, ts: u64) -> Vec<Write> {
        let mut writes = Vec::new();
        self.for_each_write(&mut |w| {
            if w.version() <= ts && w.record() == record {
                writes.push(w.clone());
            }
        });
        writes
    }

    /// Every write touching `(key, record)` at or before `ts`, in
    /// version order.
    fn audit_field(&self, key: &str, record: Id, ts: u64) -> Vec<Write> {
        let mut writes = Vec::new();
        self.for_each_write(&mut |w| {
            if w.version() <= ts && w.record() == record && w.key() == key {
                writes.push(w.clone());
            }
        });
        writes
    }
}

/// Toggles `write.value()` in `set`: ADD inserts, REMOVE removes.
fn toggle_value(set: &mut BTreeSet<Value>, write: &Write) {
    match write.action() {
        Action::Add => {
            set.insert(write.value().clone());
        }
        Action::Remove => {
            set.remove(write.value());
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Queue
// ------------------------------------------------------------------------------------------------

/// A plain in-memory write log backed by a `Vec`.
#[derive(Debug, Default)]
pub struct Queue {
    writes: Vec<Write>,
}

impl Queue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a write.
    pub fn insert(&mut self, write: Write) {
        self.writes.push(write);
    }

    /// The staged writes in insertion order.
    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the queue holds no writes.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Removes and returns all staged writes.
    pub fn drain(&mut self) -> Vec<Write> {
        std::mem::take(&mut self.writes)
    }
}

impl Limbo for Queue {
    fn for_each_write(&self, f: &mut dyn FnMut(&Write)) {
        for write in &self.writes {
            f(write);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TransactionQueue
// ------------------------------------------------------------------------------------------------

/// A [`Queue`] that additionally maintains a bloom filter over
/// `(key, value, record)` composites, so `verify` misses return without
/// scanning — transactions verify their own write set on every read.
#[derive(Debug)]
pub struct TransactionQueue {
    queue: Queue,
    /// `None` only if filter sizing failed — verify then degrades to a
    /// plain scan, which is still correct.
    filter: Option<Bloom<[u8]>>,
}

impl TransactionQueue {
    /// Creates an empty transaction queue.
    pub fn new() -> Self {
        Self {
            queue: Queue::new(),
            filter: Bloom::new_for_fp_rate(
                TRANSACTION_FILTER_INSERTIONS,
                TRANSACTION_FILTER_FP_RATE,
            )
            .ok(),
        }
    }

    /// Appends a write, recording its datum in the filter.
    pub fn insert(&mut self, write: Write) {
        if let Some(filter) = &mut self.filter {
            filter.set(&write.datum_composite());
        }
        self.queue.insert(write);
    }

    /// The staged writes in insertion order.
    pub fn writes(&self) -> &[Write] {
        self.queue.writes()
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue holds no writes.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for TransactionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Limbo for TransactionQueue {
    fn for_each_write(&self, f: &mut dyn FnMut(&Write)) {
        self.queue.for_each_write(f);
    }

    fn verify(&self, key: &str, value: &Value, record: Id, ts: u64) -> bool {
        if let Some(filter) = &self.filter {
            let composite = crate::model::composite_three(&key.to_string(), value, &record);
            if !filter.check(&composite) {
                return false;
            }
        }
        self.queue.verify(key, value, record, ts)
    }
}
