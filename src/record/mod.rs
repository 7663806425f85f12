//! # Record — the in-memory aggregate of one locator's revisions
//!
//! A [`Record`] folds every revision for a single locator (in one
//! family) into two views:
//!
//! - `present` — the values currently present per key, maintained by
//!   toggle: an ADD inserts, a REMOVE deletes.
//! - `history` — the full, version-ordered revision list per key, from
//!   which any historical state can be replayed.
//!
//! Records are **caches, not owners**: they are constructed lazily on
//! first access by replaying the admitting blocks (and the buffer
//! overlay, at the engine layer), may be evicted at any time, and must
//! always be re-buildable from scratch. The database keeps them in a
//! per-family cache keyed by locator and invalidates them when a write
//! touches the locator; blocks hold no back-references to records.
//!
//! Revisions must be appended in ascending version order — block seeks
//! yield canonical order per block, and the database merges blocks in
//! creation order, which preserves per-`(locator, key, value)` version
//! order end to end.

#[cfg(test)]
mod tests;

use crate::model::{Action, Component, Position, Revision};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// The in-memory aggregate of all revisions for one locator.
#[derive(Debug, Clone)]
pub struct Record<L, K, V> {
    locator: L,
    present: BTreeMap<K, BTreeSet<V>>,
    history: BTreeMap<K, Vec<Revision<L, K, V>>>,
    version: u64,
}

/// A primary-family record: one logical entity's fields.
pub type PrimaryRecord = Record<crate::model::Id, crate::model::Text, crate::model::Value>;

/// An index-family record: one field name's value → records map.
pub type IndexRecord = Record<crate::model::Text, crate::model::Value, crate::model::Id>;

/// A search-family record: one field name's token → positions map.
pub type SearchRecord = Record<crate::model::Text, crate::model::Text, Position>;

impl<L: Component, K: Component, V: Component> Record<L, K, V> {
    /// Creates an empty record for `locator`.
    pub fn new(locator: L) -> Self {
        Self {
            locator,
            present: BTreeMap::new(),
            history: BTreeMap::new(),
            version: 0,
        }
    }

    /// The locator this record aggregates.
    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// The highest version appended so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Folds `revision` into both views.
    ///
    /// Revisions for a foreign locator are dropped with a warning — the
    /// caller owns the invariant and a violation must not corrupt the
    /// aggregate.
    pub fn append(&mut self, revision: Revision<L, K, V>) {
        if revision.locator() != &self.locator {
            warn!(?revision, "revision for foreign locator dropped");
            return;
        }
        let set = self.present.entry(revision.key().clone()).or_default();
        match revision.action() {
            Action::Add => {
                set.insert(revision.value().clone());
            }
            Action::Remove => {
                set.remove(revision.value());
            }
        }
        if set.is_empty() {
            self.present.remove(revision.key());
        }
        self.version = self.version.max(revision.version());
        self.history
            .entry(revision.key().clone())
            .or_default()
            .push(revision);
    }

    /// The values currently present for `key`.
    pub fn get(&self, key: &K) -> BTreeSet<V> {
        self.present.get(key).cloned().unwrap_or_default()
    }

    /// The values present for `key` as of `version`, replayed from
    /// history.
    pub fn get_at(&self, key: &K, version: u64) -> BTreeSet<V> {
        let mut set = BTreeSet::new();
        if let Some(revisions) = self.history.get(key) {
            for revision in revisions {
                if revision.version() > version {
                    continue;
                }
                match revision.action() {
                    Action::Add => {
                        set.insert(revision.value().clone());
                    }
                    Action::Remove => {
                        set.remove(revision.value());
                    }
                }
            }
        }
        set
    }

    /// The keys with at least one present value.
    pub fn keys(&self) -> BTreeSet<K> {
        self.present.keys().cloned().collect()
    }

    /// The keys with at least one value present as of `version`.
    pub fn keys_at(&self, version: u64) -> BTreeSet<K> {
        self.history
            .keys()
            .filter(|key| !self.get_at(key, version).is_empty())
            .cloned()
            .collect()
    }

    /// The full present view: key → values.
    pub fn all(&self) -> BTreeMap<K, BTreeSet<V>> {
        self.present.clone()
    }

    /// The full present view as of `version`.
    pub fn all_at(&self, version: u64) -> BTreeMap<K, BTreeSet<V>> {
        self.history
            .keys()
            .filter_map(|key| {
                let set = self.get_at(key, version);
                if set.is_empty() {
                    None
                } else {
                    Some((key.clone(), set))
                }
            })
            .collect()
    }

    /// The revision history for `key`, version-ascending.
    pub fn audit(&self, key: &K) -> Vec<Revision<L, K, V>> {
        self.history.get(key).cloned().unwrap_or_default()
    }

    /// The revision history across all keys, version-ascending.
    pub fn audit_all(&self) -> Vec<Revision<L, K, V>> {
        let mut revisions: Vec<Revision<L, K, V>> =
            self.history.values().flatten().cloned().collect();
        revisions.sort_by_key(Revision::version);
        revisions
    }

    /// Whether any value is currently present under any key.
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}
