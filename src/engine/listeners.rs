//! The version-change listener registry.
//!
//! Atomic operations and transactions observe reads by registering a
//! [`ListenerHandle`] against the point tokens and value ranges they
//! touch. Every committed write announces itself here; intersecting
//! listeners are **preempted** — a flag flip, nothing more. The
//! preempted operation notices on its next action or at commit.
//!
//! Registrations hold the handle weakly and are additionally unindexed
//! by operation id when the operation finishes, so an aborted or
//! forgotten operation never pins registry memory: dead entries are
//! pruned during announcements.

use crate::model::{RangeScope, Token, Value, Write};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// ListenerHandle
// ------------------------------------------------------------------------------------------------

/// The preemption flag shared between one operation and the registry.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    preempted: AtomicBool,
}

impl ListenerHandle {
    /// The operation id this handle belongs to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a conflicting write has been observed.
    pub fn is_preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }

    /// Marks the operation preempted.
    pub fn preempt(&self) {
        self.preempted.store(true, Ordering::Release);
    }
}

// ------------------------------------------------------------------------------------------------
// ListenerRegistry
// ------------------------------------------------------------------------------------------------

/// Maps point tokens and value ranges to the live listeners observing
/// them.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    point: Mutex<HashMap<Token, HashMap<u64, Weak<ListenerHandle>>>>,
    range: Mutex<HashMap<u64, (Weak<ListenerHandle>, Vec<RangeScope>)>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh handle for a new operation.
    pub fn new_handle(&self) -> Arc<ListenerHandle> {
        Arc::new(ListenerHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            preempted: AtomicBool::new(false),
        })
    }

    /// Registers `handle` as a listener on a point token.
    pub fn register_point(&self, token: Token, handle: &Arc<ListenerHandle>) {
        if let Ok(mut point) = self.point.lock() {
            point
                .entry(token)
                .or_default()
                .insert(handle.id(), Arc::downgrade(handle));
        }
    }

    /// Registers `handle` as a listener on a value range scope.
    pub fn register_range(&self, scope: RangeScope, handle: &Arc<ListenerHandle>) {
        if let Ok(mut range) = self.range.lock() {
            let entry = range
                .entry(handle.id())
                .or_insert_with(|| (Arc::downgrade(handle), Vec::new()));
            entry.1.push(scope);
        }
    }

    /// Removes every registration of operation `id`.
    pub fn unregister(&self, id: u64) {
        if let Ok(mut point) = self.point.lock() {
            point.retain(|_, listeners| {
                listeners.remove(&id);
                !listeners.is_empty()
            });
        }
        if let Ok(mut range) = self.range.lock() {
            range.remove(&id);
        }
    }

    /// Announces a committed write: preempts every live listener whose
    /// point token or range scope it intersects, except the announcing
    /// operation itself. Dead registrations are pruned in passing.
    pub fn announce(&self, write: &Write, exclude: Option<u64>) {
        let tokens = Token::for_write(write.key(), write.record());
        if let Ok(mut point) = self.point.lock() {
            for token in tokens {
                let Some(listeners) = point.get_mut(&token) else {
                    continue;
                };
                listeners.retain(|id, weak| {
                    let Some(handle) = weak.upgrade() else {
                        return false;
                    };
                    if Some(*id) != exclude {
                        trace!(listener = id, %token, "listener preempted by point write");
                        handle.preempt();
                    }
                    true
                });
                if listeners.is_empty() {
                    point.remove(&token);
                }
            }
        }
        self.announce_range(write.key(), write.value(), exclude);
    }

    fn announce_range(&self, key: &str, value: &Value, exclude: Option<u64>) {
        if let Ok(mut range) = self.range.lock() {
            range.retain(|id, (weak, scopes)| {
                let Some(handle) = weak.upgrade() else {
                    return false;
                };
                if Some(*id) != exclude && scopes.iter().any(|s| s.intersects(key, value)) {
                    trace!(listener = id, key, "listener preempted by ranged write");
                    handle.preempt();
                }
                true
            });
        }
    }
}
