//! Striped token locks.
//!
//! Tokens identify an unbounded space of read/write scopes, so locks
//! cannot exist per token. Instead each token hashes onto one of a
//! fixed number of reader/writer **stripes**; locking a token locks its
//! stripe. Two distinct tokens may share a stripe — false contention is
//! the price of a bounded lock table — but a token never maps to two
//! stripes, so mutual exclusion is preserved.
//!
//! Deadlock freedom: every multi-stripe acquisition (engine writes,
//! atomic commits) sorts its stripe indices ascending and deduplicates
//! before acquiring, so no two lockers ever wait on each other in a
//! cycle.

use crate::model::Token;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of stripes in the table.
const STRIPE_COUNT: usize = 1024;

/// One lock intent: a token plus the side required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockIntent {
    /// The scope to lock.
    pub token: Token,

    /// Whether the write side is required.
    pub exclusive: bool,
}

/// A held stripe guard, read or write side.
pub enum StripeGuard<'a> {
    /// Shared side held.
    Read(RwLockReadGuard<'a, ()>),

    /// Exclusive side held.
    Write(RwLockWriteGuard<'a, ()>),
}

/// The striped token lock table.
pub struct TokenLocks {
    stripes: Vec<RwLock<()>>,
}

impl TokenLocks {
    /// Creates a table with the default stripe count.
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| RwLock::new(())).collect(),
        }
    }

    /// The stripe index a token maps to.
    fn stripe_of(&self, token: Token) -> usize {
        let bytes = token.to_bytes();
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&bytes[..8]);
        (u64::from_be_bytes(hash) as usize) % self.stripes.len()
    }

    /// Acquires the write side of every stripe the given tokens map to,
    /// in canonical (ascending, deduplicated) order.
    pub fn write_guards(&self, tokens: &[Token]) -> Result<Vec<StripeGuard<'_>>, String> {
        let intents: Vec<LockIntent> = tokens
            .iter()
            .map(|t| LockIntent {
                token: *t,
                exclusive: true,
            })
            .collect();
        self.acquire(&intents)
    }

    /// Acquires guards for a set of intents in canonical order.
    ///
    /// When both sides of the same stripe are requested, the exclusive
    /// side wins (the lock-upgrade rule: a shared intent subsumed by an
    /// exclusive intent on the same scope re-validates via the
    /// version-change registry, not the lock).
    pub fn acquire(&self, intents: &[LockIntent]) -> Result<Vec<StripeGuard<'_>>, String> {
        let mut stripes: Vec<(usize, bool)> = intents
            .iter()
            .map(|intent| (self.stripe_of(intent.token), intent.exclusive))
            .collect();
        stripes.sort_unstable();
        // After sorting, (stripe, false) precedes (stripe, true);
        // keep the last entry per stripe so exclusive wins.
        let mut deduped: Vec<(usize, bool)> = Vec::with_capacity(stripes.len());
        for (stripe, exclusive) in stripes {
            match deduped.last_mut() {
                Some((last, last_exclusive)) if *last == stripe => {
                    *last_exclusive = *last_exclusive || exclusive;
                }
                _ => deduped.push((stripe, exclusive)),
            }
        }

        let mut guards = Vec::with_capacity(deduped.len());
        for (stripe, exclusive) in deduped {
            let lock = &self.stripes[stripe];
            let guard = if exclusive {
                StripeGuard::Write(lock.write().map_err(|_| "token stripe poisoned")?)
            } else {
                StripeGuard::Read(lock.read().map_err(|_| "token stripe poisoned")?)
            };
            guards.push(guard);
        }
        Ok(guards)
    }
}

impl Default for TokenLocks {
    fn default() -> Self {
        Self::new()
    }
}
