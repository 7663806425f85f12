//! [`Token`] — opaque lock identities and notification keys — and
//! [`ValueRange`], the range shape registered by `find` readers.
//!
//! A token is the xxh3-128 hash of a scope descriptor. Three point
//! scopes exist:
//!
//! - `{record}` — the whole record (describe/select-all reads),
//! - `{key}` — a field name across all records (browse/find reads),
//! - `{key, record}` — one field of one record (select/verify reads and
//!   every write).
//!
//! Tokens bound the identity space of the striped lock table and key the
//! point side of the version-change registry. Range scopes cannot be
//! enumerated as tokens; they are kept as explicit [`ValueRange`]s in
//! the range registry and tested by containment.

use crate::model::{Id, Operator, Text, Value, composite_one, composite_two};
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

// ------------------------------------------------------------------------------------------------
// Token
// ------------------------------------------------------------------------------------------------

const SCOPE_RECORD: u8 = 1;
const SCOPE_KEY: u8 = 2;
const SCOPE_FIELD: u8 = 3;

/// An opaque 128-bit hash of a read or write scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u128);

impl Token {
    /// Token for the `{record}` scope.
    pub fn for_record(record: Id) -> Self {
        let mut buf = vec![SCOPE_RECORD];
        buf.extend_from_slice(&composite_one(&record));
        Token(xxh3_128(&buf))
    }

    /// Token for the `{key}` scope.
    pub fn for_key(key: &str) -> Self {
        let mut buf = vec![SCOPE_KEY];
        buf.extend_from_slice(&composite_one(&key.to_string()));
        Token(xxh3_128(&buf))
    }

    /// Token for the `{key, record}` scope.
    pub fn for_field(key: &str, record: Id) -> Self {
        let mut buf = vec![SCOPE_FIELD];
        buf.extend_from_slice(&composite_two(&key.to_string(), &record));
        Token(xxh3_128(&buf))
    }

    /// The three tokens a write to `(key, record)` invalidates.
    pub fn for_write(key: &str, record: Id) -> [Token; 3] {
        [
            Token::for_record(record),
            Token::for_key(key),
            Token::for_field(key, record),
        ]
    }

    /// The token's canonical 16-byte representation, used for lock
    /// ordering and the transaction backup format.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Reconstructs a token from its canonical bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Token(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

// ------------------------------------------------------------------------------------------------
// ValueRange
// ------------------------------------------------------------------------------------------------

/// A contiguous interval of [`Value`]s under the numeric-aware total
/// order, registered against a key by ranged readers.
///
/// Bounds are **conflict-inclusive** and compare with the same loose
/// relation the query operators use: a value that [`Value::matches`] a
/// bound (cross-kind numeric equality, case-insensitive Tag↔Text) is
/// inside the range. `Operator::evaluate` mixes `matches` with the
/// strict total order, so the only sound range test for conflict
/// detection is one that never reports "outside" for a value an
/// operator could accept; the cost is at most a spurious preemption
/// when a write lands exactly on a range boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRange {
    low: Option<Value>,
    high: Option<Value>,
}

impl ValueRange {
    /// The unbounded range — any value of the key intersects it.
    pub fn all() -> Self {
        Self {
            low: None,
            high: None,
        }
    }

    /// The degenerate range containing exactly `value` (and everything
    /// that loosely matches it).
    pub fn point(value: Value) -> Self {
        Self {
            low: Some(value.clone()),
            high: Some(value),
        }
    }

    /// The ranges a `find(key, operator, operands)` read observes.
    ///
    /// `Equals` collapses to points; `NotEquals` observes the whole key
    /// (any value change can flip the result set). Missing operands
    /// yield no ranges, matching `Operator::evaluate` returning `false`.
    pub fn from_operator(operator: Operator, operands: &[Value]) -> Vec<Self> {
        let Some(first) = operands.first() else {
            return Vec::new();
        };
        match operator {
            Operator::Equals => operands.iter().cloned().map(Self::point).collect(),
            Operator::NotEquals => vec![Self::all()],
            Operator::GreaterThan | Operator::GreaterThanOrEquals => vec![Self {
                low: Some(first.clone()),
                high: None,
            }],
            Operator::LessThan | Operator::LessThanOrEquals => vec![Self {
                low: None,
                high: Some(first.clone()),
            }],
            Operator::Between => match operands.get(1) {
                Some(second) => vec![Self {
                    low: Some(first.clone()),
                    high: Some(second.clone()),
                }],
                None => Vec::new(),
            },
        }
    }

    /// Whether `value` falls inside the range for conflict-detection
    /// purposes.
    ///
    /// A value is outside only when it is strictly beyond a bound *and*
    /// does not loosely match it, keeping containment a superset of
    /// every operator's acceptance at the bound.
    pub fn contains(&self, value: &Value) -> bool {
        if let Some(low) = &self.low
            && !value.matches(low)
            && value.cmp(low) == std::cmp::Ordering::Less
        {
            return false;
        }
        if let Some(high) = &self.high
            && !value.matches(high)
            && value.cmp(high) == std::cmp::Ordering::Greater
        {
            return false;
        }
        true
    }
}

/// A key plus the value ranges observed under it — the registration unit
/// of the range side of the version-change registry.
#[derive(Debug, Clone)]
pub struct RangeScope {
    /// The observed field name.
    pub key: Text,

    /// The observed value intervals.
    pub ranges: Vec<ValueRange>,
}

impl RangeScope {
    /// Whether a write of `value` under `key` intersects this scope.
    pub fn intersects(&self, key: &str, value: &Value) -> bool {
        self.key == key && self.ranges.iter().any(|r| r.contains(value))
    }
}
