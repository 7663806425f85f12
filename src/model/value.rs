//! The [`Value`] tagged union and its numeric-aware total order.
//!
//! Values are persisted as a 1-byte type tag followed by the payload.
//! The comparator orders values by class (booleans, then numbers, then
//! textual values, then links); all numeric kinds compare with each
//! other as numbers, exactly, without rounding through a common float
//! type. Textual ordering is case-sensitive; the case-insensitive
//! Tag↔Text equivalence applies only to [`Value::matches`], which the
//! query operators use.

use crate::encoding::{Decode, Encode, EncodingError};
use crate::model::{Component, Id};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

// ------------------------------------------------------------------------------------------------
// Type tags
// ------------------------------------------------------------------------------------------------

const TAG_BOOLEAN: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_TEXT: u8 = 6;
const TAG_TAG: u8 = 7;
const TAG_LINK: u8 = 8;

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// A storable scalar value.
///
/// Persisted as `tag:1 | payload`. See the module docs for ordering
/// semantics.
#[derive(Debug, Clone)]
pub enum Value {
    /// A boolean.
    Boolean(bool),

    /// A 32-bit signed integer.
    Integer(i32),

    /// A 64-bit signed integer.
    Long(i64),

    /// A 32-bit IEEE-754 float.
    Float(f32),

    /// A 64-bit IEEE-754 float.
    Double(f64),

    /// A UTF-8 string.
    Text(String),

    /// A string that is exempt from search indexing.
    Tag(String),

    /// A link to another record.
    Link(Id),
}

/// Class rank used as the primary sort criterion. Booleans sort before
/// numbers, numbers before textual values, textual values before links.
fn class_rank(value: &Value) -> u8 {
    match value {
        Value::Boolean(_) => 0,
        Value::Integer(_) | Value::Long(_) | Value::Float(_) | Value::Double(_) => 1,
        Value::Text(_) | Value::Tag(_) => 2,
        Value::Link(_) => 3,
    }
}

/// A numeric payload widened losslessly for cross-kind comparison.
enum Number {
    Int(i64),
    Float(f64),
}

/// Compare an integer against a float exactly.
///
/// Floats outside the i64 range compare by sign; NaN sorts after every
/// number (mirroring `f64::total_cmp`).
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Less;
    }
    if f >= i64::MAX as f64 {
        return Ordering::Less;
    }
    if f <= i64::MIN as f64 {
        return Ordering::Greater;
    }
    let trunc = f.trunc() as i64;
    match i.cmp(&trunc) {
        Ordering::Equal => {
            let frac = f - trunc as f64;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x.cmp(y),
        (Number::Float(x), Number::Float(y)) => x.total_cmp(y),
        (Number::Int(x), Number::Float(y)) => cmp_int_float(*x, *y),
        (Number::Float(x), Number::Int(y)) => cmp_int_float(*y, *x).reverse(),
    }
}

impl Value {
    /// The 1-byte wire tag of this value's kind.
    pub fn tag(&self) -> u8 {
        match self {
            Value::Boolean(_) => TAG_BOOLEAN,
            Value::Integer(_) => TAG_INTEGER,
            Value::Long(_) => TAG_LONG,
            Value::Float(_) => TAG_FLOAT,
            Value::Double(_) => TAG_DOUBLE,
            Value::Text(_) => TAG_TEXT,
            Value::Tag(_) => TAG_TAG,
            Value::Link(_) => TAG_LINK,
        }
    }

    /// Returns the numeric payload, if this value is a number.
    fn as_number(&self) -> Option<Number> {
        match self {
            Value::Integer(i) => Some(Number::Int(i64::from(*i))),
            Value::Long(l) => Some(Number::Int(*l)),
            Value::Float(f) => Some(Number::Float(f64::from(*f))),
            Value::Double(d) => Some(Number::Float(*d)),
            _ => None,
        }
    }

    /// Returns the textual payload, if this value is Text or Tag.
    fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Tag(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value participates in the search family.
    ///
    /// Only `Text` values are search-indexed; `Tag` exists precisely to
    /// opt a string out of full-text indexing.
    pub fn is_searchable(&self) -> bool {
        matches!(self, Value::Text(_))
    }

    /// Query-time equality: numbers match across kinds when numerically
    /// equal, and a `Tag` matches a `Text` of the same content ignoring
    /// case. Same-kind values match exactly.
    pub fn matches(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return cmp_numbers(&a, &b) == Ordering::Equal;
        }
        match (self, other) {
            (Value::Tag(a), Value::Text(b)) | (Value::Text(a), Value::Tag(b)) => {
                a.eq_ignore_ascii_case(b)
            }
            _ => self == other,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Ordering
//
// `Ord` must be a total order consistent with `Eq`, so cross-kind
// numeric ties (e.g. Integer(1) vs Long(1)) and Tag/Text content ties
// are broken by the wire tag. `matches()` is the looser relation the
// query operators use.
// ------------------------------------------------------------------------------------------------

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        class_rank(self)
            .cmp(&class_rank(other))
            .then_with(|| match (self, other) {
                (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
                (Value::Link(a), Value::Link(b)) => a.cmp(b),
                _ => {
                    if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
                        cmp_numbers(&a, &b).then_with(|| self.tag().cmp(&other.tag()))
                    } else if let (Some(a), Some(b)) = (self.as_text(), other.as_text()) {
                        a.cmp(b).then_with(|| self.tag().cmp(&other.tag()))
                    } else {
                        // Same class rank always pairs same payload shapes.
                        Ordering::Equal
                    }
                }
            })
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            // Bitwise float equality keeps Eq reflexive for NaN and
            // consistent with total_cmp in Ord.
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Tag(a), Value::Tag(b)) => a == b,
            (Value::Link(a), Value::Link(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Long(l) => l.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            Value::Text(s) | Value::Tag(s) => s.hash(state),
            Value::Link(l) => l.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Long(l) => write!(f, "{l}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Tag(s) => write!(f, "`{s}`"),
            Value::Link(l) => write!(f, "@{l}"),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Wire format: tag:1 | payload
// ------------------------------------------------------------------------------------------------

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(self.tag());
        match self {
            Value::Boolean(b) => b.encode_to(buf),
            Value::Integer(i) => i.encode_to(buf),
            Value::Long(l) => l.encode_to(buf),
            Value::Float(x) => x.encode_to(buf),
            Value::Double(d) => d.encode_to(buf),
            // The container records the overall value size, so the
            // string payload is raw bytes with no inner length prefix.
            Value::Text(s) | Value::Tag(s) => {
                buf.extend_from_slice(s.as_bytes());
                Ok(())
            }
            Value::Link(l) => l.encode_to(buf),
        }
    }
}

impl Component for Value {
    fn write_bytes(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.encode_to(buf)
    }

    /// Decode a value from a slice containing exactly `tag | payload`.
    ///
    /// Textual payloads extend to the end of the slice, which is why
    /// `Value` only supports sized decoding ([`Component::from_bytes`])
    /// and not cursor-style [`Decode`].
    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        crate::encoding::require(bytes, 1)?;
        let tag = bytes[0];
        let payload = &bytes[1..];
        let value = match tag {
            TAG_BOOLEAN => Value::Boolean(bool::decode_from(payload)?.0),
            TAG_INTEGER => Value::Integer(i32::decode_from(payload)?.0),
            TAG_LONG => Value::Long(i64::decode_from(payload)?.0),
            TAG_FLOAT => Value::Float(f32::decode_from(payload)?.0),
            TAG_DOUBLE => Value::Double(f64::decode_from(payload)?.0),
            TAG_TEXT => Value::Text(String::from_utf8(payload.to_vec())?),
            TAG_TAG => Value::Tag(String::from_utf8(payload.to_vec())?),
            TAG_LINK => Value::Link(u64::decode_from(payload)?.0),
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "Value",
                });
            }
        };
        Ok(value)
    }
}
