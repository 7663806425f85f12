//! [`Revision`] — the immutable unit of versioned data — and [`Write`],
//! the primary-family revision produced by every mutation.
//!
//! # On-disk formats (network byte order)
//!
//! Revision (block files):
//!
//! ```text
//! action:1 | version:8 | locatorSize:4 | keySize:4 | valueSize:4 | locator | key | value
//! ```
//!
//! Write (buffer pages and transaction backups):
//!
//! ```text
//! action:1 | record:8 | version:8 | keySize:4 | valueSize:4 | key | value
//! ```
//!
//! The version travels with every persisted write: replaying a buffer
//! page or a transaction backup must reproduce the exact revisions that
//! were (or would have been) transported, and the store-wide uniqueness
//! of `(family, locator, key, value, version)` depends on it.

use crate::encoding::{Decode, Encode, EncodingError, require};
use crate::model::{Component, Id, Position, Text, Value};
use std::cmp::Ordering;

// ------------------------------------------------------------------------------------------------
// Action
// ------------------------------------------------------------------------------------------------

/// Whether a revision asserts or retracts its datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    /// The datum is asserted.
    Add,
    /// The datum is retracted.
    Remove,
}

impl Action {
    /// The 1-byte wire representation.
    pub fn tag(&self) -> u8 {
        match self {
            Action::Add => 1,
            Action::Remove => 2,
        }
    }

    /// Parse the wire byte.
    pub fn from_tag(tag: u8) -> Result<Self, EncodingError> {
        match tag {
            1 => Ok(Action::Add),
            2 => Ok(Action::Remove),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Action",
            }),
        }
    }

    /// The opposite action.
    pub fn inverse(&self) -> Self {
        match self {
            Action::Add => Action::Remove,
            Action::Remove => Action::Add,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Composites
//
// Composite byte strings identify a locator, a (locator, key) prefix,
// or a full (locator, key, value) datum across bloom filters and block
// manifests. Parts are length-prefixed so that no two distinct
// component sequences can collide byte-wise.
// ------------------------------------------------------------------------------------------------

/// Composite bytes for a bare locator.
pub fn composite_one<L: Component>(locator: &L) -> Vec<u8> {
    let mut buf = Vec::new();
    append_part(locator, &mut buf);
    buf
}

/// Composite bytes for a `(locator, key)` prefix.
pub fn composite_two<L: Component, K: Component>(locator: &L, key: &K) -> Vec<u8> {
    let mut buf = Vec::new();
    append_part(locator, &mut buf);
    append_part(key, &mut buf);
    buf
}

/// Composite bytes for a full `(locator, key, value)` datum.
pub fn composite_three<L: Component, K: Component, V: Component>(
    locator: &L,
    key: &K,
    value: &V,
) -> Vec<u8> {
    let mut buf = Vec::new();
    append_part(locator, &mut buf);
    append_part(key, &mut buf);
    append_part(value, &mut buf);
    buf
}

fn append_part<C: Component>(part: &C, buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    // Component serialisation is infallible for in-memory values; the
    // only Encode failure mode is a > u32::MAX length, which the u32
    // size fields below could not represent either.
    let _ = part.write_bytes(buf);
    let size = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

// ------------------------------------------------------------------------------------------------
// Revision
// ------------------------------------------------------------------------------------------------

/// An immutable `(locator, key, value, version, action)` datum.
///
/// Revisions sort by `(locator, key, version)` — the canonical order of
/// block files. The value and action participate only as tie-breakers to
/// keep the order total; within one family a version never repeats for
/// the same `(locator, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision<L, K, V> {
    locator: L,
    key: K,
    value: V,
    version: u64,
    action: Action,
}

/// A revision in the primary family: record → field name → value.
pub type PrimaryRevision = Revision<Id, Text, Value>;

/// A revision in the index family: field name → value → record.
pub type IndexRevision = Revision<Text, Value, Id>;

/// A revision in the search family: field name → token → position.
pub type SearchRevision = Revision<Text, Text, Position>;

impl<L: Component, K: Component, V: Component> Revision<L, K, V> {
    /// Creates a revision.
    pub fn new(locator: L, key: K, value: V, version: u64, action: Action) -> Self {
        Self {
            locator,
            key,
            value,
            version,
            action,
        }
    }

    /// The revision's locator.
    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// The revision's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The revision's value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The revision's version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The revision's action.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Composite bytes for the locator.
    pub fn locator_composite(&self) -> Vec<u8> {
        composite_one(&self.locator)
    }

    /// Composite bytes for the `(locator, key)` prefix.
    pub fn prefix_composite(&self) -> Vec<u8> {
        composite_two(&self.locator, &self.key)
    }

    /// Composite bytes for the full `(locator, key, value)` datum.
    pub fn datum_composite(&self) -> Vec<u8> {
        composite_three(&self.locator, &self.key, &self.value)
    }

    /// Whether `other` carries the same `(locator, key, value)` datum,
    /// irrespective of version and action.
    pub fn same_datum(&self, other: &Self) -> bool {
        self.locator == other.locator && self.key == other.key && self.value == other.value
    }
}

impl<L: Component, K: Component, V: Component> Ord for Revision<L, K, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.locator
            .cmp(&other.locator)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.value.cmp(&other.value))
            .then_with(|| self.action.cmp(&other.action))
    }
}

impl<L: Component, K: Component, V: Component> PartialOrd for Revision<L, K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<L: Component, K: Component, V: Component> Encode for Revision<L, K, V> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let mut locator = Vec::new();
        self.locator.write_bytes(&mut locator)?;
        let mut key = Vec::new();
        self.key.write_bytes(&mut key)?;
        let mut value = Vec::new();
        self.value.write_bytes(&mut value)?;

        buf.push(self.action.tag());
        self.version.encode_to(buf)?;
        crate::encoding::len_to_u32(locator.len())?.encode_to(buf)?;
        crate::encoding::len_to_u32(key.len())?.encode_to(buf)?;
        crate::encoding::len_to_u32(value.len())?.encode_to(buf)?;
        buf.extend_from_slice(&locator);
        buf.extend_from_slice(&key);
        buf.extend_from_slice(&value);
        Ok(())
    }
}

impl<L: Component, K: Component, V: Component> Decode for Revision<L, K, V> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        let action = Action::from_tag(buf[0])?;
        let mut offset = 1;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (locator_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (key_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (value_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;

        let locator_size = locator_size as usize;
        let key_size = key_size as usize;
        let value_size = value_size as usize;
        require(&buf[offset..], locator_size + key_size + value_size)?;

        let locator = L::from_bytes(&buf[offset..offset + locator_size])?;
        offset += locator_size;
        let key = K::from_bytes(&buf[offset..offset + key_size])?;
        offset += key_size;
        let value = V::from_bytes(&buf[offset..offset + value_size])?;
        offset += value_size;

        Ok((
            Self {
                locator,
                key,
                value,
                version,
                action,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Write
// ------------------------------------------------------------------------------------------------

/// A primary-family revision addressed by record id — the unit of
/// mutation accepted by the engine and journalled in the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Write {
    action: Action,
    record: Id,
    key: Text,
    value: Value,
    version: u64,
}

impl Write {
    /// Creates an ADD write.
    pub fn add(key: impl Into<Text>, value: Value, record: Id, version: u64) -> Self {
        Self {
            action: Action::Add,
            record,
            key: key.into(),
            value,
            version,
        }
    }

    /// Creates a REMOVE write.
    pub fn remove(key: impl Into<Text>, value: Value, record: Id, version: u64) -> Self {
        Self {
            action: Action::Remove,
            record,
            key: key.into(),
            value,
            version,
        }
    }

    /// The write's action.
    pub fn action(&self) -> Action {
        self.action
    }

    /// The record the write addresses.
    pub fn record(&self) -> Id {
        self.record
    }

    /// The field name the write addresses.
    pub fn key(&self) -> &Text {
        &self.key
    }

    /// The written value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The version stamped at creation time.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether `other` addresses the same `(key, value, record)` datum,
    /// irrespective of action and version.
    pub fn same_datum(&self, other: &Write) -> bool {
        self.record == other.record && self.key == other.key && self.value == other.value
    }

    /// Whether this write addresses the given `(key, value, record)`.
    pub fn is_datum(&self, key: &str, value: &Value, record: Id) -> bool {
        self.record == record && self.key == key && &self.value == value
    }

    /// Composite bytes over `(key, value, record)` used by the verify
    /// bloom filters.
    pub fn datum_composite(&self) -> Vec<u8> {
        composite_three(&self.key, &self.value, &self.record)
    }

    /// The same datum with the opposite action and a new version.
    pub fn inverse(&self, version: u64) -> Self {
        Self {
            action: self.action.inverse(),
            record: self.record,
            key: self.key.clone(),
            value: self.value.clone(),
            version,
        }
    }

    /// This write expressed as a primary-family revision.
    pub fn primary_revision(&self) -> PrimaryRevision {
        Revision::new(
            self.record,
            self.key.clone(),
            self.value.clone(),
            self.version,
            self.action,
        )
    }

    /// This write expressed as an index-family revision.
    pub fn index_revision(&self) -> IndexRevision {
        Revision::new(
            self.key.clone(),
            self.value.clone(),
            self.record,
            self.version,
            self.action,
        )
    }
}

impl Encode for Write {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let mut value = Vec::new();
        self.value.write_bytes(&mut value)?;

        buf.push(self.action.tag());
        self.record.encode_to(buf)?;
        self.version.encode_to(buf)?;
        crate::encoding::len_to_u32(self.key.len())?.encode_to(buf)?;
        crate::encoding::len_to_u32(value.len())?.encode_to(buf)?;
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&value);
        Ok(())
    }
}

impl Decode for Write {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        let action = Action::from_tag(buf[0])?;
        let mut offset = 1;
        let (record, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (key_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (value_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;

        let key_size = key_size as usize;
        let value_size = value_size as usize;
        require(&buf[offset..], key_size + value_size)?;

        let key = Text::from_bytes(&buf[offset..offset + key_size])?;
        offset += key_size;
        let value = Value::from_bytes(&buf[offset..offset + value_size])?;
        offset += value_size;

        Ok((
            Self {
                action,
                record,
                key,
                value,
                version,
            },
            offset,
        ))
    }
}
