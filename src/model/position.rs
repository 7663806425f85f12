//! [`Position`] — where a search token occurs inside a record.

use crate::encoding::{Decode, Encode, EncodingError};
use crate::model::{Component, Id};

/// The value type of the search inverted index: a token's position
/// inside a particular record's indexed text.
///
/// `index` is the token's ordinal among the whitespace-delimited tokens
/// of the indexed value, counting stopwords, so that phrase queries can
/// test adjacency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    /// The record containing the token.
    pub record: Id,

    /// The token's ordinal within the indexed value.
    pub index: u32,
}

impl Position {
    /// Creates a position for `record` at token ordinal `index`.
    pub fn new(record: Id, index: u32) -> Self {
        Self { record, index }
    }
}

impl Encode for Position {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.record.encode_to(buf)?;
        self.index.encode_to(buf)?;
        Ok(())
    }
}

impl Component for Position {
    fn write_bytes(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.encode_to(buf)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let (record, n) = u64::decode_from(bytes)?;
        let (index, _) = u32::decode_from(&bytes[n..])?;
        Ok(Self { record, index })
    }
}
