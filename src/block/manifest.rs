//! The sparse block manifest: composite hash → byte range.
//!
//! A sealed block's `.indx` file maps the xxh3-128 hash of every
//! distinct `locator` and `(locator, key)` prefix to the `[start, end)`
//! byte range of that prefix's revisions inside the `.blk` file:
//!
//! ```text
//! schema:4 | count:8 | minVersion:8 | maxVersion:8   (header)
//! (hash:16 | start:8 | end:8)*                       (sorted by hash)
//! ```
//!
//! Small manifests parse eagerly into a hash map. Above the configured
//! streaming threshold the manifest loads **lazily**: the raw entry
//! table (already sorted by hash) answers queries by binary search
//! while a background thread materialises the full map; whichever
//! representation is available at query time returns the same answer.

use crate::encoding::{Decode, Encode, EncodingError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_128;

/// Bytes per manifest entry: 16-byte hash + two 8-byte offsets.
pub(crate) const ENTRY_SIZE: usize = 32;

/// Bytes in the `.indx` header preceding the entry table.
pub(crate) const HEADER_SIZE: usize = 4 + 8 + 8 + 8;

/// Schema version stamped into every `.indx` header.
pub(crate) const SCHEMA_VERSION: u32 = 1;

/// Hashes a composite byte string into its 16-byte manifest key.
pub(crate) fn composite_hash(composite: &[u8]) -> [u8; 16] {
    xxh3_128(composite).to_be_bytes()
}

// ------------------------------------------------------------------------------------------------
// Stats header
// ------------------------------------------------------------------------------------------------

/// Block statistics carried in the `.indx` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStats {
    /// On-disk schema version.
    pub schema_version: u32,

    /// Number of revisions in the block.
    pub count: u64,

    /// Smallest revision version in the block.
    pub min_version: u64,

    /// Largest revision version in the block.
    pub max_version: u64,
}

impl Encode for BlockStats {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.schema_version.encode_to(buf)?;
        self.count.encode_to(buf)?;
        self.min_version.encode_to(buf)?;
        self.max_version.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockStats {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (schema_version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                schema_version,
                count,
                min_version,
                max_version,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest
// ------------------------------------------------------------------------------------------------

/// The parsed (or lazily parsing) composite → range index of one block.
#[derive(Debug)]
pub struct Manifest {
    /// Raw sorted entry table; retained for binary search until (and
    /// after) materialisation.
    raw: Arc<Vec<u8>>,

    /// Fully materialised map, set once by either the eager load or the
    /// background materialiser.
    loaded: Arc<OnceLock<HashMap<[u8; 16], (u64, u64)>>>,
}

impl Manifest {
    /// Builds a manifest from freshly computed ranges (the sync path).
    /// The encoded entry table is available via [`Manifest::raw_bytes`].
    pub fn from_ranges(ranges: &BTreeMap<[u8; 16], (u64, u64)>) -> Self {
        let mut raw = Vec::with_capacity(ranges.len() * ENTRY_SIZE);
        let mut map = HashMap::with_capacity(ranges.len());
        // BTreeMap iteration yields hashes ascending, the required
        // entry-table order.
        for (hash, (start, end)) in ranges {
            raw.extend_from_slice(hash);
            raw.extend_from_slice(&start.to_be_bytes());
            raw.extend_from_slice(&end.to_be_bytes());
            map.insert(*hash, (*start, *end));
        }
        let loaded = Arc::new(OnceLock::new());
        let _ = loaded.set(map);
        Self {
            raw: Arc::new(raw),
            loaded,
        }
    }

    /// Parses a manifest from its raw entry table.
    ///
    /// Tables at or below `streaming_threshold` bytes materialise
    /// eagerly; larger tables spawn a background materialiser and serve
    /// queries from the raw table in the meantime.
    pub fn load(raw: Vec<u8>, streaming_threshold: usize) -> Result<Self, EncodingError> {
        if raw.len() % ENTRY_SIZE != 0 {
            return Err(EncodingError::Custom(format!(
                "manifest entry table length {} is not a multiple of {ENTRY_SIZE}",
                raw.len()
            )));
        }
        let raw = Arc::new(raw);
        let loaded = Arc::new(OnceLock::new());
        if raw.len() <= streaming_threshold {
            let _ = loaded.set(materialise(&raw));
        } else {
            debug!(
                bytes = raw.len(),
                "manifest exceeds streaming threshold, materialising in background"
            );
            let raw_bg = Arc::clone(&raw);
            let loaded_bg = Arc::clone(&loaded);
            thread::spawn(move || {
                let map = materialise(&raw_bg);
                let _ = loaded_bg.set(map);
                trace!("manifest materialised");
            });
        }
        Ok(Self { raw, loaded })
    }

    /// Looks up the byte range recorded for `composite`, if any.
    pub fn lookup(&self, composite: &[u8]) -> Option<(u64, u64)> {
        let hash = composite_hash(composite);
        if let Some(map) = self.loaded.get() {
            return map.get(&hash).copied();
        }
        // Not yet materialised: binary search the sorted raw table.
        let entries = self.raw.len() / ENTRY_SIZE;
        let (mut lo, mut hi) = (0usize, entries);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let at = mid * ENTRY_SIZE;
            let entry_hash = &self.raw[at..at + 16];
            match entry_hash.cmp(hash.as_slice()) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    let start = be_u64(&self.raw[at + 16..at + 24]);
                    let end = be_u64(&self.raw[at + 24..at + 32]);
                    return Some((start, end));
                }
            }
        }
        None
    }

    /// Number of entries in the manifest.
    pub fn len(&self) -> usize {
        self.raw.len() / ENTRY_SIZE
    }

    /// Whether the manifest holds no entries.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The encoded entry table (the body of the `.indx` file).
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }
}

fn materialise(raw: &[u8]) -> HashMap<[u8; 16], (u64, u64)> {
    let mut map = HashMap::with_capacity(raw.len() / ENTRY_SIZE);
    for chunk in raw.chunks_exact(ENTRY_SIZE) {
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&chunk[..16]);
        map.insert(hash, (be_u64(&chunk[16..24]), be_u64(&chunk[24..32])));
    }
    map
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(arr)
}
