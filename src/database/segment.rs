//! # Segment — a pre-built bundle of blocks for one transport batch
//!
//! A [`Segment`] bundles the three family blocks (primary, index,
//! search) produced from one batch of buffered writes, plus the
//! receipts — the locators each block touched. The batch transporter
//! builds and seals the blocks **off the critical path**, so database
//! reads stay unblocked, then installs the finished segment atomically
//! with [`crate::database::Database::merge`].
//!
//! Blocks inside a segment are already durable (sealed and fsynced)
//! before the merge; a crash between seal and merge leaves orphan
//! blocks that startup discovery adopts and the deduplication pass
//! reconciles against the still-unpurged buffer.

use crate::block::Block;
use crate::model::{Id, Position, Text, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// The locators a segment touched per family — consumed by the merge to
/// invalidate exactly the affected record cache entries.
#[derive(Debug, Default)]
pub struct SegmentReceipts {
    /// Record ids with new primary revisions.
    pub primary_locators: HashSet<Id>,

    /// Field names with new index revisions.
    pub index_locators: HashSet<Text>,

    /// Field names with new search revisions.
    pub search_locators: HashSet<Text>,
}

/// A fully-built, sealed bundle of family blocks awaiting merge.
///
/// Families a batch did not touch are absent (for example, a batch
/// containing no searchable text produces no search block).
pub struct Segment {
    /// The sealed primary block, if the batch produced one.
    pub(crate) primary: Option<Arc<Block<Id, Text, Value>>>,

    /// The sealed index block, if the batch produced one.
    pub(crate) index: Option<Arc<Block<Text, Value, Id>>>,

    /// The sealed search block, if the batch produced one.
    pub(crate) search: Option<Arc<Block<Text, Text, Position>>>,

    /// The locators the blocks cover.
    pub(crate) receipts: SegmentReceipts,
}

impl Segment {
    /// The locators the segment's blocks cover.
    pub fn receipts(&self) -> &SegmentReceipts {
        &self.receipts
    }

    /// Total revisions across the segment's blocks.
    pub fn revision_count(&self) -> u64 {
        let mut count = 0;
        if let Some(block) = &self.primary {
            count += block.len().unwrap_or(0);
        }
        if let Some(block) = &self.index {
            count += block.len().unwrap_or(0);
        }
        if let Some(block) = &self.search {
            count += block.len().unwrap_or(0);
        }
        count
    }
}
