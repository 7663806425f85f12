//! Engine configuration.
//!
//! A single [`Config`] value is passed to `Engine::open` and threaded
//! through every subsystem — there is no global mutable state. Tests
//! construct small-page, short-interval variants to force transports and
//! page rolls quickly.

use std::time::Duration;

/// How buffered writes move into the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Move writes one at a time from the oldest page while holding the
    /// transport lock.
    Streaming,

    /// Extract a batch, build an immutable segment off the critical
    /// path, then merge it under a short critical section. The default:
    /// the database stays responsive for reads while segments build.
    Batch,
}

/// Tunables for an engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity in bytes of one buffer page (mmap region).
    pub buffer_page_size: usize,

    /// Revisions accepted into a mutable block before it is sealed and
    /// a fresh one opened.
    pub block_size_threshold: usize,

    /// Encoded manifest size above which block manifests load lazily,
    /// answering early queries by scanning the raw entry table while a
    /// background thread materialises the full map.
    pub manifest_streaming_threshold: usize,

    /// Expected number of insertions used to size bloom filters.
    pub expected_insertions: usize,

    /// Transport discipline. The two modes are mutually exclusive for
    /// the lifetime of the engine.
    pub transport_mode: TransportMode,

    /// How long the transporter sleeps when the buffer has nothing
    /// ready.
    pub transport_interval: Duration,

    /// Writes moved per streaming transport pass.
    pub transport_rate: usize,

    /// Writes extracted per batch transport.
    pub batch_size: usize,

    /// How often the watchdog inspects the transporter's progress.
    pub hung_detection_frequency: Duration,

    /// Duration of no-progress (with work pending) after which the
    /// transporter thread is considered hung and restarted.
    pub hung_detection_threshold: Duration,

    /// Duration of idleness (with work pending) after which the
    /// watchdog nudges the transporter awake.
    pub allowable_inactivity_threshold: Duration,

    /// Words excluded from the search family, lowercase.
    pub stopwords: Vec<String>,
}

impl Config {
    /// The default stopword list applied to search indexing and queries.
    pub fn default_stopwords() -> Vec<String> {
        [
            "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into",
            "is", "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then",
            "there", "these", "they", "this", "to", "was", "will", "with",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_page_size: 8 * 1024 * 1024,
            block_size_threshold: 100_000,
            manifest_streaming_threshold: 64 * 1024,
            expected_insertions: 500_000,
            transport_mode: TransportMode::Batch,
            transport_interval: Duration::from_millis(5),
            transport_rate: 1024,
            batch_size: 4096,
            hung_detection_frequency: Duration::from_secs(10),
            hung_detection_threshold: Duration::from_secs(60),
            allowable_inactivity_threshold: Duration::from_secs(2),
            stopwords: Self::default_stopwords(),
        }
    }
}
