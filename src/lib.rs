//! # veristore
//!
//! An embeddable, transactional, **versioned document-graph storage
//! engine** built on an append-only revision log. Every datum is a
//! `(key, value, record, version, add|remove)` revision; presence is
//! the parity of a datum's revision count, and any historical state can
//! be replayed from the log.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Engine                           │
//! │  ┌─────────────┐   transport   ┌──────────────────────┐ │
//! │  │   Buffer     │ ───────────► │      Database        │ │
//! │  │  mmap pages  │   (stream /  │  primary | index |   │ │
//! │  │  (WAL overlay│    batch     │  search block        │ │
//! │  │   of writes) │   segments)  │  families + records  │ │
//! │  └─────────────┘               └──────────────────────┘ │
//! │                                                         │
//! │  token locks ─ version-change registry ─ watchdog       │
//! │                                                         │
//! │  ┌───────────────────┐   ┌───────────────────────────┐  │
//! │  │ AtomicOperation   │   │ Transaction (+ nested     │  │
//! │  │ (optimistic, per- │   │  atomic ops, durable      │  │
//! │  │  thread, retry)   │   │  commit backup)           │  │
//! │  └───────────────────┘   └───────────────────────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Top-level store — composite reads, writes, background transport |
//! | [`buffer`] | Paged, memory-mapped, append-only write-ahead overlay |
//! | [`database`] | Immutable block families, record caches, segment merges |
//! | [`block`] | Sorted revision runs with bloom filters and sparse manifests |
//! | [`record`] | Per-locator present/history aggregates |
//! | [`limbo`] | Unindexed in-memory write logs (queues, the buffer overlay) |
//! | [`atomic`] | Optimistic atomic operations and durable transactions |
//! | [`model`] | Revisions, writes, values, positions, tokens |
//! | [`encoding`] | The crate-owned big-endian wire format |
//!
//! ## Key properties
//!
//! - **Write-ahead durability** — every mutation is flushed to a
//!   memory-mapped buffer page before it is acknowledged.
//! - **Odd-count semantics** — a value is present iff its ADD/REMOVE
//!   revision count is odd; reads combine the buffer and database by
//!   XOR and set-toggling.
//! - **Three parallel indexes** — one logical write fans out into the
//!   primary, index, and search families, answering "what is in this
//!   record", "who has this value", and full-text queries.
//! - **Optimistic isolation** — atomic operations and transactions
//!   validate against version-change notifications at commit; exactly
//!   one of two conflicting commits succeeds.
//! - **Crash recovery** — buffer pages replay from persisted cursors,
//!   block deduplication reconciles double-transported writes, and
//!   transaction backups complete interrupted commits.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use veristore::config::Config;
//! use veristore::engine::Engine;
//! use veristore::model::Value;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::open("/tmp/my_store", Config::default())?;
//!
//! engine.add("name", Value::Text("jeff".into()), 1)?;
//! assert!(engine.verify("name", &Value::Text("jeff".into()), 1)?);
//! assert_eq!(engine.search("name", "ef")?.into_iter().collect::<Vec<_>>(), vec![1]);
//!
//! let mut op = engine.start_atomic_operation();
//! op.add("age", Value::Integer(30), 1)?;
//! op.commit()?;
//!
//! engine.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod atomic;
pub mod block;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod database;
pub mod encoding;
pub mod engine;
pub mod limbo;
pub mod model;
pub mod record;
pub mod tokenizer;
