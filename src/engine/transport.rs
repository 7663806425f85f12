//! Background transport: the transporter thread, the ordering latch,
//! and the watchdog's view of progress.
//!
//! A single transporter thread drains the buffer into the database.
//! In **streaming** mode it calls `Buffer::transport` directly; in
//! **batch** mode (the default) it snapshots a batch, builds a sealed
//! [`Segment`](crate::database::Segment) off the critical path, awaits
//! its ordinal on a count-up latch, and merges inside a short
//! buffer-exclusive critical section.
//!
//! ## Restarts
//!
//! Threads cannot be interrupted, so a hung transporter is *abandoned*:
//! the watchdog bumps the shared generation counter and spawns a
//! replacement with a fresh latch. The abandoned thread re-checks the
//! generation under the merge critical section and drops its batch
//! without merging — its writes are still in the buffer (never purged)
//! and the replacement re-extracts them, so nothing is lost or
//! duplicated.

use crate::buffer::Buffer;
use crate::config::{Config, TransportMode};
use crate::database::Database;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

// ------------------------------------------------------------------------------------------------
// CountUpLatch
// ------------------------------------------------------------------------------------------------

/// Orders batch merges: each transport task awaits its ordinal before
/// entering the merge critical section, and counts up on the way out.
#[derive(Debug, Default)]
pub struct CountUpLatch {
    state: Mutex<u64>,
    cv: Condvar,
}

impl CountUpLatch {
    /// Blocks until the latch reaches `ordinal`.
    pub fn await_turn(&self, ordinal: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        while *state < ordinal {
            match self.cv.wait(state) {
                Ok(guard) => state = guard,
                Err(_) => return,
            }
        }
    }

    /// Releases the next ordinal.
    pub fn advance(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state += 1;
            self.cv.notify_all();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Progress
// ------------------------------------------------------------------------------------------------

/// Shared transporter telemetry the watchdog inspects.
#[derive(Debug)]
pub struct TransportProgress {
    /// Wall micros of the last pass that moved at least one write.
    last_progress: AtomicU64,

    /// Wall micros of the last pass attempt, successful or not.
    last_attempt: AtomicU64,

    /// Total writes transported since open.
    moved: AtomicU64,

    /// Current valid transporter generation; stale generations must
    /// not merge.
    generation: AtomicU64,
}

impl TransportProgress {
    pub(crate) fn new() -> Self {
        let now = wall_micros();
        Self {
            last_progress: AtomicU64::new(now),
            last_attempt: AtomicU64::new(now),
            moved: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn note_attempt(&self) {
        self.last_attempt.store(wall_micros(), Ordering::Release);
    }

    pub(crate) fn note_moved(&self, count: usize) {
        let now = wall_micros();
        self.last_attempt.store(now, Ordering::Release);
        if count > 0 {
            self.last_progress.store(now, Ordering::Release);
            self.moved.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Micros since the last productive pass.
    pub(crate) fn stalled_for(&self) -> Duration {
        Duration::from_micros(
            wall_micros().saturating_sub(self.last_progress.load(Ordering::Acquire)),
        )
    }

    /// Micros since the last attempt of any kind.
    pub(crate) fn idle_for(&self) -> Duration {
        Duration::from_micros(
            wall_micros().saturating_sub(self.last_attempt.load(Ordering::Acquire)),
        )
    }

    /// Total writes transported since open.
    pub(crate) fn total_moved(&self) -> u64 {
        self.moved.load(Ordering::Relaxed)
    }
}

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Transporter
// ------------------------------------------------------------------------------------------------

/// Wake/stop signals for the transporter thread.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Signal {
    /// Exit the loop.
    Stop,

    /// Skip the current sleep and attempt a pass now.
    Nudge,
}

/// A running transporter thread and its control channel.
pub(crate) struct Transporter {
    pub(crate) thread: JoinHandle<()>,
    pub(crate) tx: Sender<Signal>,
    pub(crate) generation: u64,
}

impl Transporter {
    /// Spawns a transporter for `generation`.
    pub(crate) fn spawn(
        generation: u64,
        buffer: Arc<Buffer>,
        database: Arc<Database>,
        config: Config,
        progress: Arc<TransportProgress>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let thread = std::thread::Builder::new()
            .name(format!("transport-{generation}"))
            .spawn(move || {
                transporter_loop(generation, &buffer, &database, &config, &progress, &rx);
            })
            .unwrap_or_else(|e| {
                // Spawn failure leaves writes safe in the buffer; the
                // watchdog will retry.
                error!(error = %e, "transporter spawn failed");
                std::thread::spawn(|| {})
            });
        info!(generation, "transporter started");
        Self {
            thread,
            tx,
            generation,
        }
    }

    /// Asks the thread to stop; does not join (the thread may be
    /// stuck — that is the reason for the restart mechanism).
    pub(crate) fn stop(&self) {
        let _ = self.tx.send(Signal::Stop);
    }
}

fn transporter_loop(
    generation: u64,
    buffer: &Buffer,
    database: &Database,
    config: &Config,
    progress: &TransportProgress,
    rx: &Receiver<Signal>,
) {
    let latch = CountUpLatch::default();
    let ordinals = AtomicU64::new(0);

    loop {
        match rx.recv_timeout(config.transport_interval) {
            Ok(Signal::Stop) => break,
            Ok(Signal::Nudge) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if progress.generation() != generation {
            debug!(generation, "transporter abandoned, exiting");
            break;
        }

        progress.note_attempt();
        let result = match config.transport_mode {
            TransportMode::Streaming => buffer
                .transport(database, config.transport_rate)
                .map_err(|e| e.to_string()),
            TransportMode::Batch => {
                batch_pass(generation, buffer, database, config, progress, &latch, &ordinals)
            }
        };
        match result {
            Ok(moved) => progress.note_moved(moved),
            Err(e) => {
                // Transient storage errors (e.g. a concurrent directory
                // removal) resolve themselves; log and retry after the
                // sleep. The engine is never halted from here.
                warn!(generation, error = %e, "transport pass failed, will retry");
            }
        }
    }
    debug!(generation, "transporter stopped");
}

/// One batch transport pass: extract → build → await ordinal → merge →
/// purge. Returns the number of writes moved.
fn batch_pass(
    generation: u64,
    buffer: &Buffer,
    database: &Database,
    config: &Config,
    progress: &TransportProgress,
    latch: &CountUpLatch,
    ordinals: &AtomicU64,
) -> Result<usize, String> {
    let Some((writes, receipt)) = buffer
        .take_batch(config.batch_size)
        .map_err(|e| e.to_string())?
    else {
        return Ok(0);
    };
    let moved = writes.len();
    let ordinal = ordinals.fetch_add(1, Ordering::AcqRel);

    // Built off the critical path: readers stay unblocked.
    let segment = database.build_segment(&writes).map_err(|e| e.to_string())?;

    latch.await_turn(ordinal);
    let outcome = (|| {
        let _guard = buffer.transport_guard().map_err(|e| e.to_string())?;
        if progress.generation() != generation {
            // Abandoned mid-flight: drop the batch; the replacement
            // transporter re-extracts these writes.
            warn!(generation, "stale transporter dropped its batch");
            return Ok(0);
        }
        database.merge(segment).map_err(|e| e.to_string())?;
        buffer.purge(&receipt).map_err(|e| e.to_string())?;
        Ok(moved)
    })();
    latch.advance();
    outcome
}
