//! The monotonic version clock.
//!
//! Every write is stamped with a version drawn from a [`Clock`], and the
//! global write order across threads is exactly the order of those
//! versions. The clock therefore guarantees **strictly increasing**
//! values: wall-clock microseconds when they advance, the previous value
//! plus one when they do not (same-microsecond calls, or a wall clock
//! that stepped backwards).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A strictly-increasing 64-bit timestamp source.
///
/// Thread-safe; `next()` never returns the same value twice and never
/// goes backwards, even under concurrent callers or wall-clock
/// adjustments.
#[derive(Debug)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Creates a clock that will never emit a value at or below `floor`.
    ///
    /// The floor is how a reopened store keeps versions increasing
    /// across restarts: seed it with the highest version recovered from
    /// disk.
    pub fn with_floor(floor: u64) -> Self {
        Self {
            last: AtomicU64::new(floor),
        }
    }

    /// Creates a clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_floor(0)
    }

    /// Returns the next version: strictly greater than every value this
    /// clock has returned before.
    pub fn next(&self) -> u64 {
        let now = wall_micros();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => last = observed,
            }
        }
    }

    /// Raises the floor so subsequent versions exceed `version`.
    pub fn advance_past(&self, version: u64) {
        self.last.fetch_max(version, Ordering::AcqRel);
    }

    /// The most recently emitted version (or the floor, before any
    /// emission).
    pub fn recent(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Microseconds since the UNIX epoch; zero if the system clock predates
/// the epoch.
fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn versions_strictly_increase() {
        let clock = Clock::new();
        let mut previous = 0;
        for _ in 0..10_000 {
            let v = clock.next();
            assert!(v > previous, "clock emitted {v} after {previous}");
            previous = v;
        }
    }

    #[test]
    fn versions_unique_across_threads() {
        let clock = Arc::new(Clock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(thread::spawn(move || {
                (0..1_000).map(|_| clock.next()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("clock thread panicked"))
            .collect();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count, "duplicate versions emitted");
    }

    #[test]
    fn floor_is_respected() {
        let floor = wall_micros() + 1_000_000_000;
        let clock = Clock::with_floor(floor);
        assert!(clock.next() > floor);
    }
}
