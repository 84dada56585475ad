//! Logical clock used to order transactions without synchronized wall clocks.
//!
//! Every host owns one [`LogicalClock`]. Whenever a timestamp is learned from
//! another participant it is merged in, so a transaction that causally follows
//! another always receives a strictly larger timestamp.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

/// Smallest step the clock advances by on every merge.
pub const EPSILON: Timestamp = 1;

/// Physical time source feeding the logical clock.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Current physical time in microseconds.
    fn now_micros(&self) -> Timestamp;
}

/// Wall clock in microseconds since the UNIX epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_micros(&self) -> Timestamp {
        #[allow(clippy::cast_possible_truncation)]
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        micros
    }
}

/// Manually driven time source for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Timestamp) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_micros(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Monotonic, mergeable clock.
#[derive(Debug)]
pub struct LogicalClock {
    source: Arc<dyn TimeSource>,
    last: AtomicU64,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::system()
    }
}

impl LogicalClock {
    pub fn system() -> Self {
        Self::with_source(Arc::new(SystemTimeSource))
    }

    pub fn with_source(source: Arc<dyn TimeSource>) -> Self {
        Self {
            source,
            last: AtomicU64::new(0),
        }
    }

    /// Current monotonic reading without advancing the clock.
    pub fn peek(&self) -> Timestamp {
        self.source
            .now_micros()
            .max(self.last.load(Ordering::SeqCst))
    }

    /// Issue a fresh timestamp.
    pub fn now(&self) -> Timestamp {
        self.merge_utc_now(0)
    }

    /// Returns `max(now, candidate) + EPSILON` and advances the clock to it.
    pub fn merge_utc_now(&self, candidate: Timestamp) -> Timestamp {
        let mut issued = 0;
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                let wall = self.source.now_micros();
                issued = wall.max(last).max(candidate).saturating_add(EPSILON);
                Some(issued)
            });
        issued
    }

    /// Make sure every later timestamp is strictly greater than `observed`.
    pub fn observe(&self, observed: Timestamp) {
        self.last.fetch_max(observed, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(start: Timestamp) -> (Arc<ManualTimeSource>, LogicalClock) {
        let source = Arc::new(ManualTimeSource::new(start));
        let clock = LogicalClock::with_source(source.clone());
        (source, clock)
    }

    #[test]
    fn merge_moves_past_candidate_from_the_future() {
        let (_, clock) = manual(10);
        assert_eq!(clock.merge_utc_now(100), 101);
        // Local reads stay ahead of what was merged even though wall time lags.
        assert_eq!(clock.now(), 102);
    }

    #[test]
    fn merge_is_monotonic_when_wall_time_goes_backwards() {
        let (source, clock) = manual(500);
        let first = clock.now();
        source.set(100);
        let second = clock.merge_utc_now(50);
        assert!(second > first);
    }

    #[test]
    fn observe_never_moves_the_clock_back() {
        let (_, clock) = manual(0);
        clock.observe(1_000);
        clock.observe(10);
        assert_eq!(clock.peek(), 1_000);
        assert_eq!(clock.now(), 1_001);
    }
}
