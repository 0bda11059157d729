//! Aggregator heartbeat.
//!
//! One writer role (the aggregator's batch-processed callback) and one reader
//! role (the drain monitor). The timestamp is a monotonic offset stored in an
//! atomic, so a read is always a consistent snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct HeartbeatInner {
    origin: Instant,
    last_micros: AtomicU64,
    beats: AtomicU64,
}

/// Shared "last batch processed" timestamp.
///
/// Cloning yields another handle to the same timestamp. Hand one clone to the
/// aggregator completion hook and one to the scheduler.
#[derive(Clone, Debug)]
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

impl Heartbeat {
    /// A heartbeat that last beat now.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                origin: Instant::now(),
                last_micros: AtomicU64::new(0),
                beats: AtomicU64::new(0),
            }),
        }
    }

    /// Record that the aggregator completed a batch.
    pub fn beat(&self) {
        let now = self.now_micros();
        self.inner.last_micros.fetch_max(now, Ordering::AcqRel);
        self.inner.beats.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last beat.
    pub fn age(&self) -> Duration {
        let last = self.inner.last_micros.load(Ordering::Acquire);
        Duration::from_micros(self.now_micros().saturating_sub(last))
    }

    pub fn last_beat(&self) -> Instant {
        self.inner.origin + Duration::from_micros(self.inner.last_micros.load(Ordering::Acquire))
    }

    /// Number of beats recorded so far.
    pub fn beat_count(&self) -> u64 {
        self.inner.beats.load(Ordering::Relaxed)
    }

    fn now_micros(&self) -> u64 {
        self.inner.origin.elapsed().as_micros() as u64
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_resets_age() {
        let heartbeat = Heartbeat::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(heartbeat.age() >= Duration::from_millis(20));

        heartbeat.beat();
        assert!(heartbeat.age() < Duration::from_millis(20));
        assert_eq!(heartbeat.beat_count(), 1);
    }

    #[test]
    fn clones_share_the_timestamp() {
        let writer = Heartbeat::new();
        let reader = writer.clone();
        std::thread::sleep(Duration::from_millis(15));

        let beater = std::thread::spawn(move || writer.beat());
        beater.join().expect("beat thread");

        assert!(reader.age() < Duration::from_millis(15));
        assert_eq!(reader.beat_count(), 1);
    }
}
