//! Drain monitor.
//!
//! Decides when the outgoing generation can be destroyed. The only evidence
//! is the heartbeat: once the aggregator has been idle for `multiplier`
//! batch timeouts, anything the old generation published has already been
//! batched or discarded by the aggregator itself.

use std::time::{Duration, Instant};

use crate::error::{RotationError, RotationResult};
use crate::heartbeat::Heartbeat;
use crate::stop::StopSignal;

pub const DEFAULT_DRAIN_MULTIPLIER: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained { waited: Duration, polls: u32 },
    Stopped,
}

#[derive(Clone, Debug)]
pub struct DrainMonitor {
    poll_interval: Duration,
    multiplier: u32,
    deadline: Option<Duration>,
}

impl DrainMonitor {
    /// Poll every `batch_timeout` until the heartbeat is `multiplier` timeouts old.
    pub fn new(batch_timeout: Duration, multiplier: u32) -> Self {
        Self {
            poll_interval: batch_timeout,
            multiplier,
            deadline: None,
        }
    }

    /// Give up with `DrainStalled` after `deadline`. `None` waits forever.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Minimum heartbeat age that counts as drained.
    pub fn threshold(&self) -> Duration {
        self.poll_interval * self.multiplier
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Block until drained, stopped, or past the deadline.
    pub fn wait(&self, heartbeat: &Heartbeat, stop: &StopSignal) -> RotationResult<DrainOutcome> {
        let started = Instant::now();
        let threshold = self.threshold();
        let mut polls = 0u32;
        loop {
            polls += 1;
            let age = heartbeat.age();
            log::debug!(
                "drain poll #{}: heartbeat age {:?}, need {:?}",
                polls,
                age,
                threshold
            );
            if age >= threshold {
                return Ok(DrainOutcome::Drained {
                    waited: started.elapsed(),
                    polls,
                });
            }
            if let Some(deadline) = self.deadline {
                let waited = started.elapsed();
                if waited >= deadline {
                    return Err(RotationError::DrainStalled { waited });
                }
            }
            if stop.wait_timeout(self.poll_interval) {
                return Ok(DrainOutcome::Stopped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_multiple_of_batch_timeout() {
        let monitor = DrainMonitor::new(Duration::from_millis(40), 5);
        assert_eq!(monitor.threshold(), Duration::from_millis(200));
    }

    #[test]
    fn stale_heartbeat_drains_on_first_poll() {
        let heartbeat = Heartbeat::new();
        std::thread::sleep(Duration::from_millis(25));
        let monitor = DrainMonitor::new(Duration::from_millis(5), 2);

        let outcome = monitor
            .wait(&heartbeat, &StopSignal::new())
            .expect("drain");
        assert!(matches!(outcome, DrainOutcome::Drained { polls: 1, .. }));
    }

    #[test]
    fn waits_out_the_threshold_after_last_beat() {
        let heartbeat = Heartbeat::new();
        heartbeat.beat();
        let monitor = DrainMonitor::new(Duration::from_millis(10), 5);

        monitor
            .wait(&heartbeat, &StopSignal::new())
            .expect("drain");
        assert!(heartbeat.age() >= Duration::from_millis(50));
    }

    #[test]
    fn stop_interrupts_the_wait() {
        let heartbeat = Heartbeat::new();
        let stop = StopSignal::new();
        let beating = heartbeat.clone();
        let remote = stop.clone();
        let worker = std::thread::spawn(move || {
            for _ in 0..5 {
                beating.beat();
                std::thread::sleep(Duration::from_millis(10));
            }
            remote.stop();
        });

        let monitor = DrainMonitor::new(Duration::from_millis(10), 50);
        let outcome = monitor.wait(&heartbeat, &stop).expect("wait");
        assert_eq!(outcome, DrainOutcome::Stopped);
        worker.join().expect("worker");
    }

    #[test]
    fn deadline_reports_stall() {
        let heartbeat = Heartbeat::new();
        let stop = StopSignal::new();
        let beating = heartbeat.clone();
        let halt = stop.clone();
        let worker = std::thread::spawn(move || {
            while !halt.wait_timeout(Duration::from_millis(5)) {
                beating.beat();
            }
        });

        let monitor = DrainMonitor::new(Duration::from_millis(10), 5)
            .with_deadline(Some(Duration::from_millis(60)));
        let err = monitor
            .wait(&heartbeat, &StopSignal::new())
            .expect_err("heartbeat never goes stale");
        assert!(matches!(err, RotationError::DrainStalled { .. }));

        stop.stop();
        worker.join().expect("worker");
    }
}
