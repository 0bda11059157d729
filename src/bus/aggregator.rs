use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use super::Frame;
use crate::heartbeat::Heartbeat;

/// One batch: at most one frame per slot, indexed by slot.
#[derive(Debug)]
pub struct Batch {
    pub id: u64,
    pub frames: Vec<Option<Frame>>,
    /// True when the batch was pushed by the timeout rather than by a full set of inputs.
    pub timed_out: bool,
}

impl Batch {
    pub fn filled(&self) -> usize {
        self.frames.iter().filter(|frame| frame.is_some()).count()
    }
}

/// Counters exported by a running aggregator.
#[derive(Debug, Default)]
pub struct AggregatorStats {
    batches: AtomicU64,
    frames: AtomicU64,
    timeouts: AtomicU64,
}

impl AggregatorStats {
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// Fixed-size batcher over the bus's slot ports.
///
/// A batch is pushed once every slot has delivered a frame, or once
/// `batch_timeout` has elapsed since the first frame of the pending batch.
/// Each pushed batch beats the heartbeat before it is handed to the sink.
pub struct BatchAggregator {
    shutdown: Arc<AtomicBool>,
    stats: Arc<AggregatorStats>,
    join: Option<JoinHandle<()>>,
}

impl BatchAggregator {
    pub fn spawn<S>(
        inputs: Vec<Receiver<Frame>>,
        batch_timeout: Duration,
        heartbeat: Heartbeat,
        sink: S,
    ) -> Result<Self>
    where
        S: FnMut(Batch) + Send + 'static,
    {
        if inputs.is_empty() {
            return Err(anyhow!("aggregator needs at least one input"));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(AggregatorStats::default());
        let worker = Worker {
            inputs,
            batch_timeout,
            heartbeat,
            shutdown: shutdown.clone(),
            stats: stats.clone(),
        };
        let join = std::thread::Builder::new()
            .name("batch-aggregator".to_string())
            .spawn(move || worker.run(sink))
            .context("spawn aggregator thread")?;
        Ok(Self {
            shutdown,
            stats,
            join: Some(join),
        })
    }

    pub fn stats(&self) -> Arc<AggregatorStats> {
        self.stats.clone()
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("aggregator thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for BatchAggregator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

struct Worker {
    inputs: Vec<Receiver<Frame>>,
    batch_timeout: Duration,
    heartbeat: Heartbeat,
    shutdown: Arc<AtomicBool>,
    stats: Arc<AggregatorStats>,
}

impl Worker {
    fn run<S: FnMut(Batch)>(self, mut sink: S) {
        let slots = self.inputs.len();
        let idle_step = (self.batch_timeout / 8).clamp(Duration::from_millis(1), Duration::from_millis(5));
        let mut pending: Vec<Option<Frame>> = vec![None; slots];
        let mut opened_at: Option<Instant> = None;
        let mut next_id = 0u64;

        while !self.shutdown.load(Ordering::SeqCst) {
            for (slot, input) in self.inputs.iter().enumerate() {
                if pending[slot].is_some() {
                    continue;
                }
                match input.try_recv() {
                    Ok(frame) => {
                        pending[slot] = Some(frame);
                        opened_at.get_or_insert_with(Instant::now);
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
                }
            }

            let filled = pending.iter().filter(|frame| frame.is_some()).count();
            let timed_out = opened_at.is_some_and(|at| at.elapsed() >= self.batch_timeout);
            if filled == slots || (filled > 0 && timed_out) {
                let frames = std::mem::replace(&mut pending, vec![None; slots]);
                opened_at = None;
                let batch = Batch {
                    id: next_id,
                    frames,
                    timed_out: filled < slots,
                };
                next_id += 1;

                self.stats.batches.fetch_add(1, Ordering::Relaxed);
                self.stats.frames.fetch_add(filled as u64, Ordering::Relaxed);
                if batch.timed_out {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                self.heartbeat.beat();
                log::trace!("batch {} pushed with {}/{} frames", batch.id, filled, slots);
                sink(batch);
                continue;
            }

            std::thread::sleep(idle_step);
        }
    }
}
