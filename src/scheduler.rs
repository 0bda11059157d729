//! Rotation scheduler.
//!
//! Each cycle retires the live producer generation and replaces it with a
//! fresh one on the other half of the channel namespace:
//!
//! 1. **Steady**: N producers active, slot `i` listening to the i-th channel.
//! 2. **Unsubscribing**: every slot stops listening.
//! 3. **Draining**: wait for heartbeat evidence that the aggregator is idle.
//! 4. **Swapping**: spawn the next generation, then destroy the drained one.
//! 5. **Resubscribing**: point every slot at the new generation.
//!
//! A stop request is honoured between command batches: the scheduler
//! finishes what it is issuing, then unsubscribes every slot and destroys
//! every live producer.

use std::collections::VecDeque;
use std::time::Duration;

use crate::channel::{ChannelName, ChannelNamespace, DEFAULT_CHANNEL_PREFIX};
use crate::drain::{DrainMonitor, DrainOutcome, DEFAULT_DRAIN_MULTIPLIER};
use crate::error::{RotationError, RotationResult};
use crate::heartbeat::Heartbeat;
use crate::ingest::SourceSpec;
use crate::producer::{ProducerFactory, ProducerId, ProducerPool};
use crate::slot::{ConsumerSlotPool, Transport};
use crate::stop::StopSignal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationState {
    /// Constructed, no generation spawned yet.
    Idle,
    Steady,
    Unsubscribing,
    Draining,
    Swapping,
    Resubscribing,
    /// Torn down. Terminal.
    Stopped,
}

/// Tunables of the rotation loop.
#[derive(Clone, Debug)]
pub struct RotationSettings {
    /// Number of slots, and producers per generation.
    pub batch_size: usize,
    pub channel_prefix: String,
    /// Aggregator batch-formation timeout; also the drain poll interval.
    pub batch_timeout: Duration,
    /// Heartbeat must be this many batch timeouts old to count as drained.
    pub drain_multiplier: u32,
    /// Upper bound on a drain wait. `None` waits forever.
    pub drain_deadline: Option<Duration>,
    /// Time spent Steady between cycles.
    pub cycle_interval: Duration,
    /// Pause between spawning a generation and subscribing slots to it.
    pub settle_delay: Duration,
    /// Stop rotating (but keep running) after this many cycles.
    pub max_cycles: Option<u64>,
    /// Slot `i` is fed from `sources[i % sources.len()]`.
    pub sources: Vec<SourceSpec>,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            batch_size: 4,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            batch_timeout: Duration::from_millis(40),
            drain_multiplier: DEFAULT_DRAIN_MULTIPLIER,
            drain_deadline: None,
            cycle_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(3),
            max_cycles: None,
            sources: vec![SourceSpec::default()],
        }
    }
}

/// Summary of a finished run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotationReport {
    pub cycles: u64,
    /// Number of the last generation that was spawned.
    pub final_generation: u64,
}

/// Result of a single `rotate` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { generation: u64 },
    /// Stop arrived mid-cycle. The caller should tear down.
    Interrupted,
}

struct Generation {
    number: u64,
    base: usize,
    producers: Vec<ProducerId>,
}

pub struct RotationScheduler<F: ProducerFactory, T: Transport> {
    namespace: ChannelNamespace,
    settings: RotationSettings,
    producers: ProducerPool<F>,
    slots: ConsumerSlotPool<T>,
    heartbeat: Heartbeat,
    drain: DrainMonitor,
    stop: StopSignal,
    state: RotationState,
    base: usize,
    next_generation: u64,
    generations: VecDeque<Generation>,
    cycles: u64,
}

impl<F: ProducerFactory, T: Transport> RotationScheduler<F, T> {
    pub fn new(
        settings: RotationSettings,
        factory: F,
        transport: T,
        heartbeat: Heartbeat,
        stop: StopSignal,
    ) -> Self {
        let namespace = ChannelNamespace::new(settings.channel_prefix.clone(), settings.batch_size);
        let drain = DrainMonitor::new(settings.batch_timeout, settings.drain_multiplier)
            .with_deadline(settings.drain_deadline);
        Self {
            slots: ConsumerSlotPool::new(transport, namespace.batch_size()),
            producers: ProducerPool::new(factory),
            namespace,
            settings,
            heartbeat,
            drain,
            stop,
            state: RotationState::Idle,
            base: 0,
            next_generation: 0,
            generations: VecDeque::new(),
            cycles: 0,
        }
    }

    /// Spawn the initial generation and subscribe every slot to it.
    pub fn start(&mut self) -> RotationResult<()> {
        if self.state != RotationState::Idle {
            return Ok(());
        }
        let generation = match self.spawn_generation(self.base) {
            Ok(generation) => generation,
            Err(err) => {
                self.shutdown();
                return Err(err);
            }
        };
        let number = generation.number;
        self.generations.push_back(generation);
        if let Err(err) = self.subscribe_current() {
            self.shutdown();
            return Err(err);
        }
        self.enter(RotationState::Steady);
        log::info!(
            "rotation started: generation {} on {}",
            number,
            self.describe_names(self.base)
        );
        Ok(())
    }

    /// Rotate until stopped. Fatal errors tear everything down before returning.
    pub fn run(&mut self) -> RotationResult<RotationReport> {
        self.start()?;
        loop {
            if self.state == RotationState::Stopped {
                break;
            }
            if self
                .settings
                .max_cycles
                .is_some_and(|max| self.cycles >= max)
            {
                log::info!(
                    "rotation limit of {} cycles reached, holding generation {}",
                    self.cycles,
                    self.current_generation()
                );
                self.stop.wait();
                break;
            }
            if self.stop.wait_timeout(self.settings.cycle_interval) {
                break;
            }
            if self.rotate()? == CycleOutcome::Interrupted {
                break;
            }
        }
        self.shutdown();
        Ok(RotationReport {
            cycles: self.cycles,
            final_generation: self.next_generation.saturating_sub(1),
        })
    }

    /// Run one full cycle from Steady back to Steady.
    ///
    /// A fatal error tears down every producer and slot before it is returned,
    /// leaving the scheduler Stopped.
    pub fn rotate(&mut self) -> RotationResult<CycleOutcome> {
        if self.state == RotationState::Idle {
            self.start()?;
        }
        if self.state != RotationState::Steady {
            return Ok(CycleOutcome::Interrupted);
        }
        match self.cycle() {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                log::error!("rotation aborted: {}", err);
                self.shutdown();
                Err(err)
            }
        }
    }

    fn cycle(&mut self) -> RotationResult<CycleOutcome> {
        log::info!("cycle {}: unsubscribing all slots", self.cycles + 1);

        self.enter(RotationState::Unsubscribing);
        self.slots.unsubscribe_all();

        self.enter(RotationState::Draining);
        match self.drain.wait(&self.heartbeat, &self.stop)? {
            DrainOutcome::Drained { waited, polls } => {
                log::info!("drained after {:?} ({} polls)", waited, polls);
            }
            DrainOutcome::Stopped => return Ok(CycleOutcome::Interrupted),
        }

        self.enter(RotationState::Swapping);
        let next_base = self.namespace.advance(self.base);
        let incoming = self.spawn_generation(next_base)?;
        while let Some(outgoing) = self.generations.pop_front() {
            for id in &outgoing.producers {
                self.producers.despawn(*id);
            }
            log::info!(
                "generation {} retired from {}",
                outgoing.number,
                self.describe_names(outgoing.base)
            );
        }
        let number = incoming.number;
        self.generations.push_back(incoming);
        self.base = next_base;

        self.enter(RotationState::Resubscribing);
        if !self.settings.settle_delay.is_zero()
            && self.stop.wait_timeout(self.settings.settle_delay)
        {
            return Ok(CycleOutcome::Interrupted);
        }
        self.subscribe_current()?;
        self.cycles += 1;
        self.enter(RotationState::Steady);
        log::info!(
            "cycle {} complete: generation {} on {}",
            self.cycles,
            number,
            self.describe_names(self.base)
        );
        Ok(CycleOutcome::Completed { generation: number })
    }

    /// Unsubscribe every slot and destroy every live producer.
    pub fn shutdown(&mut self) {
        if self.state == RotationState::Stopped {
            return;
        }
        self.slots.unsubscribe_all();
        self.producers.despawn_all();
        self.generations.clear();
        self.enter(RotationState::Stopped);
        log::info!("rotation stopped after {} cycles", self.cycles);
    }

    pub fn state(&self) -> RotationState {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Number of the newest spawned generation.
    pub fn current_generation(&self) -> u64 {
        self.generations.back().map(|g| g.number).unwrap_or(0)
    }

    /// Producer ids of the newest generation, in slot order.
    pub fn current_producers(&self) -> Vec<ProducerId> {
        self.generations
            .back()
            .map(|g| g.producers.clone())
            .unwrap_or_default()
    }

    /// Channel names of the newest generation, in slot order.
    pub fn current_channels(&self) -> Vec<ChannelName> {
        self.namespace.generation_names(self.base)
    }

    /// `(slot, channel, producer)` for every slot whose channel has a bound producer.
    pub fn bindings(&self) -> Vec<(usize, ChannelName, ProducerId)> {
        self.slots
            .subscriptions()
            .iter()
            .enumerate()
            .filter_map(|(slot, channel)| {
                let channel = channel.as_ref()?;
                let producer = self.producers.registry().binding(channel)?;
                Some((slot, channel.clone(), producer))
            })
            .collect()
    }

    pub fn namespace(&self) -> &ChannelNamespace {
        &self.namespace
    }

    pub fn producers(&self) -> &ProducerPool<F> {
        &self.producers
    }

    pub fn slots(&self) -> &ConsumerSlotPool<T> {
        &self.slots
    }

    fn spawn_generation(&mut self, base: usize) -> RotationResult<Generation> {
        let number = self.next_generation;
        self.next_generation += 1;
        let names = self.namespace.generation_names(base);
        let mut producers = Vec::with_capacity(names.len());
        for (slot, channel) in names.iter().enumerate() {
            let spawned = match self.source_for(slot) {
                Some(source) => {
                    let source = source.clone();
                    self.producers.spawn(channel, &source, number)
                }
                None => Err(RotationError::SpawnFailed {
                    channel: channel.clone(),
                    reason: "no source configured".to_string(),
                }),
            };
            match spawned {
                Ok(id) => producers.push(id),
                Err(err) => {
                    for id in producers {
                        self.producers.despawn(id);
                    }
                    return Err(err);
                }
            }
        }
        log::debug!("generation {} spawned at base {}", number, base);
        Ok(Generation {
            number,
            base,
            producers,
        })
    }

    fn subscribe_current(&mut self) -> RotationResult<()> {
        for (slot, channel) in self.namespace.generation_names(self.base).iter().enumerate() {
            self.slots.subscribe(slot, channel)?;
        }
        Ok(())
    }

    fn source_for(&self, slot: usize) -> Option<&SourceSpec> {
        let sources = &self.settings.sources;
        if sources.is_empty() {
            return None;
        }
        sources.get(slot % sources.len())
    }

    fn describe_names(&self, base: usize) -> String {
        let names = self.namespace.generation_names(base);
        match (names.first(), names.last()) {
            (Some(first), Some(last)) => format!("{}..{}", first, last),
            _ => String::new(),
        }
    }

    fn enter(&mut self, state: RotationState) {
        log::debug!("rotation state {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    struct NullFactory;

    impl ProducerFactory for NullFactory {
        type Handle = ();

        fn start(&mut self, _channel: &ChannelName, _source: &SourceSpec) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self, _handle: ()) -> Result<()> {
            Ok(())
        }
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn subscribe(&mut self, _slot: usize, _channel: &ChannelName) {}

        fn unsubscribe(&mut self, _slot: usize) {}
    }

    fn fast_settings(batch_size: usize) -> RotationSettings {
        RotationSettings {
            batch_size,
            batch_timeout: Duration::from_millis(2),
            drain_multiplier: 2,
            cycle_interval: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
            ..RotationSettings::default()
        }
    }

    fn scheduler(batch_size: usize) -> RotationScheduler<NullFactory, NullTransport> {
        RotationScheduler::new(
            fast_settings(batch_size),
            NullFactory,
            NullTransport,
            Heartbeat::new(),
            StopSignal::new(),
        )
    }

    #[test]
    fn start_enters_steady_with_full_generation() {
        let mut sched = scheduler(3);
        sched.start().expect("start");
        assert_eq!(sched.state(), RotationState::Steady);
        assert_eq!(sched.producers().active_count(), 3);
        assert_eq!(sched.bindings().len(), 3);
        assert_eq!(sched.current_generation(), 0);
    }

    #[test]
    fn rotation_alternates_namespace_halves() {
        let mut sched = scheduler(2);
        sched.start().expect("start");
        let names = |s: &RotationScheduler<NullFactory, NullTransport>| {
            s.current_channels()
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&sched), ["ch-00", "ch-01"]);

        sched.rotate().expect("cycle 1");
        assert_eq!(names(&sched), ["ch-02", "ch-03"]);

        sched.rotate().expect("cycle 2");
        assert_eq!(names(&sched), ["ch-00", "ch-01"]);
        assert_eq!(sched.current_generation(), 2);
        assert_eq!(sched.producers().active_count(), 2);
    }

    #[test]
    fn shutdown_is_terminal_and_idempotent() {
        let mut sched = scheduler(2);
        sched.start().expect("start");
        sched.shutdown();
        sched.shutdown();
        assert_eq!(sched.state(), RotationState::Stopped);
        assert!(sched.producers().live_ids().is_empty());
        assert_eq!(
            sched.rotate().expect("rotate after stop"),
            CycleOutcome::Interrupted
        );
    }

    #[test]
    fn empty_source_list_fails_to_spawn() {
        let mut sched = RotationScheduler::new(
            RotationSettings {
                sources: Vec::new(),
                ..fast_settings(2)
            },
            NullFactory,
            NullTransport,
            Heartbeat::new(),
            StopSignal::new(),
        );
        let err = sched.start().expect_err("no sources");
        assert!(matches!(err, RotationError::SpawnFailed { .. }));
        assert_eq!(sched.state(), RotationState::Stopped);
    }
}
