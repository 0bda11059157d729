//! Producer pool.
//!
//! Producers live in an arena of entries. A `ProducerId` carries the entry
//! index plus the number of times that entry has been recycled, so an id held
//! past its producer's destruction can never address the entry's next occupant.

use std::fmt;

use anyhow::Result;

use crate::channel::{ChannelName, ChannelRegistry};
use crate::error::{RotationError, RotationResult};
use crate::ingest::SourceSpec;

/// Starts and stops the external units that publish onto channels.
pub trait ProducerFactory {
    type Handle;

    /// Start a producer publishing `source` onto `channel`.
    fn start(&mut self, channel: &ChannelName, source: &SourceSpec) -> Result<Self::Handle>;

    /// Halt and release a producer.
    fn stop(&mut self, handle: Self::Handle) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProducerId {
    index: u32,
    reuse: u32,
}

impl ProducerId {
    pub(crate) fn new(index: u32, reuse: u32) -> Self {
        Self { index, reuse }
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "producer#{}.{}", self.index, self.reuse)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerState {
    Created,
    Active,
    Stopping,
    Destroyed,
}

struct Producer<H> {
    generation: u64,
    channel: ChannelName,
    state: ProducerState,
    handle: Option<H>,
}

struct Entry<H> {
    reuse: u32,
    producer: Producer<H>,
}

/// Owns every producer and the channel bindings they hold.
pub struct ProducerPool<F: ProducerFactory> {
    factory: F,
    registry: ChannelRegistry,
    entries: Vec<Entry<F::Handle>>,
    free: Vec<u32>,
}

impl<F: ProducerFactory> ProducerPool<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            registry: ChannelRegistry::new(),
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Spawn a producer bound to `channel`.
    ///
    /// On factory failure the producer goes straight from Created to Destroyed
    /// and its binding is released before `SpawnFailed` is returned.
    pub fn spawn(
        &mut self,
        channel: &ChannelName,
        source: &SourceSpec,
        generation: u64,
    ) -> RotationResult<ProducerId> {
        let id = self.allocate(Producer {
            generation,
            channel: channel.clone(),
            state: ProducerState::Created,
            handle: None,
        });
        if let Err(err) = self.registry.bind(channel, id) {
            self.retire(id);
            return Err(err);
        }

        match self.factory.start(channel, source) {
            Ok(handle) => {
                let producer = &mut self.entries[id.index as usize].producer;
                producer.handle = Some(handle);
                producer.state = ProducerState::Active;
                log::debug!("{} active on {} ({})", id, channel, source.url);
                Ok(id)
            }
            Err(err) => {
                self.registry.unbind(channel);
                self.retire(id);
                log::error!("{} failed to start on {}: {:#}", id, channel, err);
                Err(RotationError::SpawnFailed {
                    channel: channel.clone(),
                    reason: format!("{:#}", err),
                })
            }
        }
    }

    /// Stop a producer and release its channel. No-op on a destroyed or unknown id.
    pub fn despawn(&mut self, id: ProducerId) {
        let Some(entry) = self.entries.get_mut(id.index as usize) else {
            return;
        };
        if entry.reuse != id.reuse || entry.producer.state == ProducerState::Destroyed {
            return;
        }

        entry.producer.state = ProducerState::Stopping;
        let channel = entry.producer.channel.clone();
        if let Some(handle) = entry.producer.handle.take() {
            if let Err(err) = self.factory.stop(handle) {
                log::warn!("{} on {} did not stop cleanly: {:#}", id, channel, err);
            }
        }
        if self.registry.binding(&channel) == Some(id) {
            self.registry.unbind(&channel);
        }
        self.retire(id);
        log::debug!("{} destroyed, {} released", id, channel);
    }

    /// Despawn every producer that is not yet destroyed.
    pub fn despawn_all(&mut self) {
        for id in self.live_ids() {
            self.despawn(id);
        }
    }

    /// Lifecycle state of `id`. Ids whose entry has since been recycled report Destroyed.
    pub fn state(&self, id: ProducerId) -> Option<ProducerState> {
        let entry = self.entries.get(id.index as usize)?;
        if entry.reuse != id.reuse {
            return Some(ProducerState::Destroyed);
        }
        Some(entry.producer.state)
    }

    /// Channel bound to a live producer.
    pub fn channel(&self, id: ProducerId) -> Option<&ChannelName> {
        self.live(id).map(|producer| &producer.channel)
    }

    pub fn generation(&self, id: ProducerId) -> Option<u64> {
        self.live(id).map(|producer| producer.generation)
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.producer.state == ProducerState::Active)
            .count()
    }

    pub fn active_ids(&self) -> Vec<ProducerId> {
        self.ids_where(|state| state == ProducerState::Active)
    }

    /// Ids of every producer that has not reached Destroyed.
    pub fn live_ids(&self) -> Vec<ProducerId> {
        self.ids_where(|state| state != ProducerState::Destroyed)
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn live(&self, id: ProducerId) -> Option<&Producer<F::Handle>> {
        let entry = self.entries.get(id.index as usize)?;
        if entry.reuse != id.reuse || entry.producer.state == ProducerState::Destroyed {
            return None;
        }
        Some(&entry.producer)
    }

    fn ids_where(&self, keep: impl Fn(ProducerState) -> bool) -> Vec<ProducerId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| keep(entry.producer.state))
            .map(|(index, entry)| ProducerId::new(index as u32, entry.reuse))
            .collect()
    }

    fn allocate(&mut self, producer: Producer<F::Handle>) -> ProducerId {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.reuse = entry.reuse.wrapping_add(1);
            entry.producer = producer;
            return ProducerId::new(index, entry.reuse);
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry { reuse: 0, producer });
        ProducerId::new(index, 0)
    }

    fn retire(&mut self, id: ProducerId) {
        let entry = &mut self.entries[id.index as usize];
        entry.producer.state = ProducerState::Destroyed;
        entry.producer.handle = None;
        self.free.push(id.index);
    }
}
