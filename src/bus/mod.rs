//! In-process data plane.
//!
//! - `MemoryBus`: named one-publisher channels and per-slot input ports.
//! - `BatchAggregator`: forms fixed-size batches from the slot ports and
//!   beats the heartbeat on every batch.
//! - `BusEvent`: the closed set of pipeline events the daemon reacts to.
//!
//! This is the reference transport used by the daemon's synthetic mode and by
//! the end-to-end tests. The GStreamer backend in `ingest::gstreamer` honours
//! the same contract with interpipe elements.

mod aggregator;

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::channel::ChannelName;
use crate::slot::Transport;

pub use aggregator::{AggregatorStats, Batch, BatchAggregator};

/// Default depth of each slot's input queue.
pub const DEFAULT_PORT_DEPTH: usize = 8;

/// One unit of published data.
#[derive(Clone, Debug)]
pub struct Frame {
    pub channel: ChannelName,
    pub sequence: u64,
    pub captured_at: Instant,
    pub width: u32,
    pub height: u32,
    pub payload: Vec<u8>,
}

/// Events raised by a running pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    EndOfStream,
    Error { source: String, message: String },
    Other(String),
}

impl BusEvent {
    /// End-of-stream and errors end the run; everything else is informational.
    pub fn requests_stop(&self) -> bool {
        matches!(self, BusEvent::EndOfStream | BusEvent::Error { .. })
    }
}

struct SlotPort {
    listen_to: Option<ChannelName>,
    tx: SyncSender<Frame>,
}

#[derive(Default)]
struct BusState {
    publishers: HashMap<ChannelName, u64>,
    next_token: u64,
    ports: Vec<SlotPort>,
}

/// Publish/subscribe bus with one publisher per channel name.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    /// Create a bus with `slots` input ports, returning the port receivers in slot order.
    ///
    /// Ports are leaky: when a port already holds `depth` frames, new frames for
    /// it are dropped.
    pub fn new(slots: usize, depth: usize) -> (Self, Vec<Receiver<Frame>>) {
        let mut ports = Vec::with_capacity(slots);
        let mut inputs = Vec::with_capacity(slots);
        for _ in 0..slots {
            let (tx, rx) = mpsc::sync_channel(depth.max(1));
            ports.push(SlotPort {
                listen_to: None,
                tx,
            });
            inputs.push(rx);
        }
        let bus = Self {
            state: Arc::new(Mutex::new(BusState {
                ports,
                ..BusState::default()
            })),
        };
        (bus, inputs)
    }

    /// Claim `channel` for publishing. Fails while another publisher holds it.
    pub fn create_channel(&self, channel: &ChannelName) -> Result<Publisher> {
        let mut state = self.lock();
        if state.publishers.contains_key(channel) {
            return Err(anyhow!("channel {} already has a publisher", channel));
        }
        let token = state.next_token;
        state.next_token += 1;
        state.publishers.insert(channel.clone(), token);
        Ok(Publisher {
            bus: self.clone(),
            channel: channel.clone(),
            token,
        })
    }

    pub fn has_publisher(&self, channel: &ChannelName) -> bool {
        self.lock().publishers.contains_key(channel)
    }

    /// Slots currently listening to `channel`.
    pub fn subscribers(&self, channel: &ChannelName) -> Vec<usize> {
        self.lock()
            .ports
            .iter()
            .enumerate()
            .filter(|(_, port)| port.listen_to.as_ref() == Some(channel))
            .map(|(index, _)| index)
            .collect()
    }

    pub fn listen_to(&self, slot: usize) -> Option<ChannelName> {
        self.lock()
            .ports
            .get(slot)
            .and_then(|port| port.listen_to.clone())
    }

    fn deliver(&self, frame: &Frame) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for (index, port) in state.ports.iter().enumerate() {
            if port.listen_to.as_ref() != Some(&frame.channel) {
                continue;
            }
            match port.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::trace!("slot {} queue full, dropping {}", index, frame.channel);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        delivered
    }

    fn release(&self, channel: &ChannelName, token: u64) {
        let mut state = self.lock();
        if state.publishers.get(channel) == Some(&token) {
            state.publishers.remove(channel);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryBus {
    fn subscribe(&mut self, slot: usize, channel: &ChannelName) {
        if let Some(port) = self.lock().ports.get_mut(slot) {
            port.listen_to = Some(channel.clone());
        }
    }

    fn unsubscribe(&mut self, slot: usize) {
        if let Some(port) = self.lock().ports.get_mut(slot) {
            port.listen_to = None;
        }
    }
}

/// Exclusive publishing right on one channel. Dropping it frees the name.
pub struct Publisher {
    bus: MemoryBus,
    channel: ChannelName,
    token: u64,
}

impl Publisher {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Publish to every slot listening to this channel. Returns the number of
    /// slots that accepted the frame.
    pub fn publish(&self, sequence: u64, width: u32, height: u32, payload: Vec<u8>) -> usize {
        let frame = Frame {
            channel: self.channel.clone(),
            sequence,
            captured_at: Instant::now(),
            width,
            height,
            payload,
        };
        self.bus.deliver(&frame)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.bus.release(&self.channel, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_publisher_per_channel() {
        let (bus, _inputs) = MemoryBus::new(1, 4);
        let name = ChannelName::new("ch-00");
        let publisher = bus.create_channel(&name).expect("first publisher");
        assert!(bus.create_channel(&name).is_err());

        drop(publisher);
        assert!(!bus.has_publisher(&name));
        bus.create_channel(&name).expect("name free after drop");
    }

    #[test]
    fn frames_reach_only_listening_slots() {
        let (mut bus, inputs) = MemoryBus::new(2, 4);
        let name = ChannelName::new("ch-01");
        let publisher = bus.create_channel(&name).expect("publisher");

        assert_eq!(publisher.publish(0, 1, 1, vec![1]), 0);

        bus.subscribe(1, &name);
        assert_eq!(publisher.publish(1, 1, 1, vec![2]), 1);
        assert!(inputs[0].try_recv().is_err());
        let frame = inputs[1].try_recv().expect("slot 1 frame");
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.channel, name);

        bus.unsubscribe(1);
        assert_eq!(publisher.publish(2, 1, 1, vec![3]), 0);
        assert!(bus.subscribers(&name).is_empty());
    }

    #[test]
    fn full_port_drops_frames() {
        let (mut bus, inputs) = MemoryBus::new(1, 2);
        let name = ChannelName::new("ch-02");
        let publisher = bus.create_channel(&name).expect("publisher");
        bus.subscribe(0, &name);

        let delivered: usize = (0..5).map(|seq| publisher.publish(seq, 1, 1, vec![])).sum();
        assert_eq!(delivered, 2);
        assert_eq!(inputs[0].try_iter().count(), 2);
    }

    #[test]
    fn bus_events_that_end_the_run() {
        assert!(BusEvent::EndOfStream.requests_stop());
        assert!(BusEvent::Error {
            source: "nvinfer".into(),
            message: "bad config".into()
        }
        .requests_stop());
        assert!(!BusEvent::Other("state-changed".into()).requests_stop());
    }
}
