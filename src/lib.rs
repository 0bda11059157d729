//! Feed rotor
//!
//! Keeps a fixed-size batch consumer fed from live sources while the sources
//! are retired and replaced on a timer.
//!
//! # Architecture
//!
//! The rotation core maintains three invariants:
//!
//! 1. **Full house**: between cycles exactly N producers are active and slot `i`
//!    listens to the channel of the i-th producer.
//! 2. **Drain before destroy**: a producer is destroyed only after the aggregator
//!    heartbeat has been idle for `K × batch_timeout` since its slot was
//!    unsubscribed.
//! 3. **No aliasing**: a generation never reuses a channel name whose previous
//!    producer is still alive (the namespace holds `2N` names and each cycle
//!    strides it by N).
//!
//! # Module Structure
//!
//! - `channel`: circular channel namespace and binding registry
//! - `producer`: producer arena and the `ProducerFactory` seam
//! - `slot`: consumer slots and the `Transport` seam
//! - `heartbeat`, `drain`, `stop`: drain evidence and cancellation
//! - `scheduler`: the rotation state machine
//! - `bus`: in-process transport and batch aggregator
//! - `ingest`: synthetic and GStreamer producer backends
//! - `config`: file + environment configuration

pub mod bus;
pub mod channel;
pub mod config;
pub mod drain;
pub mod error;
pub mod heartbeat;
pub mod ingest;
pub mod producer;
pub mod scheduler;
pub mod slot;
pub mod stop;

pub use bus::{Batch, BatchAggregator, BusEvent, Frame, MemoryBus, Publisher};
pub use channel::{ChannelName, ChannelNamespace, ChannelRegistry};
pub use config::{InferenceSettings, RotorConfig};
pub use drain::{DrainMonitor, DrainOutcome};
pub use error::{RotationError, RotationResult};
pub use heartbeat::Heartbeat;
pub use ingest::{SourceSpec, SourceTransport, SyntheticFactory};
pub use producer::{ProducerFactory, ProducerId, ProducerPool, ProducerState};
pub use scheduler::{
    CycleOutcome, RotationReport, RotationScheduler, RotationSettings, RotationState,
};
pub use slot::{ConsumerSlotPool, Transport};
pub use stop::StopSignal;
