use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelName;
use crate::producer::ProducerId;

/// Failures surfaced by the rotation core.
///
/// Every variant except `SlotOutOfRange` is fatal to the scheduler: the run
/// loop tears down all producers and slots and hands the error back to the
/// caller, which is expected to terminate the process.
#[derive(Debug, Error)]
pub enum RotationError {
    /// The producer factory could not construct a source instance.
    #[error("failed to spawn producer on {channel}: {reason}")]
    SpawnFailed { channel: ChannelName, reason: String },

    /// A bind collided with a live binding. Indicates a namespace striding bug.
    #[error("channel {channel} is already bound to producer {holder}")]
    NameInUse {
        channel: ChannelName,
        holder: ProducerId,
    },

    #[error("slot {index} out of range (pool has {slots} slots)")]
    SlotOutOfRange { index: usize, slots: usize },

    /// No drain evidence within the configured drain deadline.
    #[error("drain stalled: heartbeat still fresh after {waited:?}")]
    DrainStalled { waited: Duration },
}

impl RotationError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RotationError::SlotOutOfRange { .. })
    }
}

pub type RotationResult<T> = std::result::Result<T, RotationError>;
