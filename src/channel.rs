//! Channel naming and binding bookkeeping.
//!
//! - `ChannelNamespace`: the circular namespace of `2N` channel names.
//! - `ChannelRegistry`: which producer currently holds each name.
//!
//! The registry is pure bookkeeping. Actual wiring is done by the transport.

use std::collections::HashMap;
use std::fmt;

use crate::error::{RotationError, RotationResult};
use crate::producer::ProducerId;

pub const DEFAULT_CHANNEL_PREFIX: &str = "ch";

/// Name of a one-producer binding point on the transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Circular namespace of `2 * batch_size` channel names.
///
/// Each generation occupies `batch_size` consecutive names starting at a base
/// index. Advancing the base by exactly `batch_size` keeps two consecutive
/// generations on disjoint names.
#[derive(Clone, Debug)]
pub struct ChannelNamespace {
    prefix: String,
    batch_size: usize,
}

impl ChannelNamespace {
    pub fn new(prefix: impl Into<String>, batch_size: usize) -> Self {
        debug_assert!(batch_size > 0, "batch size must be positive");
        Self {
            prefix: prefix.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Total number of names in the namespace.
    pub fn size(&self) -> usize {
        self.batch_size * 2
    }

    /// Name at `index`, wrapped into the namespace.
    pub fn name(&self, index: usize) -> ChannelName {
        ChannelName(format!("{}-{:02}", self.prefix, index % self.size()))
    }

    /// The `batch_size` names of the generation starting at `base`.
    pub fn generation_names(&self, base: usize) -> Vec<ChannelName> {
        (0..self.batch_size).map(|i| self.name(base + i)).collect()
    }

    /// Base index of the generation following the one at `base`.
    pub fn advance(&self, base: usize) -> usize {
        (base + self.batch_size) % self.size()
    }
}

/// Maps channel names to the producer bound to them.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    bindings: HashMap<ChannelName, ProducerId>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `channel` to `producer`. Fails if the name has a live binding.
    pub fn bind(&mut self, channel: &ChannelName, producer: ProducerId) -> RotationResult<()> {
        if let Some(holder) = self.bindings.get(channel) {
            return Err(RotationError::NameInUse {
                channel: channel.clone(),
                holder: *holder,
            });
        }
        self.bindings.insert(channel.clone(), producer);
        Ok(())
    }

    /// Release `channel`. Returns the previous holder, if any.
    pub fn unbind(&mut self, channel: &ChannelName) -> Option<ProducerId> {
        self.bindings.remove(channel)
    }

    pub fn binding(&self, channel: &ChannelName) -> Option<ProducerId> {
        self.bindings.get(channel).copied()
    }

    pub fn is_bound(&self, channel: &ChannelName) -> bool {
        self.bindings.contains_key(channel)
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.len()
    }

    /// Bound names in sorted order.
    pub fn bound_names(&self) -> Vec<ChannelName> {
        let mut names: Vec<ChannelName> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }
}
