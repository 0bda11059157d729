//! Producer backends.
//!
//! - Synthetic sources (`stub://`) publishing onto the memory bus
//! - RTSP sources over GStreamer interpipe (feature: interpipe-gstreamer)
//!
//! Sources are described by a structured `SourceSpec`; the channel a producer
//! publishes on is chosen by the rotation scheduler at spawn time.

#[cfg(feature = "interpipe-gstreamer")]
pub mod gstreamer;
mod source;
pub mod synthetic;

#[cfg(feature = "interpipe-gstreamer")]
pub use gstreamer::{InferencePipeline, InterpipeFactory, InterpipeTransport};
pub use source::{SourceSpec, SourceTransport};
pub use synthetic::{SyntheticFactory, SyntheticProducer};
