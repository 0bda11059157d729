//! Synthetic producers for `stub://` sources.
//!
//! Each producer owns a publisher on the memory bus and a thread that emits
//! frames at the source's `fps` until stopped. Payloads are a small generated
//! pattern, not decoded video.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::bus::{MemoryBus, Publisher};
use crate::channel::ChannelName;
use crate::ingest::SourceSpec;
use crate::producer::ProducerFactory;

const PAYLOAD_BYTES: usize = 256;

/// Producer factory backed by the memory bus.
#[derive(Clone)]
pub struct SyntheticFactory {
    bus: MemoryBus,
}

impl SyntheticFactory {
    pub fn new(bus: MemoryBus) -> Self {
        Self { bus }
    }
}

/// Handle to a running synthetic producer.
pub struct SyntheticProducer {
    channel: ChannelName,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<u64>>,
}

impl SyntheticProducer {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }
}

impl Drop for SyntheticProducer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl ProducerFactory for SyntheticFactory {
    type Handle = SyntheticProducer;

    fn start(&mut self, channel: &ChannelName, source: &SourceSpec) -> Result<SyntheticProducer> {
        if !source.is_synthetic() {
            bail!(
                "{} requires the interpipe-gstreamer feature (only stub:// sources are synthetic)",
                source.url
            );
        }
        if source.fps == 0 {
            bail!("source {} has fps 0", source.url);
        }

        let publisher = self.bus.create_channel(channel)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let emitter = Emitter {
            publisher,
            width: source.width,
            height: source.height,
            interval: frame_interval(source.fps),
            shutdown: shutdown.clone(),
            frame_count: 0,
            scene_state: 0,
        };
        let join = std::thread::Builder::new()
            .name(format!("producer-{}", channel))
            .spawn(move || emitter.run())
            .context("spawn synthetic producer thread")?;
        log::info!("synthetic producer started: {} -> {}", source.url, channel);

        Ok(SyntheticProducer {
            channel: channel.clone(),
            shutdown,
            join: Some(join),
        })
    }

    fn stop(&mut self, mut handle: SyntheticProducer) -> Result<()> {
        handle.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = handle.join.take() {
            let published = join
                .join()
                .map_err(|_| anyhow!("producer thread for {} panicked", handle.channel))?;
            log::info!(
                "synthetic producer on {} stopped after {} frames",
                handle.channel,
                published
            );
        }
        Ok(())
    }
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps
}

struct Emitter {
    publisher: Publisher,
    width: u32,
    height: u32,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    frame_count: u64,
    /// Simulated scene, bumped every 50 frames.
    scene_state: u8,
}

impl Emitter {
    fn run(mut self) -> u64 {
        while !self.shutdown.load(Ordering::SeqCst) {
            let payload = self.next_payload();
            self.publisher
                .publish(self.frame_count, self.width, self.height, payload);
            self.frame_count += 1;
            std::thread::sleep(self.interval);
        }
        self.frame_count
    }

    fn next_payload(&mut self) -> Vec<u8> {
        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        (0..PAYLOAD_BYTES)
            .map(|i| ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Transport;

    #[test]
    fn rejects_non_stub_sources() {
        let (bus, _inputs) = MemoryBus::new(1, 4);
        let mut factory = SyntheticFactory::new(bus);
        let err = factory
            .start(
                &ChannelName::new("ch-00"),
                &SourceSpec::from_url("rtsp://10.0.0.1/live"),
            )
            .err()
            .expect("rtsp must be rejected");
        assert!(err.to_string().contains("interpipe-gstreamer"));
    }

    #[test]
    fn producer_publishes_until_stopped() -> Result<()> {
        let (mut bus, inputs) = MemoryBus::new(1, 64);
        let channel = ChannelName::new("ch-04");
        let mut factory = SyntheticFactory::new(bus.clone());
        let source = SourceSpec {
            fps: 200,
            ..SourceSpec::from_url("stub://test")
        };

        let handle = factory.start(&channel, &source)?;
        assert!(bus.has_publisher(&channel));
        bus.subscribe(0, &channel);

        let frame = inputs[0].recv_timeout(Duration::from_secs(2))?;
        assert_eq!(frame.channel, channel);
        assert_eq!(frame.payload.len(), PAYLOAD_BYTES);

        factory.stop(handle)?;
        assert!(!bus.has_publisher(&channel));
        Ok(())
    }

    #[test]
    fn frame_interval_keeps_sub_millisecond_precision() {
        assert_eq!(frame_interval(25), Duration::from_millis(40));
        assert_eq!(frame_interval(300), Duration::from_nanos(3_333_333));
        assert!(!frame_interval(2_000).is_zero());
    }

    #[test]
    fn channel_cannot_host_two_producers() -> Result<()> {
        let (bus, _inputs) = MemoryBus::new(1, 4);
        let channel = ChannelName::new("ch-01");
        let mut factory = SyntheticFactory::new(bus);
        let source = SourceSpec::from_url("stub://a");

        let first = factory.start(&channel, &source)?;
        assert!(factory.start(&channel, &source).is_err());
        factory.stop(first)?;
        Ok(())
    }
}
