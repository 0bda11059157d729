//! GStreamer interpipe backend.
//!
//! - Producers are standalone pipelines:
//!   `rtspsrc ! queue ! parsebin ! <decoder> ! queue ! interpipesink name=<channel>`
//! - Slots are the `interpipesrc` elements of the inference pipeline; subscribing
//!   rewrites their `listen-to` property.
//! - The inference pipeline batches slots with `nvstreammux` and beats the
//!   heartbeat from a buffer probe on the OSD sink pad.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ::gstreamer as gst;
use gst::prelude::*;

use crate::bus::BusEvent;
use crate::channel::ChannelName;
use crate::config::InferenceSettings;
use crate::heartbeat::Heartbeat;
use crate::ingest::SourceSpec;
use crate::producer::ProducerFactory;
use crate::slot::Transport;

fn make(factory: &str, name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .with_context(|| format!("create {} element '{}'", factory, name))
}

/// Builds one source pipeline per producer.
pub struct InterpipeFactory;

impl InterpipeFactory {
    pub fn new() -> Result<Self> {
        gst::init().context("initialize gstreamer")?;
        Ok(Self)
    }
}

pub struct InterpipeProducer {
    channel: ChannelName,
    pipeline: gst::Pipeline,
}

impl ProducerFactory for InterpipeFactory {
    type Handle = InterpipeProducer;

    fn start(&mut self, channel: &ChannelName, source: &SourceSpec) -> Result<InterpipeProducer> {
        let pipeline = gst::Pipeline::with_name(&format!("producer-{}", channel));

        let rtspsrc = gst::ElementFactory::make("rtspsrc")
            .name("source")
            .property("location", source.url.as_str())
            .property_from_str("protocols", source.transport.as_protocols())
            .build()
            .context("create rtspsrc")?;
        let queue = make("queue", "source-queue")?;
        let parser = make("parsebin", "parser")?;
        let decoder = make(&source.decoder, "decoder")?;
        let decoded_queue = make("queue", "decoder-queue")?;
        let sink = gst::ElementFactory::make("interpipesink")
            .name(channel.as_str())
            .property("sync", false)
            .property("async", false)
            .build()
            .context("create interpipesink")?;

        pipeline
            .add_many([&rtspsrc, &queue, &parser, &decoder, &decoded_queue, &sink])
            .context("add producer elements")?;
        queue.link(&parser).context("link queue to parsebin")?;
        gst::Element::link_many([&decoder, &decoded_queue, &sink])
            .context("link decoder chain")?;

        link_dynamic(&rtspsrc, &queue);
        link_dynamic(&parser, &decoder);

        pipeline
            .set_state(gst::State::Playing)
            .with_context(|| format!("set producer {} to Playing", channel))?;
        log::info!("interpipe producer started: {} -> {}", source.url, channel);

        Ok(InterpipeProducer {
            channel: channel.clone(),
            pipeline,
        })
    }

    fn stop(&mut self, handle: InterpipeProducer) -> Result<()> {
        handle
            .pipeline
            .set_state(gst::State::Null)
            .with_context(|| format!("set producer {} to Null", handle.channel))?;
        log::info!("interpipe producer on {} released", handle.channel);
        Ok(())
    }
}

/// Link the first compatible pad that `upstream` exposes at runtime to `downstream`.
fn link_dynamic(upstream: &gst::Element, downstream: &gst::Element) {
    let downstream = downstream.downgrade();
    upstream.connect_pad_added(move |element, pad| {
        let Some(downstream) = downstream.upgrade() else {
            return;
        };
        let Some(sink_pad) = downstream.static_pad("sink") else {
            return;
        };
        if sink_pad.is_linked() {
            return;
        }
        if let Err(err) = pad.link(&sink_pad) {
            log::warn!("{}: pad {} not linked: {:?}", element.name(), pad.name(), err);
        }
    });
}

/// The batching/inference pipeline fed by the slots.
pub struct InferencePipeline {
    pipeline: gst::Pipeline,
    inputs: Vec<gst::Element>,
}

impl InferencePipeline {
    pub fn build(
        settings: &InferenceSettings,
        batch_size: usize,
        batch_timeout: Duration,
        heartbeat: Heartbeat,
    ) -> Result<Self> {
        gst::init().context("initialize gstreamer")?;
        let push_timeout = push_timeout_micros(batch_timeout)?;
        let pipeline = gst::Pipeline::with_name("inference");

        let streammux = gst::ElementFactory::make("nvstreammux")
            .name("streammux")
            .property("batch-size", batch_size as u32)
            .property("width", settings.width)
            .property("height", settings.height)
            .property("batched-push-timeout", push_timeout)
            .build()
            .context("create nvstreammux")?;
        let pgie = gst::ElementFactory::make("nvinfer")
            .name("pgie")
            .property(
                "config-file-path",
                settings.infer_config_path.to_string_lossy().as_ref(),
            )
            .build()
            .context("create nvinfer")?;
        let convert = make("nvvideoconvert", "nvvidconv")?;
        let osd = make("nvdsosd", "nvosd")?;
        let convert_out = make("nvvideoconvert", "nvvidconv2sink")?;
        let sink = make("fakesink", "sink")?;

        pipeline
            .add_many([&streammux, &pgie, &convert, &osd, &convert_out, &sink])
            .context("add inference elements")?;
        gst::Element::link_many([&streammux, &pgie, &convert, &osd, &convert_out, &sink])
            .context("link inference chain")?;

        let mut inputs = Vec::with_capacity(batch_size);
        for slot in 0..batch_size {
            let src = gst::ElementFactory::make("interpipesrc")
                .name(format!("interpipesrc-{:02}", slot))
                .property("is-live", true)
                .property("allow-renegotiation", true)
                .property_from_str("stream-sync", "passthrough-ts")
                .build()
                .context("create interpipesrc")?;
            let queue = make("queue", &format!("interpipesrc-{:02}-queue", slot))?;
            pipeline
                .add_many([&src, &queue])
                .context("add slot elements")?;
            src.link(&queue).context("link interpipesrc to queue")?;

            let mux_pad = streammux
                .request_pad_simple(&format!("sink_{}", slot))
                .ok_or_else(|| anyhow!("streammux request pad sink_{} failed", slot))?;
            let queue_pad = queue
                .static_pad("src")
                .ok_or_else(|| anyhow!("slot {} queue has no src pad", slot))?;
            queue_pad
                .link(&mux_pad)
                .map_err(|err| anyhow!("link slot {} to streammux: {:?}", slot, err))?;
            inputs.push(src);
        }

        let osd_sink = osd
            .static_pad("sink")
            .ok_or_else(|| anyhow!("nvdsosd has no sink pad"))?;
        osd_sink.add_probe(gst::PadProbeType::BUFFER, move |_, _| {
            heartbeat.beat();
            gst::PadProbeReturn::Ok
        });

        Ok(Self { pipeline, inputs })
    }

    pub fn play(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("set inference pipeline to Playing")?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .context("set inference pipeline to Null")?;
        Ok(())
    }

    /// Transport handle that rebinds this pipeline's slot inputs.
    pub fn transport(&self) -> InterpipeTransport {
        InterpipeTransport {
            inputs: self.inputs.clone(),
        }
    }

    /// Drain pending bus messages without blocking.
    pub fn poll_events(&self) -> Vec<BusEvent> {
        let Some(bus) = self.pipeline.bus() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while let Some(message) = bus.timed_pop(gst::ClockTime::ZERO) {
            events.push(bus_event(&message));
        }
        events
    }
}

fn bus_event(message: &gst::MessageRef) -> BusEvent {
    use gst::MessageView;
    match message.view() {
        MessageView::Eos(..) => BusEvent::EndOfStream,
        MessageView::Error(err) => BusEvent::Error {
            source: err
                .src()
                .map(|s| s.path_string().to_string())
                .unwrap_or_default(),
            message: err.error().to_string(),
        },
        _ => BusEvent::Other(format!("{:?}", message.type_())),
    }
}

/// nvstreammux takes `batched-push-timeout` as signed microseconds.
fn push_timeout_micros(batch_timeout: Duration) -> Result<i32> {
    i32::try_from(batch_timeout.as_micros()).map_err(|_| {
        anyhow!(
            "batch timeout {:?} does not fit nvstreammux batched-push-timeout",
            batch_timeout
        )
    })
}

/// `listen-to` rebinding over the inference pipeline's interpipesrc elements.
pub struct InterpipeTransport {
    inputs: Vec<gst::Element>,
}

impl Transport for InterpipeTransport {
    fn subscribe(&mut self, slot: usize, channel: &ChannelName) {
        if let Some(src) = self.inputs.get(slot) {
            src.set_property("listen-to", channel.as_str());
        }
    }

    fn unsubscribe(&mut self, slot: usize) {
        if let Some(src) = self.inputs.get(slot) {
            src.set_property("listen-to", None::<&str>);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_timeout_rejects_values_beyond_i32() {
        assert_eq!(push_timeout_micros(Duration::from_millis(40)).unwrap(), 40_000);
        assert!(push_timeout_micros(Duration::from_secs(3_600)).is_err());
    }

    #[test]
    fn bus_messages_map_to_events() {
        gst::init().expect("gstreamer init");

        let eos = gst::message::Eos::new();
        assert_eq!(bus_event(&eos), BusEvent::EndOfStream);

        let decoder = gst::Bin::with_name("decoder");
        let error = gst::message::Error::builder(gst::CoreError::Failed, "decoder went away")
            .src(&decoder)
            .build();
        match bus_event(&error) {
            BusEvent::Error { source, message } => {
                assert!(source.ends_with("decoder"), "source was {source}");
                assert_eq!(message, "decoder went away");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(bus_event(&error).requests_stop());

        let latency = gst::message::Latency::new();
        let event = bus_event(&latency);
        assert!(matches!(event, BusEvent::Other(_)));
        assert!(!event.requests_stop());
    }
}
