//! rotord - source rotation daemon
//!
//! This daemon:
//! 1. Loads rotation settings (config file + ROTOR_* environment)
//! 2. Builds the data plane: memory bus + synthetic producers for `stub://`
//!    sources, or GStreamer interpipe pipelines for RTSP sources
//! 3. Runs the rotation scheduler until Ctrl-C or a fatal pipeline event
//! 4. Tears down every producer and slot before exiting

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use feed_rotor::bus::DEFAULT_PORT_DEPTH;
use feed_rotor::{
    BatchAggregator, Heartbeat, MemoryBus, RotationReport, RotationResult, RotationScheduler,
    RotorConfig, StopSignal, SyntheticFactory,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "ROTOR_CONFIG")]
    config: Option<PathBuf>,
    /// Stop rotating after this many cycles (keeps running until Ctrl-C).
    #[arg(long)]
    max_cycles: Option<u64>,
    /// Override the number of slots / producers per generation.
    #[arg(long)]
    batch_size: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = RotorConfig::load_from(args.config.as_deref())?;
    if let Some(max_cycles) = args.max_cycles {
        cfg.rotation.max_cycles = Some(max_cycles);
    }
    if let Some(batch_size) = args.batch_size {
        if batch_size == 0 {
            return Err(anyhow!("--batch-size must be >= 1"));
        }
        cfg.rotation.batch_size = batch_size;
    }

    log::info!(
        "rotord starting: batch_size={} batch_timeout={:?} drain_multiplier={} sources={}",
        cfg.rotation.batch_size,
        cfg.rotation.batch_timeout,
        cfg.rotation.drain_multiplier,
        cfg.rotation.sources.len()
    );

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        handler_stop.stop();
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    if cfg.all_synthetic() {
        run_synthetic(cfg, stop)
    } else {
        run_interpipe(cfg, stop)
    }
}

fn run_synthetic(cfg: RotorConfig, stop: StopSignal) -> Result<()> {
    let heartbeat = Heartbeat::new();
    let (bus, inputs) = MemoryBus::new(cfg.rotation.batch_size, DEFAULT_PORT_DEPTH);
    let aggregator = BatchAggregator::spawn(
        inputs,
        cfg.rotation.batch_timeout,
        heartbeat.clone(),
        |batch| {
            log::debug!(
                "batch {}: {} frames{}",
                batch.id,
                batch.filled(),
                if batch.timed_out { " (timeout)" } else { "" }
            );
        },
    )?;
    let stats = aggregator.stats();

    let mut scheduler = RotationScheduler::new(
        cfg.rotation,
        SyntheticFactory::new(bus.clone()),
        bus,
        heartbeat,
        stop,
    );
    let outcome = scheduler.run();
    aggregator.stop()?;
    log::info!(
        "aggregator: {} batches, {} frames, {} timeouts",
        stats.batches(),
        stats.frames(),
        stats.timeouts()
    );

    finish(outcome)
}

#[cfg(feature = "interpipe-gstreamer")]
fn run_interpipe(cfg: RotorConfig, stop: StopSignal) -> Result<()> {
    use feed_rotor::ingest::{InferencePipeline, InterpipeFactory};
    use feed_rotor::BusEvent;
    use std::time::Duration;

    let heartbeat = Heartbeat::new();
    let pipeline = InferencePipeline::build(
        &cfg.inference,
        cfg.rotation.batch_size,
        cfg.rotation.batch_timeout,
        heartbeat.clone(),
    )?;
    let transport = pipeline.transport();
    let factory = InterpipeFactory::new()?;
    pipeline.play()?;

    let mut scheduler =
        RotationScheduler::new(cfg.rotation, factory, transport, heartbeat, stop.clone());

    let watcher_stop = stop.clone();
    let outcome = std::thread::scope(|scope| {
        scope.spawn(|| {
            while !watcher_stop.wait_timeout(Duration::from_millis(100)) {
                for event in pipeline.poll_events() {
                    match &event {
                        BusEvent::Error { source, message } => {
                            log::error!("ERROR from element {}: {}", source, message);
                        }
                        BusEvent::EndOfStream => log::info!("end of stream"),
                        BusEvent::Other(_) => {}
                    }
                    if event.requests_stop() {
                        watcher_stop.stop();
                    }
                }
            }
        });
        let outcome = scheduler.run();
        stop.stop();
        outcome
    });
    pipeline.shutdown()?;

    finish(outcome)
}

#[cfg(not(feature = "interpipe-gstreamer"))]
fn run_interpipe(_cfg: RotorConfig, _stop: StopSignal) -> Result<()> {
    Err(anyhow!("non-stub sources require the interpipe-gstreamer feature"))
}

fn finish(outcome: RotationResult<RotationReport>) -> Result<()> {
    match outcome {
        Ok(report) => {
            log::info!(
                "rotord stopped after {} cycles (last generation {})",
                report.cycles,
                report.final_generation
            );
            Ok(())
        }
        Err(err) if err.is_fatal() => {
            log::error!("rotation aborted, all producers and slots torn down: {}", err);
            Err(err.into())
        }
        Err(err) => Err(anyhow!("rotation failed: {}", err)),
    }
}
