use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::DEFAULT_CHANNEL_PREFIX;
use crate::drain::DEFAULT_DRAIN_MULTIPLIER;
use crate::ingest::SourceSpec;
use crate::scheduler::RotationSettings;

const DEFAULT_BATCH_SIZE: usize = 4;
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 40;
const DEFAULT_CYCLE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 3_000;
const DEFAULT_MUX_WIDTH: u32 = 1920;
const DEFAULT_MUX_HEIGHT: u32 = 1080;
const DEFAULT_INFER_CONFIG: &str = "dstest1_pgie_config.txt";

#[derive(Debug, Deserialize, Default)]
struct RotorConfigFile {
    batch_size: Option<usize>,
    channel_prefix: Option<String>,
    rotation: Option<RotationConfigFile>,
    sources: Option<Vec<SourceSpec>>,
    inference: Option<InferenceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RotationConfigFile {
    batch_timeout_ms: Option<u64>,
    drain_multiplier: Option<u32>,
    drain_deadline_ms: Option<u64>,
    cycle_interval_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
    max_cycles: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RotorConfig {
    pub rotation: RotationSettings,
    pub inference: InferenceSettings,
}

/// Settings of the batching/inference stage (GStreamer backend only).
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub width: u32,
    pub height: u32,
    pub infer_config_path: PathBuf,
}

impl RotorConfig {
    /// File named by `ROTOR_CONFIG` (if any), then `ROTOR_*` overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROTOR_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// True when every source is served by the synthetic factory.
    pub fn all_synthetic(&self) -> bool {
        self.rotation.sources.iter().all(SourceSpec::is_synthetic)
    }

    fn from_file(file: RotorConfigFile) -> Self {
        let rotation_file = file.rotation.unwrap_or_default();
        let rotation = RotationSettings {
            batch_size: file.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            channel_prefix: file
                .channel_prefix
                .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIX.to_string()),
            batch_timeout: Duration::from_millis(
                rotation_file
                    .batch_timeout_ms
                    .unwrap_or(DEFAULT_BATCH_TIMEOUT_MS),
            ),
            drain_multiplier: rotation_file
                .drain_multiplier
                .unwrap_or(DEFAULT_DRAIN_MULTIPLIER),
            drain_deadline: rotation_file.drain_deadline_ms.map(Duration::from_millis),
            cycle_interval: Duration::from_millis(
                rotation_file
                    .cycle_interval_ms
                    .unwrap_or(DEFAULT_CYCLE_INTERVAL_MS),
            ),
            settle_delay: Duration::from_millis(
                rotation_file
                    .settle_delay_ms
                    .unwrap_or(DEFAULT_SETTLE_DELAY_MS),
            ),
            max_cycles: rotation_file.max_cycles,
            sources: file
                .sources
                .unwrap_or_else(|| vec![SourceSpec::default()]),
        };
        let inference = InferenceSettings {
            width: file
                .inference
                .as_ref()
                .and_then(|inference| inference.width)
                .unwrap_or(DEFAULT_MUX_WIDTH),
            height: file
                .inference
                .as_ref()
                .and_then(|inference| inference.height)
                .unwrap_or(DEFAULT_MUX_HEIGHT),
            infer_config_path: file
                .inference
                .and_then(|inference| inference.config_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INFER_CONFIG)),
        };
        Self {
            rotation,
            inference,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(batch_size) = env_number::<usize>("ROTOR_BATCH_SIZE")? {
            self.rotation.batch_size = batch_size;
        }
        if let Some(ms) = env_number::<u64>("ROTOR_BATCH_TIMEOUT_MS")? {
            self.rotation.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(multiplier) = env_number::<u32>("ROTOR_DRAIN_MULTIPLIER")? {
            self.rotation.drain_multiplier = multiplier;
        }
        if let Some(ms) = env_number::<u64>("ROTOR_DRAIN_DEADLINE_MS")? {
            self.rotation.drain_deadline = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_number::<u64>("ROTOR_CYCLE_INTERVAL_MS")? {
            self.rotation.cycle_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("ROTOR_SETTLE_DELAY_MS")? {
            self.rotation.settle_delay = Duration::from_millis(ms);
        }
        if let Some(cycles) = env_number::<u64>("ROTOR_MAX_CYCLES")? {
            self.rotation.max_cycles = Some(cycles);
        }
        if let Ok(prefix) = std::env::var("ROTOR_CHANNEL_PREFIX") {
            if !prefix.trim().is_empty() {
                self.rotation.channel_prefix = prefix.trim().to_string();
            }
        }
        if let Ok(sources) = std::env::var("ROTOR_SOURCES") {
            let urls = split_csv(&sources);
            if !urls.is_empty() {
                self.rotation.sources = urls.into_iter().map(SourceSpec::from_url).collect();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let rotation = &self.rotation;
        if rotation.batch_size == 0 {
            return Err(anyhow!("batch_size must be greater than zero"));
        }
        if rotation.batch_timeout.is_zero() {
            return Err(anyhow!("batch_timeout_ms must be greater than zero"));
        }
        if rotation.drain_multiplier == 0 {
            return Err(anyhow!("drain_multiplier must be greater than zero"));
        }
        if let Some(deadline) = rotation.drain_deadline {
            let threshold = rotation.batch_timeout * rotation.drain_multiplier;
            if deadline < threshold {
                return Err(anyhow!(
                    "drain_deadline_ms ({:?}) is shorter than the drain threshold ({:?})",
                    deadline,
                    threshold
                ));
            }
        }
        if rotation.channel_prefix.is_empty()
            || rotation.channel_prefix.chars().any(char::is_whitespace)
        {
            return Err(anyhow!(
                "channel_prefix '{}' must be non-empty without whitespace",
                rotation.channel_prefix
            ));
        }
        if rotation.sources.is_empty() {
            return Err(anyhow!("at least one source must be configured"));
        }
        for source in &rotation.sources {
            if source.url.trim().is_empty() {
                return Err(anyhow!("source url must not be empty"));
            }
            if source.is_synthetic() && source.fps == 0 {
                return Err(anyhow!("synthetic source {} needs fps > 0", source.url));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RotorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let cfg: RotorConfigFile = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_number<N: std::str::FromStr>(key: &str) -> Result<Option<N>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
