use serde::{Deserialize, Serialize};

const DEFAULT_SOURCE_URL: &str = "stub://camera-0";
const DEFAULT_DECODER: &str = "nvv4l2decoder";
const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const DEFAULT_FPS: u32 = 25;

/// Lower transport used for RTSP sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTransport {
    Tcp,
    Udp,
}

impl SourceTransport {
    /// Value for the `protocols` property of `rtspsrc`.
    pub fn as_protocols(self) -> &'static str {
        match self {
            SourceTransport::Tcp => "tcp",
            SourceTransport::Udp => "udp",
        }
    }
}

/// Structured description of one upstream source.
///
/// The target channel is not carried here; the producer pool supplies it
/// when the source is started.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSpec {
    /// Source address, e.g. "rtsp://10.0.0.5:554/live/1" or "stub://lobby".
    pub url: String,
    pub transport: SourceTransport,
    /// Decoder element used by the GStreamer backend.
    pub decoder: String,
    pub width: u32,
    pub height: u32,
    /// Publish rate of synthetic sources.
    pub fps: u32,
}

impl SourceSpec {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// `stub://` sources are served by the synthetic factory.
    pub fn is_synthetic(&self) -> bool {
        self.url.starts_with("stub://")
    }
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            transport: SourceTransport::Tcp,
            decoder: DEFAULT_DECODER.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let spec: SourceSpec =
            serde_json::from_str(r#"{"url": "rtsp://cam-3/live", "transport": "udp"}"#)
                .expect("parse");
        assert_eq!(spec.url, "rtsp://cam-3/live");
        assert_eq!(spec.transport, SourceTransport::Udp);
        assert_eq!(spec.decoder, DEFAULT_DECODER);
        assert!(!spec.is_synthetic());
    }

    #[test]
    fn stub_urls_are_synthetic() {
        assert!(SourceSpec::from_url("stub://lobby").is_synthetic());
        assert_eq!(SourceTransport::Tcp.as_protocols(), "tcp");
    }
}
