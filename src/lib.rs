pub mod capture;
pub mod codec;
#[cfg(feature = "preview")]
pub mod display;
pub mod error;
pub mod pipeline;
pub mod publish;
pub mod server;
pub mod stream;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Capture, CaptureProp, Frame, SourceType};
pub use error::{DecodeError, OpenError, PacketError, PublishError, ReadError};
pub use publish::{OutboundPublisher, VideoWriter};
pub use server::VideoServer;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub publisher: PublisherConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Device path, file path or stream URL
    pub url: String,
    pub source_type: SourceType,
    pub drop_frames: bool,
    /// `"auto"` or a decoder element name
    pub decoder: String,
    /// Requested size and rate for device capture
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Reopen attempts after a lost source; negative means unlimited
    pub reopen_times: i32,
    pub reopen_delay_ms: u64,
    pub roi: Option<capture::frame::Rect>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub url: String,
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub gop: u32,
    pub threads: u32,
    pub encoder: Option<String>,
    pub queue_capacity: usize,
    /// `None` waits for the connection forever
    pub connect_timeout_ms: Option<u64>,
    pub max_write_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub decode_wait_ms: u64,
    pub drop_poll_ms: u64,
    /// Extra attempts granted to the first read after open
    pub warmup_retries: u32,
    pub read_retries: u32,
    /// Consecutive failed reads tolerated before the source counts as lost
    pub max_failed_reads: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "/dev/video0".into(),
            source_type: SourceType::Normal,
            drop_frames: false,
            decoder: "auto".into(),
            width: 1280,
            height: 720,
            fps: 30,
            reopen_times: -1,
            reopen_delay_ms: 1000,
            roi: None,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            bitrate_kbps: 2000,
            fps: 25,
            gop: 30,
            threads: 0,
            encoder: None,
            queue_capacity: 256,
            connect_timeout_ms: Some(10_000),
            max_write_retries: 5,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            decode_wait_ms: 40,
            drop_poll_ms: 1,
            warmup_retries: 100,
            read_retries: 3,
            max_failed_reads: 25,
        }
    }
}

impl SourceConfig {
    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }
}

impl PublisherConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

impl PipelineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn decode_wait(&self) -> Duration {
        Duration::from_millis(self.decode_wait_ms)
    }

    pub fn drop_poll(&self) -> Duration {
        Duration::from_millis(self.drop_poll_ms)
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by `VIDRELAY__SECTION__KEY` variables
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("VIDRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
