//! Uniform BGR capture over cameras, files and network streams

pub mod decode;
pub mod frame;
pub mod gst_capture;
pub mod stream_capture;
pub mod v4l2;

use serde::{Deserialize, Serialize};
use tracing::{info, Span};

pub use frame::{Frame, PixelFormat, Rect};
pub use gst_capture::GstCapture;
pub use stream_capture::StreamCapture;
pub use v4l2::V4l2Capture;

use crate::error::{OpenError, ReadError};
use crate::pipeline::DeliveryPolicy;
use crate::stream::source::SourceKind;
use crate::{PipelineConfig, SourceConfig};

/// Requested capture kind; stream URLs always become `Stream`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Normal,
    Jpeg,
    Yuyv,
    Stream,
}

/// Capture properties, numbered like the usual capture APIs plus two internal ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureProp {
    PosFrames,
    FrameWidth,
    FrameHeight,
    Fps,
    /// 0 = blocking, 1 = drop
    RecvMethod,
    /// Packets or frames consumed per read
    Step,
    Other(i32),
}

impl CaptureProp {
    pub fn from_id(id: i32) -> Self {
        match id {
            1 => CaptureProp::PosFrames,
            3 => CaptureProp::FrameWidth,
            4 => CaptureProp::FrameHeight,
            5 => CaptureProp::Fps,
            -100 => CaptureProp::RecvMethod,
            -200 => CaptureProp::Step,
            other => CaptureProp::Other(other),
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            CaptureProp::PosFrames => 1,
            CaptureProp::FrameWidth => 3,
            CaptureProp::FrameHeight => 4,
            CaptureProp::Fps => 5,
            CaptureProp::RecvMethod => -100,
            CaptureProp::Step => -200,
            CaptureProp::Other(id) => *id,
        }
    }
}

pub fn is_stream_url(url: &str) -> bool {
    matches!(SourceKind::from_url(url), SourceKind::Rtsp | SourceKind::Rtmp)
}

/// Device capture plus the frame step it honours
pub struct DeviceCapture<C> {
    inner: C,
    step: u32,
}

impl<C> DeviceCapture<C> {
    fn new(inner: C) -> Self {
        Self { inner, step: 1 }
    }
}

pub enum Capture {
    Normal(DeviceCapture<GstCapture>),
    Jpeg(DeviceCapture<V4l2Capture>),
    Yuyv(DeviceCapture<V4l2Capture>),
    Stream(StreamCapture),
}

impl Capture {
    /// Open `url` as `source_type`, or as a stream when the URL names one
    pub fn create(
        url: &str,
        source_type: SourceType,
        drop_frames: bool,
        decoder_hint: &str,
        config: &PipelineConfig,
        parent: &Span,
    ) -> Result<Self, OpenError> {
        let source = SourceConfig {
            url: url.to_string(),
            source_type,
            drop_frames,
            decoder: decoder_hint.to_string(),
            ..SourceConfig::default()
        };
        Self::from_config(&source, config, parent)
    }

    /// As `create`, with device size and rate taken from the source section
    pub fn from_config(
        source: &SourceConfig,
        config: &PipelineConfig,
        parent: &Span,
    ) -> Result<Self, OpenError> {
        let url = source.url.as_str();
        let source_type = if is_stream_url(url) {
            SourceType::Stream
        } else {
            source.source_type
        };
        info!("Creating {:?} capture for {}", source_type, url);

        let device = |format| {
            V4l2Capture::open(url, format, source.width, source.height, source.fps, parent)
                .map(DeviceCapture::new)
        };

        Ok(match source_type {
            SourceType::Normal => {
                Capture::Normal(DeviceCapture::new(GstCapture::open(url, config, parent)?))
            }
            SourceType::Jpeg => Capture::Jpeg(device(PixelFormat::Mjpeg)?),
            SourceType::Yuyv => Capture::Yuyv(device(PixelFormat::Yuyv4)?),
            SourceType::Stream => {
                let policy = if source.drop_frames {
                    DeliveryPolicy::Drop
                } else {
                    DeliveryPolicy::Blocking
                };
                let mut capture = StreamCapture::new(policy, &source.decoder, config, parent);
                capture.open(url)?;
                Capture::Stream(capture)
            }
        })
    }

    pub fn read(&mut self) -> Result<Frame, ReadError> {
        match self {
            Capture::Normal(c) => c.inner.read(c.step),
            Capture::Jpeg(c) | Capture::Yuyv(c) => c.inner.read(c.step),
            Capture::Stream(c) => c.read(),
        }
    }

    pub fn is_opened(&self) -> bool {
        match self {
            Capture::Normal(c) => c.inner.is_opened(),
            Capture::Jpeg(c) | Capture::Yuyv(c) => c.inner.is_opened(),
            Capture::Stream(c) => c.is_opened(),
        }
    }

    pub fn release(&mut self) {
        match self {
            Capture::Normal(c) => c.inner.release(),
            Capture::Jpeg(c) | Capture::Yuyv(c) => c.inner.release(),
            Capture::Stream(c) => c.release(),
        }
    }

    /// Property value, `-1.0` when unknown
    pub fn get(&self, prop: CaptureProp) -> f64 {
        match self {
            Capture::Normal(c) => match prop {
                CaptureProp::FrameWidth => c.inner.width() as f64,
                CaptureProp::FrameHeight => c.inner.height() as f64,
                CaptureProp::Fps => c.inner.fps(),
                CaptureProp::PosFrames => c.inner.position(),
                CaptureProp::Step => c.step as f64,
                _ => -1.0,
            },
            Capture::Jpeg(c) | Capture::Yuyv(c) => match prop {
                CaptureProp::FrameWidth => c.inner.width() as f64,
                CaptureProp::FrameHeight => c.inner.height() as f64,
                CaptureProp::Fps => c.inner.fps() as f64,
                CaptureProp::PosFrames => c.inner.frames_read() as f64,
                CaptureProp::Step => c.step as f64,
                _ => -1.0,
            },
            Capture::Stream(c) => c.get(prop),
        }
    }

    /// Set a property; unsupported ones are ignored
    pub fn set(&mut self, prop: CaptureProp, value: f64) {
        match (self, prop) {
            (Capture::Stream(c), prop) => c.set(prop, value),
            (Capture::Normal(c), CaptureProp::Step) => c.step = (value as u32).max(1),
            (Capture::Jpeg(c) | Capture::Yuyv(c), CaptureProp::Step) => {
                c.step = (value as u32).max(1)
            }
            _ => {}
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            Capture::Normal(_) => SourceType::Normal,
            Capture::Jpeg(_) => SourceType::Jpeg,
            Capture::Yuyv(_) => SourceType::Yuyv,
            Capture::Stream(_) => SourceType::Stream,
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.release();
    }
}
