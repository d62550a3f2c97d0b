//! GStreamer capture for anything `decodebin` understands: V4L2 devices, files and URIs

use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, info_span, Span};

use crate::capture::frame::Frame;
use crate::codec::gst::{self as gsth, PullFailure};
use crate::error::{OpenError, ReadError};
use crate::PipelineConfig;

/// Decoded-to-BGR capture pipeline
pub struct GstCapture {
    pipeline: Option<gst::Pipeline>,
    appsink: gst_app::AppSink,
    /// First sample, pulled at open to learn the format
    pending: Option<gst::Sample>,
    width: u32,
    height: u32,
    fps: f64,
    sequence: u64,
    read_timeout: Duration,
    span: Span,
}

impl GstCapture {
    pub fn open(url: &str, config: &PipelineConfig, parent: &Span) -> Result<Self, OpenError> {
        let span = info_span!(parent: parent, "gst_capture", url);
        let _enter = span.enter();
        info!("Initializing GStreamer capture pipeline");

        let (description, property) = Self::build_pipeline_string(url);
        let pipeline = gsth::launch(description)?;
        pipeline
            .by_name("src")
            .ok_or_else(|| OpenError::Pipeline("Failed to find source element".into()))?
            .set_property(property, url);

        let appsink = gsth::app_sink(&pipeline, "appsink")?;
        // Drop old buffers if the reader can't keep up
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| OpenError::Connect {
                url: url.to_string(),
                reason: format!("Failed to start pipeline: {:?}", e),
            })?;

        let sample = match gsth::pull_sample(&pipeline, &appsink, config.connect_timeout()) {
            Ok(sample) => sample,
            Err(failure) => {
                gsth::shutdown(&pipeline);
                return Err(match failure {
                    PullFailure::Timeout => OpenError::Timeout {
                        url: url.to_string(),
                        after: config.connect_timeout(),
                    },
                    PullFailure::Eos => OpenError::NoVideoStream {
                        url: url.to_string(),
                    },
                    PullFailure::Error(reason) => OpenError::Connect {
                        url: url.to_string(),
                        reason,
                    },
                });
            }
        };

        let s = sample.caps().and_then(|caps| caps.structure(0));
        let width = s.and_then(|s| s.get::<i32>("width").ok()).unwrap_or(0).max(0) as u32;
        let height = s.and_then(|s| s.get::<i32>("height").ok()).unwrap_or(0).max(0) as u32;
        let fps = s
            .and_then(|s| s.get::<gst::Fraction>("framerate").ok())
            .filter(|f| f.denom() > 0)
            .map(|f| f.numer() as f64 / f.denom() as f64)
            .unwrap_or(0.0);
        info!("Pipeline started: {}x{} @ {:.2} fps", width, height, fps);

        drop(_enter);
        Ok(Self {
            pipeline: Some(pipeline),
            appsink,
            pending: Some(sample),
            width,
            height,
            fps,
            sequence: 0,
            read_timeout: config.read_timeout(),
            span,
        })
    }

    /// Pipeline description and the property the URL goes into
    fn build_pipeline_string(url: &str) -> (&'static str, &'static str) {
        if url.starts_with("/dev/video") {
            (
                concat!(
                    "v4l2src name=src ! queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! ",
                    "decodebin ! videoconvert ! video/x-raw,format=BGR ! appsink name=appsink"
                ),
                "device",
            )
        } else if url.contains("://") {
            (
                "uridecodebin name=src ! videoconvert ! video/x-raw,format=BGR ! appsink name=appsink",
                "uri",
            )
        } else {
            (
                "filesrc name=src ! decodebin ! videoconvert ! video/x-raw,format=BGR ! appsink name=appsink",
                "location",
            )
        }
    }

    /// Pull `max(step, 1)` samples and convert the last
    pub fn read(&mut self, step: u32) -> Result<Frame, ReadError> {
        let _enter = self.span.enter();
        let timestamp = Instant::now();
        let pipeline = self.pipeline.as_ref().ok_or(ReadError::Closed)?;

        let mut sample = None;
        for _ in 0..step.max(1) {
            sample = Some(match self.pending.take() {
                Some(s) => s,
                None => match gsth::pull_sample(pipeline, &self.appsink, self.read_timeout) {
                    Ok(s) => s,
                    Err(PullFailure::Timeout) => return Err(ReadError::Transient),
                    Err(PullFailure::Eos) => {
                        return Err(ReadError::Persistent("end of stream".into()))
                    }
                    Err(PullFailure::Error(msg)) => return Err(ReadError::Persistent(msg)),
                },
            });
        }
        let sample = sample.ok_or(ReadError::Transient)?;

        self.sequence += 1;
        let mut frame = gsth::sample_to_bgr(&sample, self.sequence).map_err(|e| {
            debug!("Dropping unconvertible sample: {}", e);
            ReadError::Transient
        })?;
        frame.timestamp = timestamp;
        Ok(frame)
    }

    pub fn is_opened(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _enter = self.span.enter();
            info!("Stopping GStreamer pipeline");
            gsth::shutdown(&pipeline);
        }
        self.pending = None;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Playback position in milliseconds
    pub fn position(&self) -> f64 {
        self.pipeline
            .as_ref()
            .and_then(|p| p.query_position::<gst::ClockTime>())
            .map(|p| p.mseconds() as f64)
            .unwrap_or(-1.0)
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        self.release();
    }
}
