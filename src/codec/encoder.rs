//! H.264 encoding of BGR frames

use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, info_span, warn, Span};

use super::gst::{self as gsth, ElementRegistry, PullFailure};
use super::registry::DEFAULT_ENCODERS;
use crate::capture::Frame;
use crate::error::{EncodeError, OpenError};

/// Encoded access unit; timestamps are in encoder ticks of `1/fps`
#[derive(Debug, Clone, Default)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub key_frame: bool,
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub gop: u32,
    pub threads: u32,
    /// Named encoder element, tried before the defaults
    pub encoder: Option<String>,
}

impl EncoderSettings {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            bitrate_kbps: 2000,
            gop: 30,
            threads: 0,
            encoder: None,
        }
    }
}

/// Frame in, at most one packet out
pub trait FrameEncoder: Send {
    /// Encode the `index`th frame of the stream
    fn encode(&mut self, frame: &Frame, index: i64) -> Result<Option<EncodedPacket>, EncodeError>;

    /// Signal end of stream and collect everything still buffered
    fn finish(&mut self) -> Vec<EncodedPacket>;

    fn name(&self) -> &str;
}

const ENCODE_WAIT: Duration = Duration::from_millis(200);

/// Launch fragment for an encoder element with rate control applied where the properties are known
fn encoder_fragment(element: &str, settings: &EncoderSettings) -> String {
    match element {
        "x264enc" => format!(
            "x264enc tune=zerolatency speed-preset=ultrafast bframes=0 bitrate={} key-int-max={} threads={}",
            settings.bitrate_kbps, settings.gop, settings.threads
        ),
        "openh264enc" => format!(
            "openh264enc bitrate={} gop-size={}",
            settings.bitrate_kbps * 1000,
            settings.gop
        ),
        other => other.to_string(),
    }
}

/// Encoders in the order they are tried
fn encoder_candidates(settings: &EncoderSettings, registry: &dyn ElementRegistry) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    if let Some(named) = settings.encoder.as_deref().filter(|n| !n.is_empty()) {
        if registry.contains(named) {
            names.push(named.to_string());
        } else {
            warn!("Encoder '{}' is not available, using the default", named);
        }
    }
    for name in DEFAULT_ENCODERS {
        if registry.contains(name) && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Row stride GStreamer assumes for packed 24-bit video
fn aligned_stride(width: u32) -> usize {
    ((width as usize * 3) + 3) & !3
}

pub struct GstEncoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    settings: EncoderSettings,
    name: String,
    span: Span,
}

impl GstEncoder {
    /// Resolve the encoder: named first, then the default H.264 encoders
    pub fn open(
        settings: &EncoderSettings,
        registry: &dyn ElementRegistry,
        parent: &Span,
    ) -> Result<Self, OpenError> {
        let span = info_span!(parent: parent, "encoder");
        let _enter = span.enter();

        for element in encoder_candidates(settings, registry) {
            match Self::launch(&element, settings) {
                Ok((pipeline, appsrc, appsink)) => {
                    info!(
                        "Using encoder {} ({}x{} @ {} fps, {} kbit/s)",
                        element, settings.width, settings.height, settings.fps, settings.bitrate_kbps
                    );
                    drop(_enter);
                    return Ok(Self {
                        pipeline,
                        appsrc,
                        appsink,
                        settings: settings.clone(),
                        name: element,
                        span,
                    });
                }
                Err(e) => warn!("Encoder {} failed to initialise: {}", element, e),
            }
        }
        Err(OpenError::NoEncoder)
    }

    fn launch(
        element: &str,
        settings: &EncoderSettings,
    ) -> Result<(gst::Pipeline, gst_app::AppSrc, gst_app::AppSink), OpenError> {
        let pipeline = gsth::launch(&format!(
            "appsrc name=input format=time ! videoconvert ! video/x-raw,format=I420 ! {} ! \
             h264parse config-interval=-1 ! video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=packets sync=false",
            encoder_fragment(element, settings)
        ))?;

        let appsrc = gsth::app_src(&pipeline, "input")?;
        let caps = format!(
            "video/x-raw,format=BGR,width={},height={},framerate={}/1",
            settings.width, settings.height, settings.fps
        )
        .parse::<gst::Caps>()
        .map_err(|e| OpenError::Pipeline(e.to_string()))?;
        appsrc.set_caps(Some(&caps));
        let appsink = gsth::app_sink(&pipeline, "packets")?;

        if let Err(e) = gsth::change_state(&pipeline, gst::State::Playing, Duration::from_secs(2)) {
            gsth::shutdown(&pipeline);
            return Err(e);
        }
        Ok((pipeline, appsrc, appsink))
    }

    fn frame_buffer(&self, frame: &Frame) -> Result<gst::Buffer, EncodeError> {
        let (w, h) = (self.settings.width, self.settings.height);
        if frame.width() != w || frame.height() != h {
            return Err(EncodeError(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                w,
                h
            )));
        }

        let stride = aligned_stride(w);
        let packed = w as usize * 3;
        if stride == packed {
            return Ok(gst::Buffer::from_slice(frame.data.clone()));
        }
        let mut padded = vec![0u8; stride * h as usize];
        for (row, line) in frame.data.chunks_exact(packed).enumerate() {
            padded[row * stride..row * stride + packed].copy_from_slice(line);
        }
        Ok(gst::Buffer::from_mut_slice(padded))
    }

    fn packet_from_sample(&self, sample: &gst::Sample) -> Option<EncodedPacket> {
        let (data, buffer) = gsth::sample_bytes(sample)?;
        let fps = self.settings.fps as i64;
        let ticks = |ns: i64| (ns * fps + 500_000_000) / 1_000_000_000;
        let pts = gsth::to_ns(buffer.pts()).map(ticks).unwrap_or(-1);
        let dts = gsth::to_ns(buffer.dts()).map(ticks).unwrap_or(pts);
        Some(EncodedPacket {
            data,
            pts,
            dts,
            key_frame: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
        })
    }
}

impl FrameEncoder for GstEncoder {
    fn encode(&mut self, frame: &Frame, index: i64) -> Result<Option<EncodedPacket>, EncodeError> {
        let mut buffer = self.frame_buffer(frame)?;
        {
            let frame_ns = 1_000_000_000 / self.settings.fps as u64;
            let buf = buffer.make_mut();
            buf.set_pts(gst::ClockTime::from_nseconds(index.max(0) as u64 * frame_ns));
            buf.set_duration(gst::ClockTime::from_nseconds(frame_ns));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncodeError(format!("push failed: {:?}", e)))?;

        match self.appsink.try_pull_sample(gsth::clock_time(ENCODE_WAIT)) {
            Some(sample) => Ok(self.packet_from_sample(&sample)),
            None => match gsth::bus_error(&self.pipeline) {
                Some(msg) => Err(EncodeError(msg)),
                None => Ok(None),
            },
        }
    }

    fn finish(&mut self) -> Vec<EncodedPacket> {
        let _enter = self.span.enter();
        let mut packets = Vec::new();
        if self.appsrc.end_of_stream().is_err() {
            return packets;
        }
        loop {
            match gsth::pull_sample(&self.pipeline, &self.appsink, Duration::from_secs(2)) {
                Ok(sample) => packets.extend(self.packet_from_sample(&sample)),
                Err(PullFailure::Eos) => break,
                Err(PullFailure::Timeout) => {
                    warn!("Encoder did not drain within 2s");
                    break;
                }
                Err(PullFailure::Error(msg)) => {
                    warn!("Encoder error while draining: {}", msg);
                    break;
                }
            }
        }
        debug!("Encoder drained {} packets", packets.len());
        packets
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        gsth::shutdown(&self.pipeline);
    }
}
