//! Thin helpers around GStreamer pipelines shared by sources, decoders, encoders and sinks

use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use gstreamer_video::prelude::*;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::capture::decode::{self, Plane};
use crate::capture::Frame;
use crate::error::OpenError;

static GST_INIT: OnceCell<Result<(), String>> = OnceCell::new();

/// Initialize GStreamer once per process
pub fn init() -> Result<(), OpenError> {
    GST_INIT
        .get_or_init(|| gst::init().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| OpenError::Pipeline(format!("Failed to initialize GStreamer: {}", e)))
}

/// Parse a launch description into a pipeline
pub fn launch(description: &str) -> Result<gst::Pipeline, OpenError> {
    init()?;
    debug!("Pipeline: {}", description);
    gst::parse::launch(description)
        .map_err(|e| OpenError::Pipeline(format!("{}: {}", description, e)))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| OpenError::Pipeline("Failed to create pipeline".into()))
}

pub fn app_sink(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSink, OpenError> {
    pipeline
        .by_name(name)
        .ok_or_else(|| OpenError::Pipeline(format!("Failed to find {} element", name)))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| OpenError::Pipeline(format!("{} is not an AppSink", name)))
}

pub fn app_src(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSrc, OpenError> {
    pipeline
        .by_name(name)
        .ok_or_else(|| OpenError::Pipeline(format!("Failed to find {} element", name)))?
        .downcast::<gst_app::AppSrc>()
        .map_err(|_| OpenError::Pipeline(format!("{} is not an AppSrc", name)))
}

pub fn clock_time(d: Duration) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(d.as_nanos() as u64)
}

/// Move the pipeline to `state` and wait for the transition to settle.
///
/// Live pipelines report `NoPreroll` on the way to Paused, which counts as success.
pub fn change_state(
    pipeline: &gst::Pipeline,
    state: gst::State,
    timeout: Duration,
) -> Result<(), OpenError> {
    pipeline
        .set_state(state)
        .map_err(|e| OpenError::Pipeline(format!("Failed to reach {:?}: {:?}", state, e)))?;

    let (result, current, _) = pipeline.state(Some(clock_time(timeout)));
    match result {
        Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => Ok(()),
        Ok(gst::StateChangeSuccess::Async) => {
            debug!("Pipeline still changing state ({:?} -> {:?})", current, state);
            Ok(())
        }
        Err(_) => Err(OpenError::Pipeline(
            bus_error(pipeline).unwrap_or_else(|| format!("Failed to reach {:?}", state)),
        )),
    }
}

/// Stop the pipeline, ignoring errors
pub fn shutdown(pipeline: &gst::Pipeline) {
    let _ = pipeline.set_state(gst::State::Null);
}

pub enum BusEvent {
    Error(String),
    Eos,
}

/// Pop a pending error or EOS message without blocking
pub fn poll_bus(pipeline: &gst::Pipeline) -> Option<BusEvent> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(BusEvent::Error(format!(
            "{} ({})",
            err.error(),
            err.debug().map(|d| d.to_string()).unwrap_or_default()
        ))),
        gst::MessageView::Eos(..) => Some(BusEvent::Eos),
        _ => None,
    }
}

pub fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    match poll_bus(pipeline)? {
        BusEvent::Error(msg) => Some(msg),
        BusEvent::Eos => None,
    }
}

pub enum PullFailure {
    Timeout,
    Eos,
    Error(String),
}

/// Pull the next sample, checking the bus between short waits so errors surface early
pub fn pull_sample(
    pipeline: &gst::Pipeline,
    sink: &gst_app::AppSink,
    timeout: Duration,
) -> Result<gst::Sample, PullFailure> {
    const SLICE: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Some(sample) = sink.try_pull_sample(clock_time(remaining.min(SLICE))) {
            return Ok(sample);
        }
        if sink.is_eos() {
            return Err(PullFailure::Eos);
        }
        match poll_bus(pipeline) {
            Some(BusEvent::Error(msg)) => return Err(PullFailure::Error(msg)),
            Some(BusEvent::Eos) => return Err(PullFailure::Eos),
            None => {}
        }
        if remaining.is_zero() {
            return Err(PullFailure::Timeout);
        }
    }
}

/// Copy a sample's buffer out into owned bytes
pub fn sample_bytes(sample: &gst::Sample) -> Option<(Bytes, &gst::BufferRef)> {
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    Some((Bytes::copy_from_slice(map.as_slice()), buffer))
}

pub fn to_ns(t: Option<gst::ClockTime>) -> Option<i64> {
    t.map(|t| t.nseconds() as i64)
}

/// Raw formats the BGR conversion understands
pub const RAW_CAPS: &str = "video/x-raw,format=(string){ I420, NV12, BGR, BGRx, BGRA }";

/// Convert a raw video sample to a packed BGR frame, choosing the routine by format tag
pub fn sample_to_bgr(sample: &gst::Sample, sequence: u64) -> Result<Frame, String> {
    let caps = sample.caps().ok_or("Sample has no caps")?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|_| "Failed to parse video info from caps".to_string())?;
    let buffer = sample.buffer().ok_or("Sample contains no buffer")?;
    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
        .map_err(|_| "Failed to map video frame".to_string())?;

    let (w, h) = (info.width(), info.height());
    let bgr = match info.format() {
        gst_video::VideoFormat::I420 => decode::i420_to_bgr(
            plane(&frame, 0)?,
            plane(&frame, 1)?,
            plane(&frame, 2)?,
            w,
            h,
        ),
        gst_video::VideoFormat::Nv12 => {
            decode::nv12_to_bgr(plane(&frame, 0)?, plane(&frame, 1)?, w, h)
        }
        gst_video::VideoFormat::Bgrx | gst_video::VideoFormat::Bgra => {
            decode::bgrx_to_bgr(plane(&frame, 0)?, w, h)
        }
        gst_video::VideoFormat::Bgr => decode::bgr_packed(plane(&frame, 0)?, w, h),
        other => return Err(format!("unsupported format: {:?}", other)),
    };

    let pts = buffer.pts().map(Duration::from);
    Ok(Frame::bgr(Bytes::from(bgr), w, h, sequence).with_device_timestamp(pts))
}

fn plane<'a>(
    frame: &'a gst_video::VideoFrameRef<&gst::BufferRef>,
    index: u32,
) -> Result<Plane<'a>, String> {
    let data = frame
        .plane_data(index)
        .map_err(|_| format!("Failed to map plane {}", index))?;
    Ok(Plane::new(data, frame.plane_stride()[index as usize] as usize))
}

/// Lookup of element factories available on this platform
pub trait ElementRegistry: Send + Sync {
    fn contains(&self, name: &str) -> bool;
}

/// The GStreamer plugin registry
#[derive(Debug, Default, Clone, Copy)]
pub struct GstRegistry;

impl ElementRegistry for GstRegistry {
    fn contains(&self, name: &str) -> bool {
        init().is_ok() && gst::ElementFactory::find(name).is_some()
    }
}
