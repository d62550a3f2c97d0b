//! Muxed outputs: RTSP (record), RTMP and local files

use std::path::Path;
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, info_span, warn, Span};

use super::timestamp::OUTPUT_CLOCK_RATE;
use crate::codec::gst::{self as gsth, BusEvent};
use crate::codec::EncodedPacket;
use crate::error::{OpenError, WriteError};

/// Destination for encoded packets stamped on the 90 kHz clock
pub trait PacketSink: Send {
    /// Establish the output; `None` waits as long as the output needs
    fn connect(&mut self, timeout: Option<Duration>) -> Result<(), OpenError>;

    fn write(&mut self, packet: &EncodedPacket) -> Result<(), WriteError>;

    /// Finalise and release the output. Idempotent.
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Rtsp,
    Rtmp,
    File(&'static str),
}

impl SinkKind {
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            return SinkKind::Rtsp;
        }
        if lower.starts_with("rtmp://") || lower.starts_with("rtmps://") {
            return SinkKind::Rtmp;
        }
        let ext = Path::new(&lower)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        // Container guessed from the extension; raw Annex B otherwise
        SinkKind::File(match ext.as_str() {
            "mp4" | "m4v" | "mov" => "mp4mux",
            "mkv" | "webm" => "matroskamux",
            "flv" => "flvmux",
            "ts" | "m2ts" => "mpegtsmux",
            "avi" => "avimux",
            _ => "identity",
        })
    }

    fn description(&self) -> String {
        const HEAD: &str = "appsrc name=input format=time ! h264parse";
        match self {
            SinkKind::Rtsp => format!("{} ! rtspclientsink name=sink protocols=tcp", HEAD),
            SinkKind::Rtmp => format!("{} ! flvmux streamable=true ! rtmpsink name=sink", HEAD),
            SinkKind::File(mux) => format!("{} ! {} ! filesink name=sink", HEAD, mux),
        }
    }

    fn readiness(&self, timeout: Option<Duration>) -> Readiness {
        match self {
            SinkKind::Rtsp => Readiness::Handshake(timeout),
            // rtmpsink and muxers only touch the destination once data flows
            _ => Readiness::Settle(timeout.map_or(CONNECT_SETTLE, |t| t.min(CONNECT_SETTLE))),
        }
    }
}

const CONNECT_SETTLE: Duration = Duration::from_millis(200);

/// What `connect` waits for before reporting the output as connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// The RTSP client connected and got an OPTIONS reply; `None` waits indefinitely
    Handshake(Option<Duration>),
    /// No handshake before data; only errors posted within this window fail the connect
    Settle(Duration),
}

#[derive(Debug, PartialEq, Eq)]
enum ConnectEvent {
    Ready,
    Failed(String),
}

fn connect_event(msg: &gst::MessageRef) -> Option<ConnectEvent> {
    match msg.view() {
        gst::MessageView::Error(err) => Some(ConnectEvent::Failed(err.error().to_string())),
        gst::MessageView::Progress(progress) => {
            let (kind, code, text) = progress.get();
            match kind {
                gst::ProgressType::Complete if code == "open" => Some(ConnectEvent::Ready),
                gst::ProgressType::Error | gst::ProgressType::Canceled => {
                    Some(ConnectEvent::Failed(format!("{}: {}", code, text)))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn to_clock(ticks: i64) -> gst::ClockTime {
    gst::ClockTime::from_nseconds((ticks.max(0) as u64) * 1_000_000_000 / OUTPUT_CLOCK_RATE as u64)
}

pub struct GstPacketSink {
    kind: SinkKind,
    url: String,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    caps: String,
    span: Span,
}

impl GstPacketSink {
    pub fn new(url: &str, width: u32, height: u32, fps: u32, parent: &Span) -> Self {
        Self {
            kind: SinkKind::from_url(url),
            url: url.to_string(),
            pipeline: None,
            appsrc: None,
            caps: format!(
                "video/x-h264,stream-format=byte-stream,alignment=au,width={},height={},framerate={}/1",
                width,
                height,
                fps.max(1)
            ),
            span: info_span!(parent: parent, "sink", url),
        }
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    fn await_ready(&self, pipeline: &gst::Pipeline, readiness: Readiness) -> Result<(), OpenError> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| OpenError::Pipeline("pipeline without bus".into()))?;
        let failed = |reason: String| OpenError::Connect {
            url: self.url.clone(),
            reason,
        };

        match readiness {
            Readiness::Settle(window) => {
                // Early failures (bad location, refused port) are posted right after start
                match bus
                    .timed_pop_filtered(gsth::clock_time(window), &[gst::MessageType::Error])
                    .as_deref()
                    .and_then(connect_event)
                {
                    Some(ConnectEvent::Failed(reason)) => Err(failed(reason)),
                    _ => Ok(()),
                }
            }
            Readiness::Handshake(timeout) => {
                let deadline = timeout.map(|t| Instant::now() + t);
                loop {
                    let wait = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                warn!("No answer from {} within {:?}", self.url, timeout);
                                return Err(OpenError::Timeout {
                                    url: self.url.clone(),
                                    after: timeout.unwrap_or_default(),
                                });
                            }
                            Some(gsth::clock_time(remaining))
                        }
                        None => None,
                    };

                    let msg = bus.timed_pop_filtered(
                        wait,
                        &[gst::MessageType::Error, gst::MessageType::Progress],
                    );
                    match msg.as_deref().and_then(connect_event) {
                        Some(ConnectEvent::Ready) => return Ok(()),
                        Some(ConnectEvent::Failed(reason)) => return Err(failed(reason)),
                        None => {}
                    }
                }
            }
        }
    }
}

impl PacketSink for GstPacketSink {
    /// RTSP outputs wait up to `timeout` for the server to answer. The session itself is
    /// announced once caps flow, so a refused ANNOUNCE surfaces on the first writes.
    fn connect(&mut self, timeout: Option<Duration>) -> Result<(), OpenError> {
        let _enter = self.span.enter();
        info!("Connecting {:?} output", self.kind);

        let pipeline = gsth::launch(&self.kind.description())?;
        pipeline
            .by_name("sink")
            .ok_or_else(|| OpenError::Pipeline("Failed to find sink element".into()))?
            .set_property("location", self.url.as_str());

        let appsrc = gsth::app_src(&pipeline, "input")?;
        let caps = self
            .caps
            .parse::<gst::Caps>()
            .map_err(|e| OpenError::Pipeline(e.to_string()))?;
        appsrc.set_caps(Some(&caps));

        if pipeline.set_state(gst::State::Playing).is_err() {
            let reason = gsth::bus_error(&pipeline).unwrap_or_else(|| "failed to start".into());
            gsth::shutdown(&pipeline);
            return Err(OpenError::Connect {
                url: self.url.clone(),
                reason,
            });
        }

        if let Err(e) = self.await_ready(&pipeline, self.kind.readiness(timeout)) {
            gsth::shutdown(&pipeline);
            return Err(e);
        }
        info!("Output ready");

        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        Ok(())
    }

    fn write(&mut self, packet: &EncodedPacket) -> Result<(), WriteError> {
        let (pipeline, appsrc) = match (&self.pipeline, &self.appsrc) {
            (Some(p), Some(a)) => (p, a),
            _ => return Err(WriteError("output is not connected".into())),
        };

        let mut buffer = gst::Buffer::from_slice(packet.data.clone());
        {
            let buf = buffer.make_mut();
            buf.set_pts(to_clock(packet.pts));
            buf.set_dts(to_clock(packet.dts));
            if !packet.key_frame {
                buf.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        appsrc
            .push_buffer(buffer)
            .map_err(|e| WriteError(format!("{:?}", e)))?;
        match gsth::poll_bus(pipeline) {
            Some(BusEvent::Error(msg)) => Err(WriteError(msg)),
            Some(BusEvent::Eos) => Err(WriteError("output reached end of stream".into())),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        let _enter = self.span.enter();

        if let Some(appsrc) = self.appsrc.take() {
            let _ = appsrc.end_of_stream();
            // Muxers write their index on EOS
            if let Some(bus) = pipeline.bus() {
                match bus.timed_pop_filtered(
                    gst::ClockTime::from_seconds(5),
                    &[gst::MessageType::Eos, gst::MessageType::Error],
                ) {
                    Some(msg) if matches!(msg.view(), gst::MessageView::Eos(..)) => {
                        debug!("Output finalised")
                    }
                    Some(_) => warn!("Output reported an error while finalising"),
                    None => warn!("Output did not finalise within 5s"),
                }
            }
        }
        gsth::shutdown(&pipeline);
        info!("Output closed");
    }
}

impl Drop for GstPacketSink {
    fn drop(&mut self) {
        self.close();
    }
}
