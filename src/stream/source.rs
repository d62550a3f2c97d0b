//! GStreamer demux front-end for RTSP, RTMP and file inputs

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, info_span, warn, Span};

use super::{CompressedPacket, MediaParameters, PacketReader, VideoCodec};
use crate::codec::gst::{self as gsth, PullFailure};
use crate::error::{OpenError, PacketError};
use crate::PipelineConfig;

/// Elementary streams the appsink accepts; parsebin converts to these
const PACKET_CAPS: &str = "video/x-h264,stream-format=byte-stream,alignment=au; \
                           video/x-h265,stream-format=byte-stream,alignment=au; \
                           image/jpeg";

/// Input kind, decided by the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Rtsp,
    Rtmp,
    File,
    Uri,
}

impl SourceKind {
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if lower.starts_with("rtmp://") || lower.starts_with("rtmps://") {
            SourceKind::Rtmp
        } else if lower.contains("://") {
            SourceKind::Uri
        } else {
            SourceKind::File
        }
    }

    /// Launch description; the source element is named `src` and its location set afterwards
    fn description(&self) -> &'static str {
        match self {
            // TCP interleaved, 10 MiB receive buffer, 2 s socket timeout
            SourceKind::Rtsp => {
                "rtspsrc name=src protocols=tcp latency=100 udp-buffer-size=10485760 \
                 tcp-timeout=2000000 ! application/x-rtp,media=video ! parsebin ! \
                 appsink name=packets sync=false max-buffers=64"
            }
            SourceKind::Rtmp => {
                "rtmpsrc name=src timeout=2 ! flvdemux name=demux demux.video ! queue ! \
                 parsebin ! appsink name=packets sync=false max-buffers=64"
            }
            SourceKind::File => {
                "filesrc name=src ! parsebin ! appsink name=packets sync=false max-buffers=64"
            }
            SourceKind::Uri => {
                "urisourcebin name=src ! parsebin ! appsink name=packets sync=false max-buffers=64"
            }
        }
    }

    fn location_property(&self) -> &'static str {
        match self {
            SourceKind::Uri => "uri",
            _ => "location",
        }
    }
}

struct Session {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

/// Packet source backed by a `<source> ! parsebin ! appsink` pipeline
pub struct PacketSource {
    session: Option<Session>,
    /// Packet pulled while probing the stream at open, returned by the first read
    pending: Option<CompressedPacket>,
    current: CompressedPacket,
    url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    span: Span,
}

impl PacketSource {
    pub fn new(config: &PipelineConfig, parent: &Span) -> Self {
        Self {
            session: None,
            pending: None,
            current: CompressedPacket::default(),
            url: String::new(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            span: info_span!(parent: parent, "packet_source"),
        }
    }

    fn packet_from_sample(sample: &gst::Sample) -> Option<CompressedPacket> {
        let (data, buffer) = gsth::sample_bytes(sample)?;
        Some(CompressedPacket {
            data,
            pts: gsth::to_ns(buffer.pts()),
            dts: gsth::to_ns(buffer.dts()).or_else(|| gsth::to_ns(buffer.pts())),
            key_frame: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
        })
    }

    fn parameters(&self, sample: &gst::Sample) -> Result<MediaParameters, OpenError> {
        let no_video = || OpenError::NoVideoStream {
            url: self.url.clone(),
        };
        let s = sample
            .caps()
            .and_then(|caps| caps.structure(0))
            .ok_or_else(no_video)?;

        let codec = VideoCodec::from_media_type(s.name().as_str());
        if codec == VideoCodec::Unknown {
            return Err(no_video());
        }

        let (fps_num, fps_den) = s
            .get::<gst::Fraction>("framerate")
            .map(|f| (f.numer().max(0) as u32, f.denom().max(0) as u32))
            .unwrap_or((0, 1));

        Ok(MediaParameters {
            width: s.get::<i32>("width").unwrap_or(0).max(0) as u32,
            height: s.get::<i32>("height").unwrap_or(0).max(0) as u32,
            fps_num,
            fps_den,
            codec,
        })
    }

    fn next_packet(&mut self) -> Result<CompressedPacket, PacketError> {
        if let Some(packet) = self.pending.take() {
            return Ok(packet);
        }
        let session = self.session.as_ref().ok_or(PacketError::Closed)?;
        match gsth::pull_sample(&session.pipeline, &session.appsink, self.read_timeout) {
            Ok(sample) => Self::packet_from_sample(&sample)
                .ok_or_else(|| PacketError::Read("sample without buffer".into())),
            Err(PullFailure::Eos) => Err(PacketError::EndOfStream),
            Err(PullFailure::Timeout) => Err(PacketError::Read(format!(
                "no packet within {:?}",
                self.read_timeout
            ))),
            Err(PullFailure::Error(msg)) => Err(PacketError::Read(msg)),
        }
    }
}

impl PacketReader for PacketSource {
    fn open(&mut self, url: &str) -> Result<MediaParameters, OpenError> {
        self.close();
        let _enter = self.span.enter();
        self.url = url.to_string();

        let kind = SourceKind::from_url(url);
        info!("Opening {:?} source {}", kind, url);

        let pipeline = gsth::launch(kind.description())?;
        let src = pipeline
            .by_name("src")
            .ok_or_else(|| OpenError::Pipeline("Failed to find source element".into()))?;
        src.set_property(kind.location_property(), url);

        let appsink = gsth::app_sink(&pipeline, "packets")?;
        let caps = PACKET_CAPS
            .parse::<gst::Caps>()
            .map_err(|e| OpenError::Pipeline(e.to_string()))?;
        appsink.set_caps(Some(&caps));

        if pipeline.set_state(gst::State::Playing).is_err() {
            let reason = gsth::bus_error(&pipeline).unwrap_or_else(|| "failed to start".into());
            gsth::shutdown(&pipeline);
            return Err(OpenError::Connect {
                url: url.to_string(),
                reason,
            });
        }

        let sample = match gsth::pull_sample(&pipeline, &appsink, self.connect_timeout) {
            Ok(sample) => sample,
            Err(failure) => {
                gsth::shutdown(&pipeline);
                return Err(match failure {
                    PullFailure::Timeout => OpenError::Timeout {
                        url: url.to_string(),
                        after: self.connect_timeout,
                    },
                    PullFailure::Eos => OpenError::NoVideoStream {
                        url: url.to_string(),
                    },
                    PullFailure::Error(reason) if reason.contains("not-negotiated") => {
                        OpenError::NoVideoStream {
                            url: url.to_string(),
                        }
                    }
                    PullFailure::Error(reason) => OpenError::Connect {
                        url: url.to_string(),
                        reason,
                    },
                });
            }
        };

        let params = match self.parameters(&sample) {
            Ok(params) => params,
            Err(e) => {
                gsth::shutdown(&pipeline);
                return Err(e);
            }
        };
        info!(
            "Stream {}x{} @ {}/{} fps, codec {} (id {})",
            params.width,
            params.height,
            params.fps_num,
            params.fps_den,
            params.codec,
            params.codec_id()
        );

        self.pending = Self::packet_from_sample(&sample);
        self.session = Some(Session { pipeline, appsink });
        Ok(params)
    }

    fn read_packet(&mut self, step: u32) -> Result<&CompressedPacket, PacketError> {
        let span = self.span.clone();
        let _enter = span.enter();

        for _ in 0..step.max(1) {
            match self.next_packet() {
                Ok(packet) => {
                    metrics::counter!("vidrelay_packets_read_total").increment(1);
                    self.current = packet;
                }
                Err(e) => {
                    if e != PacketError::Closed {
                        warn!("Packet read from {} failed: {}", self.url, e);
                    }
                    return Err(e);
                }
            }
        }
        Ok(&self.current)
    }

    fn position(&self) -> i64 {
        self.current.dts.unwrap_or(0)
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _enter = self.span.enter();
            debug!("Closing source {}", self.url);
            gsth::shutdown(&session.pipeline);
        }
        self.pending = None;
    }
}

impl Drop for PacketSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_sniffing() {
        assert_eq!(SourceKind::from_url("rtsp://cam/stream"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_url("RTSP://cam/stream"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_url("rtmp://host/live"), SourceKind::Rtmp);
        assert_eq!(SourceKind::from_url("http://host/a.mp4"), SourceKind::Uri);
        assert_eq!(SourceKind::from_url("/data/a.mp4"), SourceKind::File);
    }

    #[test]
    fn uri_sources_use_the_uri_property() {
        assert_eq!(SourceKind::Uri.location_property(), "uri");
        assert_eq!(SourceKind::Rtsp.location_property(), "location");
        assert!(SourceKind::Rtsp.description().contains("protocols=tcp"));
    }

    #[test]
    fn read_before_open_is_closed() {
        let mut source = PacketSource::new(&PipelineConfig::default(), &Span::none());
        assert_eq!(source.read_packet(1).unwrap_err(), PacketError::Closed);
        assert_eq!(source.position(), 0);
    }
}
