//! Decoder backend with hardware to software fallback
//!
//! `DecoderBackend` walks the candidate plan from [`registry::plan`](super::registry::plan) and
//! keeps the first session that initialises and decodes. Each instance owns exactly one native
//! session at a time.

use std::collections::VecDeque;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, info_span, warn, Span};

use super::gst::{self as gsth, ElementRegistry, GstRegistry};
use super::registry::{self, DecoderVariant};
use crate::capture::Frame;
use crate::error::{DecodeError, OpenError};
use crate::stream::{CompressedPacket, MediaParameters};
use crate::PipelineConfig;

/// Packet in, at most one BGR frame out
pub trait FrameDecoder: Send {
    fn open(&mut self, params: &MediaParameters) -> Result<(), OpenError>;

    /// Decode one packet. With `read_all`, frames buffered behind the first one are discarded.
    fn decode(&mut self, packet: &CompressedPacket, read_all: bool) -> Result<Frame, DecodeError>;

    fn close(&mut self);

    fn name(&self) -> &str;
}

/// One initialised native decode session
pub trait DecodeSession: Send {
    fn decode(&mut self, packet: &CompressedPacket, read_all: bool) -> Result<Frame, DecodeError>;
    fn close(&mut self);
}

/// Creates a session for a decoder candidate; failing here moves on to the next candidate
pub trait SessionLauncher: Send + Sync {
    fn launch(
        &self,
        variant: &DecoderVariant,
        params: &MediaParameters,
    ) -> Result<Box<dyn DecodeSession>, OpenError>;
}

pub struct DecoderBackend {
    hint: String,
    registry: Box<dyn ElementRegistry>,
    launcher: Box<dyn SessionLauncher>,
    session: Option<Box<dyn DecodeSession>>,
    variant: Option<DecoderVariant>,
    /// Candidates not yet tried, kept until the session yields its first frame
    remaining: VecDeque<DecoderVariant>,
    params: Option<MediaParameters>,
    produced: bool,
    name: String,
    span: Span,
}

impl DecoderBackend {
    /// GStreamer-backed decoder; `hint` is `"auto"` or an element name
    pub fn new(hint: &str, config: &PipelineConfig, parent: &Span) -> Self {
        Self::with_parts(
            hint,
            Box::new(GstRegistry),
            Box::new(GstSessionLauncher::new(config.decode_wait())),
            parent,
        )
    }

    pub fn with_parts(
        hint: &str,
        registry: Box<dyn ElementRegistry>,
        launcher: Box<dyn SessionLauncher>,
        parent: &Span,
    ) -> Self {
        Self {
            hint: hint.to_string(),
            registry,
            launcher,
            session: None,
            variant: None,
            remaining: VecDeque::new(),
            params: None,
            produced: false,
            name: String::new(),
            span: info_span!(parent: parent, "decoder"),
        }
    }

    /// The variant that won selection, once open
    pub fn variant(&self) -> Option<&DecoderVariant> {
        self.variant.as_ref()
    }

    /// Launch the next remaining candidate that initialises
    fn launch_next(&mut self, params: &MediaParameters) -> bool {
        while let Some(variant) = self.remaining.pop_front() {
            match self.launcher.launch(&variant, params) {
                Ok(session) => {
                    info!("Using decoder {}", variant);
                    if variant.is_hardware() {
                        metrics::counter!("vidrelay_decoder_hardware_total").increment(1);
                    } else {
                        metrics::counter!("vidrelay_decoder_software_total").increment(1);
                    }
                    self.name = variant.element().to_string();
                    self.session = Some(session);
                    self.variant = Some(variant);
                    self.produced = false;
                    return true;
                }
                Err(e) => {
                    warn!("Decoder {} failed to initialise: {}", variant, e);
                    metrics::counter!("vidrelay_decoder_fallbacks_total").increment(1);
                }
            }
        }
        false
    }

    fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("Closing decoder {}", self.name);
            session.close();
        }
        self.variant = None;
    }
}

impl FrameDecoder for DecoderBackend {
    fn open(&mut self, params: &MediaParameters) -> Result<(), OpenError> {
        self.close();
        let span = self.span.clone();
        let _enter = span.enter();

        self.remaining = registry::plan(params.codec, &self.hint, self.registry.as_ref()).into();
        self.params = Some(*params);
        if self.launch_next(params) {
            return Ok(());
        }

        self.params = None;
        Err(OpenError::NoDecoder {
            codec: params.codec.to_string(),
        })
    }

    fn decode(&mut self, packet: &CompressedPacket, read_all: bool) -> Result<Frame, DecodeError> {
        loop {
            let session = self
                .session
                .as_mut()
                .ok_or_else(|| DecodeError::Corrupt("decoder is not open".into()))?;

            match session.decode(packet, read_all) {
                Ok(frame) => {
                    if !self.produced {
                        // Selection is final once a frame came out
                        self.produced = true;
                        self.remaining.clear();
                    }
                    return Ok(frame);
                }
                // Caps negotiation only happens once data flows, so a candidate
                // that fails before its first frame is replaced by the next one
                Err(DecodeError::Corrupt(msg)) if !self.produced && !self.remaining.is_empty() => {
                    let span = self.span.clone();
                    let _enter = span.enter();
                    warn!("Decoder {} failed on first data: {}", self.name, msg);
                    metrics::counter!("vidrelay_decoder_fallbacks_total").increment(1);
                    self.drop_session();

                    let Some(params) = self.params else {
                        return Err(DecodeError::Corrupt(msg));
                    };
                    if !self.launch_next(&params) {
                        return Err(DecodeError::Corrupt(msg));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.drop_session();
        self.remaining.clear();
        self.params = None;
        self.produced = false;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DecoderBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Launches `appsrc ! <decoder> ! videoconvert ! appsink` sessions
pub struct GstSessionLauncher {
    wait: Duration,
}

impl GstSessionLauncher {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }
}

impl SessionLauncher for GstSessionLauncher {
    fn launch(
        &self,
        variant: &DecoderVariant,
        params: &MediaParameters,
    ) -> Result<Box<dyn DecodeSession>, OpenError> {
        let input_caps = params.codec.caps().ok_or_else(|| OpenError::NoDecoder {
            codec: params.codec.to_string(),
        })?;

        let pipeline = gsth::launch(&format!(
            "appsrc name=input format=time ! {} ! videoconvert ! \
             appsink name=frames sync=false max-buffers=8 drop=true",
            variant.element()
        ))?;

        let appsrc = gsth::app_src(&pipeline, "input")?;
        let caps = input_caps
            .parse::<gst::Caps>()
            .map_err(|e| OpenError::Pipeline(e.to_string()))?;
        appsrc.set_caps(Some(&caps));

        let appsink = gsth::app_sink(&pipeline, "frames")?;
        let raw = gsth::RAW_CAPS
            .parse::<gst::Caps>()
            .map_err(|e| OpenError::Pipeline(e.to_string()))?;
        appsink.set_caps(Some(&raw));

        // Device and context errors surface on the way to Ready
        if let Err(e) = gsth::change_state(&pipeline, gst::State::Ready, Duration::from_secs(2))
            .and_then(|_| {
                gsth::change_state(&pipeline, gst::State::Playing, Duration::from_secs(2))
            })
        {
            gsth::shutdown(&pipeline);
            return Err(e);
        }

        Ok(Box::new(GstDecodeSession {
            pipeline,
            appsrc,
            appsink,
            wait: self.wait,
            sequence: 0,
        }))
    }
}

struct GstDecodeSession {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    wait: Duration,
    sequence: u64,
}

impl DecodeSession for GstDecodeSession {
    fn decode(&mut self, packet: &CompressedPacket, read_all: bool) -> Result<Frame, DecodeError> {
        let mut buffer = gst::Buffer::from_slice(packet.data.clone());
        {
            let buf = buffer.make_mut();
            let to_clock = |ns: i64| gst::ClockTime::from_nseconds(ns.max(0) as u64);
            buf.set_pts(packet.pts.map(to_clock));
            buf.set_dts(packet.dts.map(to_clock));
            if !packet.key_frame {
                buf.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| DecodeError::Corrupt(format!("push failed: {:?}", e)))?;

        let sample = match self.appsink.try_pull_sample(gsth::clock_time(self.wait)) {
            Some(sample) => sample,
            None => {
                return Err(match gsth::bus_error(&self.pipeline) {
                    Some(msg) => DecodeError::Corrupt(msg),
                    None => DecodeError::WouldBlock,
                })
            }
        };

        if read_all {
            while self.appsink.try_pull_sample(gst::ClockTime::ZERO).is_some() {
                metrics::counter!("vidrelay_decoder_drained_total").increment(1);
            }
        }

        self.sequence += 1;
        gsth::sample_to_bgr(&sample, self.sequence).map_err(DecodeError::Corrupt)
    }

    fn close(&mut self) {
        let _ = self.appsrc.end_of_stream();
        gsth::shutdown(&self.pipeline);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::registry::tests::FakeRegistry;
    use crate::stream::VideoCodec;
    use std::sync::{Arc, Mutex};

    /// Session producing a solid frame per packet
    pub(crate) struct SolidSession;

    impl DecodeSession for SolidSession {
        fn decode(&mut self, _: &CompressedPacket, _: bool) -> Result<Frame, DecodeError> {
            Ok(Frame::filled(2, 2, [0, 0, 255]))
        }
        fn close(&mut self) {}
    }

    /// Launcher that fails every hardware candidate and records attempts
    pub(crate) struct NoHardwareLauncher(pub Arc<Mutex<Vec<String>>>);

    impl SessionLauncher for NoHardwareLauncher {
        fn launch(
            &self,
            variant: &DecoderVariant,
            _: &MediaParameters,
        ) -> Result<Box<dyn DecodeSession>, OpenError> {
            self.0.lock().unwrap().push(variant.element().to_string());
            if variant.is_hardware() {
                Err(OpenError::Pipeline("device context unavailable".into()))
            } else {
                Ok(Box::new(SolidSession))
            }
        }
    }

    /// Session that starts fine but never negotiates caps
    struct UnnegotiatedSession(Arc<Mutex<u32>>);

    impl DecodeSession for UnnegotiatedSession {
        fn decode(&mut self, _: &CompressedPacket, _: bool) -> Result<Frame, DecodeError> {
            Err(DecodeError::Corrupt("not-negotiated".into()))
        }
        fn close(&mut self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    /// Hardware candidates launch, then fail on the first buffer
    struct LateFailureLauncher {
        attempts: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<u32>>,
    }

    impl SessionLauncher for LateFailureLauncher {
        fn launch(
            &self,
            variant: &DecoderVariant,
            _: &MediaParameters,
        ) -> Result<Box<dyn DecodeSession>, OpenError> {
            self.attempts
                .lock()
                .unwrap()
                .push(variant.element().to_string());
            if variant.is_hardware() {
                Ok(Box::new(UnnegotiatedSession(self.closed.clone())))
            } else {
                Ok(Box::new(SolidSession))
            }
        }
    }

    fn h264() -> MediaParameters {
        MediaParameters {
            width: 2,
            height: 2,
            fps_num: 25,
            fps_den: 1,
            codec: VideoCodec::H264,
        }
    }

    #[test]
    fn hardware_failure_falls_back_to_software() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let mut decoder = DecoderBackend::with_parts(
            "auto",
            Box::new(FakeRegistry::with(&["nvh264dec", "vah264dec", "avdec_h264"])),
            Box::new(NoHardwareLauncher(attempts.clone())),
            &Span::none(),
        );

        decoder.open(&h264()).unwrap();
        assert_eq!(decoder.name(), "avdec_h264");
        assert!(!decoder.variant().unwrap().is_hardware());
        assert_eq!(
            *attempts.lock().unwrap(),
            ["nvh264dec", "vah264dec", "avdec_h264"]
        );

        let frame = decoder.decode(&CompressedPacket::default(), false).unwrap();
        assert_eq!(frame.width(), 2);
    }

    #[test]
    fn no_candidates_is_no_decoder() {
        let mut decoder = DecoderBackend::with_parts(
            "auto",
            Box::new(FakeRegistry::with(&["nvh264dec"])),
            Box::new(NoHardwareLauncher(Arc::default())),
            &Span::none(),
        );
        assert!(matches!(
            decoder.open(&h264()),
            Err(OpenError::NoDecoder { .. })
        ));
        assert!(decoder.decode(&CompressedPacket::default(), false).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let mut decoder = DecoderBackend::with_parts(
            "auto",
            Box::new(FakeRegistry::with(&["avdec_h264"])),
            Box::new(NoHardwareLauncher(Arc::default())),
            &Span::none(),
        );
        decoder.open(&h264()).unwrap();
        decoder.close();
        decoder.close();
        assert!(decoder.variant().is_none());
    }

    #[test]
    fn negotiation_failure_on_first_packet_falls_back() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(0));
        let mut decoder = DecoderBackend::with_parts(
            "auto",
            Box::new(FakeRegistry::with(&["nvh264dec", "avdec_h264"])),
            Box::new(LateFailureLauncher {
                attempts: attempts.clone(),
                closed: closed.clone(),
            }),
            &Span::none(),
        );

        decoder.open(&h264()).unwrap();
        assert_eq!(decoder.name(), "nvh264dec");

        // The same packet is fed again to the software session
        let frame = decoder.decode(&CompressedPacket::default(), false).unwrap();
        assert_eq!(frame.width(), 2);
        assert_eq!(decoder.name(), "avdec_h264");
        assert!(!decoder.variant().unwrap().is_hardware());
        assert_eq!(*closed.lock().unwrap(), 1);
        assert_eq!(*attempts.lock().unwrap(), ["nvh264dec", "avdec_h264"]);
    }

    #[test]
    fn failure_with_no_candidates_left_is_reported() {
        let closed = Arc::new(Mutex::new(0));
        let mut decoder = DecoderBackend::with_parts(
            "auto",
            Box::new(FakeRegistry::with(&["nvh264dec"])),
            Box::new(LateFailureLauncher {
                attempts: Arc::default(),
                closed: closed.clone(),
            }),
            &Span::none(),
        );

        // No software element registered, so the hardware candidate is the whole plan
        decoder.open(&h264()).unwrap();
        assert!(matches!(
            decoder.decode(&CompressedPacket::default(), false),
            Err(DecodeError::Corrupt(msg)) if msg == "not-negotiated"
        ));
        assert_eq!(decoder.name(), "nvh264dec");
        assert_eq!(*closed.lock().unwrap(), 0);
    }
}
