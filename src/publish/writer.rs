//! Synchronous encode-and-mux to a local file

use std::path::Path;

use tracing::{info, info_span, warn, Span};

use super::sink::{GstPacketSink, PacketSink};
use super::timestamp::TimestampNormalizer;
use crate::capture::Frame;
use crate::codec::gst::GstRegistry;
use crate::codec::{EncodedPacket, EncoderSettings, FrameEncoder, GstEncoder};
use crate::error::{OpenError, WriteError};

pub struct VideoWriter {
    encoder: Option<Box<dyn FrameEncoder>>,
    sink: Box<dyn PacketSink>,
    normalizer: TimestampNormalizer,
    index: i64,
    span: Span,
}

impl VideoWriter {
    /// Open `path` for writing; the container follows the file extension
    pub fn create(
        path: impl AsRef<Path>,
        settings: &EncoderSettings,
        parent: &Span,
    ) -> Result<Self, OpenError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let span = info_span!(parent: parent, "writer", path = %path);
        let encoder = GstEncoder::open(settings, &GstRegistry, &span)?;
        let sink = GstPacketSink::new(&path, settings.width, settings.height, settings.fps, &span);
        Self::with_parts(Box::new(encoder), Box::new(sink), settings.fps, span)
    }

    pub fn with_parts(
        encoder: Box<dyn FrameEncoder>,
        mut sink: Box<dyn PacketSink>,
        fps: u32,
        span: Span,
    ) -> Result<Self, OpenError> {
        sink.connect(None)?;
        {
            let _enter = span.enter();
            info!("Writing with encoder {}", encoder.name());
        }
        Ok(Self {
            encoder: Some(encoder),
            sink,
            normalizer: TimestampNormalizer::new(fps),
            index: 0,
            span,
        })
    }

    fn write_packet(&mut self, mut packet: EncodedPacket) -> Result<(), WriteError> {
        let (pts, dts) = self.normalizer.normalize(packet.pts, packet.dts);
        packet.pts = pts;
        packet.dts = dts;
        self.sink.write(&packet)
    }

    /// Encode and write one frame
    pub fn write(&mut self, frame: &Frame) -> Result<(), WriteError> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| WriteError("writer is released".into()))?;
        let packet = encoder
            .encode(frame, self.index)
            .map_err(|e| WriteError(e.to_string()))?;
        self.index += 1;
        match packet {
            Some(packet) => self.write_packet(packet),
            None => Ok(()),
        }
    }

    pub fn is_opened(&self) -> bool {
        self.encoder.is_some()
    }

    /// Flush the encoder and finalise the file
    pub fn release(&mut self) {
        let Some(mut encoder) = self.encoder.take() else {
            return;
        };
        let span = self.span.clone();
        let _enter = span.enter();
        for packet in encoder.finish() {
            if let Err(e) = self.write_packet(packet) {
                warn!("Dropping trailing packet: {}", e);
            }
        }
        self.sink.close();
        info!("Wrote {} frames", self.index);
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        self.release();
    }
}
