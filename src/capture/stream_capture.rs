//! Network stream capture: packet source, decoder backend and delivery engine

use tracing::{info, info_span, Span};

use crate::capture::frame::Frame;
use crate::capture::CaptureProp;
use crate::codec::{DecoderBackend, FrameDecoder};
use crate::error::{OpenError, ReadError};
use crate::pipeline::{DeliveryPolicy, FrameDeliveryEngine, FrameReader};
use crate::stream::{MediaParameters, PacketReader, PacketSource};
use crate::PipelineConfig;

pub struct StreamCapture {
    engine: Option<FrameDeliveryEngine>,
    params: Option<MediaParameters>,
    /// Applied at the next open
    policy: DeliveryPolicy,
    step: u32,
    decoder_hint: String,
    config: PipelineConfig,
    span: Span,
}

impl StreamCapture {
    pub fn new(
        policy: DeliveryPolicy,
        decoder_hint: &str,
        config: &PipelineConfig,
        parent: &Span,
    ) -> Self {
        Self {
            engine: None,
            params: None,
            policy,
            step: 1,
            decoder_hint: decoder_hint.to_string(),
            config: config.clone(),
            span: info_span!(parent: parent, "stream_capture"),
        }
    }

    /// Open `url` with the GStreamer source and decoder backend
    pub fn open(&mut self, url: &str) -> Result<MediaParameters, OpenError> {
        let source = PacketSource::new(&self.config, &self.span);
        let decoder = DecoderBackend::new(&self.decoder_hint, &self.config, &self.span);
        self.open_with(url, Box::new(source), Box::new(decoder))
    }

    /// Open `url` with the given source and decoder
    pub fn open_with(
        &mut self,
        url: &str,
        source: Box<dyn PacketReader>,
        decoder: Box<dyn FrameDecoder>,
    ) -> Result<MediaParameters, OpenError> {
        self.release();
        let _enter = self.span.enter();
        info!("Opening stream {} ({:?})", url, self.policy);

        let mut engine =
            FrameDeliveryEngine::new(source, decoder, self.policy, &self.config, &self.span);
        engine.set_step(self.step);
        let params = engine.open(url)?;
        self.engine = Some(engine);
        self.params = Some(params);
        Ok(params)
    }

    /// Parameters of the open stream
    pub fn parameters(&self) -> Option<MediaParameters> {
        self.params
    }

    pub fn read(&mut self) -> Result<Frame, ReadError> {
        self.engine.as_mut().ok_or(ReadError::Closed)?.read()
    }

    /// Extra independent reader when running with the Drop policy
    pub fn reader(&self) -> Option<FrameReader> {
        self.engine.as_ref()?.reader()
    }

    pub fn is_opened(&self) -> bool {
        self.engine.as_ref().is_some_and(|e| e.is_open())
    }

    pub fn release(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.close();
        }
    }

    pub fn get(&self, prop: CaptureProp) -> f64 {
        let params = self.params.as_ref();
        match prop {
            CaptureProp::FrameWidth => params.map_or(-1.0, |p| p.width as f64),
            CaptureProp::FrameHeight => params.map_or(-1.0, |p| p.height as f64),
            CaptureProp::Fps => params
                .filter(|p| p.fps_den > 0)
                .map_or(-1.0, |p| p.fps_num as f64 / p.fps_den as f64),
            CaptureProp::PosFrames => self.engine.as_ref().map_or(-1.0, |e| e.position() as f64),
            CaptureProp::RecvMethod => match self.policy {
                DeliveryPolicy::Blocking => 0.0,
                DeliveryPolicy::Drop => 1.0,
            },
            CaptureProp::Step => self.step as f64,
            CaptureProp::Other(_) => -1.0,
        }
    }

    pub fn set(&mut self, prop: CaptureProp, value: f64) {
        match prop {
            CaptureProp::RecvMethod => {
                self.policy = if value as i32 == 1 {
                    DeliveryPolicy::Drop
                } else {
                    DeliveryPolicy::Blocking
                };
            }
            CaptureProp::Step => {
                self.step = (value as u32).max(1);
                if let Some(engine) = &self.engine {
                    engine.set_step(self.step);
                }
            }
            _ => {}
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        self.release();
    }
}
