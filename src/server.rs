//! Capture service loop: read, crop, hand to a callback, reopen on loss

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, info_span, warn, Span};

use crate::capture::{Capture, Frame};
use crate::error::{OpenError, ReadError};
use crate::{PipelineConfig, SourceConfig};

pub type CaptureOpener = Box<dyn FnMut(&SourceConfig) -> Result<Capture, OpenError> + Send>;

/// Stops a running [`VideoServer`] from another thread
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct VideoServer {
    source: SourceConfig,
    capture: Option<Capture>,
    opener: CaptureOpener,
    running: Arc<AtomicBool>,
    reopens_left: i32,
    span: Span,
}

impl VideoServer {
    pub fn new(source: SourceConfig, pipeline: &PipelineConfig, parent: &Span) -> Self {
        let pipeline = pipeline.clone();
        let span = info_span!(parent: parent, "server");
        let capture_span = span.clone();
        let opener: CaptureOpener =
            Box::new(move |source| Capture::from_config(source, &pipeline, &capture_span));
        Self::with_opener(source, opener, span)
    }

    /// Server using `opener` to (re)create its capture
    pub fn with_opener(source: SourceConfig, opener: CaptureOpener, span: Span) -> Self {
        Self {
            reopens_left: source.reopen_times,
            source,
            capture: None,
            opener,
            running: Arc::new(AtomicBool::new(true)),
            span,
        }
    }

    /// Replace the source description; takes effect at the next open
    pub fn setup(&mut self, source: SourceConfig) {
        self.reopens_left = source.reopen_times;
        self.source = source;
        self.running.store(true, Ordering::Release);
    }

    pub fn open_source(&mut self) -> Result<(), OpenError> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.clear();
        let capture = (self.opener)(&self.source)?;
        info!("Opened {} as {:?}", self.source.url, capture.source_type());
        self.capture = Some(capture);
        Ok(())
    }

    fn clear(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
    }

    pub fn is_opened(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.is_opened())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    /// Read one frame and pass it to `callback`. A lost source is released.
    pub fn run_once<F: FnMut(Frame)>(&mut self, callback: &mut F) -> Result<(), ReadError> {
        let capture = self.capture.as_mut().ok_or(ReadError::Closed)?;
        match capture.read() {
            Ok(frame) => {
                let frame = match self.source.roi {
                    Some(roi) if roi.area() > 0 => frame.crop(roi),
                    _ => frame,
                };
                callback(frame);
                Ok(())
            }
            Err(ReadError::Transient) => Err(ReadError::Transient),
            Err(e) => {
                let _enter = self.span.enter();
                warn!("Source lost: {}", e);
                capture.release();
                Err(e)
            }
        }
    }

    /// Serve frames until stopped or the reopen allowance is spent
    pub fn run<F: FnMut(Frame)>(&mut self, mut callback: F) {
        if self.capture.is_none() {
            if let Err(e) = self.open_source() {
                let _enter = self.span.enter();
                warn!("Failed to open source: {}", e);
            }
        }

        while self.running.load(Ordering::Acquire) {
            if self.is_opened() {
                let _ = self.run_once(&mut callback);
                continue;
            }

            if self.reopens_left == 0 {
                let _enter = self.span.enter();
                info!("No reopen attempts left");
                break;
            }
            if !self.sleep(self.source.reopen_delay()) {
                break;
            }
            let span = self.span.clone();
            let _enter = span.enter();
            info!("Reopening {}", self.source.url);
            match self.open_source() {
                Ok(()) => info!("Reopen succeeded"),
                Err(e) => warn!("Failed to reopen source: {}", e),
            }
            metrics::counter!("vidrelay_source_reopens_total").increment(1);
            if self.reopens_left > 0 {
                self.reopens_left -= 1;
            }
        }
        self.clear();
    }

    /// Sleep in short slices; false when stopped meanwhile
    fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while self.running.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(Duration::from_millis(50)));
        }
        false
    }
}

impl Drop for VideoServer {
    fn drop(&mut self) {
        self.clear();
    }
}
