//! V4L2 capture of MJPEG and YUYV cameras, converted to BGR on the host

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, info_span, warn, Span};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture as _;
use v4l::{Device, FourCC};

use crate::capture::decode::{self, Plane};
use crate::capture::frame::{Frame, PixelFormat};
use crate::error::{OpenError, ReadError};

const BUFFER_COUNT: u32 = 4;

/// Camera delivering MJPEG or YUYV through memory-mapped buffers
pub struct V4l2Capture {
    stream: Option<MmapStream<'static>>,
    path: String,
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: usize,
    fps: u32,
    sequence: u64,
    span: Span,
}

impl V4l2Capture {
    /// Open the device and negotiate `format`; the driver may adjust size and rate
    pub fn open(
        path: &str,
        format: PixelFormat,
        width: u32,
        height: u32,
        fps: u32,
        parent: &Span,
    ) -> Result<Self, OpenError> {
        let span = info_span!(parent: parent, "v4l2", device = path);
        let _enter = span.enter();
        info!("Initializing V4L2 capture ({:?})", format);

        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(OpenError::Connect {
                url: path.to_string(),
                reason: "device doesn't support video capture".into(),
            });
        }

        let mut fmt = device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = match format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => {
                return Err(OpenError::Pipeline(format!(
                    "unsupported device format: {:?}",
                    other
                )))
            }
        };
        let fmt = device.set_format(&fmt)?;
        if fmt.fourcc != FourCC::new(b"MJPG") && fmt.fourcc != FourCC::new(b"YUYV") {
            return Err(OpenError::Connect {
                url: path.to_string(),
                reason: format!("driver selected {} instead", fmt.fourcc),
            });
        }

        let fps = match device.set_params(&Parameters::with_fps(fps.max(1))) {
            Ok(params) if params.interval.numerator > 0 => {
                params.interval.denominator / params.interval.numerator
            }
            Ok(_) => fps,
            Err(e) => {
                warn!("Failed to set frame rate: {}", e);
                fps
            }
        };

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
        info!(
            "Capture stream started: {}x{} @ {} fps, {} buffers",
            fmt.width, fmt.height, fps, BUFFER_COUNT
        );

        drop(_enter);
        Ok(Self {
            stream: Some(stream),
            path: path.to_string(),
            format,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride as usize,
            fps,
            sequence: 0,
            span,
        })
    }

    /// Dequeue `max(step, 1)` buffers and convert the last one
    pub fn read(&mut self, step: u32) -> Result<Frame, ReadError> {
        let _enter = self.span.enter();
        let timestamp = Instant::now();
        let stream = self.stream.as_mut().ok_or(ReadError::Closed)?;

        for _ in 1..step.max(1) {
            stream
                .next()
                .map_err(|e| ReadError::Persistent(format!("{}: {}", self.path, e)))?;
        }
        let (buf, meta) = stream
            .next()
            .map_err(|e| ReadError::Persistent(format!("{}: {}", self.path, e)))?;

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let data = &buf[..used];

        let (bgr, width, height) = match self.format {
            PixelFormat::Mjpeg => decode::mjpeg_to_bgr(data).map_err(|e| {
                debug!("Dropping corrupt MJPEG frame: {}", e);
                ReadError::Transient
            })?,
            _ => {
                let stride = self.stride.max(self.width as usize * 2);
                if data.len() < stride * self.height as usize {
                    debug!("Short YUYV buffer ({} bytes)", data.len());
                    return Err(ReadError::Transient);
                }
                let bgr = decode::yuyv_to_bgr(Plane::new(data, stride), self.width, self.height);
                (bgr, self.width, self.height)
            }
        };

        self.sequence += 1;
        let device_ts = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);
        let mut frame = Frame::bgr(Bytes::from(bgr), width, height, self.sequence)
            .with_device_timestamp(Some(device_ts));
        frame.timestamp = timestamp;
        Ok(frame)
    }

    pub fn is_opened(&self) -> bool {
        self.stream.is_some()
    }

    pub fn release(&mut self) {
        if self.stream.take().is_some() {
            let _enter = self.span.enter();
            info!("Capture stream stopped");
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frames_read(&self) -> u64 {
        self.sequence
    }
}
