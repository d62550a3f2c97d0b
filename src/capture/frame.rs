use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decoded frame with zero-copy sharing semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Stream or hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
    I420,
}

/// Region of interest in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl Frame {
    /// Wrap a tightly packed BGR buffer
    pub fn bgr(data: Bytes, width: u32, height: u32, sequence: u64) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: width * 3,
                format: PixelFormat::Bgr24,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    /// Solid-colour BGR frame, mostly useful for tests and padding
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data: Vec<u8> = bgr
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self::bgr(Bytes::from(data), width, height, 0)
    }

    pub fn with_device_timestamp(mut self, ts: Option<Duration>) -> Self {
        Arc::make_mut(&mut self.meta).device_timestamp = ts;
        self
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.meta.width == 0 || self.meta.height == 0
    }

    /// Mean sample value over all channels
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
        sum as f64 / self.data.len() as f64
    }

    /// Copy out a BGR sub-rectangle; the ROI is clipped to the frame.
    pub fn crop(&self, roi: Rect) -> Frame {
        let x0 = roi.x.min(self.width());
        let y0 = roi.y.min(self.height());
        let w = roi.width.min(self.width() - x0);
        let h = roi.height.min(self.height() - y0);
        let stride = self.meta.stride as usize;

        let mut out = Vec::with_capacity((w * h * 3) as usize);
        for row in y0..y0 + h {
            let start = row as usize * stride + x0 as usize * 3;
            out.extend_from_slice(&self.data[start..start + w as usize * 3]);
        }

        Frame {
            data: Bytes::from(out),
            meta: Arc::new(FrameMetadata {
                width: w,
                height: h,
                stride: w * 3,
                ..(*self.meta).clone()
            }),
            timestamp: self.timestamp,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_frame_has_expected_mean() {
        let frame = Frame::filled(4, 2, [10, 20, 30]);
        assert_eq!(frame.data.len(), 24);
        assert!((frame.mean() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn crop_is_clipped_to_frame() {
        let mut data = Vec::new();
        for y in 0..4u8 {
            for x in 0..4u8 {
                data.extend_from_slice(&[x, y, 0]);
            }
        }
        let frame = Frame::bgr(Bytes::from(data), 4, 4, 7);

        let cropped = frame.crop(Rect { x: 2, y: 1, width: 10, height: 2 });
        assert_eq!((cropped.width(), cropped.height()), (2, 2));
        assert_eq!(cropped.sequence(), 7);
        assert_eq!(&cropped.data[..6], &[2, 1, 0, 3, 1, 0]);
        assert_eq!(&cropped.data[6..], &[2, 2, 0, 3, 2, 0]);
    }
}
