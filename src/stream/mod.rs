//! Compressed packet sources
//!
//! A packet source demuxes a network or file input into one compressed video packet per call.
//! Only one packet is in flight at a time: `read_packet` hands out a borrow that ends before the
//! next call can be made.

pub mod source;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{OpenError, PacketError};

pub use source::PacketSource;

/// Video codec carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
    Mjpeg,
    Unknown,
}

impl VideoCodec {
    /// Classify a caps structure name
    pub fn from_media_type(media_type: &str) -> Self {
        match media_type {
            "video/x-h264" => VideoCodec::H264,
            "video/x-h265" => VideoCodec::H265,
            "image/jpeg" => VideoCodec::Mjpeg,
            _ => VideoCodec::Unknown,
        }
    }

    /// Caps handed to a decoder's input
    pub fn caps(&self) -> Option<&'static str> {
        match self {
            VideoCodec::H264 => Some("video/x-h264,stream-format=byte-stream,alignment=au"),
            VideoCodec::H265 => Some("video/x-h265,stream-format=byte-stream,alignment=au"),
            VideoCodec::Mjpeg => Some("image/jpeg"),
            VideoCodec::Unknown => None,
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265",
            VideoCodec::Mjpeg => "MJPEG",
            VideoCodec::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Stream parameters discovered once at open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaParameters {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub codec: VideoCodec,
}

impl MediaParameters {
    /// Numeric codec id as used by most muxers (H.264 = 27, H.265 = 173)
    pub fn codec_id(&self) -> i32 {
        match self.codec {
            VideoCodec::H264 => 27,
            VideoCodec::H265 => 173,
            VideoCodec::Mjpeg => 7,
            VideoCodec::Unknown => 0,
        }
    }

    /// Rounded frame rate, 0 when the source does not advertise one
    pub fn fps(&self) -> u32 {
        if self.fps_den == 0 {
            return 0;
        }
        (self.fps_num + self.fps_den / 2) / self.fps_den
    }
}

/// One compressed video packet; timestamps are in nanoseconds
#[derive(Debug, Clone, Default)]
pub struct CompressedPacket {
    pub data: Bytes,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub key_frame: bool,
}

impl CompressedPacket {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Demuxer yielding one compressed packet per call
pub trait PacketReader: Send {
    fn open(&mut self, url: &str) -> Result<MediaParameters, OpenError>;

    /// Consume `max(step, 1)` packets and return the last one
    fn read_packet(&mut self, step: u32) -> Result<&CompressedPacket, PacketError>;

    /// DTS of the last packet read, in nanoseconds
    fn position(&self) -> i64;

    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_ids_match_muxer_numbering() {
        let mut p = MediaParameters {
            width: 1920,
            height: 1080,
            fps_num: 25,
            fps_den: 1,
            codec: VideoCodec::H264,
        };
        assert_eq!(p.codec_id(), 27);
        p.codec = VideoCodec::H265;
        assert_eq!(p.codec_id(), 173);
        p.codec = VideoCodec::Unknown;
        assert_eq!(p.codec_id(), 0);
    }

    #[test]
    fn fps_rounds_fractional_rates() {
        let p = MediaParameters {
            width: 0,
            height: 0,
            fps_num: 30000,
            fps_den: 1001,
            codec: VideoCodec::H264,
        };
        assert_eq!(p.fps(), 30);
        assert_eq!(MediaParameters { fps_den: 0, ..p }.fps(), 0);
    }

    #[test]
    fn media_type_classification() {
        assert_eq!(VideoCodec::from_media_type("video/x-h265"), VideoCodec::H265);
        assert_eq!(VideoCodec::from_media_type("audio/mpeg"), VideoCodec::Unknown);
        assert!(VideoCodec::Unknown.caps().is_none());
    }
}
