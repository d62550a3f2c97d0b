use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::SourceType;
use crate::error::OpenError;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub source_type: SourceType,
}

impl FoundDevice {
    pub fn new(path: String, card: String, source_type: SourceType) -> Self {
        Self {
            path,
            card,
            source_type,
        }
    }
}

/// Capture kind for a device offering `fourccs`; MJPEG is preferred over YUYV
pub fn preferred_source_type(fourccs: &[FourCC]) -> Option<SourceType> {
    if fourccs.contains(&FourCC::new(b"MJPG")) {
        Some(SourceType::Jpeg)
    } else if fourccs.contains(&FourCC::new(b"YUYV")) {
        Some(SourceType::Yuyv)
    } else {
        None
    }
}

fn probe(path: &str) -> Option<FoundDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    // Check for capture capability
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return None;
    }
    let fourccs: Vec<FourCC> = dev.enum_formats().ok()?.into_iter().map(|f| f.fourcc).collect();
    debug!("{}: {} offers {:?}", path, caps.card, fourccs);
    preferred_source_type(&fourccs).map(|t| FoundDevice::new(path.to_string(), caps.card, t))
}

/// All capture devices under `/dev/video0..9` that deliver MJPEG or YUYV
pub fn list_devices() -> Vec<FoundDevice> {
    (0..10)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists())
        .filter_map(|path| probe(&path))
        .collect()
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<FoundDevice, OpenError> {
    info!("Auto-detecting capture devices...");

    let devices = list_devices();
    let best = devices
        .iter()
        .find(|d| d.source_type == SourceType::Jpeg)
        .or_else(|| devices.first())
        .cloned()
        .ok_or_else(|| {
            OpenError::Device(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No suitable capture device found",
            ))
        })?;

    info!("Found {:?} device: {} - {}", best.source_type, best.path, best.card);
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_wins_over_yuyv() {
        let both = [FourCC::new(b"YUYV"), FourCC::new(b"MJPG")];
        assert_eq!(preferred_source_type(&both), Some(SourceType::Jpeg));
        assert_eq!(
            preferred_source_type(&[FourCC::new(b"YUYV")]),
            Some(SourceType::Yuyv)
        );
        assert_eq!(preferred_source_type(&[FourCC::new(b"GREY")]), None);
    }
}
