//! Decoder candidate tables and selection order

use std::fmt;

use tracing::{debug, warn};

use super::gst::ElementRegistry;
use crate::stream::VideoCodec;

/// Hardware acceleration backend behind a decoder element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    RockchipMpp,
    Nvdec,
    Jetson,
    Va,
    Vaapi,
    V4l2,
    D3d11,
    VideoToolbox,
    Other,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::RockchipMpp => "rockchip-mpp",
            Platform::Nvdec => "nvdec",
            Platform::Jetson => "jetson",
            Platform::Va => "va",
            Platform::Vaapi => "vaapi",
            Platform::V4l2 => "v4l2",
            Platform::D3d11 => "d3d11",
            Platform::VideoToolbox => "videotoolbox",
            Platform::Other => "other",
        };
        f.write_str(name)
    }
}

/// Concrete decoder choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderVariant {
    Software { element: String },
    Hardware { element: String, platform: Platform },
}

impl DecoderVariant {
    pub fn element(&self) -> &str {
        match self {
            DecoderVariant::Software { element } | DecoderVariant::Hardware { element, .. } => {
                element
            }
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, DecoderVariant::Hardware { .. })
    }
}

impl fmt::Display for DecoderVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderVariant::Software { element } => write!(f, "{} (software)", element),
            DecoderVariant::Hardware { element, platform } => {
                write!(f, "{} ({})", element, platform)
            }
        }
    }
}

const H264_HARDWARE: &[(&str, Platform)] = &[
    ("mppvideodec", Platform::RockchipMpp),
    ("nvh264dec", Platform::Nvdec),
    ("nvv4l2decoder", Platform::Jetson),
    ("vah264dec", Platform::Va),
    ("vaapih264dec", Platform::Vaapi),
    ("v4l2h264dec", Platform::V4l2),
    ("d3d11h264dec", Platform::D3d11),
    ("vtdec_hw", Platform::VideoToolbox),
];

const H265_HARDWARE: &[(&str, Platform)] = &[
    ("mppvideodec", Platform::RockchipMpp),
    ("nvh265dec", Platform::Nvdec),
    ("nvv4l2decoder", Platform::Jetson),
    ("vah265dec", Platform::Va),
    ("vaapih265dec", Platform::Vaapi),
    ("v4l2h265dec", Platform::V4l2),
    ("d3d11h265dec", Platform::D3d11),
    ("vtdec_hw", Platform::VideoToolbox),
];

const MJPEG_HARDWARE: &[(&str, Platform)] = &[
    ("nvjpegdec", Platform::Nvdec),
    ("vaapijpegdec", Platform::Vaapi),
    ("v4l2jpegdec", Platform::V4l2),
];

/// Hardware decoders in priority order
pub fn hardware_candidates(codec: VideoCodec) -> &'static [(&'static str, Platform)] {
    match codec {
        VideoCodec::H264 => H264_HARDWARE,
        VideoCodec::H265 => H265_HARDWARE,
        VideoCodec::Mjpeg => MJPEG_HARDWARE,
        VideoCodec::Unknown => &[],
    }
}

/// Software decoders in priority order
pub fn software_candidates(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::H264 => &["avdec_h264", "openh264dec"],
        VideoCodec::H265 => &["avdec_h265", "libde265dec"],
        VideoCodec::Mjpeg => &["jpegdec", "avdec_mjpeg"],
        VideoCodec::Unknown => &[],
    }
}

/// H.264 encoders tried when no named encoder is given or the named one fails
pub const DEFAULT_ENCODERS: &[&str] = &["x264enc", "openh264enc"];

fn classify(codec: VideoCodec, element: &str) -> DecoderVariant {
    if software_candidates(codec).contains(&element) {
        return DecoderVariant::Software {
            element: element.to_string(),
        };
    }
    let platform = hardware_candidates(codec)
        .iter()
        .find(|(name, _)| *name == element)
        .map(|(_, platform)| *platform)
        .unwrap_or(Platform::Other);
    DecoderVariant::Hardware {
        element: element.to_string(),
        platform,
    }
}

/// Ordered list of decoders to try for `codec`.
///
/// A recognised named hint comes first, then every available hardware candidate, then software.
pub fn plan(codec: VideoCodec, hint: &str, registry: &dyn ElementRegistry) -> Vec<DecoderVariant> {
    let mut plan: Vec<DecoderVariant> = Vec::new();

    let hint = hint.trim();
    if !hint.is_empty() && !hint.eq_ignore_ascii_case("auto") {
        if registry.contains(hint) {
            plan.push(classify(codec, hint));
        } else {
            warn!("Decoder '{}' is not available, selecting automatically", hint);
        }
    }

    let hardware = hardware_candidates(codec)
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| registry.contains(name));
    let software = software_candidates(codec)
        .iter()
        .copied()
        .filter(|name| registry.contains(name));

    for name in hardware.chain(software) {
        if plan.iter().all(|v| v.element() != name) {
            plan.push(classify(codec, name));
        }
    }

    debug!(
        "Decoder plan for {}: {:?}",
        codec,
        plan.iter().map(|v| v.element()).collect::<Vec<_>>()
    );
    plan
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    pub(crate) struct FakeRegistry(pub HashSet<&'static str>);

    impl FakeRegistry {
        pub(crate) fn with(names: &[&'static str]) -> Self {
            Self(names.iter().copied().collect())
        }
    }

    impl ElementRegistry for FakeRegistry {
        fn contains(&self, name: &str) -> bool {
            self.0.contains(name)
        }
    }

    #[test]
    fn hardware_precedes_software() {
        let registry = FakeRegistry::with(&["avdec_h264", "vah264dec", "nvh264dec"]);
        let plan = plan(VideoCodec::H264, "auto", &registry);
        let names: Vec<_> = plan.iter().map(|v| v.element()).collect();
        assert_eq!(names, ["nvh264dec", "vah264dec", "avdec_h264"]);
        assert!(plan[0].is_hardware());
        assert!(!plan[2].is_hardware());
    }

    #[test]
    fn named_hint_is_tried_first_without_duplicates() {
        let registry = FakeRegistry::with(&["avdec_h264", "vah264dec", "nvh264dec"]);
        let plan = plan(VideoCodec::H264, "vah264dec", &registry);
        let names: Vec<_> = plan.iter().map(|v| v.element()).collect();
        assert_eq!(names, ["vah264dec", "nvh264dec", "avdec_h264"]);
        assert_eq!(
            plan[0],
            DecoderVariant::Hardware {
                element: "vah264dec".into(),
                platform: Platform::Va
            }
        );
    }

    #[test]
    fn unknown_hint_falls_back_to_automatic_order() {
        let registry = FakeRegistry::with(&["avdec_h265"]);
        let plan = plan(VideoCodec::H265, "nosuchdec", &registry);
        assert_eq!(
            plan,
            vec![DecoderVariant::Software {
                element: "avdec_h265".into()
            }]
        );
    }

    #[test]
    fn nothing_available_gives_empty_plan() {
        let registry = FakeRegistry::with(&[]);
        assert!(plan(VideoCodec::Mjpeg, "auto", &registry).is_empty());
    }
}
