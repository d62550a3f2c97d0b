pub mod decoder;
pub mod encoder;
pub mod gst;
pub mod registry;

pub use decoder::{DecoderBackend, FrameDecoder};
pub use encoder::{EncodedPacket, EncoderSettings, FrameEncoder, GstEncoder};
pub use registry::{DecoderVariant, Platform};
