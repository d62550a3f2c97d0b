//! Outbound side: encode frames and write them to a network or file output

pub mod publisher;
pub mod sink;
pub mod timestamp;
pub mod writer;

pub use publisher::{ConnectionState, OutboundPublisher, PendingFrameQueue};
pub use sink::{GstPacketSink, PacketSink, SinkKind};
pub use timestamp::TimestampNormalizer;
pub use writer::VideoWriter;
