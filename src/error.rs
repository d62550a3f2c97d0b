//! Error taxonomy shared by sources, decoders, the delivery engine and the publisher

use std::time::Duration;

use thiserror::Error;

/// A component failed to initialise.
///
/// Failures with a documented fallback (hardware decoder, named encoder) never reach callers as
/// this error; only the case with nothing left to fall back to does.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("cannot connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("no packet from {url} within {after:?}")]
    Timeout { url: String, after: Duration },
    #[error("no video stream found in {url}")]
    NoVideoStream { url: String },
    #[error("no usable decoder for {codec}")]
    NoDecoder { codec: String },
    #[error("no usable H.264 encoder")]
    NoEncoder,
    #[error("pipeline setup failed: {0}")]
    Pipeline(String),
    #[error("device error: {0}")]
    Device(#[from] std::io::Error),
}

/// Failure of `PacketSource::read_packet`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("end of stream")]
    EndOfStream,
    #[error("read failed: {0}")]
    Read(String),
    #[error("source is closed")]
    Closed,
}

/// Outcome of feeding one packet to a decoder that did not yield a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The decoder buffered the packet; no frame is ready yet. Expected during warm-up.
    #[error("no frame ready yet")]
    WouldBlock,
    #[error("decode failed: {0}")]
    Corrupt(String),
}

/// Failure of a capture or delivery-engine read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// No frame this call; the caller may keep reading.
    #[error("no frame available (transient)")]
    Transient,
    /// The source is gone or persistently degraded; the caller should reopen.
    #[error("source lost: {0}")]
    Persistent(String),
    #[error("capture is not opened")]
    Closed,
}

/// Failure to write one packet to a muxed output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("write failed: {0}")]
pub struct WriteError(pub String);

/// Failure to encode one frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("encode failed: {0}")]
pub struct EncodeError(pub String);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("no connection to {url} after {after:?}")]
    ConnectTimeout { url: String, after: Duration },
    #[error("connection to {url} failed")]
    ConnectFailed { url: String },
    #[error("publisher already started")]
    AlreadyStarted,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<PacketError> for ReadError {
    fn from(e: PacketError) -> Self {
        ReadError::Persistent(e.to_string())
    }
}
