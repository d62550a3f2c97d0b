//! Outbound publisher: bounded frame queue, encode and write worker, connect gate

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, info_span, warn, Span};

use super::sink::{GstPacketSink, PacketSink};
use super::timestamp::TimestampNormalizer;
use crate::capture::Frame;
use crate::codec::gst::GstRegistry;
use crate::codec::{EncoderSettings, FrameEncoder, GstEncoder};
use crate::error::PublishError;
use crate::PublisherConfig;

enum Message {
    Frame(Frame),
    Shutdown,
}

/// Bounded FIFO between `push` and the worker; full means the new frame is dropped
#[derive(Clone)]
pub struct PendingFrameQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    capacity: usize,
}

impl PendingFrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueue without blocking; returns false when the frame was dropped
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send(Message::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                metrics::counter!("vidrelay_publish_frames_dropped_total").increment(1);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn wake(&self) {
        let _ = self.tx.try_send(Message::Shutdown);
    }

    fn receiver(&self) -> Receiver<Message> {
        self.rx.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connected,
    Failed,
}

struct ConnectGate {
    state: Mutex<ConnectionState>,
    cond: Condvar,
}

impl ConnectGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::NotConnected),
            cond: Condvar::new(),
        }
    }

    fn set(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.cond.notify_all();
    }

    /// Leave `NotConnected` for `state` unless another party already decided; returns the outcome
    fn settle(&self, state: ConnectionState) -> ConnectionState {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == ConnectionState::NotConnected {
            *current = state;
            self.cond.notify_all();
        }
        *current
    }

    fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the state leaves `NotConnected` or the timeout expires
    fn wait(&self, timeout: Option<Duration>) -> ConnectionState {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while *state == ConnectionState::NotConnected {
            state = match deadline {
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    self.cond
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *state
    }
}

struct Worker {
    encoder: Box<dyn FrameEncoder>,
    sink: Box<dyn PacketSink>,
    rx: Receiver<Message>,
    gate: Arc<ConnectGate>,
    stopping: Arc<AtomicBool>,
    connect_timeout: Option<Duration>,
    max_write_retries: u32,
    fps: u32,
}

impl Worker {
    fn run(mut self) {
        if let Err(e) = self.sink.connect(self.connect_timeout) {
            error!("Failed to connect output: {}", e);
            self.gate.set(ConnectionState::Failed);
            return;
        }
        // start() may have given up while connect was still running
        if self.stopping.load(Ordering::Acquire)
            || self.gate.settle(ConnectionState::Connected) != ConnectionState::Connected
        {
            warn!("Output connected after the publisher gave up");
            self.sink.close();
            return;
        }
        info!("Output connected");

        let mut normalizer = TimestampNormalizer::new(self.fps);
        let mut index: i64 = 0;
        let mut failures: u32 = 0;

        while let Ok(message) = self.rx.recv() {
            let frame = match message {
                Message::Frame(frame) => frame,
                Message::Shutdown => break,
            };
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let encoded = self.encoder.encode(&frame, index);
            index += 1;
            let mut packet = match encoded {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Encode failed: {}", e);
                    continue;
                }
            };

            let (pts, dts) = normalizer.normalize(packet.pts, packet.dts);
            packet.pts = pts;
            packet.dts = dts;

            match self.sink.write(&packet) {
                Ok(()) => {
                    failures = 0;
                    metrics::counter!("vidrelay_publish_packets_written_total").increment(1);
                }
                Err(e) => {
                    failures += 1;
                    metrics::counter!("vidrelay_publish_write_failures_total").increment(1);
                    if failures > self.max_write_retries {
                        error!("Write failed {} times in a row, giving up: {}", failures, e);
                        self.gate.set(ConnectionState::Failed);
                        break;
                    }
                    warn!("Write failed ({}/{}), packet dropped: {}", failures, self.max_write_retries, e);
                }
            }
        }

        self.sink.close();
        debug!("Publisher worker finished after {} frames", index);
    }
}

/// Single-stream publisher: `push` frames, a worker encodes and writes them
pub struct OutboundPublisher {
    url: String,
    queue: PendingFrameQueue,
    gate: Arc<ConnectGate>,
    stopping: Arc<AtomicBool>,
    parts: Option<(Box<dyn FrameEncoder>, Box<dyn PacketSink>)>,
    worker: Option<JoinHandle<()>>,
    connect_timeout: Option<Duration>,
    max_write_retries: u32,
    fps: u32,
    span: Span,
}

impl OutboundPublisher {
    /// Resolve the encoder and prepare the output for `width`x`height` frames
    pub fn open(
        url: &str,
        width: u32,
        height: u32,
        config: &PublisherConfig,
        parent: &Span,
    ) -> Result<Self, PublishError> {
        let span = info_span!(parent: parent, "publisher", url);
        let settings = EncoderSettings {
            width,
            height,
            fps: config.fps.max(1),
            bitrate_kbps: config.bitrate_kbps,
            gop: config.gop,
            threads: config.threads,
            encoder: config.encoder.clone(),
        };
        let encoder = GstEncoder::open(&settings, &GstRegistry, &span)?;
        let sink = GstPacketSink::new(url, width, height, settings.fps, &span);
        Ok(Self::with_parts(
            url,
            Box::new(encoder),
            Box::new(sink),
            config,
            span,
        ))
    }

    /// Publisher over the given encoder and sink; `span` is used as-is
    pub fn with_parts(
        url: &str,
        encoder: Box<dyn FrameEncoder>,
        sink: Box<dyn PacketSink>,
        config: &PublisherConfig,
        span: Span,
    ) -> Self {
        Self {
            url: url.to_string(),
            queue: PendingFrameQueue::new(config.queue_capacity),
            gate: Arc::new(ConnectGate::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            parts: Some((encoder, sink)),
            worker: None,
            connect_timeout: config.connect_timeout(),
            max_write_retries: config.max_write_retries,
            fps: config.fps.max(1),
            span,
        }
    }

    /// Spawn the worker and wait for the connection
    pub fn start(&mut self) -> Result<(), PublishError> {
        let (encoder, sink) = self.parts.take().ok_or(PublishError::AlreadyStarted)?;
        let _enter = self.span.enter();
        info!("Starting publisher");

        let worker = Worker {
            encoder,
            sink,
            rx: self.queue.receiver(),
            gate: self.gate.clone(),
            stopping: self.stopping.clone(),
            connect_timeout: self.connect_timeout,
            max_write_retries: self.max_write_retries,
            fps: self.fps,
        };
        let span = self.span.clone();
        let handle = thread::Builder::new()
            .name("vidrelay-publish".into())
            .spawn(move || {
                let _enter = span.enter();
                worker.run()
            })
            .map_err(PublishError::Spawn)?;
        self.worker = Some(handle);

        match self.gate.wait(self.connect_timeout) {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Failed => Err(PublishError::ConnectFailed {
                url: self.url.clone(),
            }),
            ConnectionState::NotConnected => {
                if self.gate.settle(ConnectionState::Failed) == ConnectionState::Connected {
                    return Ok(());
                }
                let after = self.connect_timeout.unwrap_or_default();
                warn!("No connection after {:?}", after);
                self.signal_stop();
                Err(PublishError::ConnectTimeout {
                    url: self.url.clone(),
                    after,
                })
            }
        }
    }

    /// Queue a frame without blocking. Dropped when the queue is full or the connection failed.
    pub fn push(&self, frame: Frame) -> bool {
        if self.gate.get() == ConnectionState::Failed || self.stopping.load(Ordering::Acquire) {
            metrics::counter!("vidrelay_publish_frames_dropped_total").increment(1);
            return false;
        }
        metrics::counter!("vidrelay_publish_frames_pushed_total").increment(1);
        self.queue.push(frame)
    }

    fn signal_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.queue.wake();
    }

    /// Stop the worker and close the output; pending frames are discarded
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.worker.take() {
            let _enter = self.span.enter();
            if handle.join().is_err() {
                error!("Publisher worker panicked");
            }
            info!("Publisher stopped");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.gate.get() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.gate.get()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue(&self) -> &PendingFrameQueue {
        &self.queue
    }
}

impl Drop for OutboundPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_new_frames() {
        let queue = PendingFrameQueue::new(256);
        let frame = Frame::filled(2, 2, [1, 2, 3]);
        let accepted = (0..300).filter(|_| queue.push(frame.clone())).count();
        assert_eq!(accepted, 256);
        assert_eq!(queue.len(), 256);
    }

    #[test]
    fn gate_times_out_while_not_connected() {
        let gate = ConnectGate::new();
        let start = Instant::now();
        assert_eq!(
            gate.wait(Some(Duration::from_millis(30))),
            ConnectionState::NotConnected
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn gate_wakes_on_state_change() {
        let gate = Arc::new(ConnectGate::new());
        let setter = gate.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set(ConnectionState::Connected);
        });
        assert_eq!(gate.wait(None), ConnectionState::Connected);
        t.join().unwrap();
    }

    #[test]
    fn first_settled_state_wins() {
        let gate = ConnectGate::new();
        assert_eq!(gate.settle(ConnectionState::Failed), ConnectionState::Failed);
        assert_eq!(
            gate.settle(ConnectionState::Connected),
            ConnectionState::Failed
        );
        assert_eq!(gate.get(), ConnectionState::Failed);
    }
}
