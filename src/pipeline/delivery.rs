//! Frame delivery from a packet source and decoder pair
//!
//! Two policies:
//! * `Blocking` decodes on the caller's thread, one frame per `read()`.
//! * `Drop` decodes continuously on a background thread into a single slot. Readers only ever see
//!   the newest frame and never the same sequence id twice; frames nobody read in time are skipped.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Span};

use crate::capture::Frame;
use crate::codec::FrameDecoder;
use crate::error::{DecodeError, OpenError, ReadError};
use crate::stream::{MediaParameters, PacketReader};
use crate::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryPolicy {
    Blocking,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Closed,
    Opening,
    Open,
}

/// Delivery counters
#[derive(Default)]
pub struct DeliveryStats {
    decoded: CachePadded<AtomicU64>,
    delivered: CachePadded<AtomicU64>,
    skipped: CachePadded<AtomicU64>,
    decode_failures: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub decoded: u64,
    pub delivered: u64,
    pub skipped: u64,
    pub decode_failures: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            decoded: self.decoded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }

    fn record_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vidrelay_frames_decoded_total").increment(1);
    }

    fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vidrelay_frames_delivered_total").increment(1);
    }

    fn record_skipped(&self, n: u64) {
        if n > 0 {
            self.skipped.fetch_add(n, Ordering::Relaxed);
            metrics::counter!("vidrelay_frames_skipped_total").increment(n);
        }
    }

    fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vidrelay_decode_failures_total").increment(1);
    }
}

/// Source and decoder pair plus the retry bookkeeping around them
struct DecodeLoop {
    source: Box<dyn PacketReader>,
    decoder: Box<dyn FrameDecoder>,
    step: Arc<AtomicU32>,
    position: Arc<AtomicI64>,
    /// Set by `close` so a long warm-up gives up between attempts
    stop: Arc<AtomicBool>,
    read_all: bool,
    first_read: bool,
    failed_reads: u32,
    warmup_retries: u32,
    read_retries: u32,
    max_failed_reads: u32,
    stats: Arc<DeliveryStats>,
}

impl DecodeLoop {
    /// Read packets until one decodes into a frame or the retry allowance runs out.
    ///
    /// The first read after open may retry `warmup_retries` times, later reads `read_retries`.
    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        let retries = if self.first_read {
            self.warmup_retries
        } else {
            self.read_retries
        };
        self.first_read = false;
        let step = self.step.load(Ordering::Relaxed);

        for _ in 0..=retries {
            if self.stop.load(Ordering::Acquire) {
                return Err(ReadError::Closed);
            }
            let packet = self.source.read_packet(step)?;
            let decoded = self.decoder.decode(packet, self.read_all);
            self.position.store(self.source.position(), Ordering::Relaxed);

            match decoded {
                Ok(frame) => {
                    self.failed_reads = 0;
                    self.stats.record_decoded();
                    return Ok(frame);
                }
                Err(DecodeError::WouldBlock) => {}
                Err(DecodeError::Corrupt(msg)) => {
                    debug!("Decode failed: {}", msg);
                    self.stats.record_decode_failure();
                }
            }
        }

        self.failed_reads += 1;
        if self.failed_reads > self.max_failed_reads {
            Err(ReadError::Persistent(format!(
                "{} consecutive reads without a frame",
                self.failed_reads
            )))
        } else {
            Err(ReadError::Transient)
        }
    }

    fn close(&mut self) {
        self.decoder.close();
        self.source.close();
    }
}

struct Slot {
    frame: Option<Frame>,
    seq: u64,
    in_use: bool,
    stopped: bool,
    failure: Option<ReadError>,
}

struct Shared {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Independent consumer of a Drop-policy engine
#[derive(Clone)]
pub struct FrameReader {
    shared: Arc<Shared>,
    stats: Arc<DeliveryStats>,
    last_seen: u64,
}

impl FrameReader {
    /// Wait for a frame this reader has not seen yet
    pub fn read(&mut self) -> Result<Frame, ReadError> {
        self.wait(None)
    }

    /// As `read`, giving up with `ReadError::Transient` after `timeout`
    pub fn read_timeout(&mut self, timeout: Duration) -> Result<Frame, ReadError> {
        self.wait(Some(Instant::now() + timeout))
    }

    fn wait(&mut self, deadline: Option<Instant>) -> Result<Frame, ReadError> {
        let mut slot = self.shared.lock();
        loop {
            if slot.stopped {
                return Err(ReadError::Closed);
            }
            // An unread frame goes out before a failure recorded after it
            if !slot.in_use && slot.seq != self.last_seen {
                if let Some(frame) = &slot.frame {
                    let gap = slot.seq - self.last_seen;
                    if self.last_seen > 0 {
                        self.stats.record_skipped(gap - 1);
                    }
                    self.last_seen = slot.seq;
                    self.stats.record_delivered();
                    return Ok(frame.clone());
                }
            }
            if let Some(failure) = &slot.failure {
                return Err(failure.clone());
            }

            slot = match deadline {
                None => self
                    .shared
                    .cond
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ReadError::Transient);
                    }
                    self.shared
                        .cond
                        .wait_timeout(slot, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Sequence id of the last frame this reader received
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}

struct Worker {
    shared: Arc<Shared>,
    handle: JoinHandle<DecodeLoop>,
    reader: FrameReader,
}

fn produce(mut decode_loop: DecodeLoop, shared: Arc<Shared>, poll: Duration) -> DecodeLoop {
    loop {
        {
            let mut slot = shared.lock();
            if slot.stopped {
                break;
            }
            slot.in_use = true;
        }

        let result = decode_loop.read_frame();

        let persistent = {
            let mut slot = shared.lock();
            slot.in_use = false;
            if slot.stopped {
                break;
            }
            let persistent = match result {
                Ok(frame) => {
                    slot.frame = Some(frame);
                    slot.seq += 1;
                    false
                }
                Err(ReadError::Transient) => false,
                Err(e) => {
                    error!("Decode thread stopping: {}", e);
                    slot.failure = Some(e);
                    true
                }
            };
            shared.cond.notify_all();
            persistent
        };

        if persistent {
            break;
        }
        thread::sleep(poll);
    }
    decode_loop
}

/// Source and decoder pair behind a delivery policy
pub struct FrameDeliveryEngine {
    policy: DeliveryPolicy,
    state: EngineState,
    decode_loop: Option<DecodeLoop>,
    worker: Option<Worker>,
    params: Option<MediaParameters>,
    step: Arc<AtomicU32>,
    position: Arc<AtomicI64>,
    stop: Arc<AtomicBool>,
    stats: Arc<DeliveryStats>,
    poll: Duration,
    span: Span,
}

impl FrameDeliveryEngine {
    pub fn new(
        source: Box<dyn PacketReader>,
        decoder: Box<dyn FrameDecoder>,
        policy: DeliveryPolicy,
        config: &PipelineConfig,
        parent: &Span,
    ) -> Self {
        let step = Arc::new(AtomicU32::new(1));
        let position = Arc::new(AtomicI64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(DeliveryStats::default());

        Self {
            policy,
            state: EngineState::Closed,
            decode_loop: Some(DecodeLoop {
                source,
                decoder,
                step: step.clone(),
                position: position.clone(),
                stop: stop.clone(),
                read_all: policy == DeliveryPolicy::Drop,
                first_read: true,
                failed_reads: 0,
                warmup_retries: config.warmup_retries,
                read_retries: config.read_retries,
                max_failed_reads: config.max_failed_reads,
                stats: stats.clone(),
            }),
            worker: None,
            params: None,
            step,
            position,
            stop,
            stats,
            poll: config.drop_poll(),
            span: info_span!(parent: parent, "delivery", policy = ?policy),
        }
    }

    /// Open the source, then the decoder; on decoder failure the source is closed again
    pub fn open(&mut self, url: &str) -> Result<MediaParameters, OpenError> {
        self.close();
        let span = self.span.clone();
        let _enter = span.enter();
        let decode_loop = self
            .decode_loop
            .as_mut()
            .ok_or_else(|| OpenError::Pipeline("decode loop unavailable".into()))?;

        self.state = EngineState::Opening;
        let params = match decode_loop.source.open(url) {
            Ok(params) => params,
            Err(e) => {
                self.state = EngineState::Closed;
                return Err(e);
            }
        };
        if let Err(e) = decode_loop.decoder.open(&params) {
            decode_loop.source.close();
            self.state = EngineState::Closed;
            return Err(e);
        }
        decode_loop.first_read = true;
        decode_loop.failed_reads = 0;
        self.stop.store(false, Ordering::Release);
        info!(
            "Opened {} with decoder {} ({:?})",
            url,
            decode_loop.decoder.name(),
            self.policy
        );

        if self.policy == DeliveryPolicy::Drop {
            if let Err(e) = self.spawn_worker() {
                if let Some(decode_loop) = self.decode_loop.as_mut() {
                    decode_loop.close();
                }
                self.state = EngineState::Closed;
                return Err(e);
            }
        }

        self.params = Some(params);
        self.state = EngineState::Open;
        Ok(params)
    }

    fn spawn_worker(&mut self) -> Result<(), OpenError> {
        let decode_loop = self
            .decode_loop
            .take()
            .ok_or_else(|| OpenError::Pipeline("decode loop unavailable".into()))?;
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                frame: None,
                seq: 0,
                in_use: false,
                stopped: false,
                failure: None,
            }),
            cond: Condvar::new(),
        });

        let span = self.span.clone();
        let poll = self.poll;
        let worker_shared = shared.clone();
        // A failed spawn drops the closure and the decode loop with it
        let handle = thread::Builder::new()
            .name("vidrelay-decode".into())
            .spawn(move || {
                let _enter = span.enter();
                debug!("Decode thread started");
                produce(decode_loop, worker_shared, poll)
            })?;

        self.worker = Some(Worker {
            reader: FrameReader {
                shared: shared.clone(),
                stats: self.stats.clone(),
                last_seen: 0,
            },
            shared,
            handle,
        });
        Ok(())
    }

    /// Next frame according to the policy
    pub fn read(&mut self) -> Result<Frame, ReadError> {
        if self.state != EngineState::Open {
            return Err(ReadError::Closed);
        }
        if let Some(worker) = self.worker.as_mut() {
            return worker.reader.read();
        }
        let decode_loop = self.decode_loop.as_mut().ok_or(ReadError::Closed)?;
        let result = decode_loop.read_frame();
        match &result {
            Ok(_) => self.stats.record_delivered(),
            Err(ReadError::Persistent(msg)) => {
                let _enter = self.span.enter();
                warn!("Source lost: {}", msg);
            }
            Err(_) => {}
        }
        result
    }

    /// Additional independent reader; only available with the Drop policy while open
    pub fn reader(&self) -> Option<FrameReader> {
        self.worker.as_ref().map(|w| FrameReader {
            last_seen: 0,
            ..w.reader.clone()
        })
    }

    pub fn close(&mut self) {
        if self.state == EngineState::Closed && self.worker.is_none() {
            return;
        }
        let _enter = self.span.enter();

        if let Some(worker) = self.worker.take() {
            self.stop.store(true, Ordering::Release);
            worker.shared.lock().stopped = true;
            worker.shared.cond.notify_all();
            match worker.handle.join() {
                Ok(decode_loop) => self.decode_loop = Some(decode_loop),
                Err(_) => error!("Decode thread panicked"),
            }
        }
        if let Some(decode_loop) = self.decode_loop.as_mut() {
            decode_loop.close();
        }
        self.state = EngineState::Closed;
        info!("Delivery closed");
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == EngineState::Open
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    pub fn parameters(&self) -> Option<MediaParameters> {
        self.params
    }

    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Relaxed)
    }

    pub fn step(&self) -> u32 {
        self.step.load(Ordering::Relaxed)
    }

    pub fn set_step(&self, step: u32) {
        self.step.store(step.max(1), Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for FrameDeliveryEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PacketError;
    use crate::stream::{CompressedPacket, VideoCodec};
    use std::collections::VecDeque;

    fn params() -> MediaParameters {
        MediaParameters {
            width: 2,
            height: 2,
            fps_num: 25,
            fps_den: 1,
            codec: VideoCodec::H264,
        }
    }

    /// Endless source; fails once `fail_after` packets have been read
    struct ScriptedSource {
        packet: CompressedPacket,
        read: u64,
        fail_after: Option<u64>,
        closed: Arc<AtomicU32>,
    }

    impl PacketReader for ScriptedSource {
        fn open(&mut self, _: &str) -> Result<MediaParameters, OpenError> {
            Ok(params())
        }
        fn read_packet(&mut self, step: u32) -> Result<&CompressedPacket, PacketError> {
            self.read += step.max(1) as u64;
            if self.fail_after.is_some_and(|n| self.read > n) {
                return Err(PacketError::Read("connection reset".into()));
            }
            self.packet.dts = Some(self.read as i64);
            Ok(&self.packet)
        }
        fn position(&self) -> i64 {
            self.packet.dts.unwrap_or(0)
        }
        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Decoder that follows a script of outcomes, then yields frames forever
    struct ScriptedDecoder {
        script: VecDeque<Result<(), DecodeError>>,
        emitted: u64,
        closed: Arc<AtomicU32>,
    }

    impl FrameDecoder for ScriptedDecoder {
        fn open(&mut self, _: &MediaParameters) -> Result<(), OpenError> {
            Ok(())
        }
        fn decode(&mut self, _: &CompressedPacket, _: bool) -> Result<Frame, DecodeError> {
            self.script.pop_front().unwrap_or(Ok(()))?;
            self.emitted += 1;
            Ok(Frame::bgr(vec![0u8; 12].into(), 2, 2, self.emitted))
        }
        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Decoder that never produces a frame, taking `delay` per packet
    struct StalledDecoder {
        delay: Duration,
    }

    impl FrameDecoder for StalledDecoder {
        fn open(&mut self, _: &MediaParameters) -> Result<(), OpenError> {
            Ok(())
        }
        fn decode(&mut self, _: &CompressedPacket, _: bool) -> Result<Frame, DecodeError> {
            thread::sleep(self.delay);
            Err(DecodeError::WouldBlock)
        }
        fn close(&mut self) {}
        fn name(&self) -> &str {
            "stalled"
        }
    }

    fn engine(
        script: Vec<Result<(), DecodeError>>,
        fail_after: Option<u64>,
        policy: DeliveryPolicy,
    ) -> FrameDeliveryEngine {
        let source = ScriptedSource {
            packet: CompressedPacket::default(),
            read: 0,
            fail_after,
            closed: Arc::default(),
        };
        let decoder = ScriptedDecoder {
            script: script.into(),
            emitted: 0,
            closed: Arc::default(),
        };
        FrameDeliveryEngine::new(
            Box::new(source),
            Box::new(decoder),
            policy,
            &PipelineConfig::default(),
            &Span::none(),
        )
    }

    #[test]
    fn first_read_tolerates_warmup() {
        let script = vec![Err(DecodeError::WouldBlock); 100];
        let mut engine = engine(script, None, DeliveryPolicy::Blocking);
        engine.open("mock://").unwrap();
        let frame = engine.read().unwrap();
        assert_eq!(frame.sequence(), 1);
        assert_eq!(engine.position(), 101);
    }

    #[test]
    fn later_reads_get_three_retries() {
        let mut script = vec![Ok(())];
        script.extend(vec![Err(DecodeError::WouldBlock); 4]);
        let mut engine = engine(script, None, DeliveryPolicy::Blocking);
        engine.open("mock://").unwrap();
        engine.read().unwrap();
        assert_eq!(engine.read().unwrap_err(), ReadError::Transient);
        assert!(engine.read().is_ok());
    }

    #[test]
    fn repeated_failures_become_persistent() {
        let mut script = vec![Ok(())];
        script.extend(vec![Err(DecodeError::Corrupt("bad".into())); 26 * 4]);
        let mut engine = engine(script, None, DeliveryPolicy::Blocking);
        engine.open("mock://").unwrap();
        engine.read().unwrap();
        for _ in 0..25 {
            assert_eq!(engine.read().unwrap_err(), ReadError::Transient);
        }
        assert!(matches!(engine.read(), Err(ReadError::Persistent(_))));
        assert_eq!(engine.stats().decode_failures, 26 * 4);
    }

    #[test]
    fn source_failure_is_persistent() {
        let mut engine = engine(vec![], Some(1), DeliveryPolicy::Blocking);
        engine.open("mock://").unwrap();
        engine.read().unwrap();
        assert!(matches!(engine.read(), Err(ReadError::Persistent(_))));
    }

    #[test]
    fn read_before_open_is_closed() {
        let mut engine = engine(vec![], None, DeliveryPolicy::Blocking);
        assert_eq!(engine.read().unwrap_err(), ReadError::Closed);
    }

    #[test]
    fn step_skips_packets() {
        let mut engine = engine(vec![], None, DeliveryPolicy::Blocking);
        engine.open("mock://").unwrap();
        engine.set_step(5);
        engine.read().unwrap();
        assert_eq!(engine.position(), 5);
        engine.set_step(0);
        assert_eq!(engine.step(), 1);
    }

    #[test]
    fn drop_policy_never_repeats_a_frame() {
        let mut engine = engine(vec![], None, DeliveryPolicy::Drop);
        engine.open("mock://").unwrap();

        let mut last = 0;
        for _ in 0..20 {
            let frame = engine.read().unwrap();
            assert!(frame.sequence() > last);
            last = frame.sequence();
            thread::sleep(Duration::from_millis(3));
        }
        engine.close();
        let stats = engine.stats();
        assert_eq!(stats.delivered, 20);
        assert!(stats.decoded >= 20);
    }

    #[test]
    fn drop_policy_readers_are_independent() {
        let mut engine = engine(vec![], None, DeliveryPolicy::Drop);
        engine.open("mock://").unwrap();
        let mut a = engine.reader().unwrap();
        let mut b = engine.reader().unwrap();

        let fa = a.read().unwrap();
        let fb = b.read().unwrap();
        assert!(fa.sequence() > 0 && fb.sequence() > 0);
        assert!(a.read().unwrap().sequence() > fa.sequence());
        engine.close();
        assert_eq!(a.read().unwrap_err(), ReadError::Closed);
    }

    #[test]
    fn drop_policy_reports_source_loss() {
        let mut engine = engine(vec![], Some(3), DeliveryPolicy::Drop);
        engine.open("mock://").unwrap();
        let err = loop {
            match engine.read() {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ReadError::Persistent(_)));
    }

    #[test]
    fn close_closes_decoder_and_source_once() {
        let source_closed = Arc::new(AtomicU32::new(0));
        let decoder_closed = Arc::new(AtomicU32::new(0));
        let mut engine = FrameDeliveryEngine::new(
            Box::new(ScriptedSource {
                packet: CompressedPacket::default(),
                read: 0,
                fail_after: None,
                closed: source_closed.clone(),
            }),
            Box::new(ScriptedDecoder {
                script: VecDeque::new(),
                emitted: 0,
                closed: decoder_closed.clone(),
            }),
            DeliveryPolicy::Drop,
            &PipelineConfig::default(),
            &Span::none(),
        );
        engine.open("mock://").unwrap();
        engine.read().unwrap();
        engine.close();
        engine.close();
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(source_closed.load(Ordering::SeqCst), 1);
        assert_eq!(decoder_closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_interrupts_warmup() {
        let mut engine = FrameDeliveryEngine::new(
            Box::new(ScriptedSource {
                packet: CompressedPacket::default(),
                read: 0,
                fail_after: None,
                closed: Arc::default(),
            }),
            Box::new(StalledDecoder {
                delay: Duration::from_millis(40),
            }),
            DeliveryPolicy::Drop,
            &PipelineConfig::default(),
            &Span::none(),
        );
        engine.open("mock://").unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        engine.close();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(engine.stats().decode_failures, 0);
    }

    #[test]
    fn last_frame_is_delivered_before_source_loss() {
        let mut engine = engine(vec![], Some(3), DeliveryPolicy::Drop);
        engine.open("mock://").unwrap();
        // Let the producer decode all three packets and hit the failure
        thread::sleep(Duration::from_millis(100));

        assert_eq!(engine.read().unwrap().sequence(), 3);
        assert!(matches!(engine.read(), Err(ReadError::Persistent(_))));
    }
}
