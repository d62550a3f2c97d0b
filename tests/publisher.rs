use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::Span;

use vidrelay::codec::{EncodedPacket, FrameEncoder};
use vidrelay::error::{EncodeError, OpenError, PublishError, WriteError};
use vidrelay::publish::{ConnectionState, OutboundPublisher, PacketSink};
use vidrelay::{Frame, PublisherConfig};

/// One packet per frame, stamped with the frame index
struct PassThroughEncoder;

impl FrameEncoder for PassThroughEncoder {
    fn encode(&mut self, _: &Frame, index: i64) -> Result<Option<EncodedPacket>, EncodeError> {
        Ok(Some(EncodedPacket {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            pts: index,
            dts: index,
            key_frame: index == 0,
        }))
    }

    fn finish(&mut self) -> Vec<EncodedPacket> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

#[derive(Default)]
struct SinkLog {
    written: Vec<EncodedPacket>,
    attempts: u32,
    closed: u32,
}

enum Behaviour {
    Accept,
    SlowConnect(Duration),
    RefuseConnect,
    FailWrites,
}

struct ScriptedSink {
    behaviour: Behaviour,
    log: Arc<Mutex<SinkLog>>,
}

impl PacketSink for ScriptedSink {
    fn connect(&mut self, _: Option<Duration>) -> Result<(), OpenError> {
        match self.behaviour {
            Behaviour::SlowConnect(delay) => {
                thread::sleep(delay);
                Ok(())
            }
            Behaviour::RefuseConnect => Err(OpenError::Connect {
                url: "rtsp://mock/out".into(),
                reason: "connection refused".into(),
            }),
            _ => Ok(()),
        }
    }

    fn write(&mut self, packet: &EncodedPacket) -> Result<(), WriteError> {
        let mut log = self.log.lock().unwrap();
        log.attempts += 1;
        match self.behaviour {
            Behaviour::FailWrites => Err(WriteError("broken pipe".into())),
            _ => {
                log.written.push(packet.clone());
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed += 1;
    }
}

fn publisher(
    behaviour: Behaviour,
    config: &PublisherConfig,
) -> (OutboundPublisher, Arc<Mutex<SinkLog>>) {
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let sink = ScriptedSink {
        behaviour,
        log: log.clone(),
    };
    let publisher = OutboundPublisher::with_parts(
        "rtsp://mock/out",
        Box::new(PassThroughEncoder),
        Box::new(sink),
        config,
        Span::none(),
    );
    (publisher, log)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn pushed_frames_are_written_in_order() {
    let (mut publisher, log) = publisher(Behaviour::Accept, &PublisherConfig::default());
    publisher.start().unwrap();
    assert!(publisher.is_connected());

    for _ in 0..3 {
        assert!(publisher.push(Frame::filled(4, 4, [0, 0, 255])));
    }
    assert!(wait_until(Duration::from_secs(2), || {
        log.lock().unwrap().written.len() == 3
    }));
    publisher.stop();

    let log = log.lock().unwrap();
    // 25 fps on a 90 kHz clock
    let dts: Vec<i64> = log.written.iter().map(|p| p.dts).collect();
    assert_eq!(dts, vec![0, 3600, 7200]);
    assert!(log.written[0].key_frame);
    assert_eq!(log.closed, 1);
}

#[test]
fn start_twice_is_rejected() {
    let (mut publisher, _log) = publisher(Behaviour::Accept, &PublisherConfig::default());
    publisher.start().unwrap();
    assert!(matches!(
        publisher.start(),
        Err(PublishError::AlreadyStarted)
    ));
}

#[test]
fn slow_connection_times_out() {
    let config = PublisherConfig {
        connect_timeout_ms: Some(50),
        ..PublisherConfig::default()
    };
    let (mut publisher, _log) = publisher(Behaviour::SlowConnect(Duration::from_millis(300)), &config);
    let started = Instant::now();
    match publisher.start() {
        Err(PublishError::ConnectTimeout { after, .. }) => {
            assert_eq!(after, Duration::from_millis(50))
        }
        other => panic!("expected a connect timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(!publisher.push(Frame::filled(4, 4, [0, 0, 0])));
}

#[test]
fn late_connection_after_timeout_stays_failed() {
    let config = PublisherConfig {
        connect_timeout_ms: Some(30),
        ..PublisherConfig::default()
    };
    let (mut publisher, log) = publisher(Behaviour::SlowConnect(Duration::from_millis(150)), &config);
    assert!(matches!(
        publisher.start(),
        Err(PublishError::ConnectTimeout { .. })
    ));
    assert_eq!(publisher.state(), ConnectionState::Failed);

    // The sink finishes connecting long after start() gave up
    thread::sleep(Duration::from_millis(300));
    assert!(!publisher.is_connected());
    assert_eq!(publisher.state(), ConnectionState::Failed);
    assert_eq!(log.lock().unwrap().closed, 1);
    publisher.stop();
    assert_eq!(log.lock().unwrap().attempts, 0);
}

#[test]
fn refused_connection_fails_start_and_drops_pushes() {
    let (mut publisher, log) = publisher(Behaviour::RefuseConnect, &PublisherConfig::default());
    assert!(matches!(
        publisher.start(),
        Err(PublishError::ConnectFailed { .. })
    ));
    assert_eq!(publisher.state(), ConnectionState::Failed);
    assert!(!publisher.push(Frame::filled(4, 4, [0, 0, 0])));
    publisher.stop();
    assert_eq!(log.lock().unwrap().attempts, 0);
}

#[test]
fn repeated_write_failures_mark_the_connection_failed() {
    let config = PublisherConfig {
        max_write_retries: 5,
        ..PublisherConfig::default()
    };
    let (mut publisher, log) = publisher(Behaviour::FailWrites, &config);
    publisher.start().unwrap();

    for _ in 0..6 {
        assert!(publisher.push(Frame::filled(4, 4, [0, 255, 0])));
    }
    assert!(wait_until(Duration::from_secs(2), || {
        publisher.state() == ConnectionState::Failed
    }));
    assert_eq!(log.lock().unwrap().attempts, 6);
    assert!(!publisher.push(Frame::filled(4, 4, [0, 255, 0])));

    publisher.stop();
    assert_eq!(log.lock().unwrap().closed, 1);
}
