use std::io::Write;

use vidrelay::{Config, SourceType};

#[test]
fn defaults_without_file() {
    let config = Config::load(None).unwrap();
    assert_eq!(config.source.url, "/dev/video0");
    assert_eq!(config.source.reopen_times, -1);
    assert_eq!(config.pipeline.warmup_retries, 100);
    assert_eq!(config.pipeline.read_retries, 3);
    assert_eq!(config.publisher.queue_capacity, 256);
    assert_eq!(config.publisher.max_write_retries, 5);
}

#[test]
fn file_then_environment_override_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[source]
url = "rtsp://camera.local/main"
source_type = "stream"
drop_frames = true

[source.roi]
x = 10
y = 20
width = 320
height = 240

[publisher]
url = "rtsp://127.0.0.1:8554/out"
bitrate_kbps = 800
"#
    )
    .unwrap();

    std::env::set_var("VIDRELAY__PIPELINE__DECODE_WAIT_MS", "80");
    let config = Config::load(Some(file.path())).unwrap();
    std::env::remove_var("VIDRELAY__PIPELINE__DECODE_WAIT_MS");

    assert_eq!(config.source.url, "rtsp://camera.local/main");
    assert_eq!(config.source.source_type, SourceType::Stream);
    assert!(config.source.drop_frames);
    assert_eq!(config.source.roi.map(|r| r.area()), Some(320 * 240));
    assert_eq!(config.publisher.bitrate_kbps, 800);
    // Untouched keys keep their defaults
    assert_eq!(config.publisher.gop, 30);
    assert_eq!(config.pipeline.decode_wait_ms, 80);
}
