//! vidrelay: capture or receive video, re-encode it and push it to an RTSP server

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, info_span, warn, Span};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

use vidrelay::capture::{Capture, CaptureProp, Frame, SourceType};
use vidrelay::{utils, Config, OutboundPublisher, ReadError};

#[derive(Parser, Debug)]
#[command(version, about = "Push a camera, file or stream to an RTSP server")]
struct Args {
    /// Source: device path or index, file, rtsp:// or rtmp:// URL; "" auto-detects a camera
    #[arg(short, long)]
    source: Option<String>,

    /// Destination URL (rtsp://, rtmp:// or a file path)
    #[arg(short, long, default_value = "rtsp://127.0.0.1:8554/stream/test")]
    dest: String,

    /// Target bitrate in kbit/s
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Frame rate used when the source does not report one
    #[arg(short, long, default_value_t = 30)]
    fps: u32,

    /// Camera delivers MJPEG (otherwise YUYV)
    #[arg(short, long)]
    compressed: bool,

    /// Encoder element name
    #[arg(short, long)]
    encoder: Option<String>,

    /// Show pushed frames in a window
    #[arg(long)]
    show: bool,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Deliver only the newest decoded frame of network streams
    #[arg(long)]
    drop_frames: bool,

    /// Decoder element name, or "auto"
    #[arg(long)]
    decoder: Option<String>,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vidrelay=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(uptime())
        .init();
}

/// Merge command line options over the loaded configuration
fn apply_args(config: &mut Config, args: &Args) -> Result<()> {
    let source = &mut config.source;
    match args.source.as_deref() {
        Some(s) if !s.is_empty() => source.url = s.to_string(),
        None if !source.url.is_empty() => {}
        _ => {
            let device = utils::auto_detect_device()?;
            info!("Using capture device: {:?}", device);
            source.url = device.path;
        }
    }

    if source.url.chars().all(|c| c.is_ascii_digit()) {
        source.url = format!("/dev/video{}", source.url);
    }
    if source.url.starts_with("/dev/video") {
        source.source_type = if args.compressed {
            SourceType::Jpeg
        } else {
            SourceType::Yuyv
        };
    }
    source.drop_frames |= args.drop_frames;
    if let Some(decoder) = &args.decoder {
        source.decoder = decoder.clone();
    }

    let publisher = &mut config.publisher;
    publisher.url = args.dest.clone();
    if let Some(bitrate) = args.bitrate {
        publisher.bitrate_kbps = bitrate;
    }
    if args.encoder.is_some() {
        publisher.encoder = args.encoder.clone();
    }
    Ok(())
}

/// Read, push and optionally preview until the source ends or `running` is cleared
fn relay(
    config: Config,
    default_fps: u32,
    running: Arc<AtomicBool>,
    preview: Option<flume::Sender<Frame>>,
    span: Span,
) -> Result<()> {
    let _enter = span.enter();
    let mut capture = Capture::from_config(&config.source, &config.pipeline, &span)?;
    if !capture.is_opened() {
        return Err(eyre!("Cannot open {}", config.source.url));
    }

    let fps = match capture.get(CaptureProp::Fps) {
        f if f >= 1.0 => f.round() as u32,
        _ => default_fps.max(1),
    };
    // Size comes from the first frame; some sources only know it then
    let first = loop {
        match capture.read() {
            Ok(frame) => break frame,
            Err(ReadError::Transient) if running.load(Ordering::Acquire) => continue,
            Err(e) => return Err(eyre!("Failed to read first frame: {}", e)),
        }
    };

    let mut publisher_config = config.publisher.clone();
    publisher_config.fps = fps;
    let mut publisher = OutboundPublisher::open(
        &publisher_config.url,
        first.width(),
        first.height(),
        &publisher_config,
        &span,
    )?;
    publisher.start()?;

    let frame_interval = Duration::from_secs(1) / fps;
    info!("fps: {}, delay: {:?}", fps, frame_interval);
    info!("Start push");

    let mut next = Some(first);
    let mut pushed: u64 = 0;
    while running.load(Ordering::Acquire) {
        let started = Instant::now();
        let frame = match next.take() {
            Some(frame) => frame,
            None => match capture.read() {
                Ok(frame) => frame,
                Err(ReadError::Transient) => continue,
                Err(e) => {
                    warn!("Failed to read frame: {}", e);
                    break;
                }
            },
        };

        if let Some(tx) = &preview {
            if tx.is_disconnected() {
                info!("Preview closed");
                break;
            }
            let _ = tx.try_send(frame.clone());
        }
        publisher.push(frame);
        pushed += 1;

        if let Some(rest) = frame_interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    publisher.stop();
    capture.release();
    info!("Pushed {} frames", pushed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    info!("vidrelay launching...");

    let mut config = Config::load(args.config.as_deref())?;
    apply_args(&mut config, &args)?;
    info!("Relaying {} -> {}", config.source.url, config.publisher.url);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                running.store(false, Ordering::Release);
            }
        });
    }

    let span = info_span!("vidrelay");
    let (preview_tx, preview_rx) = if args.show {
        let (tx, rx) = flume::bounded::<Frame>(2);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let relay_running = running.clone();
    let default_fps = args.fps;
    let relay_handle = tokio::task::spawn_blocking(move || {
        relay(config, default_fps, relay_running, preview_tx, span)
    });

    if let Some(rx) = preview_rx {
        let shown = show(rx);
        running.store(false, Ordering::Release);
        shown?;
    }

    match relay_handle.await? {
        Ok(()) => info!("vidrelay shutting down"),
        Err(e) => {
            error!("Relay failed: {}", e);
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(feature = "preview")]
fn show(rx: flume::Receiver<Frame>) -> Result<()> {
    use vidrelay::display::Sdl2Display;

    // Initialize SDL2
    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut app = Sdl2Display::new(&sdl_context, "vidrelay", 1280, 720)?;
    app.run(&sdl_context, rx)
}

#[cfg(not(feature = "preview"))]
fn show(_rx: flume::Receiver<Frame>) -> Result<()> {
    Err(eyre!("--show requires the `preview` feature"))
}
