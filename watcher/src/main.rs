mod http;

use camwatch_common::config::{Config, ConfigError, ReconnectConfig};
use camwatch_streamer::{ChannelEvents, MjpegStreamer, SessionEnd, SessionSummary, StreamEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

enum Outcome {
    Ended(SessionSummary),
    Shutdown,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path).map_err(WatchError::from) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        url = config.stream.url,
        raster = format!("{}x{}", config.detector.downscale_width, config.detector.downscale_height),
        ratio = config.detector.difference_threshold_ratio,
        per_channel = config.detector.per_channel_threshold,
        cooldown_ms = config.detector.cooldown_ms,
        "starting camwatch"
    );

    let client = match http::build_client(&config.stream) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let (events, mut rx) = ChannelEvents::new();
    let streamer = MjpegStreamer::new(&config.detector, Arc::new(events));

    run(&client, &config, &streamer, &mut rx).await;

    if let Some(summary) = streamer.stop().await {
        info!(session = summary.session, frames = summary.frames, "stopped");
    }
}

/// Keep a session running against the camera, reconnecting with
/// exponential backoff until Ctrl-C.
async fn run(
    client: &reqwest::Client,
    config: &Config,
    streamer: &MjpegStreamer,
    rx: &mut UnboundedReceiver<StreamEvent>,
) {
    let mut backoff = Backoff::new(&config.reconnect);

    loop {
        info!(url = config.stream.url, "connecting to MJPEG stream");
        match http::open_stream(client, &config.stream.url).await {
            Ok(body) => {
                let session = streamer.start(body).await;
                match watch_session(rx).await {
                    Outcome::Shutdown => {
                        info!(session, "shutdown requested");
                        return;
                    }
                    Outcome::Ended(summary) => {
                        if summary.frames > 0 {
                            backoff.reset();
                        }
                        match summary.end {
                            SessionEnd::TransportFailed => {
                                warn!(session, frames = summary.frames, "stream failed")
                            }
                            _ => info!(session, frames = summary.frames, "stream ended"),
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to open stream");
            }
        }

        let delay = backoff.next_delay();
        info!("reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Log events until the session ends or the user hits Ctrl-C.
async fn watch_session(rx: &mut UnboundedReceiver<StreamEvent>) -> Outcome {
    let mut last_frame_at = None;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Outcome::Shutdown,
            event = rx.recv() => event,
        };

        match event {
            Some(StreamEvent::Frame(frame)) => {
                last_frame_at = Some(frame.captured_at());
            }
            Some(StreamEvent::Metrics(m)) => {
                debug!(
                    ratio = format!("{:.4}", m.ratio),
                    changed = m.changed_pixels,
                    total = m.total_pixels,
                    "metrics"
                );
            }
            Some(StreamEvent::Motion) => match last_frame_at {
                Some(at) => info!(at = %at, "MOTION"),
                None => info!("MOTION"),
            },
            Some(StreamEvent::Error { message, fatal: true }) => {
                error!(error = message, "transport error");
            }
            Some(StreamEvent::Error { message, fatal: false }) => {
                warn!(error = message, "frame skipped");
            }
            Some(StreamEvent::SessionEnded(summary)) => return Outcome::Ended(summary),
            None => return Outcome::Shutdown,
        }
    }
}

struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(config: &ReconnectConfig) -> Self {
        let initial = Duration::from_secs(config.initial_backoff_secs);
        Self {
            initial,
            max: Duration::from_secs(config.max_backoff_secs).max(initial),
            current: initial,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}
