use bytes::Bytes;
use camwatch_common::config::DetectorConfig;
use camwatch_common::frame::RawFrame;
use futures_util::Stream;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::downscale::Downscaler;
use crate::events::StreamEvents;
use crate::extractor::FrameReader;
use crate::motion::MotionDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The byte source reached end of stream.
    SourceClosed,
    /// `stop`, a restart, or dropping the streamer.
    Cancelled,
    /// The byte source returned an error.
    TransportFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session: u64,
    pub frames: u64,
    pub decoded: u64,
    pub decode_failures: u64,
    pub motion_events: u64,
    pub discarded_bytes: u64,
    pub end: SessionEnd,
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    worker: JoinHandle<SessionSummary>,
}

/// Owns at most one streaming session at a time.
///
/// `start` and `stop` may be called from any task, concurrently with the
/// worker; they are serialized against each other. The detector sits
/// behind its own lock so teardown can clear the baseline while a
/// comparison is in flight.
pub struct MjpegStreamer {
    events: Arc<dyn StreamEvents>,
    detector: Arc<Mutex<MotionDetector>>,
    downscaler: Downscaler,
    max_frame_bytes: usize,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
}

impl MjpegStreamer {
    pub fn new(config: &DetectorConfig, events: Arc<dyn StreamEvents>) -> Self {
        Self {
            events,
            detector: Arc::new(Mutex::new(MotionDetector::new(config))),
            downscaler: Downscaler::new(config.downscale_width, config.downscale_height),
            max_frame_bytes: config.max_frame_bytes,
            session: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Begin reading `source` on a new worker, returning the session id.
    ///
    /// A session that is still running is stopped first, and its worker has
    /// exited before the new one is spawned.
    pub async fn start<S, E>(&self, source: S) -> u64
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.as_mut() {
            info!(session = previous.id, "stopping previous session before restart");
            self.finish(previous).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let worker = Worker {
            id,
            events: Arc::clone(&self.events),
            detector: Arc::clone(&self.detector),
            downscaler: self.downscaler,
            max_frame_bytes: self.max_frame_bytes,
        };
        let handle = tokio::spawn(worker.run(source, cancel.clone()));
        *slot = Some(ActiveSession {
            id,
            cancel,
            worker: handle,
        });

        info!(session = id, "session started");
        id
    }

    /// Cancel the current session, wait for its worker, and drop the
    /// detector baseline. Safe to call repeatedly or before any `start`.
    ///
    /// If this future is dropped before the worker exits, the session stays
    /// in place (already cancelled) and the next `stop` or `start` waits for
    /// it instead.
    pub async fn stop(&self) -> Option<SessionSummary> {
        let mut slot = self.session.lock().await;
        let summary = self.finish(slot.as_mut()?).await;
        *slot = None;
        summary
    }

    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|active| !active.worker.is_finished())
    }

    /// The session must stay in its slot until this returns: there is no
    /// await between the join and the baseline reset.
    async fn finish(&self, active: &mut ActiveSession) -> Option<SessionSummary> {
        active.cancel.cancel();
        let summary = match (&mut active.worker).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(session = active.id, error = %e, "session worker aborted");
                None
            }
        };
        self.detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        debug!(session = active.id, "session released");
        summary
    }
}

impl Drop for MjpegStreamer {
    fn drop(&mut self) {
        if let Some(active) = self.session.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

/// Everything one session's background task needs.
struct Worker {
    id: u64,
    events: Arc<dyn StreamEvents>,
    detector: Arc<Mutex<MotionDetector>>,
    downscaler: Downscaler,
    max_frame_bytes: usize,
}

impl Worker {
    async fn run<S, E>(self, source: S, cancel: CancellationToken) -> SessionSummary
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let mut reader = FrameReader::new(source, self.max_frame_bytes, cancel.clone());
        let mut summary = SessionSummary {
            session: self.id,
            frames: 0,
            decoded: 0,
            decode_failures: 0,
            motion_events: 0,
            discarded_bytes: 0,
            end: SessionEnd::SourceClosed,
        };

        summary.end = loop {
            let data = match reader.next_frame().await {
                Some(Ok(data)) => data,
                Some(Err(e)) if e.is_fatal() => {
                    error!(session = self.id, error = %e, "byte source failed");
                    self.events.on_error(&e);
                    break SessionEnd::TransportFailed;
                }
                Some(Err(e)) => {
                    self.events.on_error(&e);
                    continue;
                }
                None if cancel.is_cancelled() => break SessionEnd::Cancelled,
                None => break SessionEnd::SourceClosed,
            };

            summary.frames += 1;
            let frame = RawFrame::now(data, summary.frames);
            self.process(&frame, &mut summary);
        };
        summary.discarded_bytes = reader.stats().discarded_bytes;

        info!(
            session = self.id,
            frames = summary.frames,
            decode_failures = summary.decode_failures,
            motion_events = summary.motion_events,
            discarded_bytes = summary.discarded_bytes,
            end = ?summary.end,
            "session ended"
        );
        self.events.on_session_end(&summary);
        summary
    }

    fn process(&self, frame: &RawFrame, summary: &mut SessionSummary) {
        debug!(session = self.id, seq = frame.seq, bytes = frame.len(), "frame extracted");
        self.events.on_frame(frame);

        let raster = match self.downscaler.downscale(frame.jpeg_data()) {
            Ok(raster) => raster,
            Err(e) => {
                summary.decode_failures += 1;
                warn!(session = self.id, seq = frame.seq, error = %e, "skipping undecodable frame");
                self.events.on_error(&e);
                return;
            }
        };
        summary.decoded += 1;

        let detection = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluate(raster, Instant::now());

        debug!(
            session = self.id,
            seq = frame.seq,
            ratio = format!("{:.4}", detection.ratio),
            changed = detection.changed_pixels,
            total = detection.total_pixels,
            "frame compared"
        );
        self.events.on_metrics(&detection.metrics());

        if detection.motion_fired {
            summary.motion_events += 1;
            info!(session = self.id, seq = frame.seq, ratio = detection.ratio, "motion detected");
            self.events.on_motion();
        }
    }
}
