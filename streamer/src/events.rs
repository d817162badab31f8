use camwatch_common::frame::RawFrame;
use tokio::sync::mpsc;

use crate::session::SessionSummary;
use crate::StreamerError;

/// Per-frame detector output, reported whether or not motion fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetrics {
    pub ratio: f32,
    pub changed_pixels: u32,
    pub total_pixels: u32,
}

/// Subscriber interface for a streaming session.
///
/// All callbacks run on the session worker, in this order for each frame:
/// `on_frame`, then `on_metrics` once the frame decoded, then `on_motion`
/// if it fired. A frame that fails to decode gets `on_frame` and
/// `on_error` only. Implementations that drive a UI should hand the work
/// off rather than block here, since the worker waits on every callback.
pub trait StreamEvents: Send + Sync {
    fn on_frame(&self, _frame: &RawFrame) {}

    fn on_metrics(&self, _metrics: &FrameMetrics) {}

    fn on_motion(&self) {}

    /// Decode failures and oversized frames are non-fatal; a transport
    /// error is the last callback before `on_session_end`.
    fn on_error(&self, _error: &StreamerError) {}

    /// Fires exactly once per session, after everything else it produced.
    fn on_session_end(&self, _summary: &SessionSummary) {}
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(RawFrame),
    Metrics(FrameMetrics),
    Motion,
    Error { message: String, fatal: bool },
    SessionEnded(SessionSummary),
}

/// Forwards every callback into an unbounded channel as a [`StreamEvent`],
/// preserving order.
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: StreamEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl StreamEvents for ChannelEvents {
    fn on_frame(&self, frame: &RawFrame) {
        self.send(StreamEvent::Frame(frame.clone()));
    }

    fn on_metrics(&self, metrics: &FrameMetrics) {
        self.send(StreamEvent::Metrics(*metrics));
    }

    fn on_motion(&self) {
        self.send(StreamEvent::Motion);
    }

    fn on_error(&self, error: &StreamerError) {
        self.send(StreamEvent::Error {
            message: error.to_string(),
            fatal: error.is_fatal(),
        });
    }

    fn on_session_end(&self, summary: &SessionSummary) {
        self.send(StreamEvent::SessionEnded(summary.clone()));
    }
}
