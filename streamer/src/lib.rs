//! MJPEG ingest core: carves JPEG frames out of a camera byte stream,
//! downscales each one and runs frame-to-frame motion detection on a
//! single background worker per session.
//!
//! The caller owns the transport. Hand [`MjpegStreamer::start`] anything
//! that yields `Result<Bytes, E>` chunks (a `reqwest` body stream, or an
//! `AsyncRead` wrapped with [`source::from_reader`]) and subscribe through
//! [`StreamEvents`].

pub mod downscale;
pub mod events;
pub mod extractor;
pub mod motion;
pub mod session;
pub mod source;

pub use camwatch_common::frame::RawFrame;
pub use downscale::{DownscaledRaster, Downscaler};
pub use events::{ChannelEvents, FrameMetrics, StreamEvent, StreamEvents};
pub use extractor::{ExtractorStats, FrameExtractor, FrameReader};
pub use motion::{Detection, MotionDetector};
pub use session::{MjpegStreamer, SessionEnd, SessionSummary};

#[derive(Debug, thiserror::Error)]
pub enum StreamerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode JPEG frame: {0}")]
    Decode(String),
    #[error("pending frame exceeded {limit} bytes without an end marker ({buffered} buffered)")]
    OversizedFrame { buffered: usize, limit: usize },
}

impl StreamerError {
    /// Transport failures end the session; everything else only costs one frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamerError::Transport(_))
    }
}
