use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One complete JPEG image carved out of an MJPEG stream.
///
/// `data` runs from the SOI marker (`FF D8`) through the EOI marker
/// (`FF D9`) inclusive. Cloning is cheap: the bytes are reference-counted,
/// so the same frame can go to subscribers and to the decoder.
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: Bytes,
    /// Unix millis at the moment the frame was extracted.
    pub captured_at_ms: i64,
    /// Per-session sequence number, starting at 1.
    pub seq: u64,
}

impl RawFrame {
    pub fn new(data: Bytes, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            data,
            captured_at_ms,
            seq,
        }
    }

    /// Stamp a frame with the current wall-clock time.
    pub fn now(data: Bytes, seq: u64) -> Self {
        Self::new(data, Utc::now().timestamp_millis(), seq)
    }

    pub fn jpeg_data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.captured_at_ms).unwrap_or_else(Utc::now)
    }
}
