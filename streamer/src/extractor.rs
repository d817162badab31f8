use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::StreamerError;

/// JPEG start-of-image marker.
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
const EOI: [u8; 2] = [0xFF, 0xD9];

const INITIAL_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub frames: u64,
    /// Preamble, multipart boundary text and dropped oversized frames.
    pub discarded_bytes: u64,
    /// Total bytes handed to the marker search.
    pub scanned_bytes: u64,
}

/// Incremental SOI/EOI demuxer over an append-only byte accumulator.
///
/// Bytes go in at the tail with [`push`](Self::push); complete frames come
/// out of the head with [`next_frame`](Self::next_frame). Scans resume where
/// the previous one gave up, so a frame split across many reads is searched
/// once rather than from the start on every read.
pub struct FrameExtractor {
    buffer: BytesMut,
    /// True once `buffer[0..2]` is an SOI marker.
    in_frame: bool,
    /// Offset into `buffer` where the next marker search starts.
    scan_from: usize,
    max_frame_bytes: usize,
    stats: ExtractorStats,
}

impl FrameExtractor {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_frame_bytes)),
            in_frame: false,
            scan_from: 0,
            max_frame_bytes,
            stats: ExtractorStats::default(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes held but not yet emitted as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ExtractorStats {
        self.stats
    }

    /// Drop everything buffered and forget any partially seen frame.
    pub fn clear(&mut self) {
        self.stats.discarded_bytes += self.buffer.len() as u64;
        self.buffer.clear();
        self.in_frame = false;
        self.scan_from = 0;
    }

    /// Carve the next complete frame out of the accumulator.
    ///
    /// Returns `None` when more data is needed. An oversized frame is
    /// dropped and reported once as [`StreamerError::OversizedFrame`]; the
    /// extractor then resynchronises on the next SOI.
    pub fn next_frame(&mut self) -> Option<Result<Bytes, StreamerError>> {
        if !self.in_frame {
            match self.scan(&SOI) {
                Some(pos) => {
                    self.discard(pos);
                    self.in_frame = true;
                    self.scan_from = SOI.len();
                }
                None => {
                    // Only preamble so far. Hold on to a trailing 0xFF in
                    // case the marker straddles two reads.
                    self.discard(self.buffer.len() - self.trailing_marker_byte());
                    self.scan_from = 0;
                    return None;
                }
            }
        }

        match self.scan(&EOI) {
            Some(pos) => {
                let end = pos + EOI.len();
                self.in_frame = false;
                self.scan_from = 0;
                if end > self.max_frame_bytes {
                    self.discard(end);
                    return Some(Err(self.oversized(end)));
                }
                self.stats.frames += 1;
                Some(Ok(self.buffer.split_to(end).freeze()))
            }
            None if self.buffer.len() > self.max_frame_bytes => {
                let buffered = self.buffer.len();
                self.discard(buffered - self.trailing_marker_byte());
                self.in_frame = false;
                self.scan_from = 0;
                Some(Err(self.oversized(buffered)))
            }
            None => None,
        }
    }

    fn scan(&mut self, marker: &[u8]) -> Option<usize> {
        let start = self.scan_from.min(self.buffer.len());
        let window = &self.buffer[start..];
        self.stats.scanned_bytes += window.len() as u64;
        match find_subsequence(window, marker) {
            Some(pos) => Some(start + pos),
            None => {
                // The last byte may be the first half of a marker.
                self.scan_from = self
                    .buffer
                    .len()
                    .saturating_sub(marker.len() - 1)
                    .max(start);
                None
            }
        }
    }

    fn discard(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        let _ = self.buffer.split_to(len);
        self.stats.discarded_bytes += len as u64;
    }

    fn trailing_marker_byte(&self) -> usize {
        usize::from(self.buffer.last() == Some(&0xFF))
    }

    fn oversized(&self, buffered: usize) -> StreamerError {
        warn!(buffered, limit = self.max_frame_bytes, "dropping oversized frame");
        StreamerError::OversizedFrame {
            buffered,
            limit: self.max_frame_bytes,
        }
    }
}

/// Pulls chunks from a byte source into a [`FrameExtractor`] until a frame
/// is ready, the source ends, or the session is cancelled.
pub struct FrameReader<S> {
    source: S,
    extractor: FrameExtractor,
    cancel: CancellationToken,
    finished: bool,
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(source: S, max_frame_bytes: usize, cancel: CancellationToken) -> Self {
        Self {
            source,
            extractor: FrameExtractor::new(max_frame_bytes),
            cancel,
            finished: false,
        }
    }

    /// Next frame, or `None` once the source is closed or cancelled.
    ///
    /// A transport failure is yielded once as `Some(Err(..))`; every call
    /// after that returns `None`.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes, StreamerError>> {
        loop {
            if self.finished || self.cancel.is_cancelled() {
                self.finish();
                return None;
            }

            if let Some(result) = self.extractor.next_frame() {
                return Some(result);
            }

            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.finish();
                    return None;
                }
                chunk = self.source.next() => chunk,
            };

            match chunk {
                Some(Ok(chunk)) if !chunk.is_empty() => self.extractor.push(&chunk),
                Some(Ok(_)) | None => {
                    debug!(buffered = self.extractor.buffered(), "byte source closed");
                    self.finish();
                    return None;
                }
                Some(Err(e)) => {
                    self.finish();
                    return Some(Err(StreamerError::Transport(e.to_string())));
                }
            }
        }
    }

    pub fn stats(&self) -> ExtractorStats {
        self.extractor.stats()
    }

    /// No more frames will be taken; whatever is still buffered counts as
    /// discarded.
    fn finish(&mut self) {
        if !self.finished {
            self.extractor.clear();
            self.finished = true;
        }
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::io;
    use std::time::Duration;

    const LIMIT: usize = 1024 * 1024;

    fn fake_jpeg(fill: u8, len: usize) -> Vec<u8> {
        let mut data = SOI.to_vec();
        data.extend(std::iter::repeat(fill).take(len));
        data.extend_from_slice(&EOI);
        data
    }

    fn multipart(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            out.extend_from_slice(frame);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    fn drain(extractor: &mut FrameExtractor) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(result) = extractor.next_frame() {
            out.push(result.unwrap());
        }
        out
    }

    fn feed_in_chunks(data: &[u8], chunk_size: usize) -> (Vec<Bytes>, ExtractorStats) {
        let mut extractor = FrameExtractor::new(LIMIT);
        let mut frames = Vec::new();
        for chunk in data.chunks(chunk_size) {
            extractor.push(chunk);
            frames.extend(drain(&mut extractor));
        }
        (frames, extractor.stats())
    }

    #[test]
    fn extracts_contiguous_frames_in_order() {
        let frames = vec![fake_jpeg(1, 10), fake_jpeg(2, 3), fake_jpeg(3, 40)];
        let data: Vec<u8> = frames.concat();
        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.push(&data);
        let out = drain(&mut extractor);
        assert_eq!(out.len(), 3);
        for (got, want) in out.iter().zip(&frames) {
            assert_eq!(&got[..], &want[..]);
        }
        assert_eq!(extractor.buffered(), 0);
    }

    #[test]
    fn any_chunking_yields_same_frames() {
        let frames = vec![fake_jpeg(0x10, 25), fake_jpeg(0x20, 1), fake_jpeg(0x30, 60)];
        let data = multipart(&frames);
        for chunk_size in 1..=17 {
            let (out, stats) = feed_in_chunks(&data, chunk_size);
            assert_eq!(out.len(), frames.len(), "chunk size {chunk_size}");
            for (got, want) in out.iter().zip(&frames) {
                assert_eq!(&got[..], &want[..], "chunk size {chunk_size}");
            }
            assert_eq!(stats.frames, 3);
        }
    }

    #[test]
    fn preamble_is_never_part_of_a_frame() {
        let frame = fake_jpeg(7, 12);
        let mut data = b"HTTP boundary junk \xFF\x00 more junk".to_vec();
        data.extend_from_slice(&frame);
        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.push(&data);
        let out = drain(&mut extractor);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..2], &SOI);
        assert_eq!(&out[0][..], &frame[..]);
        assert_eq!(extractor.stats().discarded_bytes, (data.len() - frame.len()) as u64);
    }

    #[test]
    fn preamble_without_soi_is_not_retained() {
        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.push(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        assert!(extractor.next_frame().is_none());
        assert_eq!(extractor.buffered(), 0);

        // A dangling 0xFF could be half of an SOI and must survive.
        extractor.push(&[0x41, 0x42, 0xFF]);
        assert!(extractor.next_frame().is_none());
        assert_eq!(extractor.buffered(), 1);
        extractor.push(&[0xD8, 0x01, 0xFF, 0xD9]);
        let frame = extractor.next_frame().unwrap().unwrap();
        assert_eq!(&frame[..], &[0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
    }

    #[test]
    fn open_frame_waits_for_end_marker() {
        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.push(&[0xFF, 0xD8, 1, 2, 3]);
        assert!(extractor.next_frame().is_none());
        extractor.push(&[4, 5, 6]);
        assert!(extractor.next_frame().is_none());
        extractor.push(&[0xFF]);
        assert!(extractor.next_frame().is_none());
        extractor.push(&[0xD9, 0xFF]);
        let frame = extractor.next_frame().unwrap().unwrap();
        assert_eq!(&frame[..], &[0xFF, 0xD8, 1, 2, 3, 4, 5, 6, 0xFF, 0xD9]);
        assert!(extractor.next_frame().is_none());
    }

    #[test]
    fn minimal_frame_is_four_bytes() {
        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.push(&[0xFF, 0xD8, 0xFF, 0xD9, 0xFF, 0xD8, 0xFF, 0xD9]);
        let out = drain(&mut extractor);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|f| f.len() == 4));
    }

    #[test]
    fn byte_at_a_time_scan_is_linear() {
        let frame = fake_jpeg(0x55, 200_000);
        let (out, stats) = feed_in_chunks(&frame, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), frame.len());
        assert!(
            stats.scanned_bytes < 4 * frame.len() as u64,
            "scanned {} bytes for a {} byte frame",
            stats.scanned_bytes,
            frame.len()
        );
    }

    #[test]
    fn many_small_frames_scan_is_linear() {
        let frames: Vec<Vec<u8>> = (0..2000).map(|i| fake_jpeg((i % 200) as u8, 48)).collect();
        let data = multipart(&frames);
        let (out, stats) = feed_in_chunks(&data, 7);
        assert_eq!(out.len(), 2000);
        assert_eq!(&out[1999][..], &frames[1999][..]);
        assert!(stats.scanned_bytes < 3 * data.len() as u64);
    }

    #[test]
    fn oversized_pending_frame_is_dropped_once() {
        let mut extractor = FrameExtractor::new(16);
        extractor.push(&fake_jpeg(9, 40)[..30]);
        match extractor.next_frame() {
            Some(Err(StreamerError::OversizedFrame { buffered, limit })) => {
                assert_eq!(buffered, 30);
                assert_eq!(limit, 16);
            }
            other => panic!("expected oversized error, got {other:?}"),
        }
        assert!(extractor.next_frame().is_none());

        // Tail of the dropped frame, then a frame that fits.
        let small = fake_jpeg(3, 4);
        extractor.push(&fake_jpeg(9, 40)[30..]);
        extractor.push(&small);
        let frame = extractor.next_frame().unwrap().unwrap();
        assert_eq!(&frame[..], &small[..]);
    }

    #[test]
    fn oversized_complete_frame_is_rejected() {
        let mut extractor = FrameExtractor::new(16);
        let big = fake_jpeg(1, 20);
        let fits = fake_jpeg(2, 12);
        extractor.push(&big);
        extractor.push(&fits);
        assert!(matches!(
            extractor.next_frame(),
            Some(Err(StreamerError::OversizedFrame { .. }))
        ));
        let frame = extractor.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[..], &fits[..]);
    }

    fn chunks(data: &[u8], size: usize) -> Vec<Result<Bytes, io::Error>> {
        data.chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }

    #[tokio::test]
    async fn reader_yields_frames_then_ends() {
        let frames = vec![fake_jpeg(1, 5), fake_jpeg(2, 6)];
        let source = stream::iter(chunks(&multipart(&frames), 3));
        let mut reader = FrameReader::new(source, LIMIT, CancellationToken::new());
        assert_eq!(&reader.next_frame().await.unwrap().unwrap()[..], &frames[0][..]);
        assert_eq!(&reader.next_frame().await.unwrap().unwrap()[..], &frames[1][..]);
        assert!(reader.next_frame().await.is_none());
        assert!(reader.next_frame().await.is_none());
        assert_eq!(reader.stats().frames, 2);
    }

    #[tokio::test]
    async fn reader_reports_transport_error_once() {
        let mut items = chunks(&fake_jpeg(1, 5), 64);
        items.push(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")));
        let mut reader = FrameReader::new(stream::iter(items), LIMIT, CancellationToken::new());
        assert!(reader.next_frame().await.unwrap().is_ok());
        match reader.next_frame().await {
            Some(Err(StreamerError::Transport(msg))) => assert!(msg.contains("reset by peer")),
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(reader.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn empty_read_closes_the_stream() {
        let items: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(fake_jpeg(1, 5))),
            Ok(Bytes::new()),
            Ok(Bytes::from(fake_jpeg(2, 5))),
        ];
        let mut reader = FrameReader::new(stream::iter(items), LIMIT, CancellationToken::new());
        assert!(reader.next_frame().await.unwrap().is_ok());
        assert!(reader.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn cancel_aborts_a_pending_read() {
        let cancel = CancellationToken::new();
        let source = stream::pending::<Result<Bytes, io::Error>>();
        let mut reader = FrameReader::new(source, LIMIT, cancel.clone());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), reader.next_frame()).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn cancelled_reader_emits_nothing_buffered() {
        let cancel = CancellationToken::new();
        let data = [fake_jpeg(1, 5), fake_jpeg(2, 5)].concat();
        let source = stream::iter(vec![Ok::<_, io::Error>(Bytes::from(data))]);
        let mut reader = FrameReader::new(source, LIMIT, cancel.clone());
        assert!(reader.next_frame().await.unwrap().is_ok());
        cancel.cancel();
        assert!(reader.next_frame().await.is_none());
        // The second frame was already buffered and is released unread.
        assert_eq!(reader.stats().frames, 1);
        assert_eq!(reader.stats().discarded_bytes, 9);
    }

    #[tokio::test]
    async fn truncated_frame_at_close_counts_as_discarded() {
        let mut data = b"--frame\r\n\r\n".to_vec();
        let preamble = data.len() as u64;
        data.extend_from_slice(&fake_jpeg(1, 5));
        data.extend_from_slice(&fake_jpeg(2, 20)[..10]);
        let source = stream::iter(chunks(&data, 4));
        let mut reader = FrameReader::new(source, LIMIT, CancellationToken::new());
        assert!(reader.next_frame().await.unwrap().is_ok());
        assert!(reader.next_frame().await.is_none());
        assert_eq!(reader.stats().discarded_bytes, preamble + 10);
        assert!(reader.next_frame().await.is_none());
        assert_eq!(reader.stats().discarded_bytes, preamble + 10);
    }

    #[test]
    fn clear_drops_a_partial_frame() {
        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.push(&fake_jpeg(3, 40)[..30]);
        assert!(extractor.next_frame().is_none());
        extractor.clear();
        assert_eq!(extractor.buffered(), 0);
        assert_eq!(extractor.stats().discarded_bytes, 30);

        // A fresh frame after the clear is found from scratch.
        let frame = fake_jpeg(4, 6);
        extractor.push(&frame);
        assert_eq!(&extractor.next_frame().unwrap().unwrap()[..], &frame[..]);
    }
}
