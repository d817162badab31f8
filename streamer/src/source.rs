//! Byte sources the worker can read from.
//!
//! Anything shaped like `Stream<Item = Result<Bytes, E>>` works directly,
//! which covers `reqwest::Response::bytes_stream()`. Plain async readers
//! (sockets, files, pipes) go through [`from_reader`].

use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Read size for reader-backed sources.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Adapt an `AsyncRead` into a chunk stream. A zero-length read ends it.
pub fn from_reader<R: AsyncRead>(reader: R) -> ReaderStream<R> {
    ReaderStream::with_capacity(reader, READ_CHUNK_SIZE)
}
