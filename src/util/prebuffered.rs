//! A read-ahead buffer for HTTP connections that can be hijacked.
//!
//! [`Prebuffered`] accumulates bytes from an inner reader so that the request
//! header section can be parsed in place. Bytes are only removed from the front
//! when the caller explicitly consumes them. When a connection is handed off to
//! the splicer, [`Prebuffered::into_parts`] returns everything that was read
//! but not consumed, so no byte that arrived past the header terminator is lost.

use bytes::{Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Chunk size used when skipping bytes that were never buffered.
const SKIP_CHUNK: usize = 8 * 1024;

/// A read-ahead wrapper around an `AsyncRead` with a hard size limit.
#[derive(Debug)]
pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    /// Wraps `inner`, buffering at most `max_len` unconsumed bytes.
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Returns true once no more bytes fit into the buffer.
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Drops `n` bytes from the front of the buffer.
    ///
    /// `n` is clamped to the number of buffered bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Reads more data from the inner reader into the buffer.
    ///
    /// Returns the number of bytes added; `0` means the reader hit EOF or the
    /// buffer is full.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let room = self.max_len.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }
        (&mut self.inner)
            .take(room as u64)
            .read_buf(&mut self.buf)
            .await
    }

    /// Consumes `n` bytes, taking them from the buffer first and then reading
    /// and dropping the rest straight from the inner reader.
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the reader ends early.
    pub async fn skip(&mut self, n: u64) -> io::Result<()> {
        let buffered = (self.buf.len() as u64).min(n);
        self.consume(buffered as usize);
        let mut remaining = n - buffered;
        let mut scratch = [0u8; SKIP_CHUNK];
        while remaining > 0 {
            let want = remaining.min(SKIP_CHUNK as u64) as usize;
            let read = self.inner.read(&mut scratch[..want]).await?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            remaining -= read as u64;
        }
        Ok(())
    }

    /// Mutable access to the inner stream, e.g. to write a response.
    ///
    /// Reading from it directly bypasses the buffer.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Splits into the unconsumed bytes and the inner reader.
    pub fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}
