//! Connection abstraction and the budgeted preamble reader.
//!
//! Any `AsyncRead + AsyncWrite` stream can serve as a [`Connection`]. While
//! a preamble is decoded the connection is owned by a [`PreambleReader`],
//! which pairs it with a fixed-size read buffer and a deadline: every read
//! and write is issued with whatever remains of the stage budget rather
//! than a fresh per-call timeout.

use std::time::Duration;

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{Instant, timeout_at},
};

use crate::{
    buffer_pool::Pooled,
    error::{DecodeError, FramingError, InvariantViolation, Phase},
    rewind_stream::RewindStream,
};

/// A duplex byte stream the framing layer can drive.
///
/// Implemented for every `AsyncRead + AsyncWrite + Send + Unpin` type,
/// including boxed connections and upgraded wrappers.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection handed between pipeline stages.
pub type BoxConnection = Box<dyn Connection>;

/// Fixed-size read buffer rented from the demultiplexer's buffer pool.
pub type ReadBuffer = Pooled<Box<[u8]>>;

/// Exclusive owner of a connection while its preamble is decoded.
///
/// Bytes are read into a shared buffer; decoders are handed the unread
/// window and report how much they consumed. Consumed bytes are never
/// revisited.
pub struct PreambleReader {
    connection: Option<BoxConnection>,
    buffer: ReadBuffer,
    offset: usize,
    count: usize,
    deadline: Instant,
    budget: Duration,
    bytes_read: usize,
}

impl PreambleReader {
    /// Take ownership of `connection` with a budget starting now.
    pub fn new(connection: BoxConnection, buffer: ReadBuffer, budget: Duration) -> Self {
        Self {
            connection: Some(connection),
            buffer,
            offset: 0,
            count: 0,
            deadline: Instant::now() + budget,
            budget,
            bytes_read: 0,
        }
    }

    /// Restart the time budget from now.
    pub fn reset_budget(&mut self, budget: Duration) {
        self.budget = budget;
        self.deadline = Instant::now() + budget;
    }

    /// Instant at which the current budget runs out.
    #[must_use]
    pub fn deadline(&self) -> Instant { self.deadline }

    /// Budget the current deadline was derived from.
    #[must_use]
    pub fn budget(&self) -> Duration { self.budget }

    /// Buffered bytes not yet consumed by a decoder.
    #[must_use]
    pub fn available(&self) -> &[u8] { &self.buffer[self.offset..self.count] }

    /// Mark `n` buffered bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.count - self.offset, "consumed past buffered bytes");
        self.offset = (self.offset + n).min(self.count);
        if self.offset == self.count {
            self.offset = 0;
            self.count = 0;
        }
    }

    /// Total bytes read from the current connection.
    #[must_use]
    pub fn bytes_read(&self) -> usize { self.bytes_read }

    /// Perform one bounded read into the free tail of the buffer.
    ///
    /// Returns the number of bytes read; zero means end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::Timeout`] when the budget elapses and
    /// [`FramingError::Io`] for transport failures.
    pub async fn fill(&mut self, phase: Phase) -> Result<usize, FramingError> {
        if self.count == self.buffer.len() && self.offset > 0 {
            self.buffer.copy_within(self.offset..self.count, 0);
            self.count -= self.offset;
            self.offset = 0;
        }
        let connection = self
            .connection
            .as_mut()
            .ok_or(InvariantViolation::ConnectionTaken(phase))?;
        let tail = &mut self.buffer[self.count..];
        let n = match timeout_at(self.deadline, connection.read(tail)).await {
            Ok(Ok(n)) => n,
            Ok(Err(source)) => return Err(FramingError::io(phase, source)),
            Err(_) => {
                return Err(FramingError::Timeout {
                    phase,
                    budget: self.budget,
                });
            }
        };
        self.count += n;
        self.bytes_read += n;
        Ok(n)
    }

    /// Run one decoder step, reading more bytes first if none are buffered.
    ///
    /// `progress` is reported in the premature-EOF error when the stream
    /// ends before the step can run.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::PrematureEof`] if the stream ends, or the
    /// mapped decode, timeout or I/O error.
    pub async fn step<F>(
        &mut self,
        phase: Phase,
        progress: usize,
        decode: F,
    ) -> Result<usize, FramingError>
    where
        F: FnOnce(&[u8]) -> Result<usize, DecodeError>,
    {
        if self.available().is_empty() && self.fill(phase).await? == 0 {
            return Err(FramingError::PrematureEof {
                phase,
                bytes_decoded: progress,
            });
        }
        let consumed = decode(self.available()).map_err(|e| FramingError::decode(phase, e))?;
        self.consume(consumed);
        Ok(consumed)
    }

    /// Write `bytes` and flush within the remaining budget.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::Timeout`] or [`FramingError::Io`].
    pub async fn write_all(&mut self, bytes: &[u8], phase: Phase) -> Result<(), FramingError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(InvariantViolation::ConnectionTaken(phase))?;
        let write = async {
            connection.write_all(bytes).await?;
            connection.flush().await
        };
        match timeout_at(self.deadline, write).await {
            Ok(result) => result.map_err(|source| FramingError::io(phase, source)),
            Err(_) => Err(FramingError::Timeout {
                phase,
                budget: self.budget,
            }),
        }
    }

    /// Hand the connection to its next owner, replaying unread bytes first.
    ///
    /// The reader keeps its buffer, now empty, and owns no connection until
    /// [`replace_connection`](Self::replace_connection) is called.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::ConnectionTaken`] if the connection was
    /// already handed off.
    pub fn take_replaying(&mut self, phase: Phase) -> Result<BoxConnection, FramingError> {
        let connection = self
            .connection
            .take()
            .ok_or(InvariantViolation::ConnectionTaken(phase))?;
        let leftover = Bytes::copy_from_slice(self.available());
        self.offset = 0;
        self.count = 0;
        if leftover.is_empty() {
            Ok(connection)
        } else {
            Ok(Box::new(RewindStream::new(leftover, connection)))
        }
    }

    /// Install the connection produced by an upgrade.
    pub fn replace_connection(&mut self, connection: BoxConnection) {
        debug_assert_eq!(self.count, 0, "replaced connection with unread bytes");
        self.connection = Some(connection);
    }

    /// Remove the connection without replaying buffered bytes, e.g. to send
    /// a fault.
    pub fn take_connection(&mut self) -> Option<BoxConnection> { self.connection.take() }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::buffer_pool::ObjectPool;

    fn buffer(size: usize) -> ReadBuffer {
        ObjectPool::new(1, move || vec![0_u8; size].into_boxed_slice()).take()
    }

    #[tokio::test]
    async fn fill_compacts_when_tail_is_full() {
        let (mut peer, conn) = duplex(64);
        peer.write_all(b"abcdef").await.expect("peer write");

        let mut reader = PreambleReader::new(Box::new(conn), buffer(4), Duration::from_secs(1));
        assert_eq!(reader.fill(Phase::Mode).await.expect("fill"), 4);
        reader.consume(3);
        assert_eq!(reader.available(), b"d");
        assert_eq!(reader.fill(Phase::Mode).await.expect("fill"), 2);
        assert_eq!(reader.available(), b"def");
        assert_eq!(reader.bytes_read(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn fill_times_out_against_remaining_budget() {
        let (_peer, conn) = duplex(64);
        let mut reader = PreambleReader::new(Box::new(conn), buffer(8), Duration::from_secs(5));
        let err = reader
            .fill(Phase::SessionPreamble)
            .await
            .expect_err("silent peer must time out");
        assert!(matches!(
            err,
            FramingError::Timeout {
                phase: Phase::SessionPreamble,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn step_reports_premature_eof() {
        let (peer, conn) = duplex(64);
        drop(peer);
        let mut reader = PreambleReader::new(Box::new(conn), buffer(8), Duration::from_secs(1));
        let err = reader
            .step(Phase::SingletonPreamble, 7, |_| Ok(0))
            .await
            .expect_err("eof");
        assert!(matches!(
            err,
            FramingError::PrematureEof {
                bytes_decoded: 7,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn take_replaying_preserves_unread_bytes() {
        let (mut peer, conn) = duplex(64);
        peer.write_all(b"xyz").await.expect("peer write");
        peer.shutdown().await.expect("peer shutdown");

        let mut reader = PreambleReader::new(Box::new(conn), buffer(8), Duration::from_secs(1));
        reader.fill(Phase::Mode).await.expect("fill");
        reader.consume(1);
        let mut handed_off = reader.take_replaying(Phase::Upgrade).expect("connection");
        let mut rest = Vec::new();
        handed_off.read_to_end(&mut rest).await.expect("read");
        assert_eq!(rest, b"yz");
        assert!(reader.take_connection().is_none());
    }
}
