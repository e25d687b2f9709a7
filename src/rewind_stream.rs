//! Connection adapter that replays bytes already pulled off the wire.
//!
//! Preamble decoding reads ahead into a shared buffer. Whatever the decoder
//! did not consume belongs to the next owner of the connection (an upgrade
//! acceptor, a session handler, or the chunked body reader), so the
//! connection is handed over wrapped in a [`RewindStream`] that yields those
//! bytes before delegating to the inner stream.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream adapter that replays buffered bytes before reading from the
/// underlying stream. Writes pass straight through.
#[derive(Debug)]
pub struct RewindStream<S> {
    replay: Bytes,
    inner: S,
}

impl<S> RewindStream<S> {
    /// Wrap `inner`, yielding `replay` first.
    pub fn new(replay: Bytes, inner: S) -> Self { Self { replay, inner } }

    /// Bytes still waiting to be replayed.
    #[must_use]
    pub fn pending_replay(&self) -> &[u8] { &self.replay }

    /// Borrow the wrapped stream.
    pub fn get_ref(&self) -> &S { &self.inner }

    /// Unwrap, returning any unreplayed bytes alongside the inner stream.
    pub fn into_parts(self) -> (Bytes, S) { (self.replay, self.inner) }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.replay.is_empty() {
            let to_copy = self.replay.len().min(buf.remaining());
            buf.put_slice(&self.replay[..to_copy]);
            self.replay.advance(to_copy);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
