//! Chunked message bodies for streamed singleton transfers.
//!
//! A streamed body is an unsized-envelope record followed by chunks, each a
//! multi-byte length and that many payload bytes. A zero length closes the
//! envelope and an end record closes the connection's message sequence:
//!
//! ```text
//! 0x05 | len payload | len payload | ... | 0x00 | 0x07
//! ```
//!
//! [`ChunkedDecoder`] is the sans-io state machine; [`ChunkedReader`] and
//! [`ChunkedWriter`] adapt it to `AsyncRead` and `AsyncWrite`.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{error::DecodeError, mode::expect_record, record, varint};

/// Largest payload a single [`ChunkedWriter`] chunk carries.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Progress through a chunked body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// Awaiting the unsized-envelope record.
    ReadingEnvelopeRecord,
    /// Decoding the next chunk length.
    ReadingChunkSize,
    /// Payload bytes of the current chunk follow.
    ReadingChunk,
    /// The envelope is closed; awaiting the end record.
    EnvelopeEnd,
    /// The body and end record are complete.
    End,
}

/// Sans-io decoder for chunk framing.
///
/// [`decode`](Self::decode) consumes framing bytes only. While the state is
/// [`ChunkState::ReadingChunk`] the caller takes up to
/// [`chunk_remaining`](Self::chunk_remaining) payload bytes itself and
/// reports them with [`consume_payload`](Self::consume_payload).
#[derive(Clone, Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    size: varint::IntDecoder,
    remaining: usize,
    payload_len: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self { Self::new() }
}

impl ChunkedDecoder {
    /// Create a decoder awaiting the envelope record.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ChunkState::ReadingEnvelopeRecord,
            size: varint::IntDecoder::new(),
            remaining: 0,
            payload_len: 0,
        }
    }

    /// Create a decoder for a body whose envelope record was already read.
    #[must_use]
    pub fn after_envelope_record() -> Self {
        Self {
            state: ChunkState::ReadingChunkSize,
            ..Self::new()
        }
    }

    /// Consume framing bytes from the front of `bytes`.
    ///
    /// Returns zero without consuming when the state is
    /// [`ChunkState::ReadingChunk`].
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnexpectedRecord`] for a wrong record tag,
    /// [`DecodeError::InvalidSize`] for a malformed length and
    /// [`DecodeError::AlreadyComplete`] once the end record was decoded.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        let Some(&first) = bytes.first() else {
            return Ok(0);
        };
        match self.state {
            ChunkState::ReadingEnvelopeRecord => {
                self.state = match first {
                    record::UNSIZED_ENVELOPE => ChunkState::ReadingChunkSize,
                    record::END => ChunkState::End,
                    found => {
                        return Err(DecodeError::UnexpectedRecord {
                            found,
                            expected: "unsized envelope",
                        });
                    }
                };
                Ok(1)
            }
            ChunkState::ReadingChunkSize => {
                let consumed = self.size.decode(bytes)?;
                if let Some(size) = self.size.value() {
                    self.size.reset();
                    if size == 0 {
                        self.state = ChunkState::EnvelopeEnd;
                    } else {
                        self.remaining =
                            usize::try_from(size).map_err(|_| DecodeError::InvalidSize)?;
                        self.state = ChunkState::ReadingChunk;
                    }
                }
                Ok(consumed)
            }
            ChunkState::ReadingChunk => Ok(0),
            ChunkState::EnvelopeEnd => {
                expect_record(first, record::END, "end")?;
                self.state = ChunkState::End;
                Ok(1)
            }
            ChunkState::End => Err(DecodeError::AlreadyComplete),
        }
    }

    /// Mark `n` payload bytes of the current chunk as consumed.
    pub fn consume_payload(&mut self, n: usize) {
        debug_assert!(n <= self.remaining, "consumed past the chunk boundary");
        let n = n.min(self.remaining);
        self.remaining -= n;
        self.payload_len += n;
        if self.remaining == 0 && self.state == ChunkState::ReadingChunk {
            self.state = ChunkState::ReadingChunkSize;
        }
    }

    /// Current decoder state.
    #[must_use]
    pub fn state(&self) -> ChunkState { self.state }

    /// Payload bytes left in the current chunk.
    #[must_use]
    pub fn chunk_remaining(&self) -> usize { self.remaining }

    /// Total payload bytes consumed so far.
    #[must_use]
    pub fn payload_len(&self) -> usize { self.payload_len }

    /// Whether the end record has been decoded.
    #[must_use]
    pub fn is_done(&self) -> bool { self.state == ChunkState::End }
}

/// `AsyncRead` adapter that strips chunk framing.
///
/// A single read may return bytes from several chunks, and a single
/// underlying read may carry the tail of one chunk together with the
/// length and payload of the next. Physical end of stream before the end
/// record is an [`io::ErrorKind::UnexpectedEof`] error.
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    decoder: ChunkedDecoder,
    buffer: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl<R> ChunkedReader<R> {
    /// Wrap `inner`, expecting the envelope record first.
    pub fn new(inner: R, buffer_size: usize) -> Self {
        Self::with_decoder(inner, buffer_size, ChunkedDecoder::new())
    }

    /// Wrap `inner` with a decoder in a specific state.
    pub fn with_decoder(inner: R, buffer_size: usize, decoder: ChunkedDecoder) -> Self {
        Self {
            inner,
            decoder,
            buffer: vec![0_u8; buffer_size.max(1)].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    /// Framing state of the body.
    #[must_use]
    pub fn state(&self) -> ChunkState { self.decoder.state() }

    /// Whether the end record has been read.
    #[must_use]
    pub fn is_done(&self) -> bool { self.decoder.is_done() }

    /// Payload bytes delivered so far.
    #[must_use]
    pub fn payload_len(&self) -> usize { self.decoder.payload_len() }

    /// Unwrap, returning bytes read past the end record alongside the
    /// inner stream.
    pub fn into_parts(self) -> (Bytes, R) {
        let leftover = Bytes::copy_from_slice(&self.buffer[self.pos..self.len]);
        (leftover, self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChunkedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let start = out.filled().len();
        while out.remaining() > 0 && !this.decoder.is_done() {
            if this.pos == this.len {
                if out.filled().len() > start {
                    break;
                }
                let mut read_buf = ReadBuf::new(&mut this.buffer);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
                let n = read_buf.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "chunked body ended in state {:?} after {} payload bytes",
                            this.decoder.state(),
                            this.decoder.payload_len()
                        ),
                    )));
                }
                this.pos = 0;
                this.len = n;
            }

            let available = &this.buffer[this.pos..this.len];
            if this.decoder.state() == ChunkState::ReadingChunk {
                let n = available
                    .len()
                    .min(this.decoder.chunk_remaining())
                    .min(out.remaining());
                out.put_slice(&available[..n]);
                this.decoder.consume_payload(n);
                this.pos += n;
            } else {
                let consumed = this
                    .decoder
                    .decode(available)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                this.pos += consumed;
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Idle,
    Open,
    Finished,
}

/// `AsyncWrite` adapter that frames every write as a chunk.
///
/// Each non-empty `write` becomes one chunk with its own length prefix,
/// even a single byte. Payloads above [`MAX_CHUNK_SIZE`] are accepted
/// partially. Shutdown writes the terminator and end record before
/// shutting the inner stream down.
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    inner: W,
    pending: BytesMut,
    state: WriterState,
}

impl<W> ChunkedWriter<W> {
    /// Wrap `inner`; the envelope record is written with the first chunk.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            state: WriterState::Idle,
        }
    }

    fn stage_envelope(&mut self) {
        if self.state == WriterState::Idle {
            self.pending.put_u8(record::UNSIZED_ENVELOPE);
            self.state = WriterState::Open;
        }
    }

    fn stage_terminator(&mut self) {
        if self.state != WriterState::Finished {
            self.stage_envelope();
            self.pending.put_u8(0);
            self.pending.put_u8(record::END);
            self.state = WriterState::Finished;
        }
    }
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending.has_remaining() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Write the terminator and end record, flush, and return the inner
    /// stream without shutting it down.
    ///
    /// # Errors
    ///
    /// Returns any write or flush error from the inner stream.
    pub async fn finish(mut self) -> io::Result<W> {
        self.stage_terminator();
        self.flush().await?;
        Ok(self.inner)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChunkedWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.state == WriterState::Finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "chunked body already finished",
            )));
        }
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(MAX_CHUNK_SIZE);
        let size = u32::try_from(n).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        this.stage_envelope();
        this.pending.reserve(varint::MAX_ENCODED_LEN + n);
        varint::encode(size, &mut this.pending);
        this.pending.put_slice(&buf[..n]);
        // Opportunistic; the staged chunk is already accepted.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stage_terminator();
        ready!(self.poll_drain(cx))?;
        ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Encode `body` as a complete chunked envelope using `chunk_sizes` in
/// turn (the last size repeats), for clients and tests.
///
/// # Examples
///
/// ```
/// use netframing::chunked::encode_body;
///
/// let framed = encode_body(b"abc", &[2]);
/// assert_eq!(&framed[..], &[0x05, 2, b'a', b'b', 1, b'c', 0x00, 0x07]);
/// ```
#[must_use]
pub fn encode_body(body: &[u8], chunk_sizes: &[usize]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 16);
    out.put_u8(record::UNSIZED_ENVELOPE);
    let mut rest = body;
    let mut sizes = chunk_sizes.iter().copied();
    let mut size = sizes.next().unwrap_or(MAX_CHUNK_SIZE).max(1);
    while !rest.is_empty() {
        let n = rest.len().min(size).min(MAX_CHUNK_SIZE);
        let len = u32::try_from(n).unwrap_or(varint::MAX_VALUE);
        varint::encode(len, &mut out);
        out.put_slice(&rest[..n]);
        rest = &rest[n..];
        if let Some(next) = sizes.next() {
            size = next.max(1);
        }
    }
    out.put_u8(0);
    out.put_u8(record::END);
    out.freeze()
}
