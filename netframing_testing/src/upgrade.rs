//! A toy stream upgrade for exercising upgrade chains.
//!
//! The handshake is one key byte from the client, answered with its bitwise
//! complement. Afterwards both sides XOR every byte with the key, so any
//! record read from the wrong layer decodes as garbage.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use async_trait::async_trait;
use netframing::{
    connection::{BoxConnection, Connection},
    upgrade::{SecurityContext, StreamUpgradeAcceptor},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Upgrade name [`XorUpgrade`] answers to.
pub const XOR_UPGRADE: &str = "application/x-xor";

/// Stream wrapper that XORs both directions with a fixed key.
#[derive(Debug)]
pub struct XorStream<S> {
    inner: S,
    key: u8,
}

impl<S> XorStream<S> {
    /// Wrap `inner` with `key`.
    pub fn new(inner: S, key: u8) -> Self { Self { inner, key } }

    /// Unwrap the inner stream.
    pub fn into_inner(self) -> S { self.inner }
}

impl<S: AsyncRead + Unpin> AsyncRead for XorStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let start = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let key = self.key;
        for byte in &mut buf.filled_mut()[start..] {
            *byte ^= key;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for XorStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let key = self.key;
        let masked: Vec<u8> = buf.iter().map(|b| b ^ key).collect();
        Pin::new(&mut self.inner).poll_write(cx, &masked)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Server side of the XOR upgrade.
#[derive(Clone, Copy, Debug, Default)]
pub struct XorUpgrade {
    /// Whether completed upgrades report a [`SecurityContext`].
    pub secure: bool,
}

#[async_trait]
impl StreamUpgradeAcceptor for XorUpgrade {
    fn can_upgrade(&self, content_type: &str) -> bool { content_type == XOR_UPGRADE }

    async fn accept_upgrade(
        &self,
        mut stream: BoxConnection,
    ) -> io::Result<(BoxConnection, Option<SecurityContext>)> {
        let key = stream.read_u8().await?;
        stream.write_u8(!key).await?;
        stream.flush().await?;
        let context = self.secure.then(|| SecurityContext {
            protocol: XOR_UPGRADE.into(),
            peer_identity: Some(format!("key-{key:02x}")),
        });
        Ok((Box::new(XorStream::new(stream, key)), context))
    }

    fn provides_security(&self) -> bool { self.secure }
}

/// Client side: request the upgrade on `stream`, wait for the response
/// record, run the handshake and return the wrapped stream.
///
/// # Errors
///
/// Returns an error if the server answers with anything but an upgrade
/// response or fails the handshake.
pub async fn client_xor_upgrade<S: Connection>(mut stream: S, key: u8) -> io::Result<XorStream<S>> {
    stream
        .write_all(&crate::client::upgrade_request(XOR_UPGRADE))
        .await?;
    let response = stream.read_u8().await?;
    if response != netframing::record::UPGRADE_RESPONSE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected upgrade response, got {response:#04x}"),
        ));
    }
    stream.write_u8(key).await?;
    if stream.read_u8().await? != !key {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "handshake confirmation mismatch",
        ));
    }
    Ok(XorStream::new(stream, key))
}
