//! Errors raised by [`DemuxServer`](super::DemuxServer) operations.

use std::io;

use thiserror::Error;

/// Errors that may occur while binding or running the server.
///
/// Per-connection failures never surface here; the demultiplexer contains
/// them.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or configuring the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),

    /// Accepting a connection failed.
    #[error("accept error: {0}")]
    Accept(#[from] io::Error),
}
