//! Hand-off of negotiated connections to endpoint listeners.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    chunked::ChunkedReader,
    connection::BoxConnection,
    demux::ReuseHandle,
    error::DispatchError,
    settings::TransportSettings,
    upgrade::SecurityContext,
};

/// Receives connections whose preamble has been fully negotiated.
///
/// [`activate`](Self::activate) runs before the connection leaves the
/// demultiplexer; an error there is reported to the peer as a fault. Once
/// `accept_session` or `accept_singleton` is called the listener owns the
/// connection, and errors it returns are only logged.
#[async_trait]
pub trait EndpointListener: Send + Sync {
    /// Prepare the service behind `via` to take a connection.
    async fn activate(&self, via: &str) -> Result<(), DispatchError> {
        let _ = via;
        Ok(())
    }

    /// Take ownership of a duplex session.
    async fn accept_session(&self, session: SessionConnection) -> Result<(), DispatchError>;

    /// Take ownership of a singleton connection and its one request.
    async fn accept_singleton(&self, singleton: SingletonConnection) -> Result<(), DispatchError>;
}

/// A duplex connection ready for session traffic.
pub struct SessionConnection {
    /// Connection positioned after the preamble; bytes the decoder read
    /// ahead are replayed first.
    pub connection: BoxConnection,
    /// Destination the peer addressed.
    pub via: String,
    /// Declared content type.
    pub content_type: String,
    /// Offers the connection back to the reuse pool when the session ends.
    pub reuse: ReuseHandle,
}

impl fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConnection")
            .field("via", &self.via)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// The single request carried by a singleton connection.
pub enum SingletonMessage {
    /// The whole body, read before dispatch.
    Buffered {
        /// Reassembled body bytes.
        body: Bytes,
        /// Connection positioned after the end record, for the reply.
        connection: BoxConnection,
    },
    /// A reader over the chunked body; unwrap it with
    /// [`ChunkedReader::into_parts`] once drained to reply.
    Streamed(ChunkedReader<BoxConnection>),
}

impl fmt::Debug for SingletonMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered { body, .. } => f
                .debug_struct("Buffered")
                .field("len", &body.len())
                .finish_non_exhaustive(),
            Self::Streamed(reader) => f
                .debug_tuple("Streamed")
                .field(&reader.state())
                .finish(),
        }
    }
}

/// A singleton connection ready for its request to be processed.
pub struct SingletonConnection {
    /// Destination the peer addressed.
    pub via: String,
    /// Declared content type.
    pub content_type: String,
    /// Security context produced by the most recent upgrade.
    pub security: Option<SecurityContext>,
    /// Settings of the endpoint the via resolved to.
    pub settings: Arc<TransportSettings>,
    /// The request.
    pub message: SingletonMessage,
    /// Offers the connection back to the reuse pool after the reply.
    pub reuse: ReuseHandle,
}

impl fmt::Debug for SingletonConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingletonConnection")
            .field("via", &self.via)
            .field("content_type", &self.content_type)
            .field("security", &self.security)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
