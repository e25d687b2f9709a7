//! Tokio-based TCP front end for a [`ConnectionDemuxer`].
//!
//! `DemuxServer` spawns worker tasks that accept TCP connections and pass
//! each one to the demultiplexer, which negotiates the framing preamble and
//! dispatches the connection to its endpoint.

use std::sync::Arc;

use tokio::{net::TcpListener, sync::oneshot};

use crate::demux::ConnectionDemuxer;

/// TCP server feeding accepted connections to a [`ConnectionDemuxer`].
///
/// The server carries a typestate `S` indicating whether it is
/// [`Unbound`] (no listener yet) or [`Bound`]. New servers start `Unbound`
/// and must call [`bind`](DemuxServer::bind) or
/// [`bind_existing_listener`](DemuxServer::bind_existing_listener) before
/// running. Each worker task runs its own accept loop over the shared
/// listener; all of them feed the same demultiplexer.
pub struct DemuxServer<S = Unbound>
where
    S: ServerState,
{
    pub(crate) demuxer: ConnectionDemuxer,
    pub(crate) workers: usize,
    /// Fires once every worker has been spawned. Single use: a new sender
    /// must be supplied each time the server is started.
    pub(crate) ready_tx: Option<oneshot::Sender<()>>,
    pub(crate) backoff_config: BackoffConfig,
    /// Typestate tracking whether the server has been bound to a listener.
    pub(crate) state: S,
}

/// Marker indicating the server has not yet bound a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbound;

/// Marker indicating the server is bound to a TCP listener.
#[derive(Debug, Clone)]
pub struct Bound {
    pub(crate) listener: Arc<TcpListener>,
}

/// Trait implemented by [`Unbound`] and [`Bound`] to model binding typestate.
pub trait ServerState: sealed::Sealed {}

mod sealed {
    //! Prevent external implementations of [`ServerState`].

    pub trait Sealed {}
    impl Sealed for super::Unbound {}
    impl Sealed for super::Bound {}
}

impl ServerState for Unbound {}
impl ServerState for Bound {}

mod config;
pub use config::binding;
pub mod error;
pub use error::ServerError;
mod runtime;

/// Re-exported configuration types for server backoff behavior.
pub use runtime::BackoffConfig;

#[cfg(test)]
pub(crate) mod test_util;
