//! Configuration utilities for [`DemuxServer`].

use tokio::sync::oneshot;

use super::{BackoffConfig, DemuxServer, ServerState, Unbound};
use crate::demux::ConnectionDemuxer;

pub mod binding;


impl DemuxServer<Unbound> {
    /// Create a server feeding `demuxer`.
    ///
    /// The worker count defaults to the number of available CPU cores (or 1
    /// if this cannot be determined). Call
    /// [`bind`](DemuxServer::bind) before running the server.
    #[must_use]
    pub fn new(demuxer: ConnectionDemuxer) -> Self {
        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            demuxer,
            workers,
            ready_tx: None,
            backoff_config: BackoffConfig::default(),
            state: Unbound,
        }
    }
}

impl<S> DemuxServer<S>
where
    S: ServerState,
{
    /// Set the number of accept workers to spawn.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    /// Configure a channel used to signal when the server is ready to
    /// accept connections.
    #[must_use]
    pub fn ready_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(tx);
        self
    }

    /// Override the accept-error back-off. Values are normalized when the
    /// accept loop starts.
    #[must_use]
    pub fn accept_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff_config = backoff;
        self
    }

    /// Returns the configured number of accept workers.
    #[inline]
    #[must_use]
    pub const fn worker_count(&self) -> usize { self.workers }

    /// Returns the configured accept-error back-off.
    #[inline]
    #[must_use]
    pub const fn backoff_config(&self) -> BackoffConfig { self.backoff_config }

    /// The demultiplexer accepted connections are handed to.
    #[must_use]
    pub fn demuxer(&self) -> &ConnectionDemuxer { &self.demuxer }
}
