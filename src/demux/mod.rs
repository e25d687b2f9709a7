//! Connection demultiplexer.
//!
//! [`ConnectionDemuxer`] owns one task per connection in its preamble
//! phase. Each task decodes the mode, runs the session or singleton
//! pipeline under the connection's time budget, and hands the negotiated
//! connection to the endpoint listener the via resolved to. Every failure
//! is contained in the task: it is logged, a fault is sent when the
//! protocol defines one, and the connection is dropped. Other connections
//! are unaffected.
//!
//! Connections offered back through a [`ReuseHandle`] re-enter the same
//! pipeline as cached connections, budgeted by the idle timeout instead of
//! the channel-initialization timeout.

mod session;
mod singleton;

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    io::AsyncWriteExt,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{Instant, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info_span, trace, warn};

use crate::{
    buffer_pool::ObjectPool,
    connection::{BoxConnection, Connection, PreambleReader},
    endpoint::{SessionConnection, SingletonConnection},
    error::{FramingError, InvariantViolation, Phase},
    fault::{self, FaultCode, FaultDelivery},
    mode::{FramingMode, ModeDecoder},
    pool::{PoolSlot, ProbeOutcome, ReusePool},
    preamble::PreambleLimits,
    settings::{DemuxConfig, TransportSettings, ViaResolver},
};

/// Callback invoked with every contained connection error.
pub type ErrorCallback = Arc<dyn Fn(&FramingError) + Send + Sync + 'static>;

/// How a connection entered the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Freshly accepted from a listener.
    Fresh,
    /// Re-primed from the reuse pool.
    Cached,
}

/// Final state of one connection task.
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// The connection was handed to an endpoint listener.
    Dispatched {
        /// Decoded framing mode.
        mode: FramingMode,
        /// Decoded via.
        via: String,
    },
    /// The peer closed, or a pooled connection went unused, before any
    /// preamble byte was decoded.
    Closed,
    /// The pipeline failed; the error was logged and any fault was sent.
    Failed(FramingError),
    /// The demultiplexer shut down first.
    Cancelled,
}

enum Handoff {
    Session(Arc<TransportSettings>, SessionConnection),
    Singleton(Arc<TransportSettings>, SingletonConnection),
}

impl Handoff {
    fn via(&self) -> &str {
        match self {
            Self::Session(_, session) => &session.via,
            Self::Singleton(_, singleton) => &singleton.via,
        }
    }
}

pub(crate) struct Inner {
    config: DemuxConfig,
    limits: PreambleLimits,
    resolver: Arc<dyn ViaResolver>,
    buffers: ObjectPool<Box<[u8]>>,
    pool: ReusePool,
    pending: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    on_error: Option<ErrorCallback>,
}

/// Accepts raw connections and routes them by framing mode.
///
/// Cloning is cheap; clones share tasks, pools and the shutdown token.
#[derive(Clone)]
pub struct ConnectionDemuxer {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionDemuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDemuxer")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .field("tasks", &self.inner.tracker.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionDemuxer {
    /// Create a demultiplexer with the default [`DemuxConfig`].
    pub fn new(resolver: impl ViaResolver + 'static) -> Self {
        Self::builder(Arc::new(resolver)).build()
    }

    /// Start configuring a demultiplexer that resolves vias with `resolver`.
    #[must_use]
    pub fn builder(resolver: Arc<dyn ViaResolver>) -> DemuxBuilder {
        DemuxBuilder {
            resolver,
            config: DemuxConfig::default(),
            on_error: None,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &DemuxConfig { &self.inner.config }

    /// Pool holding connections offered back for reuse.
    #[must_use]
    pub fn reuse_pool(&self) -> &ReusePool { &self.inner.pool }

    /// Handle session handlers use to offer connections back.
    #[must_use]
    pub fn reuse_handle(&self) -> ReuseHandle { self.inner.reuse_handle() }

    /// Number of live connection tasks.
    #[must_use]
    pub fn task_count(&self) -> usize { self.inner.tracker.len() }

    /// Wait for a free preamble slot. Returns `None` after shutdown.
    pub async fn reserve(&self) -> Option<PendingSlot> {
        let permit = Arc::clone(&self.inner.pending).acquire_owned().await.ok()?;
        crate::metrics::inc_pending();
        Some(PendingSlot { _permit: permit })
    }

    /// Drive a fresh connection through its preamble on the current task.
    ///
    /// Failures are contained exactly as in spawned tasks; the outcome is
    /// returned for inspection. A dispatched connection is handed to its
    /// listener on a separate task, so this returns without waiting for the
    /// listener.
    pub async fn serve(&self, connection: impl Connection) -> ConnectionOutcome {
        Arc::clone(&self.inner)
            .serve(Box::new(connection), Origin::Fresh, None)
            .await
    }

    /// Spawn a task for a fresh connection.
    pub fn spawn(&self, connection: impl Connection) {
        self.spawn_accepted(Box::new(connection), None, None);
    }

    /// Spawn a task for a connection accepted from `peer_addr`, holding
    /// `pending` until the connection is handed off.
    pub fn spawn_accepted(
        &self,
        connection: BoxConnection,
        peer_addr: Option<SocketAddr>,
        pending: Option<PendingSlot>,
    ) {
        let inner = Arc::clone(&self.inner);
        let span = info_span!("connection", peer = ?peer_addr, origin = "fresh");
        self.inner.tracker.spawn(catch_panics(
            inner.serve(connection, Origin::Fresh, pending),
            peer_addr,
            span,
        ));
    }

    /// Cancel in-flight preambles and wait for every connection task.
    ///
    /// Connections already handed to a listener belong to it and are not
    /// waited for.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.pending.close();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

/// Configures a [`ConnectionDemuxer`].
pub struct DemuxBuilder {
    resolver: Arc<dyn ViaResolver>,
    config: DemuxConfig,
    on_error: Option<ErrorCallback>,
}

impl DemuxBuilder {
    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: DemuxConfig) -> Self {
        self.config = config;
        self
    }

    /// Budget for a fresh connection's preamble.
    #[must_use]
    pub fn channel_initialization_timeout(mut self, budget: Duration) -> Self {
        self.config.channel_initialization_timeout = budget;
        self
    }

    /// Idle budget for pooled connections.
    #[must_use]
    pub fn idle_timeout(mut self, budget: Duration) -> Self {
        self.config.idle_timeout = budget;
        self
    }

    /// Capacity of the reuse pool.
    #[must_use]
    pub fn max_pooled_connections(mut self, capacity: usize) -> Self {
        self.config.max_pooled_connections = capacity;
        self
    }

    /// Connections allowed in their preamble phase at once.
    #[must_use]
    pub fn max_pending_connections(mut self, limit: usize) -> Self {
        self.config.max_pending_connections = limit.max(1);
        self
    }

    /// Register a callback invoked with every contained error.
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FramingError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Build the demultiplexer.
    #[must_use]
    pub fn build(self) -> ConnectionDemuxer {
        let DemuxBuilder {
            resolver,
            config,
            on_error,
        } = self;
        let buffer_size = config.connection_buffer_size.max(1);
        ConnectionDemuxer {
            inner: Arc::new(Inner {
                limits: PreambleLimits::from(&config),
                resolver,
                buffers: ObjectPool::new(config.buffer_pool_capacity, move || {
                    vec![0_u8; buffer_size].into_boxed_slice()
                }),
                pool: ReusePool::new(config.max_pooled_connections, config.idle_timeout),
                pending: Arc::new(Semaphore::new(config.max_pending_connections.max(1))),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                on_error,
                config,
            }),
        }
    }
}

/// A reserved preamble slot, released when the connection is handed off
/// or fails.
#[derive(Debug)]
pub struct PendingSlot {
    _permit: OwnedSemaphorePermit,
}

impl Drop for PendingSlot {
    fn drop(&mut self) { crate::metrics::dec_pending(); }
}

/// Lets a finished session offer its connection back to the reuse pool.
///
/// Holds only a weak reference, so outstanding handles do not keep a shut
/// down demultiplexer alive.
#[derive(Clone)]
pub struct ReuseHandle {
    demuxer: Weak<Inner>,
}

impl fmt::Debug for ReuseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReuseHandle")
            .field("live", &(self.demuxer.strong_count() > 0))
            .finish()
    }
}

impl ReuseHandle {
    /// Offer `connection` for reuse.
    ///
    /// Returns `true` when the pool admitted it. Otherwise the connection
    /// is shut down within `close_timeout` and `false` is returned; the
    /// peer is expected to open a new connection.
    pub fn reuse(&self, connection: impl Connection, close_timeout: Duration) -> bool {
        let connection: BoxConnection = Box::new(connection);
        match self.demuxer.upgrade() {
            Some(inner) => inner.reuse(connection, close_timeout),
            None => {
                tokio::spawn(close(connection, close_timeout));
                false
            }
        }
    }
}

async fn close(mut connection: BoxConnection, close_timeout: Duration) {
    match timeout(close_timeout, connection.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(error = %e, "shutdown of unpooled connection failed"),
        Err(_) => trace!("shutdown of unpooled connection timed out"),
    }
}

async fn catch_panics<T>(
    task: impl Future<Output = T> + Send,
    peer_addr: Option<SocketAddr>,
    span: tracing::Span,
) {
    let fut = std::panic::AssertUnwindSafe(task.instrument(span)).catch_unwind();
    if let Err(panic) = fut.await {
        crate::metrics::inc_connection_panics();
        let panic_msg = crate::panic::format_panic(panic);
        log::error!("connection task panicked: panic={panic_msg}, peer_addr={peer_addr:?}");
        error!(panic = %panic_msg, ?peer_addr, "connection task panicked");
    }
}

impl Inner {
    fn reuse_handle(self: &Arc<Self>) -> ReuseHandle {
        ReuseHandle {
            demuxer: Arc::downgrade(self),
        }
    }

    fn fault_delivery(&self) -> FaultDelivery {
        FaultDelivery {
            timeout: self.config.fault_send_timeout,
            max_drain: self.config.max_drain_size,
        }
    }

    fn reuse(self: Arc<Self>, connection: BoxConnection, close_timeout: Duration) -> bool {
        if self.shutdown.is_cancelled() {
            self.tracker.spawn(close(connection, close_timeout));
            return false;
        }
        let Some(slot) = self.pool.try_acquire() else {
            debug!(
                capacity = self.pool.capacity(),
                "reuse pool full, closing connection"
            );
            self.tracker.spawn(close(connection, close_timeout));
            return false;
        };
        let span = info_span!("connection", origin = "cached");
        let tracker = self.tracker.clone();
        tracker.spawn(catch_panics(self.serve_cached(connection, slot), None, span));
        true
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    async fn serve_cached(self: Arc<Self>, connection: BoxConnection, slot: PoolSlot) -> ConnectionOutcome {
        let mut reader =
            PreambleReader::new(connection, self.buffers.take(), self.pool.idle_timeout());
        let probe = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return ConnectionOutcome::Cancelled,
            probe = slot.probe(&mut reader) => probe,
        };
        let expires_at = slot.expires_at();
        drop(slot);
        match probe {
            ProbeOutcome::Active => self.run(reader, Origin::Cached, None).await,
            ProbeOutcome::Expired => {
                trace!(
                    overdue = ?tokio::time::Instant::now().saturating_duration_since(expires_at),
                    "pooled connection expired unused"
                );
                ConnectionOutcome::Closed
            }
            ProbeOutcome::Closed => {
                trace!("peer closed pooled connection");
                ConnectionOutcome::Closed
            }
            ProbeOutcome::Failed(err) => {
                debug!(error = %err, "pooled connection failed while idle");
                ConnectionOutcome::Closed
            }
        }
    }

    async fn serve(
        self: Arc<Self>,
        connection: BoxConnection,
        origin: Origin,
        pending: Option<PendingSlot>,
    ) -> ConnectionOutcome {
        let budget = match origin {
            Origin::Fresh => self.config.channel_initialization_timeout,
            Origin::Cached => self.config.idle_timeout,
        };
        let reader = PreambleReader::new(connection, self.buffers.take(), budget);
        self.run(reader, origin, pending).await
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    async fn run(
        self: Arc<Self>,
        mut reader: PreambleReader,
        origin: Origin,
        pending: Option<PendingSlot>,
    ) -> ConnectionOutcome {
        let negotiated = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return ConnectionOutcome::Cancelled,
            negotiated = self.negotiate(&mut reader, origin) => negotiated,
        };
        drop(pending);
        self.finish(negotiated, reader).await
    }

    async fn negotiate(
        self: &Arc<Self>,
        reader: &mut PreambleReader,
        origin: Origin,
    ) -> Result<Option<(FramingMode, Handoff)>, FramingError> {
        let Some(mode) = read_mode(reader, origin).await? else {
            return Ok(None);
        };
        crate::metrics::inc_accepted(mode);
        trace!(%mode, "framing mode decoded");
        let handoff = match mode {
            FramingMode::Duplex => session::negotiate(self, reader).await?,
            FramingMode::Singleton => singleton::negotiate(self, reader).await?,
            FramingMode::Unsupported(byte) => {
                return Err(FramingError::fault(
                    Phase::Mode,
                    FaultCode::UnsupportedMode,
                    format!("mode {byte:#04x} is not served"),
                ));
            }
        };
        Ok(Some((mode, handoff)))
    }

    async fn finish(
        &self,
        negotiated: Result<Option<(FramingMode, Handoff)>, FramingError>,
        mut reader: PreambleReader,
    ) -> ConnectionOutcome {
        match negotiated {
            Ok(Some((mode, handoff))) => {
                drop(reader);
                let via = handoff.via().to_owned();
                // Listeners may serve the session inline; shutdown must not
                // wait on them.
                tokio::spawn(catch_panics(
                    dispatch(handoff),
                    None,
                    tracing::Span::current(),
                ));
                ConnectionOutcome::Dispatched { mode, via }
            }
            Ok(None) => {
                trace!("peer closed before sending a preamble");
                ConnectionOutcome::Closed
            }
            Err(err) => {
                self.contain(&err, &mut reader).await;
                ConnectionOutcome::Failed(err)
            }
        }
    }

    /// Log `err`, report it, and deliver its fault if the connection is
    /// still usable.
    async fn contain(&self, err: &FramingError, reader: &mut PreambleReader) {
        crate::metrics::inc_errors(err);
        let phase = err.phase().map_or("unknown", |phase| phase.as_str());
        match err {
            FramingError::Internal(violation) => {
                error!(%violation, "internal framing error, aborting connection");
            }
            FramingError::Timeout { .. } => warn!(phase, error = %err, "connection timed out"),
            FramingError::Fault {
                phase: Phase::Dispatch,
                ..
            } => warn!(phase, error = %err, "endpoint rejected connection"),
            _ => debug!(phase, error = %err, "connection failed"),
        }
        if let Some(callback) = &self.on_error {
            callback(err);
        }

        let (Some(code), Some(connection)) = (err.fault_code(), reader.take_connection()) else {
            return;
        };
        crate::metrics::inc_faults(code);
        match fault::send_fault(connection, code, self.fault_delivery()).await {
            Ok(()) => debug!(fault = code.name(), "fault delivered"),
            Err(e) => debug!(fault = code.name(), error = %e, "fault delivery incomplete"),
        }
    }

    fn resolve(&self, via: &str, phase: Phase) -> Result<Arc<TransportSettings>, FramingError> {
        self.resolver.resolve(via).ok_or_else(|| {
            FramingError::fault(
                phase,
                FaultCode::EndpointNotFound,
                format!("no endpoint for {via:?}"),
            )
        })
    }
}

/// Decode the version and mode records. `None` means the peer closed (or
/// a pooled connection went silent) before sending anything.
async fn read_mode(
    reader: &mut PreambleReader,
    origin: Origin,
) -> Result<Option<FramingMode>, FramingError> {
    let mut decoder = ModeDecoder::new();
    while !decoder.is_done() {
        let progress = decoder.bytes_decoded();
        match reader
            .step(Phase::Mode, progress, |bytes| decoder.decode(bytes))
            .await
        {
            Ok(_) => {}
            Err(FramingError::PrematureEof {
                bytes_decoded: 0, ..
            }) => return Ok(None),
            Err(FramingError::Timeout { .. }) if origin == Origin::Cached && progress == 0 => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
    }
    decoder
        .mode()
        .map(Some)
        .ok_or_else(|| InvariantViolation::MissingValue(Phase::Mode).into())
}

/// Hand the connection to its listener. Errors after hand-off cannot be
/// reported to the peer and are only logged.
async fn dispatch(handoff: Handoff) {
    match handoff {
        Handoff::Session(settings, session) => {
            let via = session.via.clone();
            debug!(%via, "dispatching duplex session");
            if let Err(err) = settings.listener().accept_session(session).await {
                warn!(%via, error = %err, "session listener failed");
            }
        }
        Handoff::Singleton(settings, singleton) => {
            let via = singleton.via.clone();
            debug!(%via, "dispatching singleton request");
            if let Err(err) = settings.listener().accept_singleton(singleton).await {
                warn!(%via, error = %err, "singleton listener failed");
            }
        }
    }
}

/// Reject content types the endpoint's payload codec does not support.
fn check_content_type(
    settings: &TransportSettings,
    content_type: &str,
    phase: Phase,
) -> Result<(), FramingError> {
    if settings.supports_content_type(content_type) {
        Ok(())
    } else {
        Err(FramingError::fault(
            phase,
            FaultCode::ContentTypeInvalid,
            format!("content type {content_type:?} is not supported"),
        ))
    }
}

/// Ask the endpoint to activate before `deadline`.
///
/// `PreambleReader` is not `Sync`; no borrow of it may be held across this
/// await.
async fn activate(
    settings: &TransportSettings,
    via: &str,
    deadline: Instant,
    budget: Duration,
) -> Result<(), FramingError> {
    match tokio::time::timeout_at(deadline, settings.listener().activate(via)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(FramingError::fault(
            Phase::Dispatch,
            err.fault(),
            err.to_string(),
        )),
        Err(_) => Err(FramingError::Timeout {
            phase: Phase::Dispatch,
            budget,
        }),
    }
}

#[cfg(test)]
mod tests;
