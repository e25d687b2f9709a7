//! Runtime control for [`DemuxServer`].

mod accept;
mod backoff;
#[cfg(test)]
mod tests;

use std::sync::Arc;

#[cfg(test)]
pub(super) use accept::MockAcceptListener;
pub(super) use accept::{AcceptLoopOptions, accept_loop};
pub use backoff::BackoffConfig;
use log::warn;
use tokio::{select, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{Bound, DemuxServer, ServerError};

impl DemuxServer<Bound> {
    /// Run the server until Ctrl+C is received.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use netframing::{demux::ConnectionDemuxer, server::DemuxServer, settings::ViaRegistry};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), netframing::server::ServerError> {
    /// let server = DemuxServer::new(ConnectionDemuxer::new(ViaRegistry::new()))
    ///     .bind(([127, 0, 0, 1], 8808).into())?;
    /// server.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Attempting to run a server without binding fails to compile:
    ///
    /// ```compile_fail
    /// use netframing::{demux::ConnectionDemuxer, server::DemuxServer, settings::ViaRegistry};
    ///
    /// async fn try_run() {
    ///     DemuxServer::new(ConnectionDemuxer::new(ViaRegistry::new()))
    ///         .run()
    ///         .await
    ///         .expect("unbound servers do not expose run()");
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// Accept failures are retried with exponential back-off and do not
    /// surface as errors; the result is reserved for startup failures.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run the server until the `shutdown` future resolves.
    ///
    /// Shutdown stops every accept worker, cancels connections still in
    /// their preamble phase and waits for all connection tasks. Connections
    /// already handed to an endpoint listener are unaffected.
    ///
    /// # Examples
    ///
    /// ```
    /// use netframing::{demux::ConnectionDemuxer, server::DemuxServer, settings::ViaRegistry};
    /// use tokio::sync::oneshot;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), netframing::server::ServerError> {
    /// let server = DemuxServer::new(ConnectionDemuxer::new(ViaRegistry::new()))
    ///     .bind(([127, 0, 0, 1], 0).into())?;
    ///
    /// let (tx, rx) = oneshot::channel::<()>();
    /// let handle = tokio::spawn(async move {
    ///     server
    ///         .run_with_shutdown(async {
    ///             let _ = rx.await;
    ///         })
    ///         .await
    /// });
    ///
    /// let _ = tx.send(());
    /// handle
    ///     .await
    ///     .expect("join server task")
    ///     .expect("server run failed");
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Accept failures are retried with exponential back-off and do not
    /// surface as errors.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run_with_shutdown<S>(self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let DemuxServer {
            demuxer,
            workers,
            ready_tx,
            backoff_config,
            state: Bound { listener },
        } = self;
        let shutdown_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        for _ in 0..workers {
            tracker.spawn(accept_loop(
                Arc::clone(&listener),
                AcceptLoopOptions {
                    demuxer: demuxer.clone(),
                    shutdown: shutdown_token.clone(),
                    backoff: backoff_config,
                },
            ));
        }

        // Signal readiness after all workers have been spawned.
        if let Some(tx) = ready_tx
            && tx.send(()).is_err()
        {
            warn!("Failed to send readiness signal: receiver dropped");
        }

        select! {
            () = shutdown => shutdown_token.cancel(),
            () = tracker.wait() => {},
        }

        tracker.close();
        tracker.wait().await;
        demuxer.shutdown().await;
        Ok(())
    }
}
