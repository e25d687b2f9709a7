//! Bounded reuse pool for idle connections.
//!
//! A session handler that finishes cleanly may offer its connection back.
//! The pool admits it only if a slot is free; admission never waits, so
//! pool pressure degrades to "the peer opens a new connection". An admitted
//! connection is probed with a read bounded by the idle timeout: if the
//! peer speaks, the connection re-enters mode decoding as a cached
//! connection; if the peer closes or stays silent, the slot is abandoned.
//! Slots are semaphore permits, so every exit path releases exactly once.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
    time::Instant,
};

use crate::{
    connection::PreambleReader,
    error::{FramingError, Phase},
};

/// Counting pool of reuse slots.
#[derive(Clone, Debug)]
pub struct ReusePool {
    permits: Arc<Semaphore>,
    capacity: usize,
    idle_timeout: Duration,
}

impl ReusePool {
    /// Create a pool of `capacity` slots whose connections expire after
    /// `idle_timeout` of silence.
    #[must_use]
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            idle_timeout,
        }
    }

    /// Claim a slot without waiting. `None` means the pool is full.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use netframing::pool::ReusePool;
    ///
    /// let pool = ReusePool::new(1, Duration::from_secs(1));
    /// let slot = pool.try_acquire().expect("one free slot");
    /// assert!(pool.try_acquire().is_none());
    /// drop(slot);
    /// assert_eq!(pool.available(), 1);
    /// ```
    #[must_use]
    pub fn try_acquire(&self) -> Option<PoolSlot> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                crate::metrics::set_pooled_connections(self.in_use());
                Some(PoolSlot {
                    permit: Some(permit),
                    expires_at: Instant::now() + self.idle_timeout,
                    idle_timeout: self.idle_timeout,
                    pool: self.clone(),
                })
            }
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Free slots.
    #[must_use]
    pub fn available(&self) -> usize { self.permits.available_permits() }

    /// Occupied slots.
    #[must_use]
    pub fn in_use(&self) -> usize { self.capacity.saturating_sub(self.available()) }

    /// Total slots.
    #[must_use]
    pub fn capacity(&self) -> usize { self.capacity }

    /// Idle budget given to each pooled connection.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration { self.idle_timeout }
}

/// One occupied reuse slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct PoolSlot {
    permit: Option<OwnedSemaphorePermit>,
    expires_at: Instant,
    idle_timeout: Duration,
    pool: ReusePool,
}

/// Result of probing a pooled connection.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// The peer sent bytes; they are buffered in the reader.
    Active,
    /// The peer stayed silent for the whole idle timeout.
    Expired,
    /// The peer closed the connection.
    Closed,
    /// The read failed.
    Failed(FramingError),
}

impl PoolSlot {
    /// Instant at which the idle connection expires.
    #[must_use]
    pub fn expires_at(&self) -> Instant { self.expires_at }

    /// Wait for the peer to start a new exchange on `reader`.
    ///
    /// The reader's budget is reset to the idle timeout, so mode decoding
    /// that follows an [`ProbeOutcome::Active`] probe shares the same
    /// allowance.
    pub async fn probe(&self, reader: &mut PreambleReader) -> ProbeOutcome {
        reader.reset_budget(self.idle_timeout);
        if !reader.available().is_empty() {
            return ProbeOutcome::Active;
        }
        match reader.fill(Phase::Mode).await {
            Ok(0) => ProbeOutcome::Closed,
            Ok(_) => ProbeOutcome::Active,
            Err(FramingError::Timeout { .. }) => ProbeOutcome::Expired,
            Err(err) => ProbeOutcome::Failed(err),
        }
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        drop(self.permit.take());
        crate::metrics::set_pooled_connections(self.pool.in_use());
    }
}
