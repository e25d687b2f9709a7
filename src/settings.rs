//! Demultiplexer configuration and per-endpoint transport settings.
//!
//! [`DemuxConfig`] holds process-wide limits and budgets and can be loaded
//! with `serde`. Each endpoint contributes a [`TransportSettings`], found by
//! resolving the decoded via through a [`ViaResolver`]; [`ViaRegistry`] is
//! the stock resolver.

use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::Deserialize;

use crate::{
    endpoint::EndpointListener,
    upgrade::{SecurityPolicy, SharedUpgradeAcceptor},
};

/// Process-wide demultiplexer settings.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use std::time::Duration;
///
/// use netframing::settings::DemuxConfig;
///
/// let config: DemuxConfig =
///     serde_json::from_str(r#"{ "idle_timeout": 5, "max_pooled_connections": 2 }"#)
///         .expect("valid config");
/// assert_eq!(config.idle_timeout, Duration::from_secs(5));
/// assert_eq!(config.max_pooled_connections, 2);
/// assert_eq!(config.max_via_size, 2048);
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DemuxConfig {
    /// Budget for a fresh connection to finish its preamble, in seconds.
    #[serde(with = "duration_secs")]
    pub channel_initialization_timeout: Duration,
    /// How long a pooled connection may sit idle, in seconds.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Connections the reuse pool holds at once.
    pub max_pooled_connections: usize,
    /// Size of each connection's preamble read buffer.
    pub connection_buffer_size: usize,
    /// Longest accepted via, in bytes.
    pub max_via_size: usize,
    /// Longest accepted content type or upgrade name, in bytes.
    pub max_content_type_size: usize,
    /// Bytes drained from a faulted connection before closing it.
    pub max_drain_size: usize,
    /// Budget for writing a fault and draining, in seconds.
    #[serde(with = "duration_secs")]
    pub fault_send_timeout: Duration,
    /// Connections allowed in their preamble phase at once.
    pub max_pending_connections: usize,
    /// Idle read buffers kept for reuse.
    pub buffer_pool_capacity: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            channel_initialization_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            max_pooled_connections: 10,
            connection_buffer_size: 8192,
            max_via_size: 2048,
            max_content_type_size: 256,
            max_drain_size: 64 * 1024,
            fault_send_timeout: Duration::from_secs(10),
            max_pending_connections: 100,
            buffer_pool_capacity: 64,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de::Error};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// How a singleton message body reaches the endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferMode {
    /// Read the whole body before dispatch.
    #[default]
    Buffered,
    /// Hand the endpoint a reader over the chunked body.
    Streamed,
}

/// Decides whether an endpoint's payload codec understands a content type.
pub trait ContentTypeValidator: Send + Sync {
    /// Whether `content_type` is supported.
    fn is_supported(&self, content_type: &str) -> bool;
}

impl<F> ContentTypeValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_supported(&self, content_type: &str) -> bool { self(content_type) }
}

/// Validator accepting every content type.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyContentType;

impl ContentTypeValidator for AnyContentType {
    fn is_supported(&self, _content_type: &str) -> bool { true }
}

/// Settings for one endpoint, shared by every connection that resolves to it.
#[derive(Clone)]
pub struct TransportSettings {
    listener: Arc<dyn EndpointListener>,
    validator: Arc<dyn ContentTypeValidator>,
    upgrade: Option<SharedUpgradeAcceptor>,
    require_upgrade: bool,
    transfer_mode: TransferMode,
    max_buffered_message_size: usize,
    receive_timeout: Duration,
}

impl TransportSettings {
    /// Settings delivering to `listener`, accepting any content type,
    /// without upgrades, with buffered transfer of bodies up to 64 KiB.
    pub fn new(listener: Arc<dyn EndpointListener>) -> Self {
        Self {
            listener,
            validator: Arc::new(AnyContentType),
            upgrade: None,
            require_upgrade: false,
            transfer_mode: TransferMode::Buffered,
            max_buffered_message_size: 64 * 1024,
            receive_timeout: Duration::from_secs(60),
        }
    }

    /// Restrict accepted content types.
    #[must_use]
    pub fn with_validator(mut self, validator: impl ContentTypeValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Offer stream upgrades through `acceptor`.
    #[must_use]
    pub fn with_upgrade(mut self, acceptor: SharedUpgradeAcceptor) -> Self {
        self.upgrade = Some(acceptor);
        self
    }

    /// Refuse singleton preambles that end without an upgrade.
    #[must_use]
    pub fn require_upgrade(mut self, required: bool) -> Self {
        self.require_upgrade = required;
        self
    }

    /// Choose how singleton bodies are delivered.
    #[must_use]
    pub fn transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    /// Cap buffered singleton bodies.
    #[must_use]
    pub fn max_buffered_message_size(mut self, size: usize) -> Self {
        self.max_buffered_message_size = size;
        self
    }

    /// Budget for reading a buffered singleton body.
    #[must_use]
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Endpoint receiving negotiated connections.
    #[must_use]
    pub fn listener(&self) -> &Arc<dyn EndpointListener> { &self.listener }

    /// Whether the endpoint supports `content_type`.
    #[must_use]
    pub fn supports_content_type(&self, content_type: &str) -> bool {
        self.validator.is_supported(content_type)
    }

    /// Upgrade acceptor, if the endpoint offers upgrades.
    #[must_use]
    pub fn upgrade(&self) -> Option<&SharedUpgradeAcceptor> { self.upgrade.as_ref() }

    /// Singleton body delivery mode.
    #[must_use]
    pub fn mode(&self) -> TransferMode { self.transfer_mode }

    /// Largest buffered singleton body.
    #[must_use]
    pub fn max_message_size(&self) -> usize { self.max_buffered_message_size }

    /// Budget for reading a buffered singleton body.
    #[must_use]
    pub fn receive_budget(&self) -> Duration { self.receive_timeout }

    /// Security checks applied when a singleton preamble ends.
    #[must_use]
    pub fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy {
            require_upgrade: self.require_upgrade,
            requires_security_context: self
                .upgrade
                .as_ref()
                .is_some_and(|acceptor| acceptor.provides_security()),
        }
    }
}

impl fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSettings")
            .field("upgrade", &self.upgrade.as_ref().map(|_| "Some(<acceptor>)"))
            .field("require_upgrade", &self.require_upgrade)
            .field("transfer_mode", &self.transfer_mode)
            .field("max_buffered_message_size", &self.max_buffered_message_size)
            .field("receive_timeout", &self.receive_timeout)
            .finish_non_exhaustive()
    }
}

/// Maps a decoded via to the settings of the endpoint serving it.
pub trait ViaResolver: Send + Sync {
    /// Settings for `via`, or `None` when no endpoint serves it.
    fn resolve(&self, via: &str) -> Option<Arc<TransportSettings>>;
}

impl<F> ViaResolver for F
where
    F: Fn(&str) -> Option<Arc<TransportSettings>> + Send + Sync,
{
    fn resolve(&self, via: &str) -> Option<Arc<TransportSettings>> { self(via) }
}

/// Concurrent via-to-endpoint table.
///
/// Lookups try the via itself, then strip trailing path segments one at a
/// time, so `net.tcp://host/svc/session/42` resolves to an endpoint
/// registered at `net.tcp://host/svc`. Trailing slashes are ignored.
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use netframing::{endpoint::EndpointListener, settings::{TransportSettings, ViaRegistry, ViaResolver}};
/// # fn demo(listener: Arc<dyn EndpointListener>) {
/// let registry = ViaRegistry::new();
/// registry.register("net.tcp://host/svc", TransportSettings::new(listener));
/// assert!(registry.resolve("net.tcp://host/svc/a/b").is_some());
/// assert!(registry.resolve("net.tcp://host/other").is_none());
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ViaRegistry {
    endpoints: DashMap<String, Arc<TransportSettings>>,
}

impl ViaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `settings` for `via`, returning any settings it replaces.
    pub fn register(
        &self,
        via: &str,
        settings: TransportSettings,
    ) -> Option<Arc<TransportSettings>> {
        self.endpoints
            .insert(normalize(via).to_owned(), Arc::new(settings))
    }

    /// Remove the endpoint registered for `via`.
    pub fn unregister(&self, via: &str) -> Option<Arc<TransportSettings>> {
        self.endpoints.remove(normalize(via)).map(|(_, settings)| settings)
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize { self.endpoints.len() }

    /// Whether no endpoints are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.endpoints.is_empty() }
}

impl ViaResolver for ViaRegistry {
    fn resolve(&self, via: &str) -> Option<Arc<TransportSettings>> {
        let mut candidate = normalize(via);
        loop {
            if let Some(settings) = self.endpoints.get(candidate) {
                return Some(Arc::clone(settings.value()));
            }
            let (parent, _) = candidate.rsplit_once('/')?;
            // Never strip into the scheme separator.
            if parent.ends_with('/') || parent.is_empty() {
                return None;
            }
            candidate = parent;
        }
    }
}

fn normalize(via: &str) -> &str { via.trim_end_matches('/') }
