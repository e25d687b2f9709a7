//! Stream upgrade negotiation for singleton preambles.
//!
//! A singleton peer may ask for one or more stream upgrades (for example
//! transport security, then message security) before it ends the preamble.
//! Each upgrade replaces the connection with a wrapper produced by a
//! pluggable [`StreamUpgradeAcceptor`]; later records are read from the
//! wrapper. The handshake is tracked by [`UpgradeState`], whose transition
//! table is checked on every step.

use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use tokio::time::timeout_at;
use tracing::debug;

use crate::{
    connection::{BoxConnection, PreambleReader},
    error::{FramingError, InvariantViolation, Phase},
    fault::FaultCode,
    record,
};

/// Identity established by a security upgrade.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityContext {
    /// Upgrade protocol that established the context.
    pub protocol: String,
    /// Authenticated peer identity, when the upgrade provides one.
    pub peer_identity: Option<String>,
}

/// Pluggable implementation of a stream upgrade (TLS, negotiate, ...).
///
/// The framing layer only runs the protocol steps; the acceptor owns the
/// handshake itself.
#[async_trait]
pub trait StreamUpgradeAcceptor: Send + Sync {
    /// Whether this acceptor implements the named upgrade.
    fn can_upgrade(&self, content_type: &str) -> bool;

    /// Run the handshake over `stream` and return the wrapped stream.
    ///
    /// `stream` replays any bytes the preamble decoder had already read.
    async fn accept_upgrade(
        &self,
        stream: BoxConnection,
    ) -> io::Result<(BoxConnection, Option<SecurityContext>)>;

    /// Whether a completed upgrade must establish a [`SecurityContext`].
    fn provides_security(&self) -> bool { false }
}

/// Shared handle to an upgrade acceptor.
pub type SharedUpgradeAcceptor = Arc<dyn StreamUpgradeAcceptor>;

/// Step of the upgrade handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeState {
    /// No upgrade has been requested.
    None,
    /// An upgrade request is being checked against the acceptor.
    VerifyingUpgradeRequest,
    /// The upgrade response record is being written.
    WritingUpgradeAck,
    /// The upgrade response record has been written.
    UpgradeAckSent,
    /// The acceptor is running the handshake.
    BeginUpgrade,
    /// The handshake finished and the connection is being replaced.
    EndUpgrade,
    /// The upgraded connection is in place.
    UpgradeComplete,
    /// The preamble acknowledgement is being written.
    WritingPreambleEnd,
    /// The preamble acknowledgement has been written.
    PreambleEndSent,
}

impl UpgradeState {
    /// States reachable from `self` in one step.
    #[must_use]
    pub fn successors(self) -> &'static [Self] {
        match self {
            Self::None | Self::UpgradeComplete => {
                &[Self::VerifyingUpgradeRequest, Self::WritingPreambleEnd]
            }
            Self::VerifyingUpgradeRequest => &[Self::WritingUpgradeAck],
            Self::WritingUpgradeAck => &[Self::UpgradeAckSent],
            Self::UpgradeAckSent => &[Self::BeginUpgrade],
            Self::BeginUpgrade => &[Self::EndUpgrade],
            Self::EndUpgrade => &[Self::UpgradeComplete],
            Self::WritingPreambleEnd => &[Self::PreambleEndSent],
            Self::PreambleEndSent => &[],
        }
    }

    /// Whether `next` may follow `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool { self.successors().contains(&next) }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// Drives the upgrade handshake for one singleton connection.
#[derive(Debug)]
pub struct UpgradeNegotiator {
    state: UpgradeState,
    history: Vec<UpgradeState>,
    upgrades: usize,
    security: Option<SecurityContext>,
}

impl Default for UpgradeNegotiator {
    fn default() -> Self { Self::new() }
}

impl UpgradeNegotiator {
    /// Create a negotiator in [`UpgradeState::None`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: UpgradeState::None,
            history: vec![UpgradeState::None],
            upgrades: 0,
            security: None,
        }
    }

    /// Current handshake state.
    #[must_use]
    pub fn state(&self) -> UpgradeState { self.state }

    /// Every state visited, starting with [`UpgradeState::None`].
    #[must_use]
    pub fn history(&self) -> &[UpgradeState] { &self.history }

    /// Number of upgrades completed.
    #[must_use]
    pub fn upgrades_completed(&self) -> usize { self.upgrades }

    /// Security context produced by the most recent upgrade.
    #[must_use]
    pub fn security(&self) -> Option<&SecurityContext> { self.security.as_ref() }

    /// Move to `next`, refusing transitions the table does not allow.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::UpgradeTransition`] for an illegal step.
    pub fn transition(&mut self, next: UpgradeState) -> Result<(), InvariantViolation> {
        if !self.state.can_transition_to(next) {
            return Err(InvariantViolation::UpgradeTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Service an upgrade request for `upgrade`.
    ///
    /// On success the reader owns the upgraded connection and the
    /// negotiator is in [`UpgradeState::UpgradeComplete`].
    ///
    /// # Errors
    ///
    /// Returns an `UpgradeInvalid` fault when no acceptor implements the
    /// upgrade or when a security-providing acceptor returns no context. A
    /// handshake that outlives the budget is a timeout and an acceptor I/O
    /// failure surfaces as such. After an acceptor failure the reader owns
    /// no connection.
    pub async fn on_upgrade_request(
        &mut self,
        reader: &mut PreambleReader,
        acceptor: Option<&dyn StreamUpgradeAcceptor>,
        upgrade: &str,
    ) -> Result<(), FramingError> {
        self.transition(UpgradeState::VerifyingUpgradeRequest)?;
        let Some(acceptor) = acceptor.filter(|a| a.can_upgrade(upgrade)) else {
            return Err(FramingError::fault(
                Phase::Upgrade,
                FaultCode::UpgradeInvalid,
                format!("unsupported upgrade {upgrade:?}"),
            ));
        };

        self.transition(UpgradeState::WritingUpgradeAck)?;
        reader
            .write_all(&[record::UPGRADE_RESPONSE], Phase::Upgrade)
            .await?;
        self.transition(UpgradeState::UpgradeAckSent)?;

        self.transition(UpgradeState::BeginUpgrade)?;
        let stream = reader.take_replaying(Phase::Upgrade)?;
        let (upgraded, security) =
            match timeout_at(reader.deadline(), acceptor.accept_upgrade(stream)).await {
                Ok(Ok(result)) => result,
                Ok(Err(source)) => return Err(FramingError::io(Phase::Upgrade, source)),
                Err(_) => {
                    return Err(FramingError::Timeout {
                        phase: Phase::Upgrade,
                        budget: reader.budget(),
                    });
                }
            };

        self.transition(UpgradeState::EndUpgrade)?;
        reader.replace_connection(upgraded);
        if acceptor.provides_security() && security.is_none() {
            return Err(FramingError::fault(
                Phase::Upgrade,
                FaultCode::UpgradeInvalid,
                format!("upgrade {upgrade:?} completed without a security context"),
            ));
        }
        self.security = security;
        self.transition(UpgradeState::UpgradeComplete)?;
        self.upgrades += 1;
        debug!(upgrade, upgrades = self.upgrades, "stream upgrade complete");
        Ok(())
    }

    /// Finish the preamble: check the security requirement and write the
    /// preamble acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an `UpgradeInvalid` fault when an upgrade was required but
    /// none happened, or when the latest upgrade left no security context
    /// where one is required. Write failures surface as timeout or I/O
    /// errors.
    pub async fn on_preamble_end(
        &mut self,
        reader: &mut PreambleReader,
        policy: SecurityPolicy,
    ) -> Result<Option<SecurityContext>, FramingError> {
        self.transition(UpgradeState::WritingPreambleEnd)?;
        if policy.require_upgrade && self.upgrades == 0 {
            return Err(FramingError::fault(
                Phase::Upgrade,
                FaultCode::UpgradeInvalid,
                "endpoint requires a stream upgrade",
            ));
        }
        if policy.requires_security_context && self.upgrades > 0 && self.security.is_none() {
            return Err(FramingError::fault(
                Phase::Upgrade,
                FaultCode::UpgradeInvalid,
                "upgrade completed without a security context",
            ));
        }
        reader
            .write_all(&[record::PREAMBLE_ACK], Phase::SingletonPreamble)
            .await?;
        self.transition(UpgradeState::PreambleEndSent)?;
        Ok(self.security.clone())
    }
}

/// Security requirements checked when the preamble ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// At least one upgrade must have completed.
    pub require_upgrade: bool,
    /// A completed upgrade must have produced a [`SecurityContext`].
    pub requires_security_context: bool,
}
