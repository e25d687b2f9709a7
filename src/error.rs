//! Error types for the framing layer.
//!
//! The taxonomy separates wire-level decode failures ([`DecodeError`]) from
//! the per-connection outcomes the demultiplexer contains
//! ([`FramingError`]):
//!
//! - protocol faults, which carry a [`FaultCode`] sent to the peer;
//! - timeouts, tagged with the [`Phase`] that ran out of time;
//! - premature end of stream, distinct from a clean idle close;
//! - internal invariant violations, which indicate a bug rather than a bad
//!   peer;
//! - transport I/O failures.

use std::{fmt, io, time::Duration};

use thiserror::Error;

use crate::{fault::FaultCode, upgrade::UpgradeState};

/// Pipeline stage in which an error occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Reading the version and mode records.
    Mode,
    /// Decoding a duplex session preamble.
    SessionPreamble,
    /// Decoding a singleton preamble.
    SingletonPreamble,
    /// Running a stream upgrade handshake.
    Upgrade,
    /// Reading a singleton message body.
    Body,
    /// Handing the connection to an endpoint listener.
    Dispatch,
}

impl Phase {
    /// Stable lowercase name used in logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mode => "mode",
            Self::SessionPreamble => "session_preamble",
            Self::SingletonPreamble => "singleton_preamble",
            Self::Upgrade => "upgrade",
            Self::Body => "body",
            Self::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Preamble field bounded by a configured maximum length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    /// Destination URI.
    Via,
    /// Declared content type.
    ContentType,
    /// Upgrade content type named by an upgrade request.
    UpgradeType,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Via => "via",
            Self::ContentType => "content type",
            Self::UpgradeType => "upgrade type",
        })
    }
}

/// Wire-level decode failures raised by the incremental decoders.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A record tag other than the one the decoder expected.
    #[error("unexpected record {found:#04x} while expecting {expected}")]
    UnexpectedRecord {
        /// Tag received from the peer.
        found: u8,
        /// Human readable description of the expected record.
        expected: &'static str,
    },

    /// The peer speaks an unsupported major version.
    #[error("unsupported framing version {major}.{minor}")]
    UnsupportedVersion {
        /// Major version received.
        major: u8,
        /// Minor version received.
        minor: u8,
    },

    /// The mode byte is not a framing mode at all.
    #[error("unknown framing mode {0:#04x}")]
    UnknownMode(u8),

    /// A string field declared a length above its configured maximum.
    #[error("{field} exceeds max length: {len} > {max}")]
    FieldTooLong {
        /// Offending field.
        field: Field,
        /// Declared length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(Field),

    /// A known-encoding byte outside the encoding table.
    #[error("unknown known-encoding {0:#04x}")]
    UnknownEncoding(u8),

    /// A multi-byte integer was malformed or out of range.
    #[error("invalid multi-byte integer")]
    InvalidSize,

    /// The decoder was driven after reaching a terminal state.
    #[error("decoder driven past its terminal state")]
    AlreadyComplete,
}

impl DecodeError {
    /// Fault reported to the peer for this error, if the protocol defines one.
    #[must_use]
    pub fn fault(&self) -> Option<FaultCode> {
        match self {
            Self::UnsupportedVersion { .. } => Some(FaultCode::UnsupportedVersion),
            Self::UnknownMode(_) => Some(FaultCode::UnsupportedMode),
            Self::FieldTooLong {
                field: Field::Via, ..
            } => Some(FaultCode::ViaTooLong),
            Self::FieldTooLong {
                field: Field::ContentType,
                ..
            } => Some(FaultCode::ContentTypeTooLong),
            Self::FieldTooLong {
                field: Field::UpgradeType,
                ..
            } => Some(FaultCode::UpgradeInvalid),
            Self::UnknownEncoding(_) => Some(FaultCode::ContentTypeInvalid),
            Self::UnexpectedRecord { .. }
            | Self::InvalidUtf8(_)
            | Self::InvalidSize
            | Self::AlreadyComplete => None,
        }
    }
}

/// A broken internal invariant. Never caused by valid or invalid peer input.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The upgrade negotiator was asked for a transition its table forbids.
    #[error("illegal upgrade transition: {from:?} -> {to:?}")]
    UpgradeTransition {
        /// Current state.
        from: UpgradeState,
        /// Requested state.
        to: UpgradeState,
    },

    /// The connection was missing when a stage needed it.
    #[error("connection already taken during {0}")]
    ConnectionTaken(Phase),

    /// A decoder reported completion without producing its value.
    #[error("decoder completed without a value during {0}")]
    MissingValue(Phase),
}

/// Per-connection failure contained at the demultiplexer boundary.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Malformed or unsupported preamble bytes.
    #[error("decode failed during {phase}: {source}")]
    Decode {
        /// Stage that was decoding.
        phase: Phase,
        /// Underlying decode error.
        #[source]
        source: DecodeError,
    },

    /// A protocol-level rejection with a fault to report to the peer.
    #[error("{code} during {phase}: {detail}")]
    Fault {
        /// Stage that rejected the connection.
        phase: Phase,
        /// Fault reported to the peer.
        code: FaultCode,
        /// Diagnostic detail for logs.
        detail: String,
    },

    /// The stage's time budget elapsed.
    #[error("{phase} timed out after {budget:?}")]
    Timeout {
        /// Stage that ran out of time.
        phase: Phase,
        /// Budget the stage started with.
        budget: Duration,
    },

    /// The peer closed the stream part-way through a record.
    #[error("premature end of stream during {phase} after {bytes_decoded} bytes")]
    PrematureEof {
        /// Stage that was reading.
        phase: Phase,
        /// Bytes decoded in this stage before the stream ended.
        bytes_decoded: usize,
    },

    /// An implementation defect.
    #[error("internal framing error: {0}")]
    Internal(#[from] InvariantViolation),

    /// Transport failure.
    #[error("I/O error during {phase}: {source}")]
    Io {
        /// Stage performing the I/O.
        phase: Phase,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl FramingError {
    pub(crate) fn decode(phase: Phase, source: DecodeError) -> Self { Self::Decode { phase, source } }

    pub(crate) fn fault(phase: Phase, code: FaultCode, detail: impl Into<String>) -> Self {
        Self::Fault {
            phase,
            code,
            detail: detail.into(),
        }
    }

    pub(crate) fn io(phase: Phase, source: io::Error) -> Self { Self::Io { phase, source } }

    /// Fault to send to the peer before tearing the connection down.
    #[must_use]
    pub fn fault_code(&self) -> Option<FaultCode> {
        match self {
            Self::Decode { source, .. } => source.fault(),
            Self::Fault { code, .. } => Some(*code),
            Self::Timeout { .. }
            | Self::PrematureEof { .. }
            | Self::Internal(_)
            | Self::Io { .. } => None,
        }
    }

    /// Stage in which the error occurred, when known.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Decode { phase, .. }
            | Self::Fault { phase, .. }
            | Self::Timeout { phase, .. }
            | Self::PrematureEof { phase, .. }
            | Self::Io { phase, .. } => Some(*phase),
            Self::Internal(_) => None,
        }
    }

    /// Whether this is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool { matches!(self, Self::Timeout { .. }) }

    /// Whether this indicates an implementation defect.
    #[must_use]
    pub fn is_internal(&self) -> bool { matches!(self, Self::Internal(_)) }

    /// Whether the peer violated or rejected the protocol.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::Fault { .. } | Self::PrematureEof { .. }
        )
    }

    /// Stable category name used in logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::Fault { .. } => "fault",
            Self::Timeout { .. } => "timeout",
            Self::PrematureEof { .. } => "premature_eof",
            Self::Internal(_) => "internal",
            Self::Io { .. } => "io",
        }
    }
}

/// Failure reported by an [`EndpointListener`](crate::endpoint::EndpointListener).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The service behind the endpoint could not be activated.
    #[error("service activation failed: {0}")]
    ActivationFailed(String),

    /// The endpoint exists but is not accepting connections.
    #[error("endpoint unavailable")]
    Unavailable,

    /// The endpoint is at capacity.
    #[error("server too busy")]
    TooBusy,

    /// The endpoint failed while taking ownership of the connection.
    #[error("dispatch failed: {0}")]
    Failed(#[from] io::Error),
}

impl DispatchError {
    /// Fault reported to the peer when dispatch fails before hand-off.
    #[must_use]
    pub fn fault(&self) -> FaultCode {
        match self {
            Self::ActivationFailed(_) => FaultCode::ServiceActivationFailed,
            Self::Unavailable => FaultCode::EndpointUnavailable,
            Self::TooBusy => FaultCode::ServerTooBusy,
            Self::Failed(_) => FaultCode::ConnectionDispatchFailed,
        }
    }
}
