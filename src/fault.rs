//! Fault records and best-effort fault delivery.
//!
//! A fault is a framed string naming the failure. After writing it the
//! sender half-closes the connection and drains whatever the peer is still
//! sending, up to a byte budget, so the peer observes a clean close rather
//! than a reset.

use std::{fmt, io, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::{Instant, timeout_at},
};

use crate::{connection::BoxConnection, record};

const FAULT_NAMESPACE: &str = "http://schemas.microsoft.com/ws/2006/05/framing/faults/";
const DRAIN_CHUNK: usize = 4096;

/// Named faults a receiver may report before aborting a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// No endpoint is registered for the via.
    EndpointNotFound,
    /// The endpoint does not accept the declared content type.
    ContentTypeInvalid,
    /// The content type exceeded the configured maximum length.
    ContentTypeTooLong,
    /// The service behind the endpoint failed to activate.
    ServiceActivationFailed,
    /// The endpoint is at capacity.
    ServerTooBusy,
    /// The framing mode is not supported.
    UnsupportedMode,
    /// The framing version is not supported.
    UnsupportedVersion,
    /// The requested upgrade is not supported or did not establish security.
    UpgradeInvalid,
    /// The via exceeded the configured maximum length.
    ViaTooLong,
    /// The endpoint exists but is not accepting connections.
    EndpointUnavailable,
    /// The endpoint failed to take ownership of the connection.
    ConnectionDispatchFailed,
    /// A buffered message exceeded the endpoint's size limit.
    MaxMessageSizeExceeded,
}

impl FaultCode {
    /// Short fault name, also used as a metric label.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::EndpointNotFound => "EndpointNotFound",
            Self::ContentTypeInvalid => "ContentTypeInvalid",
            Self::ContentTypeTooLong => "ContentTypeTooLong",
            Self::ServiceActivationFailed => "ServiceActivationFailed",
            Self::ServerTooBusy => "ServerTooBusy",
            Self::UnsupportedMode => "UnsupportedMode",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::UpgradeInvalid => "UpgradeInvalid",
            Self::ViaTooLong => "ViaTooLong",
            Self::EndpointUnavailable => "EndpointUnavailable",
            Self::ConnectionDispatchFailed => "ConnectionDispatchFailed",
            Self::MaxMessageSizeExceeded => "MaxMessageSizeExceededFault",
        }
    }

    /// Fault string as written on the wire.
    ///
    /// # Examples
    ///
    /// ```
    /// use netframing::fault::FaultCode;
    ///
    /// assert!(
    ///     FaultCode::EndpointNotFound
    ///         .wire_string()
    ///         .ends_with("/faults/EndpointNotFound")
    /// );
    /// ```
    #[must_use]
    pub fn wire_string(self) -> String { format!("{FAULT_NAMESPACE}{}", self.name()) }

    /// Parse a fault string received from a peer.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        let name = value.strip_prefix(FAULT_NAMESPACE)?;
        ALL.iter().copied().find(|code| code.name() == name)
    }

    /// Encode the complete fault record.
    #[must_use]
    pub fn encode(self) -> BytesMut {
        let mut buf = BytesMut::new();
        record::put_string_record(&mut buf, record::FAULT, &self.wire_string());
        buf
    }
}

const ALL: [FaultCode; 12] = [
    FaultCode::EndpointNotFound,
    FaultCode::ContentTypeInvalid,
    FaultCode::ContentTypeTooLong,
    FaultCode::ServiceActivationFailed,
    FaultCode::ServerTooBusy,
    FaultCode::UnsupportedMode,
    FaultCode::UnsupportedVersion,
    FaultCode::UpgradeInvalid,
    FaultCode::ViaTooLong,
    FaultCode::EndpointUnavailable,
    FaultCode::ConnectionDispatchFailed,
    FaultCode::MaxMessageSizeExceeded,
];

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Limits applied while delivering a fault.
#[derive(Clone, Copy, Debug)]
pub struct FaultDelivery {
    /// Total time allowed for writing, shutdown and draining.
    pub timeout: Duration,
    /// Maximum number of peer bytes to discard before giving up.
    pub max_drain: usize,
}

/// Write `code` to `connection`, half-close it and drain pending input.
///
/// The connection is consumed and dropped on return regardless of outcome.
///
/// # Errors
///
/// Returns an [`io::Error`] if the write or shutdown fails, the budget
/// elapses, or the peer sends more than `max_drain` bytes.
pub async fn send_fault(
    mut connection: BoxConnection,
    code: FaultCode,
    limits: FaultDelivery,
) -> io::Result<()> {
    let deadline = Instant::now() + limits.timeout;
    let record = code.encode();
    with_deadline(deadline, async {
        connection.write_all(&record).await?;
        connection.flush().await?;
        connection.shutdown().await
    })
    .await?;
    drain(&mut connection, deadline, limits.max_drain).await
}

/// Discard input until end of stream, failing past `max_drain` bytes.
///
/// # Errors
///
/// Returns an [`io::Error`] on read failure, timeout, or budget overrun.
pub async fn drain(
    connection: &mut BoxConnection,
    deadline: Instant,
    max_drain: usize,
) -> io::Result<()> {
    let mut scratch = [0_u8; DRAIN_CHUNK];
    let mut drained = 0_usize;
    loop {
        let n = with_deadline(deadline, connection.read(&mut scratch)).await?;
        if n == 0 {
            return Ok(());
        }
        drained += n;
        if drained > max_drain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("peer sent more than {max_drain} bytes after fault"),
            ));
        }
    }
}

async fn with_deadline<T>(
    deadline: Instant,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    timeout_at(deadline, fut)
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "fault delivery timed out")))
}
