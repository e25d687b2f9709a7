//! Singleton preamble, upgrades and body.

use std::{io, sync::Arc};

use bytes::Bytes;
use tokio::{io::AsyncReadExt, time::timeout};
use tracing::trace;

use super::{Handoff, Inner, activate, check_content_type};
use crate::{
    chunked::ChunkedReader,
    connection::{BoxConnection, PreambleReader},
    endpoint::{SingletonConnection, SingletonMessage},
    error::{FramingError, InvariantViolation, Phase},
    fault::FaultCode,
    preamble::{SingletonDecoder, SingletonState},
    rewind_stream::RewindStream,
    settings::{TransferMode, TransportSettings},
    upgrade::UpgradeNegotiator,
};

const PHASE: Phase = Phase::SingletonPreamble;

/// Decode the singleton preamble, servicing upgrade requests as they
/// arrive, then read or wrap the message body.
pub(super) async fn negotiate(
    inner: &Arc<Inner>,
    reader: &mut PreambleReader,
) -> Result<Handoff, FramingError> {
    let mut decoder = SingletonDecoder::new(inner.limits);
    let mut negotiator = UpgradeNegotiator::new();
    let mut settings: Option<Arc<TransportSettings>> = None;
    let missing = || FramingError::from(InvariantViolation::MissingValue(PHASE));

    while !decoder.is_done() {
        match decoder.state() {
            SingletonState::UpgradeRequest => {
                let settings = settings.as_deref().ok_or_else(missing)?;
                let upgrade = decoder.upgrade().ok_or_else(missing)?.to_owned();
                negotiator
                    .on_upgrade_request(
                        reader,
                        settings.upgrade().map(Arc::as_ref),
                        &upgrade,
                    )
                    .await?;
                decoder
                    .decode(&[])
                    .map_err(|e| FramingError::decode(Phase::Upgrade, e))?;
            }
            SingletonState::PreUpgradeStart => {
                let settings = settings.as_deref().ok_or_else(missing)?;
                let content_type = decoder.content_type().ok_or_else(missing)?;
                check_content_type(settings, content_type, PHASE)?;
                decoder
                    .decode(&[])
                    .map_err(|e| FramingError::decode(PHASE, e))?;
            }
            _ => {
                let progress = decoder.bytes_decoded();
                reader
                    .step(PHASE, progress, |bytes| decoder.decode(bytes))
                    .await?;
                if settings.is_none()
                    && let Some(via) = decoder.via()
                {
                    settings = Some(inner.resolve(via, PHASE)?);
                }
            }
        }
    }

    let settings = settings.ok_or_else(missing)?;
    let via = decoder.via().ok_or_else(missing)?.to_owned();
    let content_type = decoder.content_type().ok_or_else(missing)?.to_owned();
    activate(&settings, &via, reader.deadline(), reader.budget()).await?;
    let security = negotiator
        .on_preamble_end(reader, settings.security_policy())
        .await?;
    trace!(
        %via,
        upgrades = negotiator.upgrades_completed(),
        "singleton preamble complete"
    );

    let connection = reader.take_replaying(Phase::Body)?;
    let body_reader = ChunkedReader::new(connection, inner.config.connection_buffer_size);
    let message = match settings.mode() {
        TransferMode::Streamed => SingletonMessage::Streamed(body_reader),
        TransferMode::Buffered => match read_body(body_reader, &settings).await {
            Ok((body, connection)) => SingletonMessage::Buffered { body, connection },
            Err((err, connection)) => {
                reader.replace_connection(connection);
                return Err(err);
            }
        },
    };

    Ok(Handoff::Singleton(
        Arc::clone(&settings),
        SingletonConnection {
            via,
            content_type,
            security,
            settings,
            message,
            reuse: inner.reuse_handle(),
        },
    ))
}

/// Reassemble a chunked body of at most the endpoint's buffered size,
/// within its receive timeout.
///
/// On failure the raw connection is returned with the error so a fault can
/// still be written.
async fn read_body(
    mut body_reader: ChunkedReader<BoxConnection>,
    settings: &TransportSettings,
) -> Result<(Bytes, BoxConnection), (FramingError, BoxConnection)> {
    let limit = settings.max_message_size();
    let mut body = Vec::new();
    let read = timeout(
        settings.receive_budget(),
        (&mut body_reader)
            .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
            .read_to_end(&mut body),
    )
    .await;

    let err = match read {
        Ok(Ok(_)) if body.len() > limit => FramingError::fault(
            Phase::Body,
            FaultCode::MaxMessageSizeExceeded,
            format!("message exceeds {limit} bytes"),
        ),
        Ok(Ok(_)) => {
            let (leftover, connection) = body_reader.into_parts();
            let connection: BoxConnection = if leftover.is_empty() {
                connection
            } else {
                Box::new(RewindStream::new(leftover, connection))
            };
            return Ok((Bytes::from(body), connection));
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => FramingError::PrematureEof {
            phase: Phase::Body,
            bytes_decoded: body_reader.payload_len(),
        },
        Ok(Err(e)) => FramingError::io(Phase::Body, e),
        Err(_) => FramingError::Timeout {
            phase: Phase::Body,
            budget: settings.receive_budget(),
        },
    };
    let (_, connection) = body_reader.into_parts();
    Err((err, connection))
}
