//! Duplex session preamble.

use std::sync::Arc;

use super::{Handoff, Inner, activate, check_content_type};
use crate::{
    connection::PreambleReader,
    endpoint::SessionConnection,
    error::{FramingError, InvariantViolation, Phase},
    preamble::SessionDecoder,
};

const PHASE: Phase = Phase::SessionPreamble;

/// Decode the via and content type, resolve and activate the endpoint, and
/// package the connection for its session listener.
pub(super) async fn negotiate(
    inner: &Arc<Inner>,
    reader: &mut PreambleReader,
) -> Result<Handoff, FramingError> {
    let mut decoder = SessionDecoder::new(inner.limits);
    let mut settings = None;
    while !decoder.is_done() {
        let progress = decoder.bytes_decoded();
        reader
            .step(PHASE, progress, |bytes| decoder.decode(bytes))
            .await?;
        // Resolve as soon as the via is known so unknown endpoints are
        // refused before the content type is read.
        if settings.is_none()
            && let Some(via) = decoder.via()
        {
            settings = Some(inner.resolve(via, PHASE)?);
        }
    }

    let missing = || FramingError::from(InvariantViolation::MissingValue(PHASE));
    let settings = settings.ok_or_else(missing)?;
    let via = decoder.via().ok_or_else(missing)?.to_owned();
    let content_type = decoder.content_type().ok_or_else(missing)?.to_owned();
    check_content_type(&settings, &content_type, PHASE)?;
    activate(&settings, &via, reader.deadline(), reader.budget()).await?;

    let connection = reader.take_replaying(PHASE)?;
    Ok(Handoff::Session(
        settings,
        SessionConnection {
            connection,
            via,
            content_type,
            reuse: inner.reuse_handle(),
        },
    ))
}
