//! Via and content-type records shared by both preamble variants.

use super::{PreambleLimits, fields::StringDecoder};
use crate::{
    error::{DecodeError, Field},
    mode::expect_record,
    record,
};

/// Progress through the via and content-type records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderState {
    /// Awaiting the via record tag.
    ReadingViaRecord,
    /// Decoding the via string.
    ReadingViaString,
    /// Awaiting a known or extensible encoding record.
    ReadingContentTypeRecord,
    /// Decoding an extensible content-type string.
    ReadingContentTypeString,
    /// Awaiting a known-encoding byte.
    ReadingContentTypeByte,
    /// Via and content type are both decoded.
    Complete,
}

#[derive(Clone, Debug)]
pub(crate) struct HeaderDecoder {
    state: HeaderState,
    via: StringDecoder,
    content_type: StringDecoder,
    known_content_type: Option<&'static str>,
}

impl HeaderDecoder {
    pub(crate) fn new(limits: PreambleLimits) -> Self {
        Self {
            state: HeaderState::ReadingViaRecord,
            via: StringDecoder::new(Field::Via, limits.max_via_size),
            content_type: StringDecoder::new(Field::ContentType, limits.max_content_type_size),
            known_content_type: None,
        }
    }

    pub(crate) fn state(&self) -> HeaderState { self.state }

    /// Run one step. Stops after the via completes so the caller can
    /// resolve it before any content-type bytes are consumed.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        let Some(&first) = bytes.first() else {
            return Ok(0);
        };
        match self.state {
            HeaderState::ReadingViaRecord => {
                expect_record(first, record::VIA, "via")?;
                self.state = HeaderState::ReadingViaString;
                Ok(1)
            }
            HeaderState::ReadingViaString => {
                let consumed = self.via.decode(bytes)?;
                if self.via.is_done() {
                    self.state = HeaderState::ReadingContentTypeRecord;
                }
                Ok(consumed)
            }
            HeaderState::ReadingContentTypeRecord => {
                self.state = match first {
                    record::KNOWN_ENCODING => HeaderState::ReadingContentTypeByte,
                    record::EXTENSIBLE_ENCODING => HeaderState::ReadingContentTypeString,
                    found => {
                        return Err(DecodeError::UnexpectedRecord {
                            found,
                            expected: "content type",
                        });
                    }
                };
                Ok(1)
            }
            HeaderState::ReadingContentTypeByte => {
                let content_type =
                    record::known_encoding(first).ok_or(DecodeError::UnknownEncoding(first))?;
                self.known_content_type = Some(content_type);
                self.state = HeaderState::Complete;
                Ok(1)
            }
            HeaderState::ReadingContentTypeString => {
                let consumed = self.content_type.decode(bytes)?;
                if self.content_type.is_done() {
                    self.state = HeaderState::Complete;
                }
                Ok(consumed)
            }
            HeaderState::Complete => Err(DecodeError::AlreadyComplete),
        }
    }

    pub(crate) fn via(&self) -> Option<&str> { self.via.value() }

    pub(crate) fn content_type(&self) -> Option<&str> {
        self.known_content_type.or_else(|| self.content_type.value())
    }
}
