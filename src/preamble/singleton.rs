use super::{
    PreambleLimits,
    fields::StringDecoder,
    header::{HeaderDecoder, HeaderState},
};
use crate::{
    error::{DecodeError, Field},
    mode::expect_record,
    record,
};

/// Progress through a singleton preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SingletonState {
    /// Decoding the via and content-type records.
    Header(HeaderState),
    /// Via and content type decoded; upgrade records may follow.
    PreUpgradeStart,
    /// Awaiting an upgrade request or the preamble end.
    ReadingUpgradeRecord,
    /// Decoding the requested upgrade's content type.
    ReadingUpgradeString,
    /// An upgrade request is decoded and must be serviced.
    UpgradeRequest,
    /// Awaiting the preamble-end record.
    ReadingPreambleEndRecord,
    /// Preamble complete; the message body follows.
    Start,
}

/// Sans-io decoder for a singleton preamble.
///
/// When the state reaches [`SingletonState::UpgradeRequest`] the caller
/// runs the upgrade and then calls [`decode`](Self::decode) again, which
/// returns to [`SingletonState::ReadingUpgradeRecord`] without consuming
/// bytes. Everything decoded after the upgrade must be read from the
/// upgraded stream.
#[derive(Clone, Debug)]
pub struct SingletonDecoder {
    header: HeaderDecoder,
    state: SingletonState,
    upgrade: StringDecoder,
    bytes_decoded: usize,
}

impl SingletonDecoder {
    /// Create a decoder awaiting the via record.
    #[must_use]
    pub fn new(limits: PreambleLimits) -> Self {
        let header = HeaderDecoder::new(limits);
        Self {
            state: SingletonState::Header(header.state()),
            header,
            upgrade: StringDecoder::new(Field::UpgradeType, limits.max_content_type_size),
            bytes_decoded: 0,
        }
    }

    /// Run one decode step over the buffered bytes.
    ///
    /// Steps that only change state consume nothing; the caller keeps
    /// calling until the state it is waiting for is reached.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for unexpected records, oversized or
    /// malformed strings, unknown encodings, or a call after completion.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        let consumed = match self.state {
            SingletonState::Header(_) => {
                let consumed = self.header.decode(bytes)?;
                self.state = match self.header.state() {
                    HeaderState::Complete => SingletonState::PreUpgradeStart,
                    header => SingletonState::Header(header),
                };
                consumed
            }
            SingletonState::PreUpgradeStart => {
                self.state = SingletonState::ReadingUpgradeRecord;
                0
            }
            SingletonState::ReadingUpgradeRecord => match bytes.first() {
                None => 0,
                Some(&record::UPGRADE_REQUEST) => {
                    self.state = SingletonState::ReadingUpgradeString;
                    1
                }
                Some(_) => {
                    self.state = SingletonState::ReadingPreambleEndRecord;
                    0
                }
            },
            SingletonState::ReadingUpgradeString => {
                let consumed = self.upgrade.decode(bytes)?;
                if self.upgrade.is_done() {
                    self.state = SingletonState::UpgradeRequest;
                }
                consumed
            }
            SingletonState::UpgradeRequest => {
                self.upgrade.reset();
                self.state = SingletonState::ReadingUpgradeRecord;
                0
            }
            SingletonState::ReadingPreambleEndRecord => match bytes.first() {
                None => 0,
                Some(&found) => {
                    expect_record(found, record::PREAMBLE_END, "preamble end")?;
                    self.state = SingletonState::Start;
                    1
                }
            },
            SingletonState::Start => return Err(DecodeError::AlreadyComplete),
        };
        self.bytes_decoded += consumed;
        Ok(consumed)
    }

    /// Current decoder state.
    #[must_use]
    pub fn state(&self) -> SingletonState { self.state }

    /// Whether the preamble-end record has been decoded.
    #[must_use]
    pub fn is_done(&self) -> bool { self.state == SingletonState::Start }

    /// Decoded via, available once its string completes.
    #[must_use]
    pub fn via(&self) -> Option<&str> { self.header.via() }

    /// Decoded content type, available once its record completes.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> { self.header.content_type() }

    /// Upgrade content type, while in [`SingletonState::UpgradeRequest`].
    #[must_use]
    pub fn upgrade(&self) -> Option<&str> {
        match self.state {
            SingletonState::UpgradeRequest => self.upgrade.value(),
            _ => None,
        }
    }

    /// Bytes consumed so far, across every stream the preamble spanned.
    #[must_use]
    pub fn bytes_decoded(&self) -> usize { self.bytes_decoded }
}
