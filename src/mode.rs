//! Incremental decoder for the version and mode records.
//!
//! A fresh connection opens with a version record followed by a mode
//! record. [`ModeDecoder`] consumes exactly those five bytes, however they
//! are fragmented, and leaves anything after them for the preamble decoder.

use std::fmt;

use crate::{error::DecodeError, record};

/// Session kind requested by the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramingMode {
    /// Long-lived bidirectional session.
    Duplex,
    /// One request (and possibly one reply) per connection.
    Singleton,
    /// A mode the protocol defines but this receiver does not serve.
    Unsupported(u8),
}

impl FramingMode {
    /// Classify a mode byte.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownMode`] for bytes that name no mode.
    pub fn from_wire(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            record::MODE_DUPLEX => Ok(Self::Duplex),
            record::MODE_SINGLETON_UNSIZED => Ok(Self::Singleton),
            record::MODE_SIMPLEX | record::MODE_SINGLETON_SIZED => Ok(Self::Unsupported(byte)),
            other => Err(DecodeError::UnknownMode(other)),
        }
    }

    /// Stable lowercase name used in logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplex => "duplex",
            Self::Singleton => "singleton",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    ReadingVersionRecord,
    ReadingMajorVersion,
    ReadingMinorVersion { major: u8 },
    ReadingModeRecord,
    ReadingModeValue,
    Done(FramingMode),
}

/// Sans-io decoder for the opening version and mode records.
///
/// # Examples
///
/// ```
/// use netframing::mode::{FramingMode, ModeDecoder};
///
/// let mut decoder = ModeDecoder::new();
/// let bytes = [0x00, 0x01, 0x00, 0x01, 0x02, 0xff];
/// let consumed = decoder.decode(&bytes).expect("valid mode records");
/// assert_eq!(consumed, 5);
/// assert_eq!(decoder.mode(), Some(FramingMode::Duplex));
/// ```
#[derive(Clone, Debug)]
pub struct ModeDecoder {
    state: State,
    bytes_decoded: usize,
}

impl Default for ModeDecoder {
    fn default() -> Self { Self::new() }
}

impl ModeDecoder {
    /// Create a decoder awaiting the version record.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::ReadingVersionRecord,
            bytes_decoded: 0,
        }
    }

    /// Consume bytes until the mode is known or input runs out.
    ///
    /// Returns the number of bytes consumed. Bytes after the mode record are
    /// never consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for an unexpected record, an unsupported
    /// major version, or a byte that names no mode. Calling `decode` after
    /// the mode is known yields [`DecodeError::AlreadyComplete`].
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        if self.is_done() {
            return Err(DecodeError::AlreadyComplete);
        }
        let mut consumed = 0;
        for &byte in bytes {
            self.state = match self.state {
                State::ReadingVersionRecord => expect_record(byte, record::VERSION, "version")
                    .map(|()| State::ReadingMajorVersion)?,
                State::ReadingMajorVersion => State::ReadingMinorVersion { major: byte },
                State::ReadingMinorVersion { major } => {
                    if major != record::MAJOR_VERSION {
                        return Err(DecodeError::UnsupportedVersion { major, minor: byte });
                    }
                    State::ReadingModeRecord
                }
                State::ReadingModeRecord => {
                    expect_record(byte, record::MODE, "mode").map(|()| State::ReadingModeValue)?
                }
                State::ReadingModeValue => State::Done(FramingMode::from_wire(byte)?),
                State::Done(_) => break,
            };
            consumed += 1;
            self.bytes_decoded += 1;
            if self.is_done() {
                break;
            }
        }
        Ok(consumed)
    }

    /// Decoded mode, once known.
    #[must_use]
    pub fn mode(&self) -> Option<FramingMode> {
        match self.state {
            State::Done(mode) => Some(mode),
            _ => None,
        }
    }

    /// Whether the mode record has been fully decoded.
    #[must_use]
    pub fn is_done(&self) -> bool { matches!(self.state, State::Done(_)) }

    /// Bytes consumed so far. Zero means the peer has sent nothing.
    #[must_use]
    pub fn bytes_decoded(&self) -> usize { self.bytes_decoded }
}

pub(crate) fn expect_record(
    found: u8,
    expected_tag: u8,
    expected: &'static str,
) -> Result<(), DecodeError> {
    if found == expected_tag {
        Ok(())
    } else {
        Err(DecodeError::UnexpectedRecord { found, expected })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const PREFIX: [u8; 4] = [record::VERSION, 1, 0, record::MODE];

    fn records(mode: u8) -> Vec<u8> {
        let mut bytes = PREFIX.to_vec();
        bytes.push(mode);
        bytes
    }

    #[rstest]
    #[case(record::MODE_DUPLEX, FramingMode::Duplex)]
    #[case(record::MODE_SINGLETON_UNSIZED, FramingMode::Singleton)]
    #[case(record::MODE_SIMPLEX, FramingMode::Unsupported(record::MODE_SIMPLEX))]
    #[case(
        record::MODE_SINGLETON_SIZED,
        FramingMode::Unsupported(record::MODE_SINGLETON_SIZED)
    )]
    fn classifies_modes(#[case] byte: u8, #[case] expected: FramingMode) {
        let mut decoder = ModeDecoder::new();
        let mut bytes = records(byte);
        bytes.extend_from_slice(b"trailing");
        assert_eq!(decoder.decode(&bytes).expect("decode"), 5);
        assert_eq!(decoder.mode(), Some(expected));
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    fn tolerates_fragmented_delivery(#[case] fragment: usize) {
        let bytes = records(record::MODE_DUPLEX);
        let mut decoder = ModeDecoder::new();
        let mut offset = 0;
        for chunk in bytes.chunks(fragment) {
            assert!(!decoder.is_done());
            offset += decoder.decode(chunk).expect("decode");
        }
        assert_eq!(offset, bytes.len());
        assert_eq!(decoder.mode(), Some(FramingMode::Duplex));
    }

    #[test]
    fn minor_version_is_not_checked() {
        let mut decoder = ModeDecoder::new();
        decoder
            .decode(&[record::VERSION, 1, 9, record::MODE, record::MODE_DUPLEX])
            .expect("minor versions are compatible");
        assert!(decoder.is_done());
    }

    #[rstest]
    #[case(&[0x05], DecodeError::UnexpectedRecord { found: 0x05, expected: "version" })]
    #[case(&[0x00, 2, 0], DecodeError::UnsupportedVersion { major: 2, minor: 0 })]
    #[case(&[0x00, 1, 0, 0x02], DecodeError::UnexpectedRecord { found: 0x02, expected: "mode" })]
    #[case(&[0x00, 1, 0, 0x01, 0x09], DecodeError::UnknownMode(0x09))]
    fn rejects_invalid_records(#[case] bytes: &[u8], #[case] expected: DecodeError) {
        let mut decoder = ModeDecoder::new();
        assert_eq!(decoder.decode(bytes).expect_err("invalid"), expected);
    }

    #[test]
    fn refuses_to_decode_past_completion() {
        let mut decoder = ModeDecoder::new();
        decoder
            .decode(&records(record::MODE_SINGLETON_UNSIZED))
            .expect("decode");
        assert_eq!(decoder.decode(&[0]), Err(DecodeError::AlreadyComplete));
    }
}
