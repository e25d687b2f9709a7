use super::{
    PreambleLimits,
    header::{HeaderDecoder, HeaderState},
};
use crate::error::DecodeError;

/// Sans-io decoder for a duplex session preamble.
///
/// Terminal once the content type is decoded; anything after it belongs to
/// the session handler.
#[derive(Clone, Debug)]
pub struct SessionDecoder {
    header: HeaderDecoder,
    bytes_decoded: usize,
}

impl SessionDecoder {
    /// Create a decoder awaiting the via record.
    #[must_use]
    pub fn new(limits: PreambleLimits) -> Self {
        Self {
            header: HeaderDecoder::new(limits),
            bytes_decoded: 0,
        }
    }

    /// Run one decode step over the buffered bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for unexpected records, oversized or
    /// malformed strings, unknown encodings, or a call after completion.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        let consumed = self.header.decode(bytes)?;
        self.bytes_decoded += consumed;
        Ok(consumed)
    }

    /// Current decoder state.
    #[must_use]
    pub fn state(&self) -> HeaderState { self.header.state() }

    /// Whether the preamble has been fully decoded.
    #[must_use]
    pub fn is_done(&self) -> bool { self.state() == HeaderState::Complete }

    /// Decoded via, available once its string completes.
    #[must_use]
    pub fn via(&self) -> Option<&str> { self.header.via() }

    /// Decoded content type, available once its record completes.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> { self.header.content_type() }

    /// Bytes consumed so far.
    #[must_use]
    pub fn bytes_decoded(&self) -> usize { self.bytes_decoded }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use rstest::rstest;

    use super::*;
    use crate::{error::Field, record};

    fn preamble(via: &str, encoding: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        record::put_string_record(&mut buf, record::VIA, via);
        buf.put_slice(encoding);
        buf.to_vec()
    }

    fn drive(decoder: &mut SessionDecoder, bytes: &[u8]) -> Result<usize, DecodeError> {
        let mut offset = 0;
        while !decoder.is_done() && offset < bytes.len() {
            offset += decoder.decode(&bytes[offset..])?;
        }
        Ok(offset)
    }

    #[test]
    fn decodes_known_encoding_and_leaves_payload() {
        let mut bytes = preamble("net.tcp://host/svc", &[record::KNOWN_ENCODING, 0x08]);
        bytes.extend_from_slice(&[0x06, 0x01]);
        let mut decoder = SessionDecoder::new(PreambleLimits::default());

        let consumed = drive(&mut decoder, &bytes).expect("decode");
        assert_eq!(consumed, bytes.len() - 2);
        assert_eq!(decoder.via(), Some("net.tcp://host/svc"));
        assert_eq!(decoder.content_type(), Some("application/soap+msbinsession1"));
        assert_eq!(decoder.bytes_decoded(), consumed);
    }

    #[test]
    fn pauses_after_via_before_content_type() {
        let bytes = preamble("net.tcp://h/", &[record::KNOWN_ENCODING, 0x07]);
        let mut decoder = SessionDecoder::new(PreambleLimits::default());
        let mut offset = 0;
        while decoder.via().is_none() {
            offset += decoder.decode(&bytes[offset..]).expect("decode");
        }
        assert_eq!(decoder.state(), HeaderState::ReadingContentTypeRecord);
        assert_eq!(bytes[offset], record::KNOWN_ENCODING);
    }

    #[test]
    fn decodes_extensible_content_type() {
        let mut encoding = BytesMut::new();
        record::put_string_record(&mut encoding, record::EXTENSIBLE_ENCODING, "application/json");
        let bytes = preamble("net.tcp://h/", &encoding);
        let mut decoder = SessionDecoder::new(PreambleLimits::default());
        drive(&mut decoder, &bytes).expect("decode");
        assert_eq!(decoder.content_type(), Some("application/json"));
    }

    #[rstest]
    #[case(&[0x05], DecodeError::UnexpectedRecord { found: 0x05, expected: "via" })]
    #[case(&[0x02, 0x00, 0x09], DecodeError::UnexpectedRecord { found: 0x09, expected: "content type" })]
    #[case(&[0x02, 0x00, 0x03, 0x40], DecodeError::UnknownEncoding(0x40))]
    fn rejects_malformed_preambles(#[case] bytes: &[u8], #[case] expected: DecodeError) {
        let mut decoder = SessionDecoder::new(PreambleLimits::default());
        assert_eq!(drive(&mut decoder, bytes).expect_err("invalid"), expected);
    }

    #[test]
    fn enforces_via_limit() {
        let limits = PreambleLimits {
            max_via_size: 8,
            max_content_type_size: 8,
        };
        let bytes = preamble("net.tcp://far-too-long/", &[]);
        let mut decoder = SessionDecoder::new(limits);
        let err = drive(&mut decoder, &bytes).expect_err("via too long");
        assert!(matches!(
            err,
            DecodeError::FieldTooLong {
                field: Field::Via,
                ..
            }
        ));
    }
}
