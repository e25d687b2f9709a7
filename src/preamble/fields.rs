//! Length-prefixed string field decoding.

use crate::{
    error::{DecodeError, Field},
    varint::IntDecoder,
};

/// Incremental decoder for a length-prefixed UTF-8 string.
///
/// The declared length is checked against `max_len` before any string
/// bytes are buffered, so a hostile peer cannot make the decoder allocate
/// more than the configured maximum.
#[derive(Clone, Debug)]
pub struct StringDecoder {
    field: Field,
    max_len: usize,
    size: IntDecoder,
    expected: Option<usize>,
    bytes: Vec<u8>,
    value: Option<String>,
}

impl StringDecoder {
    /// Create a decoder for `field` bounded by `max_len` bytes.
    #[must_use]
    pub fn new(field: Field, max_len: usize) -> Self {
        Self {
            field,
            max_len,
            size: IntDecoder::new(),
            expected: None,
            bytes: Vec::new(),
            value: None,
        }
    }

    /// Consume bytes until the string completes or input runs out.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::FieldTooLong`] if the declared length exceeds
    /// the maximum, [`DecodeError::InvalidUtf8`] for malformed text, or
    /// [`DecodeError::InvalidSize`] for a malformed length prefix.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        if self.value.is_some() {
            return Err(DecodeError::AlreadyComplete);
        }
        let mut consumed = 0;
        let expected = if let Some(expected) = self.expected {
            expected
        } else {
            consumed += self.size.decode(bytes)?;
            let Some(len) = self.size.value() else {
                return Ok(consumed);
            };
            let len = usize::try_from(len).map_err(|_| DecodeError::InvalidSize)?;
            if len > self.max_len {
                return Err(DecodeError::FieldTooLong {
                    field: self.field,
                    len,
                    max: self.max_len,
                });
            }
            self.bytes.reserve_exact(len);
            self.expected = Some(len);
            len
        };

        let wanted = expected - self.bytes.len();
        let rest = &bytes[consumed..];
        let take = wanted.min(rest.len());
        self.bytes.extend_from_slice(&rest[..take]);
        consumed += take;

        if self.bytes.len() == expected {
            let raw = std::mem::take(&mut self.bytes);
            let text = String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8(self.field))?;
            self.value = Some(text);
        }
        Ok(consumed)
    }

    /// Whether the full string has been decoded.
    #[must_use]
    pub fn is_done(&self) -> bool { self.value.is_some() }

    /// Decoded string, once complete.
    #[must_use]
    pub fn value(&self) -> Option<&str> { self.value.as_deref() }

    /// Bytes consumed so far, including the length prefix.
    #[must_use]
    pub fn bytes_decoded(&self) -> usize {
        let body = self
            .value
            .as_ref()
            .map_or(self.bytes.len(), String::len);
        self.size.bytes_read() + body
    }

    /// Clear the decoder for the next string of the same field.
    pub fn reset(&mut self) { *self = Self::new(self.field, self.max_len); }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use proptest::prelude::*;

    use super::*;
    use crate::record;

    fn encoded(value: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        record::put_string(&mut buf, value);
        buf.to_vec()
    }

    #[test]
    fn empty_string_completes_after_length() {
        let mut decoder = StringDecoder::new(Field::Via, 16);
        assert_eq!(decoder.decode(&[0x00, 0xaa]).expect("decode"), 1);
        assert_eq!(decoder.value(), Some(""));
    }

    #[test]
    fn rejects_declared_length_above_maximum() {
        let mut decoder = StringDecoder::new(Field::ContentType, 4);
        let err = decoder.decode(&encoded("too long")).expect_err("too long");
        assert_eq!(
            err,
            DecodeError::FieldTooLong {
                field: Field::ContentType,
                len: 8,
                max: 4,
            }
        );
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut decoder = StringDecoder::new(Field::Via, 16);
        let err = decoder.decode(&[0x02, 0xc3, 0x28]).expect_err("bad utf-8");
        assert_eq!(err, DecodeError::InvalidUtf8(Field::Via));
    }

    proptest! {
        #[test]
        fn fragmented_strings_round_trip(
            value in "[a-z0-9:/._+-]{0,300}",
            fragment in 1_usize..17,
        ) {
            let bytes = encoded(&value);
            let mut decoder = StringDecoder::new(Field::Via, 300);
            let mut consumed = 0;
            for chunk in bytes.chunks(fragment) {
                consumed += decoder.decode(chunk).expect("decode");
            }
            prop_assert_eq!(consumed, bytes.len());
            prop_assert_eq!(decoder.value(), Some(value.as_str()));
            prop_assert_eq!(decoder.bytes_decoded(), bytes.len());
        }
    }
}
