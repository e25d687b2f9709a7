//! Record type tags and fixed values used on the wire.
//!
//! Every preamble record starts with a one-byte type tag. String-bearing
//! records follow the tag with a [`varint`](crate::varint) length and UTF-8
//! bytes. The values match the .NET Message Framing protocol so that
//! existing peers interoperate.

use bytes::{BufMut, BytesMut};

use crate::varint;

/// Version record: major and minor version bytes follow.
pub const VERSION: u8 = 0x00;
/// Mode record: one mode byte follows.
pub const MODE: u8 = 0x01;
/// Via record: destination URI string follows.
pub const VIA: u8 = 0x02;
/// Known encoding record: one encoding byte follows.
pub const KNOWN_ENCODING: u8 = 0x03;
/// Extensible encoding record: content type string follows.
pub const EXTENSIBLE_ENCODING: u8 = 0x04;
/// Unsized envelope record: chunked body follows.
pub const UNSIZED_ENVELOPE: u8 = 0x05;
/// Sized envelope record.
pub const SIZED_ENVELOPE: u8 = 0x06;
/// End record.
pub const END: u8 = 0x07;
/// Fault record: fault string follows.
pub const FAULT: u8 = 0x08;
/// Upgrade request record: upgrade content type string follows.
pub const UPGRADE_REQUEST: u8 = 0x09;
/// Upgrade response record.
pub const UPGRADE_RESPONSE: u8 = 0x0a;
/// Preamble acknowledgement record.
pub const PREAMBLE_ACK: u8 = 0x0b;
/// Preamble end record.
pub const PREAMBLE_END: u8 = 0x0c;

/// Supported major framing version.
pub const MAJOR_VERSION: u8 = 1;
/// Minor framing version emitted by this implementation.
pub const MINOR_VERSION: u8 = 0;

/// Mode byte for singleton connections with an unsized (chunked) envelope.
pub const MODE_SINGLETON_UNSIZED: u8 = 0x01;
/// Mode byte for duplex sessions.
pub const MODE_DUPLEX: u8 = 0x02;
/// Mode byte for simplex sessions.
pub const MODE_SIMPLEX: u8 = 0x03;
/// Mode byte for singleton connections with a sized envelope.
pub const MODE_SINGLETON_SIZED: u8 = 0x04;

/// Known encodings, indexed by their encoding byte.
const KNOWN_ENCODINGS: [&str; 9] = [
    "text/xml; charset=utf-8",
    "text/xml; charset=utf-16",
    "text/xml; charset=unicodeFFFE",
    "application/soap+xml; charset=utf-8",
    "application/soap+xml; charset=utf-16",
    "application/soap+xml; charset=unicodeFFFE",
    "multipart/related",
    "application/soap+msbin1",
    "application/soap+msbinsession1",
];

/// Map a known-encoding byte to its content type.
///
/// # Examples
///
/// ```
/// use netframing::record::known_encoding;
///
/// assert_eq!(known_encoding(0x07), Some("application/soap+msbin1"));
/// assert_eq!(known_encoding(0x42), None);
/// ```
#[must_use]
pub fn known_encoding(byte: u8) -> Option<&'static str> {
    KNOWN_ENCODINGS.get(usize::from(byte)).copied()
}

/// Map a content type to its known-encoding byte, if it has one.
#[must_use]
pub fn known_encoding_byte(content_type: &str) -> Option<u8> {
    KNOWN_ENCODINGS
        .iter()
        .position(|known| *known == content_type)
        .and_then(|index| u8::try_from(index).ok())
}

/// Append a record carrying a length-prefixed string.
///
/// # Panics
///
/// Debug builds assert the string length fits the wire integer range.
pub fn put_string_record(dst: &mut BytesMut, record: u8, value: &str) {
    dst.reserve(1 + varint::MAX_ENCODED_LEN + value.len());
    dst.put_u8(record);
    put_string(dst, value);
}

/// Append a length-prefixed string without a record tag.
pub fn put_string(dst: &mut BytesMut, value: &str) {
    let len = u32::try_from(value.len()).unwrap_or(varint::MAX_VALUE);
    varint::encode(len, dst);
    dst.put_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings_round_trip_through_byte() {
        for byte in 0..=8_u8 {
            let content_type = known_encoding(byte).expect("table entry");
            assert_eq!(known_encoding_byte(content_type), Some(byte));
        }
    }

    #[test]
    fn string_record_is_tag_length_bytes() {
        let mut buf = BytesMut::new();
        put_string_record(&mut buf, VIA, "net.tcp://h/");
        assert_eq!(buf[0], VIA);
        assert_eq!(buf[1], 12);
        assert_eq!(&buf[2..], b"net.tcp://h/");
    }
}
