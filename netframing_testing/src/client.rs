//! Client-side encoders for the framing preamble.

use bytes::{BufMut, BytesMut};
use netframing::{
    FaultCode,
    chunked::encode_body,
    record,
    varint::IntDecoder,
};

/// Builder for the version, mode, via and content-type records a client
/// sends first.
#[derive(Clone, Debug)]
pub struct ClientPreamble {
    mode: u8,
    via: String,
    content_type: String,
}

impl ClientPreamble {
    /// Preamble for an arbitrary mode byte.
    pub fn new(mode: u8, via: impl Into<String>) -> Self {
        Self {
            mode,
            via: via.into(),
            content_type: "application/soap+msbin1".into(),
        }
    }

    /// Preamble for a duplex session.
    pub fn duplex(via: impl Into<String>) -> Self { Self::new(record::MODE_DUPLEX, via) }

    /// Preamble for an unsized singleton.
    pub fn singleton(via: impl Into<String>) -> Self {
        Self::new(record::MODE_SINGLETON_UNSIZED, via)
    }

    /// Declare `content_type`. Known encodings are sent as a single byte,
    /// anything else as an extensible-encoding string.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Encode the records up to and including the content type.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&[
            record::VERSION,
            record::MAJOR_VERSION,
            record::MINOR_VERSION,
            record::MODE,
            self.mode,
        ]);
        record::put_string_record(&mut buf, record::VIA, &self.via);
        match record::known_encoding_byte(&self.content_type) {
            Some(byte) => buf.put_slice(&[record::KNOWN_ENCODING, byte]),
            None => {
                record::put_string_record(&mut buf, record::EXTENSIBLE_ENCODING, &self.content_type);
            }
        }
        buf
    }

    /// Encode a complete singleton request without upgrades: the header,
    /// the preamble end and `body` chunked by `chunk_sizes`.
    pub fn encode_request(&self, body: &[u8], chunk_sizes: &[usize]) -> BytesMut {
        let mut buf = self.encode();
        buf.put_u8(record::PREAMBLE_END);
        buf.put_slice(&encode_body(body, chunk_sizes));
        buf
    }
}

/// Encode an upgrade request naming `upgrade`.
pub fn upgrade_request(upgrade: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    record::put_string_record(&mut buf, record::UPGRADE_REQUEST, upgrade);
    buf
}

/// Find the fault record in `reply`, skipping any acknowledgement bytes
/// written before it.
pub fn parse_fault(reply: &[u8]) -> Option<FaultCode> {
    let start = reply.iter().position(|&b| b == record::FAULT)?;
    let rest = reply.get(start + 1..)?;
    let mut len = IntDecoder::new();
    let header = len.decode(rest).ok()?;
    let len = usize::try_from(len.value()?).ok()?;
    let text = rest.get(header..header + len)?;
    FaultCode::from_wire(std::str::from_utf8(text).ok()?)
}
