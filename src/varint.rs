//! Multi-byte integer encoding shared by string fields and chunk lengths.
//!
//! Values are split into 7-bit groups, least significant group first. The
//! high bit of each byte signals that another byte follows. At most
//! [`MAX_ENCODED_LEN`] bytes are permitted and the decoded value must fit in
//! a non-negative `i32`.

use bytes::BufMut;

use crate::error::DecodeError;

/// Maximum number of bytes a single encoded integer may occupy.
pub const MAX_ENCODED_LEN: usize = 5;

/// Largest value representable on the wire.
pub const MAX_VALUE: u32 = 0x7fff_ffff;

const CONTINUATION: u8 = 0x80;
const VALUE_MASK: u8 = 0x7f;
// The fifth byte may only carry the remaining three bits of a 31-bit value.
const LAST_BYTE_MASK: u8 = 0xf8;

/// Return the number of bytes `value` occupies once encoded.
///
/// # Examples
///
/// ```
/// use netframing::varint::encoded_len;
///
/// assert_eq!(encoded_len(0), 1);
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// ```
#[must_use]
pub fn encoded_len(value: u32) -> usize {
    let mut len = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Append the encoding of `value` to `dst`.
///
/// # Panics
///
/// Debug builds assert that `value` does not exceed [`MAX_VALUE`].
///
/// # Examples
///
/// ```
/// use netframing::varint::encode;
///
/// let mut buf = Vec::new();
/// encode(300, &mut buf);
/// assert_eq!(buf, [0xac, 0x02]);
/// ```
pub fn encode<B: BufMut>(value: u32, dst: &mut B) {
    debug_assert!(value <= MAX_VALUE, "varint value exceeds i32::MAX");
    let mut rest = value;
    loop {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to seven bits before the cast"
        )]
        let group = (rest & u32::from(VALUE_MASK)) as u8;
        rest >>= 7;
        if rest == 0 {
            dst.put_u8(group);
            return;
        }
        dst.put_u8(group | CONTINUATION);
    }
}

/// Incremental decoder for a single multi-byte integer.
///
/// Bytes may be supplied one at a time or in larger slices; the decoder
/// never looks past the terminating byte.
#[derive(Clone, Debug, Default)]
pub struct IntDecoder {
    value: u32,
    index: usize,
    done: bool,
}

impl IntDecoder {
    /// Create a decoder awaiting the first byte.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Consume bytes from `bytes` until the integer completes or input runs
    /// out, returning the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidSize`] if the encoding is longer than
    /// [`MAX_ENCODED_LEN`] bytes or the value exceeds [`MAX_VALUE`].
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        let mut consumed = 0;
        for &byte in bytes {
            if self.done {
                break;
            }
            if self.index == MAX_ENCODED_LEN - 1 && byte & LAST_BYTE_MASK != 0 {
                return Err(DecodeError::InvalidSize);
            }
            self.value |= u32::from(byte & VALUE_MASK) << (7 * self.index);
            self.index += 1;
            consumed += 1;
            if byte & CONTINUATION == 0 {
                self.done = true;
            }
        }
        Ok(consumed)
    }

    /// Whether the terminating byte has been seen.
    #[must_use]
    pub fn is_done(&self) -> bool { self.done }

    /// Decoded value, once complete.
    #[must_use]
    pub fn value(&self) -> Option<u32> { self.done.then_some(self.value) }

    /// Number of bytes consumed so far.
    #[must_use]
    pub fn bytes_read(&self) -> usize { self.index }

    /// Prepare the decoder for the next integer.
    pub fn reset(&mut self) { *self = Self::default(); }
}
