//! Incremental preamble decoders.
//!
//! Once the mode is known, a duplex connection sends a session preamble and
//! a singleton connection sends a singleton preamble. Both start with the
//! destination via and the content type; the singleton preamble continues
//! with zero or more upgrade requests and ends with a preamble-end record.
//!
//! The decoders are sans-io. Each [`decode`](SessionDecoder::decode) call
//! performs one step over the bytes already delivered and reports how many
//! it consumed. Callers inspect the state after every step, which is how the
//! via is resolved before the content type is read and how upgrade requests
//! are serviced before the next record is looked at.

mod fields;
mod header;
mod session;
mod singleton;

pub use fields::StringDecoder;
pub use header::HeaderState;
pub use session::SessionDecoder;
pub use singleton::{SingletonDecoder, SingletonState};

use crate::settings::DemuxConfig;

/// Maximum string lengths accepted while decoding a preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreambleLimits {
    /// Longest accepted via, in bytes.
    pub max_via_size: usize,
    /// Longest accepted content type or upgrade name, in bytes.
    pub max_content_type_size: usize,
}

impl Default for PreambleLimits {
    fn default() -> Self { Self::from(&DemuxConfig::default()) }
}

impl From<&DemuxConfig> for PreambleLimits {
    fn from(config: &DemuxConfig) -> Self {
        Self {
            max_via_size: config.max_via_size,
            max_content_type_size: config.max_content_type_size,
        }
    }
}
