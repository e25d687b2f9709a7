//! Panic payload rendering for connection-task diagnostics.

use std::{any::Any, fmt};

/// A caught panic payload that renders as its message.
///
/// `panic!` with a literal yields a `&'static str` payload and with format
/// arguments a `String`; anything else is shown through `Debug`.
///
/// ```
/// use netframing::panic::format_panic;
///
/// let caught = std::panic::catch_unwind(|| panic!("decoder state {}", 3)).unwrap_err();
/// assert_eq!(format_panic(caught).to_string(), "decoder state 3");
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl PanicMessage {
    /// The message text, if the payload carried one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.0
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| self.0.downcast_ref::<&'static str>().copied())
    }
}

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(msg) => f.write_str(msg),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// Wrap a payload returned by `catch_unwind`.
pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(panic) }
