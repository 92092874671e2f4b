//! Parse error record
//!
//! A single error type used across scalar, container, and streamer parsing.
//! Every record carries the offending byte position and a window of the
//! preceding input so a failure deep inside a document can be located
//! without re-parsing.

use serde::Serialize;

/// Maximum number of bytes of preceding input captured next to an error.
const CONTEXT_MAX_LENGTH: usize = 80;

/// A deserialization failure with positional context.
///
/// `position` is absolute over everything fed to the cursor so far;
/// `context` holds up to 80 bytes of the input window preceding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message} [position {position}, after ..{context}]")]
pub struct Error {
    message: String,
    context: String,
    position: usize,
}

impl Error {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: String::new(),
            position: 0,
        }
    }

    /// The record raised when input ends while quotes or brackets are
    /// still open.
    pub(crate) fn malformed() -> Self {
        Self::new("Malformed JSON. Missing closing quotes or brackets")
    }

    /// Attach the context window. `window` is the input chunk that was
    /// being parsed, `local` the offset of the failure inside it and
    /// `absolute` the failure position over the whole feed.
    pub(crate) fn with_context(mut self, window: &[u8], local: usize, absolute: usize) -> Self {
        let local = local.min(window.len());
        let take = local.min(CONTEXT_MAX_LENGTH);
        self.context = String::from_utf8_lossy(&window[local - take..local]).into_owned();
        self.position = absolute;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Up to 80 bytes of input preceding the failure.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Absolute byte position of the failure across all fed windows.
    pub fn position(&self) -> usize {
        self.position
    }
}
