//! Owned message buffers.

use crate::events::PipeId;

/// An opaque, length-prefixed message body.
///
/// A message is either *valid* (owns a body, possibly empty) or *invalid* (a
/// placeholder handed to completion handlers when no payload exists). Taking
/// the body out of a message leaves the source invalid.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Message {
    body: Option<Vec<u8>>,
    pipe: Option<PipeId>,
}

impl Message {
    /// Creates a valid message owning `body`.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Some(body.into()),
            pipe: None,
        }
    }

    /// Creates a valid message with a zero-length body.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            body: Some(Vec::new()),
            pipe: None,
        }
    }

    /// Creates the invalid placeholder.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            body: None,
            pipe: None,
        }
    }

    /// `true` if the message owns a body.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.body.is_some()
    }

    /// Body length in bytes (`0` for an invalid message).
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }

    /// `true` if the body is empty or the message is invalid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the body (empty for an invalid message).
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    /// Consumes the message, returning its body if valid.
    #[must_use]
    pub fn into_body(self) -> Option<Vec<u8>> {
        self.body
    }

    /// Moves the contents out, leaving `self` invalid.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// The link a received message arrived on.
    #[must_use]
    pub const fn pipe(&self) -> Option<PipeId> {
        self.pipe
    }

    pub(crate) fn with_pipe(mut self, pipe: PipeId) -> Self {
        self.pipe = Some(pipe);
        self
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Self::new(body)
    }
}

impl From<&[u8]> for Message {
    fn from(body: &[u8]) -> Self {
        Self::new(body.to_vec())
    }
}

impl From<&str> for Message {
    fn from(body: &str) -> Self {
        Self::new(body.as_bytes().to_vec())
    }
}
