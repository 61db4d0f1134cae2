//! Errors raised while encoding, decoding or framing commands.

use thiserror::Error;

/// Failures of the wire codec and frame reassembly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not well-formed XML or does not follow the command layout.
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    /// A `Hello` request was bundled with other content or a sender id.
    #[error("a Hello request must be sent alone and without a sender id")]
    InvalidHello,
    /// Commands are never sent empty.
    #[error("refusing to encode an empty command")]
    EmptyCommand,
    /// Serialization failed, e.g. because a parameter name is not a valid tag.
    #[error("failed to encode command: {0}")]
    Encode(String),
    /// The peer kept sending without ever terminating the frame.
    #[error("frame exceeds {limit} bytes without a terminator")]
    FrameTooLarge { limit: usize },
    /// A request lacks a parameter its type declares as required.
    #[error("request `{kind}` is missing required parameter `{name}`")]
    MissingParameter { kind: String, name: String },
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCommand(reason.into())
    }
}
