//! Error types for the call/reply codecs.

use crate::call::ApplicationException;

use std::io;

use thiserror::Error;

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for codec operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No factory is registered for the method.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// A call was sent while another one was still awaiting its reply.
    #[error("Call to {method} rejected: call {outstanding_seq_id} is still outstanding")]
    ConcurrentCallViolation {
        /// Method of the rejected call.
        method: String,
        /// Sequence id of the call that is still outstanding.
        outstanding_seq_id: i32,
    },

    /// An inbound reply does not belong to the outstanding call.
    #[error("Sequence id mismatch: expected {expected:?}, got {actual}")]
    SequenceMismatch {
        /// Sequence id of the outstanding call, if any.
        expected: Option<i32>,
        /// Sequence id carried by the envelope.
        actual: i32,
    },

    /// The peer sent something this side of the protocol never accepts.
    #[error("Peer protocol violation: {0}")]
    PeerProtocolViolation(String),

    /// An outbound payload does not have the expected shape.
    #[error("Unrecognized payload: {0}")]
    UnrecognizedPayload(String),

    /// Not enough bytes buffered to decode one complete message.
    #[error("Insufficient data: need {needed} bytes, {available} available")]
    InsufficientData {
        /// Bytes required by the read that failed.
        needed: usize,
        /// Bytes that were left in the buffer.
        available: usize,
    },

    /// Corrupt or structurally invalid frame.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer answered the call with an exception.
    #[error("Application exception: {0}")]
    Application(#[from] ApplicationException),

    /// The connection was closed; its state is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error leaves the connection unusable.
    ///
    /// Fatal errors close the connection: sequence numbering or framing can no
    /// longer be trusted once they happen.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::UnknownMethod(_)
            | Self::ConcurrentCallViolation { .. }
            | Self::UnrecognizedPayload(_)
            | Self::InsufficientData { .. }
            | Self::Application(_) => false,
            Self::SequenceMismatch { .. }
            | Self::PeerProtocolViolation(_)
            | Self::MalformedFrame(_)
            | Self::ConnectionClosed
            | Self::Io(_) => true,
        }
    }

    /// Whether more bytes could turn this failure into a successful decode.
    #[must_use]
    pub const fn is_insufficient_data(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::MalformedFrame(err.to_string())
    }
}
