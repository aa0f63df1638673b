//! Serializer capability the codecs are parametric over.
//!
//! This module contains:
//! - The envelope header shared by every message
//! - The `Protocol` trait (envelope and value reads/writes)
//! - `BinaryProtocol`, the capability shipped with the crate

pub mod binary;

pub use binary::BinaryProtocol;

use crate::error::{Error, Result};

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

/// Read side of a protocol: a cursor over buffered bytes.
///
/// The cursor position doubles as a checkpoint: a caller can remember
/// `position()` and restore it with `set_position()` when a read runs out of
/// bytes.
pub type InputBuffer<'a> = Cursor<&'a [u8]>;

/// Type of message carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Request from client to server.
    Call = 0x01,
    /// Successful answer to a call.
    Reply = 0x02,
    /// Failed answer to a call.
    Exception = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Error> {
        match value {
            0x01 => Ok(Self::Call),
            0x02 => Ok(Self::Reply),
            0x03 => Ok(Self::Exception),
            _ => Err(Error::MalformedFrame(format!(
                "Unknown message type: {value:#x}"
            ))),
        }
    }
}

/// Header that opens every message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Kind of message.
    pub message_type: MessageType,
    /// Name of the called method.
    pub method: String,
    /// Correlates a reply with its call.
    pub seq_id: i32,
}

impl EnvelopeHeader {
    /// Create a new envelope header.
    pub fn new(message_type: MessageType, method: impl Into<String>, seq_id: i32) -> Self {
        Self {
            message_type,
            method: method.into(),
            seq_id,
        }
    }
}

/// Byte-level serialization of envelopes and values.
///
/// Every read fails with [`Error::InsufficientData`] when the buffer ends
/// before the item does, and with [`Error::MalformedFrame`] when the bytes
/// cannot be what the protocol says they are.
pub trait Protocol: Clone + Send + Sync + Unpin + 'static {
    /// Write the envelope header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be represented by the protocol.
    fn write_envelope_begin(&self, header: &EnvelopeHeader, dst: &mut BytesMut) -> Result<()>;

    /// Read an envelope header.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer does not start with a valid header.
    fn read_envelope_begin(&self, src: &mut InputBuffer<'_>) -> Result<EnvelopeHeader>;

    /// Write one value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    fn write_value<T: Serialize + ?Sized>(&self, value: &T, dst: &mut BytesMut) -> Result<()>;

    /// Read one value.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer does not hold a complete, valid value.
    fn read_value<T: DeserializeOwned>(&self, src: &mut InputBuffer<'_>) -> Result<T>;

    /// Consume one value without interpreting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer does not hold a complete value.
    fn skip_value(&self, src: &mut InputBuffer<'_>) -> Result<()>;
}

/// Fail with `InsufficientData` unless `needed` bytes remain.
pub(crate) fn ensure_remaining(src: &InputBuffer<'_>, needed: usize) -> Result<()> {
    let available = src.remaining();
    if available < needed {
        return Err(Error::InsufficientData { needed, available });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_wire() {
        assert_eq!(MessageType::try_from(1).unwrap(), MessageType::Call);
        assert_eq!(MessageType::try_from(2).unwrap(), MessageType::Reply);
        assert_eq!(MessageType::try_from(3).unwrap(), MessageType::Exception);
        assert!(matches!(
            MessageType::try_from(4),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_ensure_remaining() {
        let data = [0u8; 3];
        let src = Cursor::new(&data[..]);
        assert!(ensure_remaining(&src, 3).is_ok());
        assert!(matches!(
            ensure_remaining(&src, 4),
            Err(Error::InsufficientData {
                needed: 4,
                available: 3
            })
        ));
    }
}
