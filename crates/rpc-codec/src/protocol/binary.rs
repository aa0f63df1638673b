//! Big-endian binary protocol.
//!
//! Envelope header, strict form:
//!
//! ```text
//! i32 version | type    (0x8001_00TT)
//! i32 name length, name bytes (UTF-8)
//! i32 sequence id
//! ```
//!
//! Old-style form (no version word): name length, name, `u8` type, sequence id.
//! Values are a `u32` byte length followed by the bincode encoding.

use super::{EnvelopeHeader, InputBuffer, MessageType, Protocol, ensure_remaining};
use crate::error::{Error, Result};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

/// Version word of the strict envelope header.
pub const VERSION_1: u32 = 0x8001_0000;

const VERSION_MASK: u32 = 0xffff_0000;
const TYPE_MASK: u32 = 0x0000_00ff;

/// The binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryProtocol {
    strict_read: bool,
    strict_write: bool,
}

impl BinaryProtocol {
    /// Create a protocol that reads and writes versioned headers only.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            strict_read: true,
            strict_write: true,
        }
    }

    /// Accept or reject headers without a version word.
    #[must_use]
    pub const fn with_strict_read(mut self, strict: bool) -> Self {
        self.strict_read = strict;
        self
    }

    /// Write versioned or old-style headers.
    #[must_use]
    pub const fn with_strict_write(mut self, strict: bool) -> Self {
        self.strict_write = strict;
        self
    }

    fn read_i32(src: &mut InputBuffer<'_>) -> Result<i32> {
        ensure_remaining(src, 4)?;
        Ok(src.get_i32())
    }

    fn read_u8(src: &mut InputBuffer<'_>) -> Result<u8> {
        ensure_remaining(src, 1)?;
        Ok(src.get_u8())
    }

    fn read_string_body(src: &mut InputBuffer<'_>, len: usize) -> Result<String> {
        ensure_remaining(src, len)?;
        let value = std::str::from_utf8(&src.chunk()[..len])
            .map_err(|e| Error::MalformedFrame(format!("Invalid method name: {e}")))?
            .to_owned();
        src.advance(len);
        Ok(value)
    }

    fn read_string(src: &mut InputBuffer<'_>) -> Result<String> {
        let len = Self::read_i32(src)?;
        let len = usize::try_from(len)
            .map_err(|_| Error::MalformedFrame(format!("Negative string length: {len}")))?;
        Self::read_string_body(src, len)
    }

    fn write_string(value: &str, dst: &mut BytesMut) -> Result<()> {
        let len = i32::try_from(value.len()).map_err(|_| {
            Error::UnrecognizedPayload(format!("String of {} bytes is too long", value.len()))
        })?;
        dst.put_i32(len);
        dst.put_slice(value.as_bytes());
        Ok(())
    }

    fn read_value_len(src: &mut InputBuffer<'_>) -> Result<usize> {
        ensure_remaining(src, 4)?;
        let len = src.get_u32() as usize;
        ensure_remaining(src, len)?;
        Ok(len)
    }
}

impl Default for BinaryProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for BinaryProtocol {
    fn write_envelope_begin(&self, header: &EnvelopeHeader, dst: &mut BytesMut) -> Result<()> {
        if self.strict_write {
            dst.put_u32(VERSION_1 | u32::from(header.message_type as u8));
            Self::write_string(&header.method, dst)?;
        } else {
            Self::write_string(&header.method, dst)?;
            dst.put_u8(header.message_type as u8);
        }
        dst.put_i32(header.seq_id);
        Ok(())
    }

    fn read_envelope_begin(&self, src: &mut InputBuffer<'_>) -> Result<EnvelopeHeader> {
        let size = Self::read_i32(src)?;

        if size < 0 {
            #[allow(clippy::cast_sign_loss)]
            let word = size as u32;
            let version = word & VERSION_MASK;
            if version != VERSION_1 {
                return Err(Error::MalformedFrame(format!(
                    "Bad version in envelope header: {version:#010x}"
                )));
            }

            #[allow(clippy::cast_possible_truncation)]
            let message_type = MessageType::try_from((word & TYPE_MASK) as u8)?;
            let method = Self::read_string(src)?;
            let seq_id = Self::read_i32(src)?;

            Ok(EnvelopeHeader {
                message_type,
                method,
                seq_id,
            })
        } else {
            if self.strict_read {
                return Err(Error::MalformedFrame(
                    "Missing version in envelope header".to_string(),
                ));
            }

            #[allow(clippy::cast_sign_loss)]
            let method = Self::read_string_body(src, size as usize)?;
            let message_type = MessageType::try_from(Self::read_u8(src)?)?;
            let seq_id = Self::read_i32(src)?;

            Ok(EnvelopeHeader {
                message_type,
                method,
                seq_id,
            })
        }
    }

    fn write_value<T: Serialize + ?Sized>(&self, value: &T, dst: &mut BytesMut) -> Result<()> {
        let encoded = bincode::serialize(value)
            .map_err(|e| Error::UnrecognizedPayload(format!("Failed to serialize: {e}")))?;
        let len = u32::try_from(encoded.len()).map_err(|_| {
            Error::UnrecognizedPayload(format!("Value of {} bytes is too long", encoded.len()))
        })?;

        dst.reserve(4 + encoded.len());
        dst.put_u32(len);
        dst.put_slice(&encoded);
        Ok(())
    }

    fn read_value<T: DeserializeOwned>(&self, src: &mut InputBuffer<'_>) -> Result<T> {
        let len = Self::read_value_len(src)?;
        let value = bincode::deserialize(&src.chunk()[..len])?;
        src.advance(len);
        Ok(value)
    }

    fn skip_value(&self, src: &mut InputBuffer<'_>) -> Result<()> {
        let len = Self::read_value_len(src)?;
        src.advance(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_header(protocol: BinaryProtocol, header: &EnvelopeHeader) -> BytesMut {
        let mut buf = BytesMut::new();
        protocol.write_envelope_begin(header, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_strict_header_layout() {
        let header = EnvelopeHeader::new(MessageType::Call, "ping", 7);
        let buf = encode_header(BinaryProtocol::new(), &header);

        assert_eq!(
            &buf[..],
            &[
                0x80, 0x01, 0x00, 0x01, // version | type
                0x00, 0x00, 0x00, 0x04, b'p', b'i', b'n', b'g', // name
                0x00, 0x00, 0x00, 0x07, // seq id
            ]
        );

        let mut src = Cursor::new(&buf[..]);
        let decoded = BinaryProtocol::new().read_envelope_begin(&mut src).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(src.remaining(), 0);
    }

    #[test]
    fn test_old_style_header() {
        let header = EnvelopeHeader::new(MessageType::Reply, "ping", 3);
        let buf = encode_header(BinaryProtocol::new().with_strict_write(false), &header);

        // Rejected by a strict reader.
        let mut src = Cursor::new(&buf[..]);
        assert!(matches!(
            BinaryProtocol::new().read_envelope_begin(&mut src),
            Err(Error::MalformedFrame(_))
        ));

        // Accepted by a lenient one.
        let mut src = Cursor::new(&buf[..]);
        let decoded = BinaryProtocol::new()
            .with_strict_read(false)
            .read_envelope_begin(&mut src)
            .unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_bad_version() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x8002_0001);
        buf.put_i32(0);
        buf.put_i32(1);

        let mut src = Cursor::new(&buf[..]);
        let err = BinaryProtocol::new()
            .read_envelope_begin(&mut src)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_partial_header() {
        let header = EnvelopeHeader::new(MessageType::Call, "ping", 1);
        let buf = encode_header(BinaryProtocol::new(), &header);

        for len in 0..buf.len() {
            let mut src = Cursor::new(&buf[..len]);
            let err = BinaryProtocol::new()
                .read_envelope_begin(&mut src)
                .unwrap_err();
            assert!(err.is_insufficient_data(), "prefix of {len} bytes: {err}");
        }
    }

    #[test]
    fn test_value_roundtrip_and_skip() {
        let protocol = BinaryProtocol::new();
        let mut buf = BytesMut::new();
        protocol.write_value("hello", &mut buf).unwrap();
        protocol.write_value(&42u64, &mut buf).unwrap();

        let mut src = Cursor::new(&buf[..]);
        protocol.skip_value(&mut src).unwrap();
        let value: u64 = protocol.read_value(&mut src).unwrap();
        assert_eq!(value, 42);
        assert_eq!(src.remaining(), 0);
    }

    #[test]
    fn test_truncated_value() {
        let protocol = BinaryProtocol::new();
        let mut buf = BytesMut::new();
        protocol
            .write_value(&"a longer string value".to_string(), &mut buf)
            .unwrap();

        let mut src = Cursor::new(&buf[..buf.len() - 1]);
        let err = protocol.read_value::<String>(&mut src).unwrap_err();
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_undecodable_value() {
        let protocol = BinaryProtocol::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(7); // not a valid bool

        let mut src = Cursor::new(&buf[..]);
        let err = protocol.read_value::<bool>(&mut src).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }
}
