//! Per-connection codecs translating calls and replies to bytes and back.
//!
//! Every codec is a cheap, clonable handle over one connection's state, so
//! the read half and the write half of a connection can each own a clone.
//! Each codec implements `tokio_util::codec::{Decoder, Encoder}` and can be
//! dropped into `Framed`, `FramedRead` or `FramedWrite`.

pub mod client;
pub mod server;
pub mod unframed;

pub use client::ClientCodec;
pub use server::ServerCodec;
pub use unframed::UnframedServerCodec;

use crate::config::CodecConfig;
use crate::error::{Error, Result};
use crate::protocol::InputBuffer;

use std::io;

use tokio_util::codec::LengthDelimitedCodec;

/// Length-prefixed framing: 4-byte big-endian length, then the message.
pub(crate) fn length_prefixed(config: &CodecConfig) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(config.max_frame_size)
        .new_codec()
}

/// Map a framing failure to a codec error.
pub(crate) fn frame_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::InvalidData {
        Error::MalformedFrame(err.to_string())
    } else {
        Error::Io(err)
    }
}

/// A complete frame that still runs out of bytes is corrupt.
pub(crate) fn within_frame(err: Error) -> Error {
    match err {
        Error::InsufficientData { needed, available } => Error::MalformedFrame(format!(
            "Truncated message: need {needed} more bytes, frame has {available}"
        )),
        other => other,
    }
}

/// A decoded message has to use up its whole frame.
pub(crate) fn ensure_consumed(src: &InputBuffer<'_>) -> Result<()> {
    let len = src.get_ref().len();
    let consumed = usize::try_from(src.position()).unwrap_or(usize::MAX);
    if consumed < len {
        return Err(Error::MalformedFrame(format!(
            "{} trailing bytes after message",
            len - consumed
        )));
    }
    Ok(())
}
