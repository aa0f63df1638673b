//! Server codec for transports that carry no length prefix.
//!
//! Message boundaries are discovered by decoding: each attempt starts from a
//! checkpoint at the front of the accumulated buffer, and an attempt that runs
//! out of bytes rolls back to it and waits for the next chunk. Bytes are only
//! consumed once a whole message has been decoded.

use super::ServerCodec;
use crate::call::{Dispatch, Payload, Reply};
use crate::config::CodecConfig;
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::registry::Registry;

use std::io::Cursor;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{error, trace};

/// Server codec with speculative framing.
pub struct UnframedServerCodec<P> {
    inner: ServerCodec<P>,
}

impl<P: Protocol> UnframedServerCodec<P> {
    /// Create a codec for a new connection dispatching through `registry`.
    #[must_use]
    pub fn new(protocol: P, registry: Arc<Registry<P>>, config: CodecConfig) -> Self {
        Self {
            inner: ServerCodec::new(protocol, registry, config),
        }
    }

    /// Try to decode one message from the front of `buf`.
    ///
    /// On success the message's bytes are consumed from `buf`. If `buf` does
    /// not yet hold a whole message, `Ok(None)` is returned and `buf` is left
    /// exactly as it was.
    ///
    /// # Errors
    ///
    /// Any decode failure other than running out of bytes is fatal and closes
    /// the codec, as does a partial message larger than the configured maximum
    /// frame size.
    pub fn on_inbound(&self, buf: &mut BytesMut) -> Result<Option<Dispatch<P>>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut src = Cursor::new(&buf[..]);
        let checkpoint = src.position();

        match self.inner.on_inbound(&mut src) {
            Ok(dispatch) => {
                #[allow(clippy::cast_possible_truncation)]
                let consumed = (src.position() - checkpoint) as usize;
                buf.advance(consumed);
                Ok(Some(dispatch))
            }
            Err(e) if e.is_insufficient_data() => {
                src.set_position(checkpoint);
                if buf.len() > self.inner.config().max_frame_size {
                    let e = Error::MalformedFrame(format!(
                        "No message in {} buffered bytes (limit {})",
                        buf.len(),
                        self.inner.config().max_frame_size
                    ));
                    error!("Closing server connection: {}", e);
                    self.inner.close();
                    return Err(e);
                }

                trace!("Waiting for more bytes ({} buffered): {}", buf.len(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Serialize `reply`, which must answer the pending call.
    ///
    /// # Errors
    ///
    /// See [`ServerCodec::send`].
    pub fn send(&self, reply: &Reply<P>) -> Result<bytes::Bytes> {
        self.inner.send(reply)
    }

    /// Close the codec, discarding the pending sequence id.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether the codec has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Sequence id of the call awaiting its reply, if any.
    #[must_use]
    pub fn pending_seq_id(&self) -> Option<i32> {
        self.inner.pending_seq_id()
    }
}

impl<P: Clone> Clone for UnframedServerCodec<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Protocol> Decoder for UnframedServerCodec<P> {
    type Item = Dispatch<P>;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.on_inbound(buf)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.on_inbound(buf)? {
            Some(dispatch) => Ok(Some(dispatch)),
            None if buf.is_empty() => Ok(None),
            None => {
                self.close();
                Err(Error::MalformedFrame(format!(
                    "Connection closed with {} bytes of a partial message",
                    buf.len()
                )))
            }
        }
    }
}

impl<P: Protocol> Encoder<Payload<P>> for UnframedServerCodec<P> {
    type Error = Error;

    fn encode(&mut self, item: Payload<P>, dst: &mut BytesMut) -> Result<()> {
        match item {
            Payload::Reply(reply) => {
                let bytes = self.send(&reply)?;
                dst.extend_from_slice(&bytes);
                Ok(())
            }
            Payload::Call(call) => Err(Error::UnrecognizedPayload(format!(
                "Server cannot send a call to {}",
                call.method()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BinaryProtocol, EnvelopeHeader, MessageType};
    use crate::registry::CallFactory;

    use bytes::BufMut;
    use proptest::prelude::*;

    fn codec() -> UnframedServerCodec<BinaryProtocol> {
        let registry = Registry::new().with(CallFactory::new::<String, String>("echo"));
        UnframedServerCodec::new(
            BinaryProtocol::new(),
            Arc::new(registry),
            CodecConfig::default(),
        )
    }

    fn call_bytes(method: &str, seq_id: i32, argument: &str) -> BytesMut {
        let protocol = BinaryProtocol::new();
        let mut buf = BytesMut::new();
        let header = EnvelopeHeader::new(MessageType::Call, method, seq_id);
        protocol.write_envelope_begin(&header, &mut buf).unwrap();
        protocol.write_value(argument, &mut buf).unwrap();
        buf
    }

    fn expect_call(dispatch: Option<Dispatch<BinaryProtocol>>) -> crate::call::Call<BinaryProtocol> {
        match dispatch {
            Some(Dispatch::Call(call)) => call,
            other => panic!("expected a call, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_message_is_retained() {
        let codec = codec();
        let message = call_bytes("echo", 1, "hello");

        let mut buf = BytesMut::from(&message[..3]);
        assert!(codec.on_inbound(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &message[..3]);
        assert_eq!(codec.pending_seq_id(), None);

        buf.put_slice(&message[3..]);
        let call = expect_call(codec.on_inbound(&mut buf).unwrap());
        assert_eq!(call.argument::<String>().map(String::as_str), Some("hello"));
        assert_eq!(call.seq_id(), Some(1));
        assert!(buf.is_empty());
        assert_eq!(codec.pending_seq_id(), Some(1));
    }

    #[test]
    fn test_back_to_back_messages() {
        let codec = codec();
        let mut buf = call_bytes("echo", 1, "a");
        let second = call_bytes("echo", 2, "b");
        buf.put_slice(&second);

        let call = expect_call(codec.on_inbound(&mut buf).unwrap());
        assert_eq!(call.seq_id(), Some(1));
        assert_eq!(&buf[..], &second[..]);

        codec.send(&call.reply("a".to_string()).unwrap()).unwrap();
        let call = expect_call(codec.on_inbound(&mut buf).unwrap());
        assert_eq!(call.seq_id(), Some(2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_garbage_is_fatal() {
        let codec = codec();
        let mut buf = BytesMut::new();
        buf.put_u32(0x1234_5678);
        buf.put_slice(b"garbage");

        let err = codec.on_inbound(&mut buf).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
        assert!(codec.is_closed());
    }

    #[test]
    fn test_oversized_partial_message_is_fatal() {
        let registry = Registry::new().with(CallFactory::new::<String, String>("echo"));
        let codec = UnframedServerCodec::new(
            BinaryProtocol::new(),
            Arc::new(registry),
            CodecConfig::new().with_max_frame_size(16),
        );

        let message = call_bytes("echo", 1, "a string longer than sixteen bytes");
        let mut buf = BytesMut::from(&message[..message.len() - 1]);
        let err = codec.on_inbound(&mut buf).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
        assert!(codec.is_closed());
    }

    #[test]
    fn test_eof_with_partial_message() {
        let mut codec = codec();
        let message = call_bytes("echo", 1, "hello");
        let mut buf = BytesMut::from(&message[..message.len() - 2]);

        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(Error::MalformedFrame(_))
        ));
        assert!(codec.is_closed());
    }

    proptest! {
        #[test]
        fn test_any_split_yields_one_call(argument in ".{0,64}", seq_id in 1..i32::MAX, split in 0usize..512) {
            let codec = codec();
            let message = call_bytes("echo", seq_id, &argument);
            let split = split % message.len();

            let mut buf = BytesMut::from(&message[..split]);
            prop_assert!(codec.on_inbound(&mut buf).unwrap().is_none());
            prop_assert_eq!(&buf[..], &message[..split]);

            buf.put_slice(&message[split..]);
            let call = expect_call(codec.on_inbound(&mut buf).unwrap());
            prop_assert_eq!(call.seq_id(), Some(seq_id));
            prop_assert_eq!(call.argument::<String>(), Some(&argument));
            prop_assert!(buf.is_empty());
        }
    }
}
