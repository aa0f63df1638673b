//! Server side: dispatch through the registry, answer against the pending
//! sequence id.

use super::{ensure_consumed, frame_error, length_prefixed, within_frame};
use crate::call::{
    ApplicationException, CallHandle, Dispatch, ExceptionKind, Payload, Reply, ValueShape,
};
use crate::config::CodecConfig;
use crate::error::{Error, Result};
use crate::protocol::{EnvelopeHeader, InputBuffer, MessageType, Protocol};
use crate::registry::Registry;

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::{debug, error, warn};

struct ServerState {
    /// Sequence id of the call awaiting its reply.
    pending_seq_id: Mutex<Option<i32>>,
    closed: AtomicBool,
}

/// Server codec for one connection.
pub struct ServerCodec<P> {
    protocol: P,
    config: CodecConfig,
    registry: Arc<Registry<P>>,
    /// Reply shape of calls to unknown methods, which are only ever answered
    /// with an exception.
    reject_shape: Arc<ValueShape<P>>,
    state: Arc<ServerState>,
    frames: LengthDelimitedCodec,
}

impl<P: Protocol> ServerCodec<P> {
    /// Create a codec for a new connection dispatching through `registry`.
    #[must_use]
    pub fn new(protocol: P, registry: Arc<Registry<P>>, config: CodecConfig) -> Self {
        Self {
            protocol,
            frames: length_prefixed(&config),
            config,
            registry,
            reject_shape: Arc::new(ValueShape::of::<()>()),
            state: Arc::new(ServerState {
                pending_seq_id: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Decode one complete message received from the client.
    ///
    /// A call to an unknown method is answered by the codec itself: the
    /// payload is skipped and a [`Dispatch::Reject`] carrying the exception
    /// reply is returned. Send it like any other reply.
    ///
    /// # Errors
    ///
    /// `InsufficientData` leaves the state untouched. `PeerProtocolViolation`
    /// and `MalformedFrame` are fatal: the codec is closed before they are
    /// returned.
    pub fn on_inbound(&self, src: &mut InputBuffer<'_>) -> Result<Dispatch<P>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        self.decode_call(src).map_err(|e| {
            if e.is_fatal() {
                error!("Closing server connection: {}", e);
                self.close();
            }
            e
        })
    }

    /// Serialize `reply`, which must answer the pending call.
    ///
    /// Returns the unframed REPLY (or EXCEPTION) envelope.
    ///
    /// # Errors
    ///
    /// Returns `SequenceMismatch` if the reply does not answer the pending
    /// call, `UnrecognizedPayload` if it cannot be serialized, and
    /// `ConnectionClosed` after `close`. Nothing is sent in either case and
    /// the pending call stays pending.
    pub fn send(&self, reply: &Reply<P>) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let call = reply.originating_call();
        let Some(seq_id) = call.seq_id() else {
            return Err(Error::UnrecognizedPayload(format!(
                "Reply to {} answers a call that was never received",
                call.method()
            )));
        };

        let mut pending = self.state.pending_seq_id.lock();
        if *pending != Some(seq_id) {
            warn!(
                "Refusing reply to {} with seq_id {}: pending is {:?}",
                call.method(),
                seq_id,
                *pending
            );
            return Err(Error::SequenceMismatch {
                expected: *pending,
                actual: seq_id,
            });
        }

        let bytes = self.encode_reply(reply, seq_id)?;
        *pending = None;
        drop(pending);

        debug!(
            "Encoded reply to {} with seq_id {} ({} bytes)",
            call.method(),
            seq_id,
            bytes.len()
        );
        Ok(bytes)
    }

    /// Close the codec, discarding the pending sequence id.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.pending_seq_id.lock().take();
    }

    /// Whether the codec has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Sequence id of the call awaiting its reply, if any.
    #[must_use]
    pub fn pending_seq_id(&self) -> Option<i32> {
        *self.state.pending_seq_id.lock()
    }

    /// The registry this codec dispatches through.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry<P>> {
        &self.registry
    }

    pub(crate) const fn config(&self) -> &CodecConfig {
        &self.config
    }

    fn decode_call(&self, src: &mut InputBuffer<'_>) -> Result<Dispatch<P>> {
        let header = self.protocol.read_envelope_begin(src)?;

        match header.message_type {
            MessageType::Exception => {
                return Err(Error::PeerProtocolViolation(format!(
                    "Server received an exception for {} (seq_id {})",
                    header.method, header.seq_id
                )));
            }
            MessageType::Reply => {
                return Err(Error::PeerProtocolViolation(format!(
                    "Server received a reply for {} (seq_id {})",
                    header.method, header.seq_id
                )));
            }
            MessageType::Call => {}
        }

        // The pending id is only recorded once the whole message is decoded,
        // so a retry after `InsufficientData` starts from the same state.
        let dispatch = match self.registry.lookup(&header.method) {
            Ok(factory) => {
                let call = factory.read_call(&self.protocol, src, header.seq_id)?;
                debug!(
                    "Decoded call to {} with seq_id {}",
                    header.method, header.seq_id
                );
                Dispatch::Call(call)
            }
            Err(e @ Error::UnknownMethod(_)) => {
                self.protocol.skip_value(src)?;
                warn!("Rejecting call with seq_id {}: {}", header.seq_id, e);

                let handle = CallHandle::new(
                    Arc::from(header.method.as_str()),
                    Some(header.seq_id),
                    Arc::clone(&self.reject_shape),
                );
                Dispatch::Reject(handle.fail(ApplicationException::new(
                    ExceptionKind::UnknownMethod,
                    e.to_string(),
                )))
            }
            Err(e) => return Err(e),
        };

        let previous = self.state.pending_seq_id.lock().replace(header.seq_id);
        if let Some(previous) = previous {
            warn!(
                "Call with seq_id {} arrived before call {} was answered",
                header.seq_id, previous
            );
        }

        Ok(dispatch)
    }

    fn encode_reply(&self, reply: &Reply<P>, seq_id: i32) -> Result<Bytes> {
        let call = reply.originating_call();
        let mut buf = BytesMut::new();

        match reply.raw_result() {
            Ok(value) => {
                let header = EnvelopeHeader::new(MessageType::Reply, call.method(), seq_id);
                self.protocol.write_envelope_begin(&header, &mut buf)?;
                call.reply_shape()
                    .write(&self.protocol, &**value, &mut buf)?;
            }
            Err(exception) => {
                let header = EnvelopeHeader::new(MessageType::Exception, call.method(), seq_id);
                self.protocol.write_envelope_begin(&header, &mut buf)?;
                self.protocol.write_value(exception, &mut buf)?;
            }
        }

        Ok(buf.freeze())
    }
}

impl<P: Clone> Clone for ServerCodec<P> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol.clone(),
            config: self.config,
            registry: Arc::clone(&self.registry),
            reject_shape: Arc::clone(&self.reject_shape),
            state: Arc::clone(&self.state),
            frames: length_prefixed(&self.config),
        }
    }
}

impl<P: Protocol> Decoder for ServerCodec<P> {
    type Item = Dispatch<P>;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        let frame = match self.frames.decode(buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                let e = frame_error(e);
                error!("Closing server connection: {}", e);
                self.close();
                return Err(e);
            }
        };

        let mut src = Cursor::new(&frame[..]);
        self.on_inbound(&mut src)
            .and_then(|item| ensure_consumed(&src).map(|()| Some(item)))
            .map_err(|e| {
                let e = within_frame(e);
                if e.is_fatal() && !self.is_closed() {
                    error!("Closing server connection: {}", e);
                    self.close();
                }
                e
            })
    }
}

impl<P: Protocol> Encoder<Payload<P>> for ServerCodec<P> {
    type Error = Error;

    fn encode(&mut self, item: Payload<P>, dst: &mut BytesMut) -> Result<()> {
        match item {
            Payload::Reply(reply) => {
                let bytes = self.send(&reply)?;
                self.frames.encode(bytes, dst).map_err(frame_error)
            }
            Payload::Call(call) => Err(Error::UnrecognizedPayload(format!(
                "Server cannot send a call to {}",
                call.method()
            ))),
        }
    }
}
