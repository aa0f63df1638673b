//! Client side: one outstanding call, sequence numbering, reply matching.

use super::{ensure_consumed, frame_error, length_prefixed, within_frame};
use crate::call::{ApplicationException, Call, CallHandle, Payload, Reply};
use crate::config::CodecConfig;
use crate::error::{Error, Result};
use crate::protocol::{EnvelopeHeader, InputBuffer, MessageType, Protocol};

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::{debug, error, warn};

struct ClientState<P> {
    /// The call awaiting its reply. Admission is a single compare-and-swap
    /// from `None`.
    outstanding: ArcSwapOption<CallHandle<P>>,
    /// Last sequence id issued.
    last_seq_id: AtomicI32,
    closed: AtomicBool,
}

/// Client codec for one connection.
pub struct ClientCodec<P> {
    protocol: P,
    config: CodecConfig,
    state: Arc<ClientState<P>>,
    frames: LengthDelimitedCodec,
}

impl<P: Protocol> ClientCodec<P> {
    /// Create a codec for a new connection. The first call gets sequence id 1.
    #[must_use]
    pub fn new(protocol: P, config: CodecConfig) -> Self {
        Self {
            protocol,
            frames: length_prefixed(&config),
            config,
            state: Arc::new(ClientState {
                outstanding: ArcSwapOption::empty(),
                last_seq_id: AtomicI32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Admit `call` as the outstanding call and serialize it.
    ///
    /// Returns the unframed CALL envelope.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentCallViolation` if another call is outstanding (that
    /// call is left untouched), `ConnectionClosed` after `close`, or the
    /// serialization error of the argument.
    pub fn send(&self, call: Call<P>) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        // Only the holder of the slot advances the counter. A sender that read
        // the counter before an earlier call completed finds it moved, gives
        // the slot back and retries with a fresh id.
        let (seq_id, handle) = loop {
            let last = self.state.last_seq_id.load(Ordering::Acquire);
            let seq_id = last.wrapping_add(1);
            let handle = Arc::new(call.handle().with_seq_id(seq_id));

            let previous = self
                .state
                .outstanding
                .compare_and_swap(&None::<Arc<CallHandle<P>>>, Some(Arc::clone(&handle)));
            if let Some(outstanding) = &*previous {
                warn!(
                    "Rejected call to {}: call {:?} is outstanding",
                    call.method(),
                    outstanding.seq_id()
                );
                return Err(Error::ConcurrentCallViolation {
                    method: call.method().to_string(),
                    outstanding_seq_id: outstanding.seq_id().unwrap_or_default(),
                });
            }

            if self
                .state
                .last_seq_id
                .compare_exchange(last, seq_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break (seq_id, handle);
            }
            self.release(&handle);
        };

        if self.is_closed() {
            self.release(&handle);
            return Err(Error::ConnectionClosed);
        }

        match self.encode_call(&call, seq_id) {
            Ok(bytes) => {
                debug!(
                    "Encoded call {} with seq_id {} ({} bytes)",
                    call.method(),
                    seq_id,
                    bytes.len()
                );
                Ok(bytes)
            }
            Err(e) => {
                self.release(&handle);
                Err(e)
            }
        }
    }

    /// Decode one complete message received from the server.
    ///
    /// # Errors
    ///
    /// `InsufficientData` leaves the state untouched. `SequenceMismatch`,
    /// `PeerProtocolViolation` and `MalformedFrame` are fatal: the codec is
    /// closed before they are returned.
    pub fn on_inbound(&self, src: &mut InputBuffer<'_>) -> Result<Reply<P>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        self.decode_reply(src).map_err(|e| {
            if e.is_fatal() {
                error!("Closing client connection: {}", e);
                self.close();
            }
            e
        })
    }

    /// Close the codec: the outstanding call is dropped and every later
    /// operation fails with `ConnectionClosed`.
    ///
    /// Returns the call that was outstanding, if any.
    pub fn close(&self) -> Option<CallHandle<P>> {
        self.state.closed.store(true, Ordering::Release);
        self.state
            .outstanding
            .swap(None)
            .map(|handle| (*handle).clone())
    }

    /// Whether the codec has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// The call awaiting its reply, if any.
    #[must_use]
    pub fn outstanding(&self) -> Option<CallHandle<P>> {
        self.state
            .outstanding
            .load_full()
            .map(|handle| (*handle).clone())
    }

    /// Last sequence id issued (0 before the first call).
    #[must_use]
    pub fn last_seq_id(&self) -> i32 {
        self.state.last_seq_id.load(Ordering::Acquire)
    }

    fn encode_call(&self, call: &Call<P>, seq_id: i32) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let header = EnvelopeHeader::new(MessageType::Call, call.method(), seq_id);
        self.protocol.write_envelope_begin(&header, &mut buf)?;
        call.write_argument(&self.protocol, &mut buf)?;
        Ok(buf.freeze())
    }

    fn decode_reply(&self, src: &mut InputBuffer<'_>) -> Result<Reply<P>> {
        let header = self.protocol.read_envelope_begin(src)?;

        match header.message_type {
            MessageType::Call => Err(Error::PeerProtocolViolation(format!(
                "Client received a call to {} (seq_id {})",
                header.method, header.seq_id
            ))),
            MessageType::Exception => {
                let exception: ApplicationException = self.protocol.read_value(src)?;
                let Some(handle) = self.state.outstanding.swap(None) else {
                    return Err(Error::SequenceMismatch {
                        expected: None,
                        actual: header.seq_id,
                    });
                };

                warn!(
                    "Call {} (seq_id {:?}) failed: {}",
                    handle.method(),
                    handle.seq_id(),
                    exception
                );
                Ok(Reply::from_parts(Err(exception), (*handle).clone()))
            }
            MessageType::Reply => {
                let Some(handle) = self.state.outstanding.load_full() else {
                    return Err(Error::SequenceMismatch {
                        expected: None,
                        actual: header.seq_id,
                    });
                };
                if handle.seq_id() != Some(header.seq_id) {
                    return Err(Error::SequenceMismatch {
                        expected: handle.seq_id(),
                        actual: header.seq_id,
                    });
                }
                if handle.method() != header.method {
                    return Err(Error::PeerProtocolViolation(format!(
                        "Reply names method {} but call {} is outstanding",
                        header.method,
                        handle.method()
                    )));
                }

                let result = handle.reply_shape().read(&self.protocol, src)?;

                let previous = self.state.outstanding.compare_and_swap(&handle, None);
                if !matches!(&*previous, Some(p) if Arc::ptr_eq(p, &handle)) {
                    return Err(Error::ConnectionClosed);
                }

                debug!(
                    "Decoded reply to {} with seq_id {}",
                    header.method, header.seq_id
                );
                Ok(Reply::from_parts(Ok(result), (*handle).clone()))
            }
        }
    }

    /// Free the slot if it still holds `handle`.
    fn release(&self, handle: &Arc<CallHandle<P>>) {
        let current = Some(Arc::clone(handle));
        self.state.outstanding.compare_and_swap(&current, None);
    }
}

impl<P: Clone> Clone for ClientCodec<P> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol.clone(),
            config: self.config,
            state: Arc::clone(&self.state),
            frames: length_prefixed(&self.config),
        }
    }
}

impl<P: Protocol> Decoder for ClientCodec<P> {
    type Item = Reply<P>;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        let frame = match self.frames.decode(buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                let e = frame_error(e);
                error!("Closing client connection: {}", e);
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
                    error!("Closing client connection: {}", e);
                    self.close();
                }
                e
            })
    }
}

impl<P: Protocol> Encoder<Payload<P>> for ClientCodec<P> {
    type Error = Error;

    fn encode(&mut self, item: Payload<P>, dst: &mut BytesMut) -> Result<()> {
        match item {
            Payload::Call(call) => {
                let bytes = self.send(call)?;
                self.frames.encode(bytes, dst).map_err(frame_error)
            }
            Payload::Reply(reply) => Err(Error::UnrecognizedPayload(format!(
                "Client cannot send a reply to {}",
                reply.originating_call().method()
            ))),
        }
    }
}
