//! Call and reply values exchanged between codecs and the application.

use crate::error::{Error, Result};
use crate::protocol::{InputBuffer, Protocol};
use crate::registry::CallFactory;

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error as ThisError;

/// Type-erased argument or result value.
pub type Value = Box<dyn Any + Send + Sync>;

type ReadFn<P> = dyn Fn(&P, &mut InputBuffer<'_>) -> Result<Value> + Send + Sync;
type WriteFn<P> = dyn Fn(&P, &(dyn Any + Send + Sync), &mut BytesMut) -> Result<()> + Send + Sync;
type IsFn = dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync;

/// Knows how to read and write values of one concrete type with protocol `P`.
pub struct ValueShape<P> {
    type_name: &'static str,
    is: Box<IsFn>,
    read: Box<ReadFn<P>>,
    write: Box<WriteFn<P>>,
}

impl<P: Protocol> ValueShape<P> {
    /// Shape of values of type `T`.
    #[must_use]
    pub fn of<T>() -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self {
            type_name: type_name::<T>(),
            is: Box::new(|value: &(dyn Any + Send + Sync)| value.is::<T>()),
            read: Box::new(|protocol: &P, src: &mut InputBuffer<'_>| {
                protocol
                    .read_value::<T>(src)
                    .map(|value| Box::new(value) as Value)
            }),
            write: Box::new(
                |protocol: &P, value: &(dyn Any + Send + Sync), dst: &mut BytesMut| {
                    let value = value.downcast_ref::<T>().ok_or_else(|| {
                        Error::UnrecognizedPayload(format!("Expected a {}", type_name::<T>()))
                    })?;
                    protocol.write_value(value, dst)
                },
            ),
        }
    }

    /// Name of the Rust type this shape reads and writes.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether `value` has this shape.
    #[must_use]
    pub fn accepts(&self, value: &(dyn Any + Send + Sync)) -> bool {
        (self.is)(value)
    }

    pub(crate) fn read(&self, protocol: &P, src: &mut InputBuffer<'_>) -> Result<Value> {
        (self.read)(protocol, src)
    }

    pub(crate) fn write(
        &self,
        protocol: &P,
        value: &(dyn Any + Send + Sync),
        dst: &mut BytesMut,
    ) -> Result<()> {
        (self.write)(protocol, value, dst)
    }
}

impl<P> fmt::Debug for ValueShape<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueShape").field(&self.type_name).finish()
    }
}

/// Category of an [`ApplicationException`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Unspecified failure.
    Unknown,
    /// The server has no such method.
    UnknownMethod,
    /// The message type was not expected.
    InvalidMessageType,
    /// The reply named a different method than the call.
    WrongMethodName,
    /// The reply carried a different sequence id than the call.
    BadSequenceId,
    /// The handler produced no result.
    MissingResult,
    /// The handler failed.
    InternalError,
    /// The request could not be decoded.
    ProtocolError,
}

impl ExceptionKind {
    /// Wire code of this kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::UnknownMethod => 1,
            Self::InvalidMessageType => 2,
            Self::WrongMethodName => 3,
            Self::BadSequenceId => 4,
            Self::MissingResult => 5,
            Self::InternalError => 6,
            Self::ProtocolError => 7,
        }
    }

    /// Kind for a wire code; unrecognized codes map to `Unknown`.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::UnknownMethod,
            2 => Self::InvalidMessageType,
            3 => Self::WrongMethodName,
            4 => Self::BadSequenceId,
            5 => Self::MissingResult,
            6 => Self::InternalError,
            7 => Self::ProtocolError,
            _ => Self::Unknown,
        }
    }
}

/// Failure reported by the peer application instead of a result.
#[derive(Debug, Clone, PartialEq, Eq, ThisError, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct ApplicationException {
    /// Wire code, see [`ExceptionKind`].
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

impl ApplicationException {
    /// Create a new exception.
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
        }
    }

    /// Category of this exception.
    #[must_use]
    pub const fn kind(&self) -> ExceptionKind {
        ExceptionKind::from_code(self.code)
    }
}

/// A request: method name, argument value and the shape of the expected reply.
pub struct Call<P> {
    factory: Arc<CallFactory<P>>,
    argument: Value,
    seq_id: Option<i32>,
}

impl<P: Protocol> Call<P> {
    pub(crate) fn new(factory: Arc<CallFactory<P>>, argument: Value) -> Self {
        Self {
            factory,
            argument,
            seq_id: None,
        }
    }

    pub(crate) fn with_seq_id(mut self, seq_id: i32) -> Self {
        self.seq_id = Some(seq_id);
        self
    }

    /// Name of the called method.
    #[must_use]
    pub fn method(&self) -> &str {
        self.factory.method()
    }

    /// Sequence id assigned by the codec that sent or received this call.
    #[must_use]
    pub const fn seq_id(&self) -> Option<i32> {
        self.seq_id
    }

    /// Shape of the reply this call expects.
    #[must_use]
    pub fn reply_shape(&self) -> &ValueShape<P> {
        self.factory.reply_shape()
    }

    /// The argument, if it is an `A`.
    #[must_use]
    pub fn argument<A: Any>(&self) -> Option<&A> {
        self.argument.downcast_ref::<A>()
    }

    /// Take the argument, dropping the correlation data.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedPayload` if the argument is not an `A`.
    pub fn into_argument<A: Any>(self) -> Result<A> {
        self.into_parts().map(|(argument, _)| argument)
    }

    /// Split the call into its argument and a handle for replying.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedPayload` if the argument is not an `A`.
    pub fn into_parts<A: Any>(self) -> Result<(A, CallHandle<P>)> {
        let handle = self.handle();
        let argument = self.argument.downcast::<A>().map_err(|_| {
            Error::UnrecognizedPayload(format!(
                "Argument of {} is not a {}",
                handle.method(),
                type_name::<A>()
            ))
        })?;
        Ok((*argument, handle))
    }

    /// Correlation handle for this call.
    #[must_use]
    pub fn handle(&self) -> CallHandle<P> {
        CallHandle {
            method: Arc::clone(self.factory.method_name()),
            seq_id: self.seq_id,
            reply: Arc::clone(self.factory.reply_shape_arc()),
        }
    }

    /// Build the successful reply to this call.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedPayload` if `result` does not have the reply shape.
    pub fn reply<R: Any + Send + Sync>(&self, result: R) -> Result<Reply<P>> {
        self.handle().reply(result)
    }

    /// Build the failed reply to this call.
    #[must_use]
    pub fn fail(&self, exception: ApplicationException) -> Reply<P> {
        self.handle().fail(exception)
    }

    pub(crate) fn write_argument(&self, protocol: &P, dst: &mut BytesMut) -> Result<()> {
        self.factory
            .argument_shape()
            .write(protocol, &*self.argument, dst)
    }
}

impl<P> fmt::Debug for Call<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.factory.method_name())
            .field("seq_id", &self.seq_id)
            .finish_non_exhaustive()
    }
}

/// Non-owning correlation record of a call: enough to match and type its reply.
pub struct CallHandle<P> {
    method: Arc<str>,
    seq_id: Option<i32>,
    reply: Arc<ValueShape<P>>,
}

impl<P: Protocol> CallHandle<P> {
    pub(crate) const fn new(method: Arc<str>, seq_id: Option<i32>, reply: Arc<ValueShape<P>>) -> Self {
        Self {
            method,
            seq_id,
            reply,
        }
    }

    /// Name of the called method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Sequence id of the call.
    #[must_use]
    pub const fn seq_id(&self) -> Option<i32> {
        self.seq_id
    }

    /// Shape of the expected reply.
    #[must_use]
    pub fn reply_shape(&self) -> &ValueShape<P> {
        &self.reply
    }

    /// Build the successful reply to the call.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedPayload` if `result` does not have the reply shape.
    pub fn reply<R: Any + Send + Sync>(&self, result: R) -> Result<Reply<P>> {
        let result: Value = Box::new(result);
        if !self.reply.accepts(&*result) {
            return Err(Error::UnrecognizedPayload(format!(
                "Reply to {} must be a {}, got a {}",
                self.method,
                self.reply.type_name(),
                type_name::<R>()
            )));
        }
        Ok(Reply {
            result: Ok(result),
            call: self.clone(),
        })
    }

    /// Build the failed reply to the call.
    #[must_use]
    pub fn fail(&self, exception: ApplicationException) -> Reply<P> {
        Reply {
            result: Err(exception),
            call: self.clone(),
        }
    }

    pub(crate) fn with_seq_id(mut self, seq_id: i32) -> Self {
        self.seq_id = Some(seq_id);
        self
    }
}

impl<P> Clone for CallHandle<P> {
    fn clone(&self) -> Self {
        Self {
            method: Arc::clone(&self.method),
            seq_id: self.seq_id,
            reply: Arc::clone(&self.reply),
        }
    }
}

impl<P> fmt::Debug for CallHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("method", &self.method)
            .field("seq_id", &self.seq_id)
            .field("reply", &self.reply)
            .finish()
    }
}

/// A response: the decoded result tied back to the call that produced it.
pub struct Reply<P> {
    result: std::result::Result<Value, ApplicationException>,
    call: CallHandle<P>,
}

impl<P: Protocol> Reply<P> {
    pub(crate) const fn from_parts(
        result: std::result::Result<Value, ApplicationException>,
        call: CallHandle<P>,
    ) -> Self {
        Self { result, call }
    }

    /// The call this reply answers.
    #[must_use]
    pub const fn originating_call(&self) -> &CallHandle<P> {
        &self.call
    }

    /// The exception, if the call failed.
    #[must_use]
    pub const fn exception(&self) -> Option<&ApplicationException> {
        match &self.result {
            Ok(_) => None,
            Err(exception) => Some(exception),
        }
    }

    /// Borrow the result as an `R`.
    ///
    /// # Errors
    ///
    /// Returns `Application` if the call failed and `UnrecognizedPayload` if
    /// the result is not an `R`.
    pub fn result<R: Any>(&self) -> Result<&R> {
        match &self.result {
            Ok(value) => value.downcast_ref::<R>().ok_or_else(|| self.wrong_type::<R>()),
            Err(exception) => Err(Error::Application(exception.clone())),
        }
    }

    /// Take the result as an `R`.
    ///
    /// # Errors
    ///
    /// Returns `Application` if the call failed and `UnrecognizedPayload` if
    /// the result is not an `R`.
    pub fn into_result<R: Any>(self) -> Result<R> {
        let error = self.wrong_type::<R>();
        match self.result {
            Ok(value) => value.downcast::<R>().map(|value| *value).map_err(|_| error),
            Err(exception) => Err(Error::Application(exception)),
        }
    }

    pub(crate) const fn raw_result(&self) -> &std::result::Result<Value, ApplicationException> {
        &self.result
    }

    fn wrong_type<R>(&self) -> Error {
        Error::UnrecognizedPayload(format!(
            "Result of {} is a {}, not a {}",
            self.call.method(),
            self.call.reply_shape().type_name(),
            type_name::<R>()
        ))
    }
}

impl<P> fmt::Debug for Reply<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Reply");
        debug.field("call", &self.call);
        match &self.result {
            Ok(_) => debug.field("result", &"Ok(..)"),
            Err(exception) => debug.field("exception", exception),
        };
        debug.finish()
    }
}

/// Outbound event handed to a codec.
#[derive(Debug)]
pub enum Payload<P> {
    /// A request to send (client side).
    Call(Call<P>),
    /// An answer to send (server side).
    Reply(Reply<P>),
}

impl<P> From<Call<P>> for Payload<P> {
    fn from(call: Call<P>) -> Self {
        Self::Call(call)
    }
}

impl<P> From<Reply<P>> for Payload<P> {
    fn from(reply: Reply<P>) -> Self {
        Self::Reply(reply)
    }
}

/// Inbound event produced by a server codec.
#[derive(Debug)]
pub enum Dispatch<P> {
    /// A decoded call for the application.
    Call(Call<P>),
    /// A call the codec answered itself; send the reply back unchanged.
    Reject(Reply<P>),
}
