//! Connection-scoped call/reply codecs for request/response RPC.
//!
//! This crate turns typed calls into bytes on a stream and back. Each
//! connection gets its own codec holding the connection's protocol state:
//!
//! - **Client codec**: admits one outstanding call at a time, numbers calls
//!   with sequence ids and matches every reply to the call that asked for it.
//!   A reply that does not match closes the connection.
//! - **Server codec**: decodes calls through a method [`Registry`], remembers
//!   the sequence id of the pending call and answers against it. Calls to
//!   unknown methods get an exception reply instead of closing the connection.
//! - **Unframed server codec**: the server codec for peers that send no
//!   length prefix. Message boundaries are found by decoding, rolling back to
//!   a checkpoint whenever a message is still incomplete.
//!
//! The codecs implement `tokio_util::codec::{Decoder, Encoder}`; the
//! [`transport`] module drives them over any async stream.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use proven_rpc_codec::{
//!     BinaryProtocol, Call, CallFactory, CallHandler, ClientConfig, Registry, Reply, Result,
//!     RpcClient, RpcServer, ServerConfig,
//! };
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl CallHandler<BinaryProtocol> for Ping {
//!     async fn handle_call(&self, call: Call<BinaryProtocol>) -> Result<Reply<BinaryProtocol>> {
//!         let (count, handle) = call.into_parts::<u32>()?;
//!         handle.reply(format!("pong {count}"))
//!     }
//! }
//!
//! async fn example() -> Result<()> {
//!     let ping = Arc::new(CallFactory::new::<u32, String>("ping"));
//!     let registry = Arc::new(Registry::new().with(Arc::clone(&ping)));
//!
//!     let mut server = RpcServer::bind(
//!         "127.0.0.1:0".parse().unwrap(),
//!         BinaryProtocol::new(),
//!         registry,
//!         Ping,
//!         ServerConfig::default(),
//!     )
//!     .await?;
//!     let addr = server.local_addr()?;
//!     let _shutdown = server.shutdown_handle();
//!     tokio::spawn(server.serve());
//!
//!     let client = RpcClient::connect(addr, BinaryProtocol::new(), ClientConfig::default()).await?;
//!     let reply = client.call(ping.call(1u32)?).await?;
//!     assert_eq!(reply.into_result::<String>()?, "pong 1");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod call;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use call::{
    ApplicationException, Call, CallHandle, Dispatch, ExceptionKind, Payload, Reply, Value,
    ValueShape,
};
pub use codec::{ClientCodec, ServerCodec, UnframedServerCodec};
pub use config::{ClientConfig, CodecConfig, Framing, MAX_FRAME_SIZE, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{BinaryProtocol, EnvelopeHeader, InputBuffer, MessageType, Protocol};
pub use registry::{CallFactory, Registry};
pub use transport::{CallHandler, RpcClient, RpcServer, serve_connection};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
