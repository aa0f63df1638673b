//! Connection drivers running the codecs over async byte streams.
//!
//! The drivers only move bytes and events between a stream and a codec; all
//! protocol state lives in the codecs.

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::{CallHandler, RpcServer, serve_connection};
