//! RPC client: one connection, one call in flight at a time.

use crate::call::{Call, Reply};
use crate::codec::{ClientCodec, frame_error, length_prefixed};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::Protocol;

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, instrument, warn};

type ReplySender<P> = oneshot::Sender<Result<Reply<P>>>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

/// RPC client over a single connection.
///
/// A second [`call`](Self::call) made while one is in flight fails with
/// `ConcurrentCallViolation`; the connection stays usable.
pub struct RpcClient<P> {
    codec: ClientCodec<P>,
    writer: Mutex<Writer>,
    /// Callers awaiting a reply, by sequence id.
    waiters: Arc<DashMap<i32, ReplySender<P>>>,
    reader: JoinHandle<()>,
}

impl<P: Protocol> RpcClient<P> {
    /// Connect to a server over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(addr: SocketAddr, protocol: P, config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {:?}", addr);
        Ok(Self::new(stream, protocol, config))
    }

    /// Run the client over an established stream.
    ///
    /// Must be called from within a tokio runtime: replies are read by a
    /// background task.
    pub fn new<S>(stream: S, protocol: P, config: ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = ClientCodec::new(protocol, config.codec);
        let (read_half, write_half) = tokio::io::split(stream);

        let waiters = Arc::new(DashMap::new());
        let reader = tokio::spawn(read_replies(
            FramedRead::new(read_half, codec.clone()),
            codec.clone(),
            Arc::clone(&waiters),
        ));

        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        Self {
            writer: Mutex::new(FramedWrite::new(
                write_half,
                length_prefixed(&config.codec),
            )),
            codec,
            waiters,
            reader,
        }
    }

    /// Send `call` and wait for its reply.
    ///
    /// An exception sent by the server is a successful return: inspect
    /// [`Reply::exception`] or use [`Reply::into_result`].
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentCallViolation` if another call is in flight, the
    /// fatal error that closed the connection while waiting, or
    /// `ConnectionClosed`.
    #[instrument(skip(self, call), fields(method = call.method()))]
    pub async fn call(&self, call: Call<P>) -> Result<Reply<P>> {
        let (tx, rx) = oneshot::channel();

        let mut writer = self.writer.lock().await;
        let bytes = self.codec.send(call)?;
        let seq_id = self.codec.last_seq_id();

        // Registered before the bytes go out, so the reply always finds it.
        self.waiters.insert(seq_id, tx);
        if self.codec.is_closed() {
            self.waiters.remove(&seq_id);
            return Err(Error::ConnectionClosed);
        }

        let sent = match writer.send(bytes).await {
            Ok(()) => Ok(()),
            Err(e) => Err(frame_error(e)),
        };
        drop(writer);

        if let Err(e) = sent {
            error!("Failed to send call {}: {}", seq_id, e);
            self.waiters.remove(&seq_id);
            self.close();
            return Err(e);
        }

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Close the connection. A call in flight fails with `ConnectionClosed`.
    pub fn close(&self) {
        if let Some(handle) = self.codec.close() {
            debug!("Closed with call {:?} outstanding", handle.seq_id());
        }
        fail_waiters(&self.waiters, || Error::ConnectionClosed);
        self.reader.abort();
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.codec.is_closed()
    }
}

impl<P> Drop for RpcClient<P> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies<P, S>(
    mut frames: FramedRead<ReadHalf<S>, ClientCodec<P>>,
    codec: ClientCodec<P>,
    waiters: Arc<DashMap<i32, ReplySender<P>>>,
) where
    P: Protocol,
    S: AsyncRead,
{
    while let Some(item) = frames.next().await {
        match item {
            Ok(reply) => {
                let seq_id = reply.originating_call().seq_id().unwrap_or_default();
                match waiters.remove(&seq_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(Ok(reply));
                    }
                    None => warn!("Dropping reply {} nobody is waiting for", seq_id),
                }
            }
            Err(e) => {
                codec.close();
                let message = e.to_string();
                let mut first = Some(e);
                fail_waiters(&waiters, || {
                    first
                        .take()
                        .unwrap_or_else(|| Error::PeerProtocolViolation(message.clone()))
                });
                return;
            }
        }
    }

    debug!("Connection closed by server");
    codec.close();
    fail_waiters(&waiters, || Error::ConnectionClosed);
}

fn fail_waiters<P>(waiters: &DashMap<i32, ReplySender<P>>, mut error: impl FnMut() -> Error) {
    let seq_ids: Vec<i32> = waiters.iter().map(|entry| *entry.key()).collect();
    for seq_id in seq_ids {
        if let Some((_, tx)) = waiters.remove(&seq_id) {
            let _ = tx.send(Err(error()));
        }
    }
}
