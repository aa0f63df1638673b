//! RPC server: accepts connections and answers calls through a handler.

use crate::call::{ApplicationException, Call, Dispatch, ExceptionKind, Payload, Reply};
use crate::codec::{ServerCodec, UnframedServerCodec};
use crate::config::{Framing, ServerConfig};
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::registry::Registry;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info, instrument, warn};

/// Application side of a server connection.
#[async_trait]
pub trait CallHandler<P: Protocol>: Send + Sync + 'static {
    /// Answer `call`.
    ///
    /// The reply must be built from the call (see [`Call::reply`] and
    /// [`Call::fail`]). Returning an error answers the call with an
    /// `InternalError` exception instead.
    async fn handle_call(&self, call: Call<P>) -> Result<Reply<P>>;
}

/// Serve one connection until the peer disconnects or a fatal error occurs.
///
/// Calls are answered one at a time, in the order they arrive.
///
/// # Errors
///
/// Returns the fatal codec or I/O error that ended the connection.
pub async fn serve_connection<P, S, C, H>(stream: S, codec: C, handler: &H) -> Result<()>
where
    P: Protocol,
    S: AsyncRead + AsyncWrite + Unpin,
    C: Decoder<Item = Dispatch<P>, Error = Error> + Encoder<Payload<P>, Error = Error> + Unpin,
    H: CallHandler<P> + ?Sized,
{
    let mut framed = Framed::new(stream, codec);

    while let Some(dispatch) = framed.next().await {
        let reply = match dispatch? {
            Dispatch::Call(call) => dispatch_call(handler, call).await,
            Dispatch::Reject(reply) => reply,
        };

        framed.send(Payload::Reply(reply)).await?;
    }

    debug!("Connection closed by client");
    Ok(())
}

async fn dispatch_call<P, H>(handler: &H, call: Call<P>) -> Reply<P>
where
    P: Protocol,
    H: CallHandler<P> + ?Sized,
{
    let handle = call.handle();

    match handler.handle_call(call).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(
                "Handler failed for {} (seq_id {:?}): {}",
                handle.method(),
                handle.seq_id(),
                e
            );
            handle.fail(ApplicationException::new(
                ExceptionKind::InternalError,
                e.to_string(),
            ))
        }
    }
}

/// RPC server listening on a TCP socket.
pub struct RpcServer<P: Protocol, H: CallHandler<P>> {
    listener: TcpListener,
    protocol: P,
    registry: Arc<Registry<P>>,
    handler: Arc<H>,
    config: ServerConfig,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl<P: Protocol, H: CallHandler<P>> RpcServer<P, H> {
    /// Bind a new server to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind.
    pub async fn bind(
        addr: SocketAddr,
        protocol: P,
        registry: Arc<Registry<P>>,
        handler: H,
        config: ServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("Failed to bind to {addr:?}: {e}"),
            )
        })?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        Ok(Self {
            listener,
            protocol,
            registry,
            handler: Arc::new(handler),
            config,
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
        })
    }

    /// Address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Take the sender that stops [`serve`](Self::serve). Sending on it (or
    /// dropping it) stops accepting connections.
    pub fn shutdown_handle(&mut self) -> Option<oneshot::Sender<()>> {
        self.shutdown_tx.take()
    }

    /// Accept connections until shut down.
    ///
    /// # Errors
    ///
    /// Accept failures are logged, not returned; this only fails if the
    /// listener itself is unusable.
    #[instrument(skip(self))]
    pub async fn serve(self) -> Result<()> {
        let Self {
            listener,
            protocol,
            registry,
            handler,
            config,
            shutdown_tx: _shutdown_tx,
            mut shutdown_rx,
        } = self;

        info!("RPC server listening on {:?}", listener.local_addr()?);
        let semaphore = Arc::new(Semaphore::new(config.max_connections));

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                warn!("Max connections reached, rejecting connection from {:?}", addr);
                                continue;
                            };

                            let protocol = protocol.clone();
                            let registry = Arc::clone(&registry);
                            let handler = Arc::clone(&handler);
                            let config = config.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    addr,
                                    protocol,
                                    registry,
                                    handler,
                                    &config,
                                )
                                .await
                                {
                                    error!("Connection error from {:?}: {}", addr, e);
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("Server shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }

    #[instrument(skip(stream, protocol, registry, handler, config))]
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        protocol: P,
        registry: Arc<Registry<P>>,
        handler: Arc<H>,
        config: &ServerConfig,
    ) -> Result<()> {
        debug!("New connection from {:?}", addr);

        match config.framing {
            Framing::LengthPrefixed => {
                let codec = ServerCodec::new(protocol, registry, config.codec);
                serve_connection(stream, codec, &*handler).await
            }
            Framing::Unframed => {
                let codec = UnframedServerCodec::new(protocol, registry, config.codec);
                serve_connection(stream, codec, &*handler).await
            }
        }
    }
}
