//! Serves `ping` on localhost and calls it a few times.
//!
//! Run with `RUST_LOG=debug` to see every envelope go by.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use proven_rpc_codec::{
    BinaryProtocol, Call, CallFactory, CallHandler, ClientConfig, Reply, Registry, Result,
    RpcClient, RpcServer, ServerConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Pong;

#[async_trait]
impl CallHandler<BinaryProtocol> for Pong {
    async fn handle_call(&self, call: Call<BinaryProtocol>) -> Result<Reply<BinaryProtocol>> {
        let (count, handle) = call.into_parts::<u32>()?;
        handle.reply(format!("pong #{count}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let ping = Arc::new(CallFactory::new::<u32, String>("ping"));
    let registry = Arc::new(Registry::new().with(Arc::clone(&ping)));

    let mut server = RpcServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        BinaryProtocol::new(),
        registry,
        Pong,
        ServerConfig::default(),
    )
    .await?;
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    let client = RpcClient::connect(addr, BinaryProtocol::new(), ClientConfig::default()).await?;
    for count in 1..=3u32 {
        let reply = client.call(ping.call(count)?).await?;
        info!("{}", reply.into_result::<String>()?);
    }
    client.close();

    if let Some(shutdown) = shutdown {
        let _ = shutdown.send(());
    }
    if let Ok(result) = serving.await {
        result?;
    }
    Ok(())
}
