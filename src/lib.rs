pub mod echo;

use anyhow::Result;
use muxrpc::{Client, Connection, ConnectionConfig, Router};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

pub const DEFAULT_ADDR: &str = "127.0.0.1:50051";

/// Connect to an echo server over TCP.
pub async fn connect(addr: &str) -> Result<Client> {
    let socket = TcpStream::connect(addr).await?;
    socket.set_nodelay(true)?;
    let connection = Connection::client(socket, ConnectionConfig::default());
    Ok(Client::new(connection))
}

/// Accept connections on `listener` and serve each with `router` until the
/// listener fails.
pub async fn serve(listener: TcpListener, router: Router, config: ConnectionConfig) -> Result<()> {
    let router = Arc::new(router);

    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(e) = socket.set_nodelay(true) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        info!(%peer, "connection accepted");
        let connection = Connection::server(socket, config.clone(), Arc::clone(&router));
        tokio::spawn(async move {
            let status = connection.closed().await;
            info!(%peer, %status, "connection closed");
        });
    }
}
