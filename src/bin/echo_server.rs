use anyhow::Result;
use muxrpc::ConnectionConfig;
use muxrpc_echo::{DEFAULT_ADDR, echo, serve};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("ECHO_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let max_streams = match std::env::var("ECHO_MAX_STREAMS") {
        Ok(value) => value.parse()?,
        Err(_) => ConnectionConfig::default().max_concurrent_streams,
    };

    let config = ConnectionConfig::builder()
        .max_concurrent_streams(max_streams)
        .build();
    let router = echo::router()?;

    let listener = TcpListener::bind(&addr).await?;
    println!("Echo server listening on {}", listener.local_addr()?);
    for method in router.methods() {
        println!("  Serving {method}");
    }

    serve(listener, router, config).await
}
