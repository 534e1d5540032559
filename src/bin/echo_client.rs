use anyhow::Result;
use muxrpc::CallOptions;
use muxrpc_echo::echo::{self, CLIENT_ID_KEY};
use muxrpc_echo::{DEFAULT_ADDR, connect};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("ECHO_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let client_id = std::env::var("ECHO_CLIENT_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
    let message = std::env::var("ECHO_MESSAGE").unwrap_or_else(|_| "hello".to_string());

    println!("Client {client_id} connecting to {addr}");
    let client = connect(&addr).await?;

    let options = || {
        CallOptions::new()
            .with_timeout(CALL_TIMEOUT)
            .with_metadata(CLIENT_ID_KEY, client_id.clone())
    };

    // All four call shapes run concurrently over the one connection.
    let (unary, streamed, joined, chatted) = tokio::join!(
        echo::unary_echo(&client, &message, options()),
        async {
            let replies = echo::server_streaming_echo(&client, &message, options()).await?;
            echo::collect_messages(replies.into_stream()).await
        },
        echo::client_streaming_echo(&client, message.split_whitespace(), options()),
        echo::bidirectional_echo(&client, message.split_whitespace(), options()),
    );

    println!("[unary] {}", unary?);
    for reply in streamed? {
        println!("[server-streaming] {reply}");
    }
    println!("[client-streaming] {}", joined?);
    for reply in chatted? {
        println!("[bidirectional] {reply}");
    }

    client.connection().close();
    Ok(())
}
