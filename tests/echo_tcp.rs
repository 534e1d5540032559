use muxrpc::{CallOptions, Code, ConnectionConfig};
use muxrpc_echo::echo::{self, EchoRequest, EchoResponse};
use muxrpc_echo::{connect, serve};
use std::time::Duration;
use tokio::net::TcpListener;

async fn spawn_server(config: ConnectionConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let router = echo::router().unwrap();
    tokio::spawn(async move {
        let _ = serve(listener, router, config).await;
    });
    addr
}

#[tokio::test]
async fn test_all_call_shapes_over_tcp() {
    let addr = spawn_server(ConnectionConfig::default()).await;
    let client = connect(&addr).await.unwrap();

    let reply = echo::unary_echo(&client, "hello", CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply, "hello");

    let replies = echo::server_streaming_echo(&client, "hi", CallOptions::new())
        .await
        .unwrap();
    let messages = echo::collect_messages(replies.into_stream()).await.unwrap();
    assert_eq!(messages, vec!["hi - seq 0", "hi - seq 1", "hi - seq 2"]);

    let joined = echo::client_streaming_echo(&client, ["x", "y"], CallOptions::new())
        .await
        .unwrap();
    assert_eq!(joined, "xy");

    let chatted = echo::bidirectional_echo(&client, ["a", "b", "c"], CallOptions::new())
        .await
        .unwrap();
    assert_eq!(chatted, vec!["echo: a", "echo: b", "echo: c"]);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let addr = spawn_server(ConnectionConfig::default()).await;
    let client = connect(&addr).await.unwrap();

    let calls: Vec<_> = (0..32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                echo::unary_echo(&client, &format!("call {i}"), CallOptions::new()).await
            })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply, format!("call {i}"));
    }
    assert_eq!(client.connection().active_streams(), 0);
}

#[tokio::test]
async fn test_server_limit_applies_per_connection() {
    let config = ConnectionConfig::builder().max_concurrent_streams(1).build();
    let addr = spawn_server(config).await;
    let client = connect(&addr).await.unwrap();

    // An open bidirectional call holds the server's only slot.
    let (_requests, _replies) = client
        .streaming::<EchoRequest, EchoResponse>(echo::BIDIRECTIONAL_ECHO, CallOptions::new())
        .await
        .unwrap();

    let mut rejected = None;
    for _ in 0..50 {
        match echo::unary_echo(&client, "late", CallOptions::new()).await {
            Err(status) => {
                rejected = Some(status);
                break;
            }
            // the first call may not have reached the server yet
            Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    assert_eq!(rejected.unwrap().code(), Code::ResourceExhausted);
}

#[tokio::test]
async fn test_closing_client_fails_pending_calls() {
    let addr = spawn_server(ConnectionConfig::default()).await;
    let client = connect(&addr).await.unwrap();

    let (_requests, mut replies) = client
        .streaming::<EchoRequest, EchoResponse>(echo::BIDIRECTIONAL_ECHO, CallOptions::new())
        .await
        .unwrap();

    client.connection().close();
    let err = replies.message().await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(client.connection().is_closed());
}
