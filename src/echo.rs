//! The echo service: one method per call shape.

use futures::{Stream, StreamExt};
use muxrpc::{CallOptions, Client, DecodedInbound, RegistryError, Router, Status, Streaming};
use tracing::debug;

pub const SERVICE: &str = "echo.EchoService";

pub const UNARY_ECHO: &str = "echo.EchoService/UnaryEcho";
pub const SERVER_STREAMING_ECHO: &str = "echo.EchoService/ServerStreamingEcho";
pub const CLIENT_STREAMING_ECHO: &str = "echo.EchoService/ClientStreamingEcho";
pub const BIDIRECTIONAL_ECHO: &str = "echo.EchoService/BidirectionalEcho";

/// Replies produced per server-streaming request.
pub const STREAM_REPLIES: usize = 3;

/// Metadata key naming the calling client.
pub const CLIENT_ID_KEY: &str = "client-id";

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

impl EchoRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Register every echo method on `router`.
pub fn register(router: &mut Router) -> Result<(), RegistryError> {
    router
        .unary(SERVICE, "UnaryEcho", |ctx, req: EchoRequest| async move {
            debug!(
                stream_id = ctx.stream_id(),
                client = ?ctx.metadata().get(CLIENT_ID_KEY),
                "unary echo"
            );
            Ok::<_, Status>(EchoResponse {
                message: req.message,
            })
        })?
        .server_streaming(
            SERVICE,
            "ServerStreamingEcho",
            |_ctx, req: EchoRequest| async move {
                let replies = (0..STREAM_REPLIES).map(move |i| {
                    Ok::<_, Status>(EchoResponse {
                        message: format!("{} - seq {i}", req.message),
                    })
                });
                Ok::<_, Status>(futures::stream::iter(replies))
            },
        )?
        .client_streaming(
            SERVICE,
            "ClientStreamingEcho",
            |_ctx, mut inbound: DecodedInbound<EchoRequest>| async move {
                let mut full = String::new();
                while let Some(req) = inbound.message().await? {
                    full.push_str(&req.message);
                }
                Ok::<_, Status>(EchoResponse { message: full })
            },
        )?
        .streaming(
            SERVICE,
            "BidirectionalEcho",
            |_ctx, inbound: DecodedInbound<EchoRequest>| async move {
                let replies = inbound.map(|item| {
                    item.map(|req| EchoResponse {
                        message: format!("echo: {}", req.message),
                    })
                });
                Ok::<_, Status>(replies)
            },
        )?;

    Ok(())
}

/// A router serving only the echo service.
pub fn router() -> Result<Router, RegistryError> {
    let mut router = Router::new();
    register(&mut router)?;
    Ok(router)
}

pub async fn unary_echo(
    client: &Client,
    message: &str,
    options: CallOptions,
) -> Result<String, Status> {
    let reply: EchoResponse = client
        .unary(UNARY_ECHO, &EchoRequest::new(message), options)
        .await?;
    Ok(reply.message)
}

pub async fn server_streaming_echo(
    client: &Client,
    message: &str,
    options: CallOptions,
) -> Result<Streaming<EchoResponse>, Status> {
    client
        .server_streaming::<EchoRequest, EchoResponse>(
            SERVER_STREAMING_ECHO,
            &EchoRequest::new(message),
            options,
        )
        .await
}

/// Send every part in order and return the server's concatenation.
pub async fn client_streaming_echo<I, S>(
    client: &Client,
    parts: I,
    options: CallOptions,
) -> Result<String, Status>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut call = client
        .client_streaming::<EchoRequest, EchoResponse>(CLIENT_STREAMING_ECHO, options)
        .await?;
    for part in parts {
        call.send(&EchoRequest::new(part)).await?;
    }
    Ok(call.finish().await?.message)
}

/// Send each message and wait for its echo before sending the next.
pub async fn bidirectional_echo<I, S>(
    client: &Client,
    messages: I,
    options: CallOptions,
) -> Result<Vec<String>, Status>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let (mut requests, mut replies) = client
        .streaming::<EchoRequest, EchoResponse>(BIDIRECTIONAL_ECHO, options)
        .await?;

    let mut echoed = Vec::new();
    for message in messages {
        requests.send(&EchoRequest::new(message)).await?;
        match replies.message().await? {
            Some(reply) => echoed.push(reply.message),
            None => return Err(Status::internal("echo stream ended early")),
        }
    }
    requests.close_send().await?;

    // drain to observe the final status
    while replies.message().await?.is_some() {}
    Ok(echoed)
}

/// Collect a reply stream into its messages.
pub async fn collect_messages(
    replies: impl Stream<Item = Result<EchoResponse, Status>>,
) -> Result<Vec<String>, Status> {
    let mut replies = std::pin::pin!(replies);
    let mut messages = Vec::new();
    while let Some(reply) = replies.next().await {
        messages.push(reply?.message);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxrpc::{Code, Connection, ConnectionConfig};

    fn client() -> (Client, Connection) {
        let router = router().unwrap();
        let (client_conn, server_conn) = Connection::pair(router, ConnectionConfig::default());
        (Client::new(client_conn), server_conn)
    }

    #[test]
    fn test_register_all_methods() {
        let router = router().unwrap();
        assert_eq!(router.len(), 4);
        assert!(router.has_handler(UNARY_ECHO));
        assert!(router.has_handler(SERVER_STREAMING_ECHO));
        assert!(router.has_handler(CLIENT_STREAMING_ECHO));
        assert!(router.has_handler(BIDIRECTIONAL_ECHO));
    }

    #[test]
    fn test_register_twice_fails() {
        let mut router = router().unwrap();
        assert!(register(&mut router).is_err());
    }

    #[tokio::test]
    async fn test_unary_echo() {
        let (client, _server) = client();
        let reply = unary_echo(&client, "hello", CallOptions::new()).await.unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test]
    async fn test_server_streaming_echo() {
        let (client, _server) = client();
        let replies = server_streaming_echo(&client, "ping", CallOptions::new())
            .await
            .unwrap();
        let messages = collect_messages(replies.into_stream()).await.unwrap();
        assert_eq!(
            messages,
            vec!["ping - seq 0", "ping - seq 1", "ping - seq 2"]
        );
    }

    #[tokio::test]
    async fn test_client_streaming_echo() {
        let (client, _server) = client();
        let reply = client_streaming_echo(&client, ["a", "b", "c"], CallOptions::new())
            .await
            .unwrap();
        assert_eq!(reply, "abc");
    }

    #[tokio::test]
    async fn test_client_streaming_without_requests() {
        let (client, _server) = client();
        let reply = client_streaming_echo(&client, Vec::<String>::new(), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(reply, "");
    }

    #[tokio::test]
    async fn test_bidirectional_echo() {
        let (client, _server) = client();
        let replies = bidirectional_echo(&client, ["one", "two"], CallOptions::new())
            .await
            .unwrap();
        assert_eq!(replies, vec!["echo: one", "echo: two"]);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (client, _server) = client();
        let err = client
            .unary::<EchoRequest, EchoResponse>(
                "echo.EchoService/Shout",
                &EchoRequest::new("hi"),
                CallOptions::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
