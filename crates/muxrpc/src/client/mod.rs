//! Making calls over a connection.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::new(connection);
//!
//! let reply: EchoResponse = client
//!     .unary("echo.EchoService/UnaryEcho", &request, CallOptions::new())
//!     .await?;
//!
//! let mut replies = client
//!     .server_streaming::<EchoRequest, EchoResponse>(
//!         "echo.EchoService/ServerStreamingEcho",
//!         &request,
//!         CallOptions::new().with_timeout(Duration::from_secs(5)),
//!     )
//!     .await?;
//! while let Some(reply) = replies.message().await? {
//!     println!("Got: {reply:?}");
//! }
//! ```

mod call;
mod options;

pub use call::{ClientStreamingCall, RequestSink, Streaming};
pub use options::CallOptions;

use std::sync::Arc;
use tokio::time::Instant;

use crate::codec::{Codec, ProstCodec, encode_to_bytes};
use crate::frame::CallHeader;
use crate::mux::Connection;
use crate::mux::registry::StreamEvent;
use crate::path::MethodPath;
use crate::status::Status;
use call::{ClientCallCore, single_response};

/// Typed call API over one [`Connection`].
#[derive(Debug, Clone)]
pub struct Client<C = ProstCodec> {
    connection: Connection,
    codec: C,
}

impl Client<ProstCodec> {
    pub fn new(connection: Connection) -> Self {
        Self::with_codec(connection, ProstCodec)
    }
}

impl<C> Client<C>
where
    C: Clone,
{
    pub fn with_codec(connection: Connection, codec: C) -> Self {
        Self { connection, codec }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// One request, one response.
    pub async fn unary<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp, Status>
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let payload = encode_to_bytes(&self.codec, request)?;
        let (core, events) = self.start::<Req, Resp>(path, options).await?;
        let mut responses = Streaming::new(Arc::clone(&core), events, self.codec.clone());

        if let Err(status) = core.send_message(payload, true).await {
            return Err(authoritative(&mut responses, status).await);
        }
        single_response(&mut responses).await
    }

    /// One request, a stream of responses.
    pub async fn server_streaming<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Streaming<Resp, C>, Status>
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let payload = encode_to_bytes(&self.codec, request)?;
        let (core, events) = self.start::<Req, Resp>(path, options).await?;
        let mut responses = Streaming::new(Arc::clone(&core), events, self.codec.clone());

        if let Err(status) = core.send_message(payload, true).await {
            return Err(authoritative(&mut responses, status).await);
        }
        Ok(responses)
    }

    /// A stream of requests, one response.
    pub async fn client_streaming<Req, Resp>(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<ClientStreamingCall<Req, Resp, C>, Status>
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let (core, events) = self.start::<Req, Resp>(path, options).await?;
        let requests = RequestSink::new(Arc::clone(&core), self.codec.clone());
        let responses = Streaming::new(core, events, self.codec.clone());
        Ok(ClientStreamingCall::new(requests, responses))
    }

    /// Streams in both directions. The halves can be moved to separate tasks.
    pub async fn streaming<Req, Resp>(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<(RequestSink<Req, C>, Streaming<Resp, C>), Status>
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let (core, events) = self.start::<Req, Resp>(path, options).await?;
        let requests = RequestSink::new(Arc::clone(&core), self.codec.clone());
        let responses = Streaming::new(core, events, self.codec.clone());
        Ok((requests, responses))
    }

    async fn start<Req, Resp>(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<
        (
            Arc<ClientCallCore>,
            tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
        ),
        Status,
    >
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let path = MethodPath::parse(path).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let now = Instant::now();
        let deadline = options.resolve_deadline(now);
        if deadline.is_some_and(|deadline| deadline <= now) {
            return Err(Status::deadline_exceeded("deadline expired before the call started"));
        }

        let (guard, handles) = self.connection.open_stream(deadline).await?;

        let header = CallHeader {
            path: path.full_path(),
            timeout_micros: deadline.map(|deadline| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                u64::try_from(remaining.as_micros()).unwrap_or(u64::MAX)
            }),
            request_type: <C as Codec<Req>>::type_tag(&self.codec).to_string(),
            response_type: <C as Codec<Resp>>::type_tag(&self.codec).to_string(),
            metadata: options.metadata.to_wire(),
        };

        ClientCallCore::start(
            guard,
            handles,
            self.connection.outbound().clone(),
            path,
            deadline,
            header,
            self.connection.config().max_frame_size,
        )
    }
}

/// After a failed send, the response side holds the status the call actually
/// ended with.
async fn authoritative<T, C>(responses: &mut Streaming<T, C>, fallback: Status) -> Status
where
    C: Codec<T>,
{
    match responses.message().await {
        Err(status) => status,
        _ => fallback,
    }
}
