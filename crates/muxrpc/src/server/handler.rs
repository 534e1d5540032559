use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;

use crate::call::{CallContext, RecvWindow};
use crate::codec::{Codec, ProstCodec, encode_to_bytes};
use crate::frame::{Frame, StreamId};
use crate::mux::registry::StreamEvent;
use crate::status::Status;
use crate::transport::FrameSender;

/// Encoded responses produced by a handler.
pub type ResponseStream = BoxStream<'static, Result<Bytes, Status>>;

/// A type-erased handler, stored by the router and invoked once per call.
pub type HandlerFn = Arc<
    dyn Fn(CallContext, RawInbound) -> BoxFuture<'static, Result<ResponseStream, Status>>
        + Send
        + Sync
        + 'static,
>;

/// Which directions of a call carry a stream of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamingMode {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

impl StreamingMode {
    pub fn is_client_streaming(self) -> bool {
        matches!(
            self,
            StreamingMode::ClientStreaming | StreamingMode::Bidirectional
        )
    }

    pub fn is_server_streaming(self) -> bool {
        matches!(
            self,
            StreamingMode::ServerStreaming | StreamingMode::Bidirectional
        )
    }
}

/// Everything the router knows about one method.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub mode: StreamingMode,
    pub handler: HandlerFn,
    pub request_type: &'static str,
    pub response_type: &'static str,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("mode", &self.mode)
            .field("request_type", &self.request_type)
            .field("response_type", &self.response_type)
            .finish_non_exhaustive()
    }
}

impl HandlerDescriptor {
    /// One request in, one response out.
    pub fn unary<Req, Resp, C, F, Fut>(codec: C, f: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        C: Codec<Req> + Codec<Resp> + Clone,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let tags = type_tags::<Req, Resp, C>(&codec);
        let f = Arc::new(f);
        let handler = make_handler(codec, move |ctx, inbound: DecodedInbound<Req, C>, codec| {
            let f = Arc::clone(&f);
            async move {
                let request = single_request(inbound).await?;
                let response = (*f)(ctx, request).await?;
                let payload = encode_to_bytes(&codec, &response)?;
                Ok::<ResponseStream, Status>(
                    futures::stream::once(async move { Ok(payload) }).boxed(),
                )
            }
        });
        Self::from_parts(StreamingMode::Unary, handler, tags)
    }

    /// One request in, a stream of responses out.
    pub fn server_streaming<Req, Resp, C, F, Fut, S>(codec: C, f: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        C: Codec<Req> + Codec<Resp> + Clone,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let tags = type_tags::<Req, Resp, C>(&codec);
        let f = Arc::new(f);
        let handler = make_handler(codec, move |ctx, inbound: DecodedInbound<Req, C>, codec| {
            let f = Arc::clone(&f);
            async move {
                let request = single_request(inbound).await?;
                let responses = (*f)(ctx, request).await?;
                Ok::<ResponseStream, Status>(encode_responses(responses, codec))
            }
        });
        Self::from_parts(StreamingMode::ServerStreaming, handler, tags)
    }

    /// A stream of requests in, one response out.
    pub fn client_streaming<Req, Resp, C, F, Fut>(codec: C, f: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        C: Codec<Req> + Codec<Resp> + Clone,
        F: Fn(CallContext, DecodedInbound<Req, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let tags = type_tags::<Req, Resp, C>(&codec);
        let handler = make_handler(codec, move |ctx, inbound: DecodedInbound<Req, C>, codec| {
            let fut = f(ctx, inbound);
            async move {
                let response = fut.await?;
                let payload = encode_to_bytes(&codec, &response)?;
                Ok::<ResponseStream, Status>(
                    futures::stream::once(async move { Ok(payload) }).boxed(),
                )
            }
        });
        Self::from_parts(StreamingMode::ClientStreaming, handler, tags)
    }

    /// Streams in both directions.
    pub fn streaming<Req, Resp, C, F, Fut, S>(codec: C, f: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        C: Codec<Req> + Codec<Resp> + Clone,
        F: Fn(CallContext, DecodedInbound<Req, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let tags = type_tags::<Req, Resp, C>(&codec);
        let handler = make_handler(codec, move |ctx, inbound: DecodedInbound<Req, C>, codec| {
            let fut = f(ctx, inbound);
            async move {
                let responses = fut.await?;
                Ok::<ResponseStream, Status>(encode_responses(responses, codec))
            }
        });
        Self::from_parts(StreamingMode::Bidirectional, handler, tags)
    }

    fn from_parts(
        mode: StreamingMode,
        handler: HandlerFn,
        (request_type, response_type): (&'static str, &'static str),
    ) -> Self {
        Self {
            mode,
            handler,
            request_type,
            response_type,
        }
    }
}

fn type_tags<Req, Resp, C>(codec: &C) -> (&'static str, &'static str)
where
    C: Codec<Req> + Codec<Resp>,
{
    (
        <C as Codec<Req>>::type_tag(codec),
        <C as Codec<Resp>>::type_tag(codec),
    )
}

/// Helper to create a type-erased handler from a typed closure.
///
/// The closure receives the decoded inbound stream and its own clone of the
/// codec for encoding responses.
pub fn make_handler<Req, C, F, Fut>(codec: C, f: F) -> HandlerFn
where
    Req: Send + 'static,
    C: Codec<Req> + Clone,
    F: Fn(CallContext, DecodedInbound<Req, C>, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseStream, Status>> + Send + 'static,
{
    Arc::new(
        move |ctx: CallContext, raw: RawInbound| -> BoxFuture<'static, Result<ResponseStream, Status>> {
            let inbound = DecodedInbound::new(raw, codec.clone());
            Box::pin(f(ctx, inbound, codec.clone()))
        },
    )
}

async fn single_request<Req, C>(mut inbound: DecodedInbound<Req, C>) -> Result<Req, Status>
where
    C: Codec<Req>,
{
    inbound
        .message()
        .await?
        .ok_or_else(|| Status::invalid_argument("call closed without a request message"))
}

fn encode_responses<Resp, C, S>(responses: S, codec: C) -> ResponseStream
where
    Resp: Send + 'static,
    C: Codec<Resp>,
    S: Stream<Item = Result<Resp, Status>> + Send + 'static,
{
    responses
        .map(move |item| {
            item.and_then(|response| encode_to_bytes(&codec, &response).map_err(Status::from))
        })
        .boxed()
}

/// Raw request payloads of one served call, in arrival order.
///
/// Taking a message returns its flow-control credit to the caller.
pub struct RawInbound {
    stream_id: StreamId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    recv_window: Arc<RecvWindow>,
    outbound: FrameSender,
    decode_failure: Arc<OnceLock<Status>>,
    finished: bool,
}

impl RawInbound {
    pub(crate) fn new(
        stream_id: StreamId,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        recv_window: Arc<RecvWindow>,
        outbound: FrameSender,
    ) -> Self {
        Self {
            stream_id,
            events,
            recv_window,
            outbound,
            decode_failure: Arc::new(OnceLock::new()),
            finished: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Set when a request could not be decoded; overrides a successful
    /// handler outcome.
    pub(crate) fn decode_failure(&self) -> Arc<OnceLock<Status>> {
        Arc::clone(&self.decode_failure)
    }
}

impl Stream for RawInbound {
    type Item = Result<Bytes, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            match ready!(this.events.poll_recv(cx)) {
                Some(StreamEvent::Message(payload)) => {
                    if let Some(increment) = this.recv_window.on_consumed() {
                        let _ = this
                            .outbound
                            .send(Frame::window_update(this.stream_id, increment));
                    }
                    return Poll::Ready(Some(Ok(payload)));
                }
                Some(StreamEvent::Headers) => continue,
                Some(StreamEvent::RemoteClosed) | None => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Some(StreamEvent::Trailers(status)) | Some(StreamEvent::Reset(status)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(status)));
                }
            }
        }
    }
}

/// Decoded request messages of one served call.
///
/// A payload that fails to decode ends the stream with `INTERNAL`, and the
/// call finishes with that status even if the handler returns success.
pub struct DecodedInbound<Req, C = ProstCodec> {
    inner: RawInbound,
    codec: C,
    decode_failure: Arc<OnceLock<Status>>,
    finished: bool,
    _marker: PhantomData<fn() -> Req>,
}

// No field is structurally pinned.
impl<Req, C> Unpin for DecodedInbound<Req, C> {}

impl<Req, C> DecodedInbound<Req, C>
where
    C: Codec<Req>,
{
    pub fn new(inner: RawInbound, codec: C) -> Self {
        let decode_failure = inner.decode_failure();
        Self {
            inner,
            codec,
            decode_failure,
            finished: false,
            _marker: PhantomData,
        }
    }

    /// The next request, `Ok(None)` once the caller has finished sending.
    pub async fn message(&mut self) -> Result<Option<Req>, Status> {
        self.next().await.transpose()
    }

    pub fn stream_id(&self) -> StreamId {
        self.inner.stream_id()
    }
}

impl<Req, C> Stream for DecodedInbound<Req, C>
where
    C: Codec<Req>,
{
    type Item = Result<Req, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(payload)) => match this.codec.decode(payload) {
                Ok(message) => Poll::Ready(Some(Ok(message))),
                // stop reading; the call fails with INTERNAL once the
                // handler returns
                Err(e) => {
                    tracing::warn!(
                        stream_id = this.inner.stream_id(),
                        error = %e,
                        "failed to decode request"
                    );
                    let status = Status::from(e);
                    let _ = this.decode_failure.set(status.clone());
                    this.finished = true;
                    Poll::Ready(Some(Err(status)))
                }
            },
            Some(Err(status)) => {
                this.finished = true;
                Poll::Ready(Some(Err(status)))
            }
            None => {
                this.finished = true;
                Poll::Ready(None)
            }
        }
    }
}
