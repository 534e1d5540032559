use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::call::{CallContext, SendWindow};
use crate::frame::{Frame, StreamId, oversized};
use crate::mux::registry::StreamGuard;
use crate::server::handler::{HandlerDescriptor, HandlerFn, RawInbound};
use crate::status::Status;
use crate::transport::FrameSender;

/// A call accepted by the reader, ready to be served on its own task.
pub(crate) struct ServerCall {
    pub ctx: CallContext,
    pub descriptor: HandlerDescriptor,
    pub inbound: RawInbound,
    pub guard: StreamGuard,
    pub signal: Arc<watch::Sender<Option<Status>>>,
    pub send_window: Arc<SendWindow>,
    pub outbound: FrameSender,
    /// Largest payload the peer accepts in one frame.
    pub max_payload: usize,
}

/// Serve one call to completion.
///
/// Responses go out in order, followed by exactly one `Trailers` frame,
/// unless the call was already ended by the peer or by connection loss, in
/// which case nothing more is sent.
pub(crate) async fn serve(call: ServerCall) {
    let ServerCall {
        ctx,
        descriptor,
        inbound,
        guard,
        signal,
        send_window,
        outbound,
        max_payload,
    } = call;
    let id = ctx.stream_id();

    if outbound.send(Frame::headers(id, Bytes::new())).is_err() {
        guard.release();
        return;
    }

    let decode_failure = inbound.decode_failure();
    let pipeline = run_pipeline(
        Arc::clone(&descriptor.handler),
        ctx.clone(),
        inbound,
        id,
        &outbound,
        &send_window,
        max_payload,
    );

    let status = tokio::select! {
        result = AssertUnwindSafe(pipeline).catch_unwind() => match result {
            Ok(Ok(())) => Status::ok(),
            Ok(Err(status)) => status,
            Err(_) => {
                error!(stream_id = id, path = %ctx.path(), "handler panicked");
                Status::internal("handler panicked")
            }
        },
        status = ctx.cancelled() => status,
        _ = sleep_until_opt(ctx.deadline()) => {
            Status::deadline_exceeded("deadline exceeded while serving the call")
        }
    };

    if signal.borrow().is_some() {
        debug!(stream_id = id, path = %ctx.path(), "call ended by peer");
        guard.release();
        return;
    }

    let status = match decode_failure.get() {
        Some(failure) if status.is_ok() => failure.clone(),
        _ => status,
    };

    if status.is_ok() {
        debug!(stream_id = id, path = %ctx.path(), "call completed");
    } else {
        warn!(stream_id = id, path = %ctx.path(), error = %status, "call failed");
    }

    signal.send_replace(Some(status.clone()));
    send_window.close();
    // Free the capacity before the caller can see the trailers and reuse it.
    guard.release();
    let mut trailers = Frame::trailers(id, &status);
    if trailers.payload.len() > max_payload {
        let status = oversized("status", trailers.payload.len(), max_payload);
        trailers = Frame::trailers(id, &status);
    }
    let _ = outbound.send(trailers);
}

async fn run_pipeline(
    handler: HandlerFn,
    ctx: CallContext,
    inbound: RawInbound,
    id: StreamId,
    outbound: &FrameSender,
    send_window: &SendWindow,
    max_payload: usize,
) -> Result<(), Status> {
    let mut responses = handler(ctx, inbound).await?;

    while let Some(item) = responses.next().await {
        let payload = item?;
        if payload.len() > max_payload {
            return Err(oversized("response message", payload.len(), max_payload));
        }
        send_window
            .reserve()
            .await
            .map_err(|_| Status::cancelled("stream closed while sending"))?;
        outbound.send(Frame::data(id, payload, false))?;
    }

    Ok(())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
