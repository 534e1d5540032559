use bytes::Bytes;
use futures::Stream;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::call::{CallStateMachine, RecvWindow, SendWindow};
use crate::codec::{Codec, ProstCodec, encode_to_bytes};
use crate::frame::{CallHeader, Frame, StreamId, oversized};
use crate::mux::registry::{StreamEvent, StreamGuard, StreamHandles};
use crate::path::MethodPath;
use crate::status::Status;
use crate::transport::FrameSender;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a call lets go of its stream when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finish {
    /// The stream already ended on the wire.
    Release,
    /// Tell the peer to stop.
    Cancel,
}

/// State shared by the request and response halves of one outgoing call.
pub(crate) struct ClientCallCore {
    stream_id: StreamId,
    path: MethodPath,
    deadline: Option<Instant>,
    outbound: FrameSender,
    /// Largest payload the peer accepts in one frame.
    max_payload: usize,
    send_window: Arc<SendWindow>,
    recv_window: Arc<RecvWindow>,
    state: Mutex<CallStateMachine>,
    guard: Mutex<Option<StreamGuard>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    locally_cancelled: AtomicBool,
}

impl ClientCallCore {
    /// Send the call headers on a freshly opened stream and arm the deadline.
    pub(crate) fn start(
        guard: StreamGuard,
        handles: StreamHandles,
        outbound: FrameSender,
        path: MethodPath,
        deadline: Option<Instant>,
        header: CallHeader,
        max_payload: usize,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>), Status> {
        use prost::Message;

        let StreamHandles {
            events,
            send_window,
            recv_window,
            ..
        } = handles;

        let core = Arc::new(ClientCallCore {
            stream_id: guard.id(),
            path,
            deadline,
            outbound,
            max_payload,
            send_window,
            recv_window,
            state: Mutex::new(CallStateMachine::new()),
            guard: Mutex::new(Some(guard)),
            watchdog: Mutex::new(None),
            locally_cancelled: AtomicBool::new(false),
        });

        let header = header.encode_to_vec();
        if header.len() > core.max_payload {
            let status = oversized("call header", header.len(), core.max_payload);
            core.finish(status.clone(), Finish::Release);
            return Err(status);
        }

        let headers = Frame::headers(core.stream_id, header.into());
        if let Err(status) = core.outbound.send(headers) {
            core.finish(status.clone(), Finish::Release);
            return Err(status);
        }
        lock(&core.state).on_headers_sent()?;

        if let Some(deadline) = deadline {
            let weak = Arc::downgrade(&core);
            let watchdog = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(core) = weak.upgrade() {
                    core.on_deadline();
                }
            });
            *lock(&core.watchdog) = Some(watchdog);
        }

        debug!(stream_id = core.stream_id, path = %core.path, "call started");
        Ok((core, events))
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn terminal_status(&self) -> Option<Status> {
        lock(&self.state).terminal_status().cloned()
    }

    fn on_deadline(&self) {
        let live = lock(&self.guard).as_ref().is_some_and(StreamGuard::is_live);
        if !live {
            return;
        }
        debug!(stream_id = self.stream_id, path = %self.path, "deadline expired");
        self.finish(
            Status::deadline_exceeded("deadline exceeded"),
            Finish::Cancel,
        );
    }

    /// Move the call to its terminal status. Returns `false` if it was
    /// already terminal.
    pub(crate) fn finish(&self, status: Status, how: Finish) -> bool {
        if !lock(&self.state).terminate(status.clone()) {
            return false;
        }
        self.send_window.close();

        let guard = lock(&self.guard).take();
        if let Some(guard) = guard {
            match how {
                Finish::Release => guard.release(),
                Finish::Cancel => guard.cancel(&status),
            }
        }
        if let Some(watchdog) = lock(&self.watchdog).take() {
            watchdog.abort();
        }
        true
    }

    pub(crate) fn cancel(&self) {
        if self.finish(Status::cancelled("call cancelled by client"), Finish::Cancel) {
            self.locally_cancelled.store(true, Ordering::Release);
        }
    }

    fn is_locally_cancelled(&self) -> bool {
        self.locally_cancelled.load(Ordering::Acquire)
    }

    pub(crate) async fn send_message(&self, payload: Bytes, end_stream: bool) -> Result<(), Status> {
        lock(&self.state).on_send_message()?;

        // The peer would read an oversized frame as a desync and drop the
        // whole connection; only this call fails.
        if payload.len() > self.max_payload {
            let status = oversized("request message", payload.len(), self.max_payload);
            self.finish(status.clone(), Finish::Cancel);
            return Err(status);
        }

        if self.send_window.reserve().await.is_err() {
            return Err(self
                .terminal_status()
                .unwrap_or_else(|| Status::unavailable("stream closed")));
        }

        {
            let mut state = lock(&self.state);
            state.on_send_message()?;
            if end_stream {
                state.on_close_send()?;
            }
        }
        self.outbound
            .send(Frame::data(self.stream_id, payload, end_stream))
    }

    pub(crate) fn close_send(&self) -> Result<(), Status> {
        if lock(&self.state).on_close_send()? {
            self.outbound.send(Frame::half_close(self.stream_id))?;
        }
        Ok(())
    }

    fn on_headers(&self) {
        lock(&self.state).on_frame_received();
    }

    fn on_message(&self) -> Result<(), Status> {
        let mut state = lock(&self.state);
        // Messages buffered before the call ended are still delivered.
        if state.is_terminal() {
            return Ok(());
        }
        state.on_message_received()
    }

    fn on_remote_closed(&self) {
        lock(&self.state).on_remote_closed();
    }

    /// Return consumed credit to the server.
    fn on_consumed(&self) {
        if let Some(increment) = self.recv_window.on_consumed() {
            let _ = self
                .outbound
                .send(Frame::window_update(self.stream_id, increment));
        }
    }
}

impl Drop for ClientCallCore {
    fn drop(&mut self) {
        let watchdog = self
            .watchdog
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
    }
}

/// Responses of an outgoing call, in the order the server sent them.
///
/// Dropping this half, together with any request half, before the call has
/// finished cancels the call.
pub struct Streaming<T, C = ProstCodec> {
    core: Arc<ClientCallCore>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    codec: C,
    done: Option<Status>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> Streaming<T, C>
where
    C: Codec<T>,
{
    pub(crate) fn new(
        core: Arc<ClientCallCore>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        codec: C,
    ) -> Self {
        Self {
            core,
            events,
            codec,
            done: None,
            _marker: PhantomData,
        }
    }

    /// The next response.
    ///
    /// `Ok(None)` once the server finished with `OK`; `Err` with the terminal
    /// status otherwise. Messages that arrived before a deadline expired are
    /// still returned first.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        loop {
            if let Some(done) = &self.done {
                return into_result(done.clone());
            }
            if self.core.is_locally_cancelled() {
                return Err(self.conclude());
            }

            let event = self.events.recv().await.unwrap_or_else(|| {
                StreamEvent::Reset(Status::unavailable("stream closed without a status"))
            });

            match event {
                StreamEvent::Headers => self.core.on_headers(),
                StreamEvent::Message(payload) => {
                    if let Err(status) = self.core.on_message() {
                        self.core.finish(status, Finish::Cancel);
                        return Err(self.conclude());
                    }
                    self.core.on_consumed();
                    match self.codec.decode(payload) {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => {
                            let status = Status::from(e);
                            self.core.finish(status, Finish::Cancel);
                            return Err(self.conclude());
                        }
                    }
                }
                StreamEvent::RemoteClosed => self.core.on_remote_closed(),
                StreamEvent::Trailers(status) | StreamEvent::Reset(status) => {
                    self.core.finish(status, Finish::Release);
                    return into_result(self.conclude());
                }
            }
        }
    }

    /// Record and return the call's terminal status.
    fn conclude(&mut self) -> Status {
        let status = self
            .core
            .terminal_status()
            .unwrap_or_else(|| Status::internal("call ended without a status"));
        self.done = Some(status.clone());
        status
    }

    /// The terminal status, once `message` has observed it.
    pub fn status(&self) -> Option<&Status> {
        self.done.as_ref()
    }

    pub fn stream_id(&self) -> StreamId {
        self.core.stream_id()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.core.deadline
    }

    /// Cancel the call. Responses not yet taken are discarded.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<T, Status>>
    where
        T: 'static,
        C: 'static,
    {
        async_stream::stream! {
            loop {
                match self.message().await {
                    Ok(Some(message)) => yield Ok(message),
                    Ok(None) => break,
                    Err(status) => {
                        yield Err(status);
                        break;
                    }
                }
            }
        }
    }
}

fn into_result<T>(status: Status) -> Result<Option<T>, Status> {
    if status.is_ok() {
        Ok(None)
    } else {
        Err(status)
    }
}

/// The request half of a streaming call.
pub struct RequestSink<Req, C = ProstCodec> {
    core: Arc<ClientCallCore>,
    codec: C,
    _marker: PhantomData<fn(Req)>,
}

impl<Req, C> RequestSink<Req, C>
where
    C: Codec<Req>,
{
    pub(crate) fn new(core: Arc<ClientCallCore>, codec: C) -> Self {
        Self {
            core,
            codec,
            _marker: PhantomData,
        }
    }

    /// Send one request, waiting for flow-control credit if the server is
    /// behind.
    pub async fn send(&mut self, message: &Req) -> Result<(), Status> {
        let payload = encode_to_bytes(&self.codec, message)?;
        self.core.send_message(payload, false).await
    }

    /// Tell the server no more requests follow. Idempotent.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.core.close_send()
    }

    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn stream_id(&self) -> StreamId {
        self.core.stream_id()
    }
}

/// A client-streaming call: many requests, then a single response.
pub struct ClientStreamingCall<Req, Resp, C = ProstCodec> {
    requests: RequestSink<Req, C>,
    responses: Streaming<Resp, C>,
}

impl<Req, Resp, C> ClientStreamingCall<Req, Resp, C>
where
    C: Codec<Req> + Codec<Resp>,
{
    pub(crate) fn new(requests: RequestSink<Req, C>, responses: Streaming<Resp, C>) -> Self {
        Self {
            requests,
            responses,
        }
    }

    /// Send one request. A failed send reports the call's authoritative
    /// status when the server already ended it.
    ///
    /// A message the codec cannot encode fails here without touching the
    /// stream; the call stays open.
    pub async fn send(&mut self, message: &Req) -> Result<(), Status> {
        let payload = encode_to_bytes(&self.requests.codec, message)?;
        match self.requests.core.send_message(payload, false).await {
            Ok(()) => Ok(()),
            Err(status) => Err(self.authoritative(status).await),
        }
    }

    /// Close the request side and wait for the response.
    pub async fn finish(mut self) -> Result<Resp, Status> {
        if let Err(status) = self.requests.close_send().await {
            return Err(self.authoritative(status).await);
        }
        single_response(&mut self.responses).await
    }

    pub fn cancel(&self) {
        self.requests.cancel();
    }

    /// Only called once the stream itself has failed, so a terminal event is
    /// already on its way.
    async fn authoritative(&mut self, fallback: Status) -> Status {
        match self.responses.message().await {
            Err(status) => status,
            _ => fallback,
        }
    }
}

/// Read exactly one response and the successful status after it.
pub(crate) async fn single_response<T, C>(responses: &mut Streaming<T, C>) -> Result<T, Status>
where
    C: Codec<T>,
{
    let Some(response) = responses.message().await? else {
        return Err(Status::internal("call finished without a response message"));
    };
    match responses.message().await? {
        None => Ok(response),
        Some(_) => {
            responses.cancel();
            Err(Status::internal("server sent more than one response"))
        }
    }
}
