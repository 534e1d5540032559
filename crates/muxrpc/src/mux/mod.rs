//! The stream multiplexer.
//!
//! A [`Connection`] owns one byte stream and runs two background tasks on it:
//! the reader, which is the only task that decodes frames and routes them to
//! calls, and the writer, which is the only task that writes to the stream.
//! Calls talk to the writer through a [`FrameSender`] and hear from the
//! reader through per-stream event channels.

mod config;
pub(crate) mod registry;

pub use config::{ConnectionConfig, Role};

use prost::Message;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::call::CallContext;
use crate::error::FrameError;
use crate::frame::{CallHeader, Frame, FrameKind, StreamId};
use crate::metadata::Metadata;
use crate::path::MethodPath;
use crate::server::Router;
use crate::server::dispatch::{self, ServerCall};
use crate::server::handler::RawInbound;
use crate::status::Status;
use crate::transport::{self, FrameReader, FrameSender, FrameWriter};
use registry::{StreamGuard, StreamHandles, StreamOrigin, StreamSlot, StreamTable};

/// Buffer size of the in-memory pipe built by [`Connection::pair`].
const PAIR_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The byte stream is up; no call has been opened yet.
    Established,
    /// At least one call has been opened or accepted.
    Active,
    /// Teardown has started; no new calls are accepted.
    Closing,
    /// Every call has been failed and the tasks are stopping.
    Closed,
}

impl ConnectionState {
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// One multiplexed connection.
///
/// Handles are cheap to clone. The connection keeps running until either
/// side closes it or the byte stream fails; dropping handles does not close
/// it.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start a connection over `io`.
    ///
    /// Calls opened by the peer are served by `router`; without one they are
    /// answered with `UNIMPLEMENTED`. Must be called from within a tokio
    /// runtime.
    pub fn new<T>(io: T, config: ConnectionConfig, router: Option<Arc<Router>>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound, frames_rx) = transport::channel();
        let (state, _) = watch::channel(ConnectionState::Established);

        let shared = Arc::new(Shared {
            role: config.role,
            next_id: AtomicU64::new(u64::from(config.role.first_stream_id())),
            last_remote_id: AtomicU32::new(0),
            local_capacity: Arc::new(Semaphore::new(config.max_concurrent_streams)),
            remote_capacity: Arc::new(Semaphore::new(config.max_concurrent_streams)),
            table: Arc::new(StreamTable::new()),
            outbound,
            router,
            state,
            close_status: OnceLock::new(),
            config,
        });

        let writer = FrameWriter::new(write_half);
        let mut writer_state = shared.state.subscribe();
        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let closing = async move { wait_closing(&mut writer_state).await };
            if let Err(e) = transport::write_loop(writer, frames_rx, closing).await {
                warn!(error = %e, "connection writer failed");
                writer_shared.shutdown(Status::from(&e));
            }
        });

        let reader = FrameReader::new(read_half, shared.config.max_frame_size);
        tokio::spawn(read_loop(Arc::clone(&shared), reader));

        debug!(role = ?shared.role, "connection established");
        Connection { shared }
    }

    /// Start the calling end of a connection.
    pub fn client<T>(io: T, config: ConnectionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, config.with_role(Role::Client), None)
    }

    /// Start the serving end of a connection.
    pub fn server<T>(io: T, config: ConnectionConfig, router: impl Into<Arc<Router>>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, config.with_role(Role::Server), Some(router.into()))
    }

    /// Build a client and a server connected by an in-memory pipe.
    pub fn pair(router: impl Into<Arc<Router>>, config: ConnectionConfig) -> (Self, Self) {
        let (client_io, server_io) = tokio::io::duplex(PAIR_BUFFER_SIZE);
        let client = Self::client(client_io, config.clone());
        let server = Self::server(server_io, config, router);
        (client, server)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closing()
    }

    /// Streams currently tracked, including cancelled ones still draining.
    pub fn active_streams(&self) -> usize {
        self.shared.table.len()
    }

    /// Close the connection, failing every open call with `UNAVAILABLE`.
    pub fn close(&self) {
        self.shared
            .shutdown(Status::unavailable("connection closed locally"));
    }

    /// Wait until the connection is closed and return the status every open
    /// call was failed with.
    pub async fn closed(&self) -> Status {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
        self.shared.closed_status()
    }

    /// Open a stream for an outgoing call, waiting for capacity until
    /// `deadline`.
    pub(crate) async fn open_stream(
        &self,
        deadline: Option<Instant>,
    ) -> Result<(StreamGuard, StreamHandles), Status> {
        self.shared.open_stream(deadline).await
    }

    pub(crate) fn outbound(&self) -> &FrameSender {
        &self.shared.outbound
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .field("streams", &self.shared.table.len())
            .finish()
    }
}

/// What to do with a stream after routing one frame to it.
enum Disposition {
    Keep,
    /// The stream is over; drop its slot.
    Finish,
    /// The peer broke the protocol on this stream.
    Reset(Status),
}

struct Shared {
    role: Role,
    config: ConnectionConfig,
    next_id: AtomicU64,
    /// Highest id the peer has opened. Only the reader task touches it.
    last_remote_id: AtomicU32,
    local_capacity: Arc<Semaphore>,
    remote_capacity: Arc<Semaphore>,
    table: Arc<StreamTable>,
    outbound: FrameSender,
    router: Option<Arc<Router>>,
    state: watch::Sender<ConnectionState>,
    close_status: OnceLock<Status>,
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.state.borrow().is_closing()
    }

    fn closed_status(&self) -> Status {
        self.close_status
            .get()
            .cloned()
            .unwrap_or_else(|| Status::unavailable("connection closed"))
    }

    fn mark_active(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Established {
                *state = ConnectionState::Active;
                return true;
            }
            false
        });
    }

    fn allocate_id(&self) -> Result<StreamId, Status> {
        let raw = self.next_id.fetch_add(2, Ordering::Relaxed);
        StreamId::try_from(raw)
            .map_err(|_| Status::unavailable("stream ids exhausted; open a new connection"))
    }

    fn guard(&self, id: StreamId) -> StreamGuard {
        StreamGuard::new(
            id,
            Arc::clone(&self.table),
            self.outbound.clone(),
            self.config.cancel_linger,
        )
    }

    async fn open_stream(
        &self,
        deadline: Option<Instant>,
    ) -> Result<(StreamGuard, StreamHandles), Status> {
        if self.is_closing() {
            return Err(self.closed_status());
        }

        let acquire = Arc::clone(&self.local_capacity).acquire_owned();
        let permit = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, acquire)
                .await
                .map_err(|_| {
                    Status::deadline_exceeded("deadline expired waiting for stream capacity")
                })?,
            None => acquire.await,
        }
        .map_err(|_| self.closed_status())?;

        let id = self.allocate_id()?;
        let (slot, handles) =
            StreamSlot::new(StreamOrigin::Local, permit, self.config.effective_window());
        if self.table.insert(id, slot).is_err() {
            return Err(Status::internal(format!("stream id {id} is already in use")));
        }

        // A shutdown that raced with the insert may have missed this slot.
        if self.is_closing() {
            self.table.remove(id);
            return Err(self.closed_status());
        }

        self.mark_active();
        Ok((self.guard(id), handles))
    }

    /// Route one inbound frame. Runs on the reader task only.
    fn on_frame(&self, frame: Frame) {
        let id = frame.stream_id;
        if id == 0 {
            warn!(kind = ?frame.kind, "discarding frame on reserved stream 0");
            return;
        }

        let disposition = {
            let Some(mut slot) = self.table.get_mut(id) else {
                self.on_unknown_stream(frame);
                return;
            };
            self.route(id, &mut slot, frame)
        };

        match disposition {
            Disposition::Keep => {}
            Disposition::Finish => {
                self.table.remove(id);
            }
            Disposition::Reset(status) => self.reset_stream(id, status),
        }
    }

    fn route(&self, id: StreamId, slot: &mut StreamSlot, frame: Frame) -> Disposition {
        if slot.draining {
            return match frame.kind {
                FrameKind::Cancel => {
                    if !frame.is_ack() {
                        let _ = self.outbound.send(Frame::cancel_ack(id));
                    }
                    Disposition::Finish
                }
                FrameKind::Trailers if slot.origin == StreamOrigin::Local => Disposition::Finish,
                _ => Disposition::Keep,
            };
        }

        match frame.kind {
            FrameKind::Headers => {
                if slot.origin == StreamOrigin::Local && !slot.headers_seen {
                    slot.headers_seen = true;
                    let _ = slot.events.send(registry::StreamEvent::Headers);
                    Disposition::Keep
                } else {
                    Disposition::Reset(Status::internal(format!(
                        "stream id collision on stream {id}"
                    )))
                }
            }
            FrameKind::Data => {
                if slot.remote_closed {
                    return Disposition::Reset(Status::internal(
                        "data received after the peer closed its side",
                    ));
                }
                if !slot.recv_window.try_accept() {
                    return Disposition::Reset(Status::resource_exhausted(
                        "peer exceeded its flow-control window",
                    ));
                }
                let end_stream = frame.is_end_stream();
                let _ = slot
                    .events
                    .send(registry::StreamEvent::Message(frame.payload));
                if end_stream {
                    slot.remote_closed = true;
                    let _ = slot.events.send(registry::StreamEvent::RemoteClosed);
                }
                Disposition::Keep
            }
            FrameKind::Trailers => match slot.origin {
                StreamOrigin::Local => {
                    let status = Status::from_wire(frame.payload);
                    slot.signal.send_replace(Some(status.clone()));
                    slot.send_window.close();
                    let _ = slot.events.send(registry::StreamEvent::Trailers(status));
                    Disposition::Finish
                }
                StreamOrigin::Remote => {
                    if !slot.remote_closed {
                        slot.remote_closed = true;
                        let _ = slot.events.send(registry::StreamEvent::RemoteClosed);
                    }
                    Disposition::Keep
                }
            },
            FrameKind::Cancel => {
                if frame.is_ack() {
                    return Disposition::Keep;
                }
                let reason = frame.cancel_reason();
                debug!(stream_id = id, status = %reason, "stream cancelled by peer");
                let _ = self.outbound.send(Frame::cancel_ack(id));
                slot.terminate(reason);
                Disposition::Finish
            }
            FrameKind::WindowUpdate => match frame.window_increment() {
                Some(increment) => {
                    slot.send_window.grant(increment);
                    Disposition::Keep
                }
                None => Disposition::Reset(Status::internal("malformed window update")),
            },
        }
    }

    fn on_unknown_stream(&self, frame: Frame) {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Headers
                if self.role.peer().owns(id)
                    && id > self.last_remote_id.load(Ordering::Acquire) =>
            {
                self.accept_stream(frame);
            }
            FrameKind::Cancel if !frame.is_ack() => {
                let _ = self.outbound.send(Frame::cancel_ack(id));
            }
            kind => {
                debug!(stream_id = id, kind = ?kind, "discarding frame for unknown stream");
            }
        }
    }

    /// Fail one stream, telling the peer why.
    fn reset_stream(&self, id: StreamId, status: Status) {
        let Some(slot) = self.table.remove(id) else {
            return;
        };
        warn!(stream_id = id, status = %status, "resetting stream");
        let _ = self.outbound.send(Frame::cancel(id, &status));
        slot.terminate(status);
    }

    /// Reject a call before any handler sees it.
    fn reject(&self, id: StreamId, status: Status) {
        let _ = self.outbound.send(Frame::trailers(id, &status));
    }

    fn accept_stream(&self, frame: Frame) {
        let id = frame.stream_id;
        self.last_remote_id.store(id, Ordering::Release);

        let header = match CallHeader::decode(frame.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!(stream_id = id, error = %e, "malformed call header");
                self.reject(id, Status::internal(format!("malformed call header: {e}")));
                return;
            }
        };

        let Some((path, descriptor)) = MethodPath::parse(&header.path)
            .ok()
            .and_then(|path| {
                let descriptor = self.router.as_ref()?.lookup(&path)?.clone();
                Some((path, descriptor))
            })
        else {
            debug!(stream_id = id, path = %header.path, "no handler for method");
            self.reject(
                id,
                Status::unimplemented(format!("unknown method '{}'", header.path)),
            );
            return;
        };

        if self.is_closing() {
            return;
        }

        let permit = match Arc::clone(&self.remote_capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(stream_id = id, path = %path, "rejecting call: too many concurrent streams");
                self.reject(
                    id,
                    Status::resource_exhausted("too many concurrent streams"),
                );
                return;
            }
        };

        if !header.request_type.is_empty() && header.request_type != descriptor.request_type {
            warn!(
                stream_id = id,
                path = %path,
                expected = descriptor.request_type,
                received = %header.request_type,
                "request type tag mismatch"
            );
        }

        let deadline = header
            .timeout_micros
            .and_then(|micros| Instant::now().checked_add(Duration::from_micros(micros)));

        let (slot, handles) =
            StreamSlot::new(StreamOrigin::Remote, permit, self.config.effective_window());
        if self.table.insert(id, slot).is_err() {
            self.reset_stream(id, Status::internal(format!("stream id collision on stream {id}")));
            return;
        }
        if self.is_closing() {
            if let Some(slot) = self.table.remove(id) {
                slot.terminate(self.closed_status());
            }
            return;
        }
        self.mark_active();

        let StreamHandles {
            events,
            send_window,
            recv_window,
            signal,
        } = handles;

        let ctx = CallContext::new(
            id,
            path,
            deadline,
            Metadata::from_wire(header.metadata),
            (header.request_type, header.response_type),
            signal.subscribe(),
        );
        let inbound = RawInbound::new(id, events, recv_window, self.outbound.clone());

        debug!(stream_id = id, path = %ctx.path(), "accepted call");
        tokio::spawn(dispatch::serve(ServerCall {
            ctx,
            descriptor,
            inbound,
            guard: self.guard(id),
            signal,
            send_window,
            outbound: self.outbound.clone(),
            max_payload: self.config.max_frame_size,
        }));
    }

    /// Tear the connection down. Only the first call has any effect.
    fn shutdown(&self, status: Status) {
        let first = self.state.send_if_modified(|state| {
            if state.is_closing() {
                return false;
            }
            *state = ConnectionState::Closing;
            true
        });
        if !first {
            return;
        }

        let _ = self.close_status.set(status.clone());
        self.local_capacity.close();
        self.remote_capacity.close();

        let ids = self.table.ids();
        info!(status = %status, open_streams = ids.len(), "connection closing");
        for id in ids {
            if let Some(slot) = self.table.remove(id) {
                slot.terminate(status.clone());
            }
        }

        self.state.send_replace(ConnectionState::Closed);
    }
}

async fn wait_closing(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| s.is_closing()).await;
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    let mut state = shared.state.subscribe();

    loop {
        let result = tokio::select! {
            result = reader.read_frame() => result,
            _ = wait_closing(&mut state) => break,
        };

        match result {
            Ok(frame) => shared.on_frame(frame),
            Err(e) if !e.is_fatal() => {
                if let FrameError::UnknownKind { stream_id, .. } = &e {
                    shared.reset_stream(*stream_id, Status::from(&e));
                }
            }
            Err(FrameError::Closed) => {
                debug!("peer closed the connection");
                shared.shutdown(Status::from(FrameError::Closed));
                break;
            }
            Err(e) => {
                error!(error = %e, "connection failed");
                shared.shutdown(Status::from(&e));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[tokio::test]
    async fn test_close_fails_open_streams_once() {
        let (client, _server) = Connection::pair(Router::new(), ConnectionConfig::default());

        let (_g1, mut h1) = client.open_stream(None).await.unwrap();
        let (_g2, mut h2) = client.open_stream(None).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Active);

        client.close();
        assert_eq!(client.closed().await.code(), Code::Unavailable);
        assert_eq!(client.active_streams(), 0);

        for handles in [&mut h1, &mut h2] {
            assert!(matches!(
                handles.events.recv().await,
                Some(registry::StreamEvent::Reset(s)) if s.code() == Code::Unavailable
            ));
            assert!(handles.events.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_ids_follow_role_parity() {
        let (client, server) = Connection::pair(Router::new(), ConnectionConfig::default());

        let (a, _) = client.open_stream(None).await.unwrap();
        let (b, _) = client.open_stream(None).await.unwrap();
        let (c, _) = server.open_stream(None).await.unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (1, 3, 2));
    }

    #[tokio::test]
    async fn test_open_after_close_is_unavailable() {
        let (client, _server) = Connection::pair(Router::new(), ConnectionConfig::default());
        client.close();
        let err = client.open_stream(None).await.err().unwrap();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_peer_eof_closes_connection() {
        let (client, server) = Connection::pair(Router::new(), ConnectionConfig::default());
        server.close();
        assert_eq!(client.closed().await.code(), Code::Unavailable);
    }
}
