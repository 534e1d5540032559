use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, mpsc, watch};
use tracing::debug;

use crate::call::{RecvWindow, SendWindow};
use crate::frame::{Frame, StreamId};
use crate::status::Status;
use crate::transport::FrameSender;

/// Which side opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamOrigin {
    Local,
    Remote,
}

/// What the reader task delivers to the call owning a stream, in frame order.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// The peer accepted a call this side opened.
    Headers,
    Message(Bytes),
    /// The peer will send no more messages.
    RemoteClosed,
    /// Terminal status sent by the serving peer.
    Trailers(Status),
    /// The stream ended without trailers: cancellation, protocol fault or
    /// connection loss.
    Reset(Status),
}

/// The call-side ends of a freshly created stream.
pub(crate) struct StreamHandles {
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub send_window: Arc<SendWindow>,
    pub recv_window: Arc<RecvWindow>,
    pub signal: Arc<watch::Sender<Option<Status>>>,
}

/// Reader-side state of one live stream.
///
/// Holding the slot holds one unit of concurrency capacity, so removing the
/// slot from the table is what frees it.
pub(crate) struct StreamSlot {
    pub origin: StreamOrigin,
    pub events: mpsc::UnboundedSender<StreamEvent>,
    pub send_window: Arc<SendWindow>,
    pub recv_window: Arc<RecvWindow>,
    pub signal: Arc<watch::Sender<Option<Status>>>,
    /// Cancelled locally; waiting for the peer to acknowledge.
    pub draining: bool,
    pub remote_closed: bool,
    pub headers_seen: bool,
    _permit: OwnedSemaphorePermit,
}

impl StreamSlot {
    pub fn new(
        origin: StreamOrigin,
        permit: OwnedSemaphorePermit,
        initial_window: u32,
    ) -> (Self, StreamHandles) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(SendWindow::new(initial_window));
        let recv_window = Arc::new(RecvWindow::new(initial_window));
        let (signal, _) = watch::channel(None);
        let signal = Arc::new(signal);

        let slot = StreamSlot {
            origin,
            events: events_tx,
            send_window: Arc::clone(&send_window),
            recv_window: Arc::clone(&recv_window),
            signal: Arc::clone(&signal),
            draining: false,
            remote_closed: false,
            headers_seen: false,
            _permit: permit,
        };
        let handles = StreamHandles {
            events: events_rx,
            send_window,
            recv_window,
            signal,
        };
        (slot, handles)
    }

    /// Record the terminal status and wake everything waiting on the stream.
    ///
    /// The `Reset` event queues behind any messages already delivered, so the
    /// consumer still sees those first.
    pub fn terminate(&self, status: Status) {
        self.signal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status.clone());
            true
        });
        self.send_window.close();
        let _ = self.events.send(StreamEvent::Reset(status));
    }
}

/// Tracks every live stream of a connection by id.
///
/// Only one slot may exist per id. Entries are removed exactly once, and the
/// remover is responsible for terminating the stream.
pub(crate) struct StreamTable {
    streams: DashMap<StreamId, StreamSlot, ahash::RandomState>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            streams: DashMap::default(),
        }
    }

    /// Insert a slot for a fresh id. Returns the slot back if the id is taken.
    pub fn insert(&self, id: StreamId, slot: StreamSlot) -> Result<(), StreamSlot> {
        use dashmap::mapref::entry::Entry;

        match self.streams.entry(id) {
            Entry::Occupied(_) => Err(slot),
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(())
            }
        }
    }

    pub fn get_mut(&self, id: StreamId) -> Option<RefMut<'_, StreamId, StreamSlot>> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&self, id: StreamId) -> Option<StreamSlot> {
        self.streams.remove(&id).map(|(_, slot)| slot)
    }

    #[cfg(test)]
    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// Whether the stream exists and has not been cancelled locally.
    pub fn is_live(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|slot| !slot.draining)
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership of one stream held by the call driving it.
///
/// A guard dropped without an explicit `release` cancels the stream.
pub(crate) struct StreamGuard {
    id: StreamId,
    table: Arc<StreamTable>,
    outbound: FrameSender,
    linger: Duration,
    armed: bool,
}

impl StreamGuard {
    pub fn new(
        id: StreamId,
        table: Arc<StreamTable>,
        outbound: FrameSender,
        linger: Duration,
    ) -> Self {
        Self {
            id,
            table,
            outbound,
            linger,
            armed: true,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.table.is_live(self.id)
    }

    /// The call finished normally; forget the stream.
    pub fn release(mut self) {
        self.armed = false;
        self.table.remove(self.id);
    }

    /// Abort the stream and tell the peer why.
    pub fn cancel(mut self, status: &Status) {
        self.armed = false;
        self.abort(status);
    }

    fn abort(&self, status: &Status) {
        let marked = match self.table.get_mut(self.id) {
            Some(mut slot) if !slot.draining => {
                slot.draining = true;
                slot.terminate(status.clone());
                true
            }
            _ => false,
        };
        if !marked {
            return;
        }

        debug!(stream_id = self.id, status = %status, "cancelling stream");
        let _ = self.outbound.send(Frame::cancel(self.id, status));

        // The slot stays until the peer acknowledges, bounded by the linger.
        let table = Arc::clone(&self.table);
        let id = self.id;
        let linger = self.linger;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(linger).await;
                    if table.remove(id).is_some() {
                        debug!(stream_id = id, "reclaimed cancelled stream without acknowledgement");
                    }
                });
            }
            Err(_) => {
                table.remove(id);
            }
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.armed {
            self.abort(&Status::cancelled("call dropped before completion"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use crate::status::Code;
    use crate::transport;
    use tokio::sync::Semaphore;

    fn permit(sem: &Arc<Semaphore>) -> OwnedSemaphorePermit {
        Arc::clone(sem).try_acquire_owned().unwrap()
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let sem = Arc::new(Semaphore::new(4));
        let table = StreamTable::new();

        let (first, _h1) = StreamSlot::new(StreamOrigin::Local, permit(&sem), 4);
        let (second, _h2) = StreamSlot::new(StreamOrigin::Local, permit(&sem), 4);
        assert!(table.insert(1, first).is_ok());
        assert!(table.insert(1, second).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_removal_frees_capacity() {
        let sem = Arc::new(Semaphore::new(1));
        let table = StreamTable::new();

        let (slot, _handles) = StreamSlot::new(StreamOrigin::Remote, permit(&sem), 4);
        table.insert(2, slot).ok();
        assert_eq!(sem.available_permits(), 0);

        table.remove(2);
        assert_eq!(sem.available_permits(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_terminate_is_observed_once() {
        let sem = Arc::new(Semaphore::new(1));
        let (slot, mut handles) = StreamSlot::new(StreamOrigin::Local, permit(&sem), 4);

        slot.terminate(Status::unavailable("gone"));
        slot.terminate(Status::ok());

        assert_eq!(
            handles.signal.borrow().as_ref().unwrap().code(),
            Code::Unavailable
        );
        assert!(handles.send_window.is_closed());
        assert!(matches!(
            handles.events.try_recv(),
            Ok(StreamEvent::Reset(s)) if s.code() == Code::Unavailable
        ));
    }

    #[test]
    fn test_release_removes_without_cancel() {
        let sem = Arc::new(Semaphore::new(1));
        let table = Arc::new(StreamTable::new());
        let (tx, mut rx) = transport::channel();

        let (slot, _handles) = StreamSlot::new(StreamOrigin::Local, permit(&sem), 4);
        table.insert(1, slot).ok();

        let guard = StreamGuard::new(1, Arc::clone(&table), tx, Duration::from_secs(5));
        assert!(guard.is_live());
        guard.release();

        assert!(!table.contains(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_without_runtime_cancels_and_removes() {
        let sem = Arc::new(Semaphore::new(1));
        let table = Arc::new(StreamTable::new());
        let (tx, mut rx) = transport::channel();

        let (slot, mut handles) = StreamSlot::new(StreamOrigin::Local, permit(&sem), 4);
        table.insert(1, slot).ok();
        drop(StreamGuard::new(1, Arc::clone(&table), tx, Duration::from_secs(5)));

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.kind, FrameKind::Cancel);
        assert_eq!(frame.cancel_reason().code(), Code::Cancelled);
        assert!(!table.contains(1));
        assert!(matches!(
            handles.events.try_recv(),
            Ok(StreamEvent::Reset(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_stream_lingers_until_reclaimed() {
        let sem = Arc::new(Semaphore::new(1));
        let table = Arc::new(StreamTable::new());
        let (tx, _rx) = transport::channel();

        let (slot, _handles) = StreamSlot::new(StreamOrigin::Local, permit(&sem), 4);
        table.insert(1, slot).ok();
        let guard = StreamGuard::new(1, Arc::clone(&table), tx, Duration::from_secs(5));
        guard.cancel(&Status::cancelled("stop"));

        assert!(table.contains(1));
        assert!(!table.is_live(1));
        assert_eq!(sem.available_permits(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!table.contains(1));
        assert_eq!(sem.available_permits(), 1);
    }
}
