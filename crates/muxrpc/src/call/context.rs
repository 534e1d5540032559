use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::frame::StreamId;
use crate::metadata::Metadata;
use crate::path::MethodPath;
use crate::status::Status;

/// Per-call information handed to a server handler.
///
/// Cloning is cheap enough to pass the context into tasks the handler spawns;
/// every clone observes the same cancellation signal.
#[derive(Debug, Clone)]
pub struct CallContext {
    stream_id: StreamId,
    path: MethodPath,
    deadline: Option<Instant>,
    metadata: Metadata,
    request_type: String,
    response_type: String,
    signal: watch::Receiver<Option<Status>>,
}

impl CallContext {
    pub(crate) fn new(
        stream_id: StreamId,
        path: MethodPath,
        deadline: Option<Instant>,
        metadata: Metadata,
        message_types: (String, String),
        signal: watch::Receiver<Option<Status>>,
    ) -> Self {
        let (request_type, response_type) = message_types;
        Self {
            stream_id,
            path,
            deadline,
            metadata,
            request_type,
            response_type,
            signal,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn path(&self) -> &MethodPath {
        &self.path
    }

    /// The caller's deadline, if it sent a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Request and response type tags announced by the caller. Empty when the
    /// caller did not send them.
    pub fn message_types(&self) -> (&str, &str) {
        (&self.request_type, &self.response_type)
    }

    /// Whether the call ended with anything other than success.
    pub fn is_cancelled(&self) -> bool {
        self.signal
            .borrow()
            .as_ref()
            .is_some_and(|status| !status.is_ok())
    }

    /// Resolves once the call has ended, returning its terminal status.
    ///
    /// Peer cancellation, connection loss and an expired deadline all resolve
    /// this future, so handlers that spawn background work can select on it.
    pub async fn cancelled(&self) -> Status {
        let mut signal = self.signal.clone();
        match signal.wait_for(Option::is_some).await {
            Ok(status) => status
                .clone()
                .unwrap_or_else(|| Status::cancelled("call cancelled")),
            Err(_) => Status::cancelled("call finished"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    fn context() -> (CallContext, watch::Sender<Option<Status>>) {
        let (tx, rx) = watch::channel(None);
        let ctx = CallContext::new(
            2,
            MethodPath::parse("echo.EchoService/UnaryEcho").unwrap(),
            None,
            Metadata::new(),
            ("echo.EchoRequest".into(), "echo.EchoResponse".into()),
            rx,
        );
        (ctx, tx)
    }

    #[tokio::test]
    async fn test_cancelled_resolves_with_signal() {
        let (ctx, tx) = context();
        assert!(!ctx.is_cancelled());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };
        tx.send_replace(Some(Status::cancelled("peer went away")));

        assert_eq!(waiter.await.unwrap().code(), Code::Cancelled);
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_signal_counts_as_finished() {
        let (ctx, tx) = context();
        drop(tx);
        assert_eq!(ctx.cancelled().await.code(), Code::Cancelled);
    }

    #[test]
    fn test_message_types_are_exposed() {
        let (ctx, _tx) = context();
        assert_eq!(ctx.message_types(), ("echo.EchoRequest", "echo.EchoResponse"));
        assert_eq!(ctx.time_remaining(), None);
    }
}
