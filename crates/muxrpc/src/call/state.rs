use crate::status::Status;

/// Lifecycle of one call as seen by the side that drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Stream id allocated, nothing sent yet.
    Initiated,
    /// Headers are on the wire; the peer has not answered.
    HeadersSent,
    /// The peer has sent at least one frame.
    Active,
    /// This side finished sending; the peer may still send.
    HalfClosed,
    /// The call is over. Later transitions are ignored.
    Terminal(Status),
}

/// Explicit transition table for a call.
///
/// The receive direction is tracked separately through `remote_closed`, since
/// the peer can finish sending before or after this side does.
#[derive(Debug, Clone)]
pub struct CallStateMachine {
    state: CallState,
    remote_closed: bool,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Initiated,
            remote_closed: false,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CallState::Terminal(_))
    }

    pub fn terminal_status(&self) -> Option<&Status> {
        match &self.state {
            CallState::Terminal(status) => Some(status),
            _ => None,
        }
    }

    pub fn remote_closed(&self) -> bool {
        self.remote_closed
    }

    pub fn on_headers_sent(&mut self) -> Result<(), Status> {
        match &self.state {
            CallState::Initiated => {
                self.state = CallState::HeadersSent;
                Ok(())
            }
            CallState::Terminal(status) => Err(status.clone()),
            other => Err(Status::internal(format!(
                "headers sent twice (state {other:?})"
            ))),
        }
    }

    /// Check that a message may be sent in the current state.
    pub fn on_send_message(&self) -> Result<(), Status> {
        match &self.state {
            CallState::HeadersSent | CallState::Active => Ok(()),
            CallState::Initiated => Err(Status::internal("message sent before headers")),
            CallState::HalfClosed => Err(Status::internal("message sent after close_send")),
            CallState::Terminal(status) => Err(status.clone()),
        }
    }

    /// Mark the sending direction finished.
    ///
    /// Returns `true` when this call performed the transition and `false` when
    /// the direction was already closed.
    pub fn on_close_send(&mut self) -> Result<bool, Status> {
        match &self.state {
            CallState::HeadersSent | CallState::Active => {
                self.state = CallState::HalfClosed;
                Ok(true)
            }
            CallState::HalfClosed => Ok(false),
            CallState::Initiated => Err(Status::internal("close_send before headers")),
            CallState::Terminal(status) => Err(status.clone()),
        }
    }

    /// Any frame from the peer moves a fresh call to `Active`.
    pub fn on_frame_received(&mut self) {
        if self.state == CallState::HeadersSent {
            self.state = CallState::Active;
        }
    }

    pub fn on_message_received(&mut self) -> Result<(), Status> {
        if self.remote_closed {
            return Err(Status::internal("message received after the peer closed"));
        }
        if let CallState::Terminal(status) = &self.state {
            return Err(status.clone());
        }
        self.on_frame_received();
        Ok(())
    }

    pub fn on_remote_closed(&mut self) {
        self.on_frame_received();
        self.remote_closed = true;
    }

    /// Move to `Terminal(status)`. Only the first terminal status sticks.
    pub fn terminate(&mut self, status: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = CallState::Terminal(status);
        true
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    fn sent() -> CallStateMachine {
        let mut sm = CallStateMachine::new();
        sm.on_headers_sent().unwrap();
        sm
    }

    #[test]
    fn test_happy_path() {
        let mut sm = sent();
        assert_eq!(sm.state(), &CallState::HeadersSent);
        sm.on_send_message().unwrap();
        sm.on_message_received().unwrap();
        assert_eq!(sm.state(), &CallState::Active);
        assert!(sm.on_close_send().unwrap());
        assert_eq!(sm.state(), &CallState::HalfClosed);
        assert!(sm.terminate(Status::ok()));
        assert!(sm.terminal_status().unwrap().is_ok());
    }

    #[test]
    fn test_first_terminal_status_wins() {
        let mut sm = sent();
        assert!(sm.terminate(Status::deadline_exceeded("late")));
        assert!(!sm.terminate(Status::ok()));
        assert!(!sm.terminate(Status::cancelled("too late")));
        assert_eq!(sm.terminal_status().unwrap().code(), Code::DeadlineExceeded);
    }

    #[test]
    fn test_send_after_close_is_rejected() {
        let mut sm = sent();
        assert!(sm.on_close_send().unwrap());
        assert!(!sm.on_close_send().unwrap());
        assert_eq!(sm.on_send_message().unwrap_err().code(), Code::Internal);
    }

    #[test]
    fn test_send_after_terminal_returns_terminal_status() {
        let mut sm = sent();
        sm.terminate(Status::cancelled("stop"));
        assert_eq!(sm.on_send_message().unwrap_err().code(), Code::Cancelled);
        assert_eq!(sm.on_close_send().unwrap_err().code(), Code::Cancelled);
    }

    #[test]
    fn test_message_after_remote_close_is_violation() {
        let mut sm = sent();
        sm.on_remote_closed();
        assert!(sm.remote_closed());
        assert_eq!(sm.on_message_received().unwrap_err().code(), Code::Internal);
    }

    #[test]
    fn test_headers_must_come_first() {
        let mut sm = CallStateMachine::new();
        assert!(sm.on_send_message().is_err());
        sm.on_headers_sent().unwrap();
        assert!(sm.on_headers_sent().is_err());
    }
}
