//! Per-call state shared by the client and server sides.

mod context;
mod state;
mod window;

pub use context::CallContext;
pub use state::{CallState, CallStateMachine};
pub use window::{RecvWindow, SendWindow};
