use bon::Builder;
use std::time::Duration;

use crate::frame::StreamId;

/// Which end of the connection this side is.
///
/// The role only decides stream id parity; both roles may open calls and
/// both may serve them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Allocates odd stream ids, starting at 1.
    #[default]
    Client,
    /// Allocates even stream ids, starting at 2.
    Server,
}

impl Role {
    pub fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` belongs to the id space this role allocates from.
    pub fn owns(self, id: StreamId) -> bool {
        id != 0 && id % 2 == self.first_stream_id() % 2
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Configuration for a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Builder)]
pub struct ConnectionConfig {
    #[builder(default)]
    pub role: Role,

    /// Limit on concurrently open streams, applied separately to streams this
    /// side opened and streams the peer opened.
    #[builder(default = 100)]
    pub max_concurrent_streams: usize,

    /// Messages a peer may send on a stream before waiting for credit.
    #[builder(default = 64)]
    pub initial_window: u32,

    /// Largest payload accepted in one frame.
    #[builder(default = 4 * 1024 * 1024)]
    pub max_frame_size: usize,

    /// How long a locally cancelled stream waits for the peer's acknowledgement
    /// before its id and capacity are reclaimed anyway.
    #[builder(default = Duration::from_secs(5))]
    pub cancel_linger: Duration,
}

impl ConnectionConfig {
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// A window of zero would deadlock every stream.
    pub(crate) fn effective_window(&self) -> u32 {
        self.initial_window.max(1)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.initial_window, 64);
        assert_eq!(config.max_frame_size, 4 * 1024 * 1024);
        assert_eq!(config.cancel_linger, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_overrides() {
        let config = ConnectionConfig::builder()
            .role(Role::Server)
            .max_concurrent_streams(2)
            .initial_window(0)
            .build();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.max_concurrent_streams, 2);
        assert_eq!(config.effective_window(), 1);
    }

    #[test]
    fn test_role_parity() {
        assert!(Role::Client.owns(1));
        assert!(Role::Client.owns(7));
        assert!(!Role::Client.owns(2));
        assert!(Role::Server.owns(2));
        assert!(!Role::Server.owns(0));
        assert_eq!(Role::Client.peer(), Role::Server);
    }
}
