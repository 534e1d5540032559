use std::time::Duration;
use tokio::time::Instant;

use crate::metadata::Metadata;

/// Per-call settings.
///
/// A timeout is converted to a deadline when the call starts. If both are
/// set, the earlier one wins.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub metadata: Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub(crate) fn resolve_deadline(&self, now: Instant) -> Option<Instant> {
        let from_timeout = self.timeout.and_then(|timeout| now.checked_add(timeout));
        match (from_timeout, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
