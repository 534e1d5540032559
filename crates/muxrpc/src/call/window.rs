//! Per-stream flow control, counted in messages.
//!
//! Each direction of a stream starts with `initial_window` credits. The
//! sender spends one credit per `Data` frame and suspends when it has none.
//! The receiver hands credit back in `WindowUpdate` frames, but only for
//! messages the consumer has actually taken, so a stalled consumer stalls
//! its producer.

use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{AcquireError, Semaphore};

/// Credit this side may spend sending to the peer.
#[derive(Debug)]
pub struct SendWindow {
    credits: Semaphore,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            credits: Semaphore::new(initial as usize),
        }
    }

    /// Wait for one credit and spend it.
    ///
    /// Fails once the window is closed, which happens when the stream ends.
    pub async fn reserve(&self) -> Result<(), AcquireError> {
        self.credits.acquire().await?.forget();
        Ok(())
    }

    pub fn grant(&self, increment: u32) {
        let room = Semaphore::MAX_PERMITS.saturating_sub(self.credits.available_permits());
        self.credits.add_permits((increment as usize).min(room));
    }

    /// Wake every waiting sender with an error.
    pub fn close(&self) {
        self.credits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.credits.is_closed()
    }

    pub fn available(&self) -> usize {
        self.credits.available_permits()
    }
}

/// Credit this side has extended to the peer.
#[derive(Debug)]
pub struct RecvWindow {
    available: AtomicU32,
    consumed: AtomicU32,
    threshold: u32,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: AtomicU32::new(initial),
            consumed: AtomicU32::new(0),
            threshold: (initial / 2).max(1),
        }
    }

    /// Account for an arriving message. `false` means the peer overran its
    /// credit.
    pub fn try_accept(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Account for a message the consumer took.
    ///
    /// Returns the increment to announce once at least half a window has been
    /// consumed since the last announcement. The credit is restored locally
    /// before it is announced.
    pub fn on_consumed(&self) -> Option<u32> {
        let consumed = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
        if consumed < self.threshold {
            return None;
        }
        self.consumed.fetch_sub(consumed, Ordering::AcqRel);
        self.available.fetch_add(consumed, Ordering::AcqRel);
        Some(consumed)
    }

    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_recv_window_rejects_overrun() {
        let window = RecvWindow::new(2);
        assert!(window.try_accept());
        assert!(window.try_accept());
        assert!(!window.try_accept());
    }

    #[test]
    fn test_recv_window_returns_credit_at_half() {
        let window = RecvWindow::new(4);
        for _ in 0..4 {
            assert!(window.try_accept());
        }
        assert_eq!(window.on_consumed(), None);
        assert_eq!(window.on_consumed(), Some(2));
        assert_eq!(window.available(), 2);
        assert_eq!(window.on_consumed(), None);
        assert_eq!(window.on_consumed(), Some(2));
        assert_eq!(window.available(), 4);
    }

    #[test]
    fn test_window_of_one_updates_every_message() {
        let window = RecvWindow::new(1);
        assert!(window.try_accept());
        assert!(!window.try_accept());
        assert_eq!(window.on_consumed(), Some(1));
        assert!(window.try_accept());
    }

    #[tokio::test]
    async fn test_send_window_suspends_until_granted() {
        let window = std::sync::Arc::new(SendWindow::new(1));
        window.reserve().await.unwrap();

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        window.grant(1);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn test_closed_send_window_fails_waiters() {
        let window = std::sync::Arc::new(SendWindow::new(0));
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve().await })
        };
        tokio::task::yield_now().await;
        window.close();
        assert!(waiter.await.unwrap().is_err());
        assert!(window.is_closed());
    }

    #[test]
    fn test_grant_saturates() {
        let window = SendWindow::new(0);
        window.grant(u32::MAX);
        window.grant(u32::MAX);
        assert!(window.available() <= Semaphore::MAX_PERMITS);
    }
}
