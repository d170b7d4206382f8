use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fanrelay_core::ConnectionId;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Result of a non-blocking send onto a session's outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Queue is at capacity; the frame was dropped.
    Full,
    /// The connection is gone or has been closed by the server.
    Closed,
}

/// Outbound half of one live connection.
///
/// Carries no device identity: which device (if any) a handle speaks for is
/// tracked only by the [`SessionRegistry`](crate::registry::SessionRegistry).
pub struct SessionHandle {
    pub id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
    drops: AtomicU64,
    pub(crate) last_pong_ms: AtomicU64,
    closed: CancellationToken,
}

impl SessionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            tx,
            drops: AtomicU64::new(0),
            last_pong_ms: AtomicU64::new(now_ms()),
            closed: CancellationToken::new(),
        };
        (Arc::new(handle), rx)
    }

    pub fn send(&self, frame: Arc<String>) -> SendOutcome {
        if self.closed.is_cancelled() {
            return SendOutcome::Closed;
        }
        match self.tx.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.drops.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Lifetime count of frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms().saturating_sub(last))
    }

    /// Ask the connection loop to shut down. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_receiver() {
        let (handle, mut rx) = SessionHandle::channel(4);
        assert_eq!(handle.send(Arc::new("hello".into())), SendOutcome::Sent);
        assert_eq!(rx.recv().await.unwrap().as_str(), "hello");
    }

    #[test]
    fn full_queue_counts_drops() {
        let (handle, _rx) = SessionHandle::channel(1);
        assert_eq!(handle.send(Arc::new("a".into())), SendOutcome::Sent);
        assert_eq!(handle.send(Arc::new("b".into())), SendOutcome::Full);
        assert_eq!(handle.send(Arc::new("c".into())), SendOutcome::Full);
        assert_eq!(handle.drop_count(), 2);
    }

    #[test]
    fn dropped_receiver_means_closed() {
        let (handle, rx) = SessionHandle::channel(4);
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(handle.send(Arc::new("x".into())), SendOutcome::Closed);
    }

    #[test]
    fn close_rejects_further_sends() {
        let (handle, _rx) = SessionHandle::channel(4);
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(handle.send(Arc::new("x".into())), SendOutcome::Closed);
    }

    #[test]
    fn pong_resets_idle_time() {
        let (handle, _rx) = SessionHandle::channel(1);
        handle.last_pong_ms.store(0, Ordering::Relaxed);
        assert!(handle.idle_for() > Duration::from_secs(3600));
        handle.record_pong();
        assert!(handle.idle_for() < Duration::from_secs(5));
    }
}
