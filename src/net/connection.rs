//! Connection identity and in-flight tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count connections a protocol server is still serving
//! - Let shutdown wait until every tracked connection has closed

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks the connections a server is currently serving.
///
/// The live count is published on a watch channel so [`wait_idle`]
/// wakes exactly when the last connection goes away.
///
/// [`wait_idle`]: ConnectionTracker::wait_idle
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    name: Arc<str>,
    count: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Create a tracker labelled with the owning server's name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            name: name.into(),
            count: Arc::new(tx),
        }
    }

    /// Record a new connection. The returned guard decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.count.send_modify(|n| *n += 1);
        metrics::gauge!("active_connections", "server" => self.name.to_string()).increment(1.0);
        ConnectionGuard {
            tracker: self.clone(),
            id,
        }
    }

    /// Current number of tracked connections.
    pub fn active_count(&self) -> u64 {
        *self.count.borrow()
    }

    /// Wait until no connection is tracked.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Wait until idle or until `limit` elapses. Returns `false` on timeout.
    pub async fn wait_idle_for(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_idle()).await.is_ok()
    }
}

/// Guard that tracks one connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.count.send_modify(|n| *n = n.saturating_sub(1));
        metrics::gauge!("active_connections", "server" => self.tracker.name.to_string())
            .decrement(1.0);
        tracing::trace!(connection_id = %self.id, server = %self.tracker.name, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new("test");
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_wakes_when_last_guard_drops() {
        let tracker = ConnectionTracker::new("test");
        let guard = tracker.track(ConnectionId::new());

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move { waiter.wait_idle_for(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_idle_times_out_with_open_connection() {
        let tracker = ConnectionTracker::new("test");
        let _guard = tracker.track(ConnectionId::new());
        assert!(!tracker.wait_idle_for(Duration::from_millis(20)).await);
    }
}
