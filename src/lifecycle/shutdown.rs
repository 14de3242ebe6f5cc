//! Shutdown coordination.

use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Each long-running task gets its own child token so shutdown phases can
/// stop tasks one group at a time. Triggering the coordinator cancels every
/// child at once.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    root: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled by [`trigger`](Shutdown::trigger) or on its own.
    pub fn subscribe(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Cancel every subscribed token.
    pub fn trigger(&self) {
        self.root.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Resolves once [`trigger`](Shutdown::trigger) has been called.
    pub async fn triggered(&self) {
        self.root.cancelled().await
    }
}
