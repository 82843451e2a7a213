//! Coordinated teardown of a comm instance's background tasks.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancellation root for everything a comm instance spawns, plus the
/// handles of its long-running tasks (accept loop, idle sweeper).
pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Handles to long-running tasks
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Register a task handle for shutdown coordination
    pub fn register_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().push(handle);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Cancels every task and waits up to `timeout` for the registered ones to exit.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.task_handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }

        let shutdown_tasks = std::pin::pin!(async {
            for handle in handles {
                let _ = handle.await;
            }
        });

        match tokio::time::timeout(timeout, shutdown_tasks).await {
            Ok(_) => {
                tracing::debug!("✓ All tasks shut down gracefully");
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShutdownManager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_and_joins_tasks() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });
        manager.register_task(handle);

        manager.shutdown(Duration::from_secs(1)).await;
        assert!(manager.is_shutting_down());
        assert!(manager.task_handles.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = ShutdownManager::default();
        manager.shutdown(Duration::from_millis(10)).await;
        manager.shutdown(Duration::from_millis(10)).await;
        assert!(manager.token().is_cancelled());
    }
}
