//! Per-run cancel handles. The registry is the single process-wide mutable
//! map; an entry doubles as the ownership record for a run's scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Cancel,
    Pause,
}

#[derive(Clone)]
pub struct RunCancelHandle {
    token: CancellationToken,
    cause: Arc<RwLock<Option<StopCause>>>,
}

impl RunCancelHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(RwLock::new(None)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn stop(&self, cause: StopCause) {
        *self.cause.write().await = Some(cause);
        self.token.cancel();
    }

    pub async fn cause(&self) -> Option<StopCause> {
        *self.cause.read().await
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<RwLock<HashMap<String, RunCancelHandle>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh handle for the run, replacing any stale one. The
    /// presence of a handle marks the run as owned by a live worker.
    pub async fn create(&self, run_id: &str) -> RunCancelHandle {
        let handle = RunCancelHandle::new();
        self.inner
            .write()
            .await
            .insert(run_id.to_string(), handle.clone());
        handle
    }

    pub async fn get(&self, run_id: &str) -> Option<RunCancelHandle> {
        self.inner.read().await.get(run_id).cloned()
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.inner.read().await.contains_key(run_id)
    }

    pub async fn remove(&self, run_id: &str) {
        self.inner.write().await.remove(run_id);
    }

    /// Removes the entry only when `handle` is still the registered owner, so
    /// an exiting worker cannot drop a successor's handle.
    pub async fn remove_matching(&self, run_id: &str, handle: &RunCancelHandle) {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get(run_id) {
            if Arc::ptr_eq(&existing.cause, &handle.cause) {
                map.remove(run_id);
            }
        }
    }

    /// Run ids that currently have a live owner.
    pub async fn owned_ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_records_cause_and_cancels_token() {
        let registry = CancellationRegistry::new();
        let handle = registry.create("r1").await;
        assert!(handle.cause().await.is_none());
        handle.stop(StopCause::Pause).await;
        assert!(handle.is_stopped());
        assert_eq!(handle.cause().await, Some(StopCause::Pause));
    }

    #[tokio::test]
    async fn create_replaces_stale_handle() {
        let registry = CancellationRegistry::new();
        let stale = registry.create("r1").await;
        stale.stop(StopCause::Cancel).await;
        let fresh = registry.create("r1").await;
        assert!(!fresh.is_stopped());
        assert!(registry.contains("r1").await);
        registry.remove("r1").await;
        assert!(!registry.contains("r1").await);
    }
}
