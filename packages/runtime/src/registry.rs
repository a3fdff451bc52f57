// ABOUTME: Registry of runs actively controlled by this process
// ABOUTME: Presence of an entry is what distinguishes a live run from a zombie

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::broadcast::LogBroadcast;

/// In-memory state of a run owned by its lifecycle task.
pub struct LiveRun {
    pub run_id: String,
    pub broadcast: LogBroadcast,
    task: OnceLock<JoinHandle<()>>,
}

impl LiveRun {
    pub fn new(run_id: impl Into<String>, subscriber_capacity: usize) -> Self {
        Self {
            run_id: run_id.into(),
            broadcast: LogBroadcast::new(subscriber_capacity),
            task: OnceLock::new(),
        }
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        let _ = self.task.set(handle);
    }

    /// Whether the lifecycle task has been spawned and not yet returned.
    pub fn task_running(&self) -> bool {
        self.task
            .get()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, Arc<LiveRun>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run. Returns `false` if the id is already present.
    pub async fn insert(&self, live: Arc<LiveRun>) -> bool {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&live.run_id) {
            return false;
        }
        runs.insert(live.run_id.clone(), live);
        true
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<LiveRun>> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    pub async fn remove(&self, run_id: &str) -> Option<Arc<LiveRun>> {
        self.runs.write().await.remove(run_id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_is_idempotent_per_run_id() {
        let registry = RunRegistry::new();

        assert!(registry.insert(Arc::new(LiveRun::new("run-1", 8))).await);
        assert!(!registry.insert(Arc::new(LiveRun::new("run-1", 8))).await);
        assert!(registry.insert(Arc::new(LiveRun::new("run-2", 8))).await);

        assert_eq!(registry.ids().await, vec!["run-1", "run-2"]);
    }

    #[tokio::test]
    async fn test_remove_makes_run_absent() {
        let registry = RunRegistry::new();
        registry.insert(Arc::new(LiveRun::new("run-1", 8))).await;

        assert!(registry.contains("run-1").await);
        assert!(registry.remove("run-1").await.is_some());
        assert!(!registry.contains("run-1").await);
        assert!(registry.get("run-1").await.is_none());
    }

    #[tokio::test]
    async fn test_task_running_tracks_attached_handle() {
        let live = LiveRun::new("run-1", 8);
        assert!(!live.task_running());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        live.attach_task(tokio::spawn(async move {
            let _ = rx.await;
        }));
        assert!(live.task_running());

        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while live.task_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
