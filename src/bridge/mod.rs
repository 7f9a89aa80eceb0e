//! Callback bridge: delivers updates to the host, spilling to the store
//! when the host is unreachable and replaying on reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TaskError;
use crate::store::{ResumeData, TaskStore};
use crate::task::{Task, TaskStatus};

/// Spill-table kind tags, one per update type.
const KIND_STATUS: &str = "statusUpdate";
const KIND_PROGRESS: &str = "progressUpdate";
const KIND_RESUME: &str = "resumeData";

/// A status change for a task, with the failure/final extras when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task: Task,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<TaskError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_set: Option<String>,
}

/// A progress emission: fraction (or sentinel), expected size, smoothed
/// speed in MB/s (-1 unknown), time remaining in ms (-1000 unknown).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub task: Task,
    pub progress: f64,
    pub expected_file_size: i64,
    pub network_speed: f64,
    pub time_remaining_ms: i64,
}

/// One update posted to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Update {
    Status(StatusUpdate),
    Progress(ProgressUpdate),
    Resume { task: Task, data: ResumeData },
}

impl Update {
    pub fn task_id(&self) -> &str {
        match self {
            Update::Status(u) => &u.task.task_id,
            Update::Progress(u) => &u.task.task_id,
            Update::Resume { task, .. } => &task.task_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Update::Status(_) => KIND_STATUS,
            Update::Progress(_) => KIND_PROGRESS,
            Update::Resume { .. } => KIND_RESUME,
        }
    }
}

/// Host-side delivery channel. `post` returns false when the host cannot
/// receive right now; the engine then stores the update for later replay.
pub trait CallbackBridge: Send + Sync {
    fn post(&self, update: &Update) -> bool;
}

/// In-memory bridge collecting updates; the default when no host bridge is
/// installed, and the workhorse of the integration tests. Delivery can be
/// switched off to exercise the spill path.
pub struct CollectorBridge {
    accepting: AtomicBool,
    updates: Mutex<Vec<(Option<Instant>, Update)>>,
}

impl CollectorBridge {
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    pub fn updates(&self) -> Vec<Update> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(_, u)| u.clone())
            .collect()
    }

    /// Updates with their arrival times, for timing assertions.
    pub fn timed_updates(&self) -> Vec<(Instant, Update)> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(t, u)| (t.unwrap_or_else(Instant::now), u.clone()))
            .collect()
    }

    /// Status sequence observed for one task id.
    pub fn statuses_for(&self, task_id: &str) -> Vec<TaskStatus> {
        self.updates()
            .into_iter()
            .filter_map(|u| match u {
                Update::Status(s) if s.task.task_id == task_id => Some(s.status),
                _ => None,
            })
            .collect()
    }
}

impl Default for CollectorBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackBridge for CollectorBridge {
    fn post(&self, update: &Update) -> bool {
        if !self.accepting.load(Ordering::Relaxed) {
            return false;
        }
        self.updates
            .lock()
            .unwrap()
            .push((Some(Instant::now()), update.clone()));
        true
    }
}

/// Dispatcher loop: a single consumer per engine, so updates for one task
/// keep their emission order. Undeliverable updates spill to the store.
pub(crate) async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Update>,
    bridge: Arc<dyn CallbackBridge>,
    store: TaskStore,
) {
    while let Some(update) = rx.recv().await {
        if bridge.post(&update) {
            continue;
        }
        let payload = match serde_json::to_string(&update) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("cannot serialize spilled update: {e}");
                continue;
            }
        };
        if let Err(e) = store
            .store_spilled_update(update.kind(), update.task_id(), &payload)
            .await
        {
            tracing::warn!("cannot spill update for {}: {e}", update.task_id());
        }
    }
}

/// Replay spilled updates in task-id order, removing each delivered row.
/// Triggered when the host reconnects after running in the background.
pub async fn resume_from_background(
    bridge: &Arc<dyn CallbackBridge>,
    store: &TaskStore,
) -> anyhow::Result<usize> {
    let spilled = store.retrieve_spilled_updates().await?;
    let mut delivered = 0;
    for row in spilled {
        let update: Update = match serde_json::from_str(&row.payload) {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!("dropping malformed spilled update for {}: {e}", row.task_id);
                store.remove_spilled_update(&row.kind, &row.task_id).await?;
                continue;
            }
        };
        if bridge.post(&update) {
            store.remove_spilled_update(&row.kind, &row.task_id).await?;
            delivered += 1;
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_update(id: &str) -> Update {
        Update::Status(StatusUpdate {
            task: Task::download(id, format!("https://example.com/{id}"), id),
            status: TaskStatus::Complete,
            exception: None,
            response_body: None,
            mime_type: None,
            char_set: None,
        })
    }

    #[test]
    fn update_serde_roundtrip() {
        let u = status_update("t1");
        let json = serde_json::to_string(&u).unwrap();
        let back: Update = serde_json::from_str(&json).unwrap();
        assert_eq!(back, u);
    }

    #[tokio::test]
    async fn undelivered_updates_spill_and_replay() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let bridge = Arc::new(CollectorBridge::new());
        bridge.set_accepting(false);

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(
            rx,
            bridge.clone() as Arc<dyn CallbackBridge>,
            store.clone(),
        ));
        tx.send(status_update("b")).unwrap();
        tx.send(status_update("a")).unwrap();
        drop(tx);
        dispatcher.await.unwrap();

        assert!(bridge.updates().is_empty());
        assert_eq!(store.retrieve_spilled_updates().await.unwrap().len(), 2);

        bridge.set_accepting(true);
        let dyn_bridge: Arc<dyn CallbackBridge> = bridge.clone();
        let delivered = resume_from_background(&dyn_bridge, &store).await.unwrap();
        assert_eq!(delivered, 2);
        // Replayed in task-id order.
        let ids: Vec<_> = bridge
            .updates()
            .iter()
            .map(|u| u.task_id().to_string())
            .collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(store.retrieve_spilled_updates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn later_update_of_same_kind_replaces_spilled_one() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let bridge = Arc::new(CollectorBridge::new());
        bridge.set_accepting(false);

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(
            rx,
            bridge.clone() as Arc<dyn CallbackBridge>,
            store.clone(),
        ));
        let mut first = status_update("t");
        if let Update::Status(s) = &mut first {
            s.status = TaskStatus::Running;
        }
        tx.send(first).unwrap();
        tx.send(status_update("t")).unwrap();
        drop(tx);
        dispatcher.await.unwrap();

        let rows = store.retrieve_spilled_updates().await.unwrap();
        assert_eq!(rows.len(), 1);
        let update: Update = serde_json::from_str(&rows[0].payload).unwrap();
        match update {
            Update::Status(s) => assert_eq!(s.status, TaskStatus::Complete),
            _ => panic!("expected status update"),
        }
    }
}
