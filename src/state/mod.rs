//! State machine: normalizes transfer outcomes into ordered status and
//! progress updates, persists the store on every transition, schedules
//! retries, and performs final-state cleanup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::bridge::{ProgressUpdate, StatusUpdate, Update};
use crate::engine::TransferOutcome;
use crate::registry::Registry;
use crate::store::{TaskRecord, TaskStore};
use crate::task::{Task, TaskStatus};

/// Exponential retry backoff: `2^attempt` seconds, where attempt counts the
/// retries already consumed.
pub fn retry_delay(task: &Task) -> Duration {
    let attempt = task.retries.saturating_sub(task.retries_remaining);
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Which groups have task-record tracking enabled.
#[derive(Debug, Default)]
pub struct Tracking {
    all: bool,
    groups: HashSet<String>,
}

impl Tracking {
    pub fn set_all(&mut self, on: bool) {
        self.all = on;
    }

    pub fn set_group(&mut self, group: &str, on: bool) {
        if on {
            self.groups.insert(group.to_string());
        } else {
            self.groups.remove(group);
        }
    }

    pub fn covers(&self, task: &Task) -> bool {
        self.all || self.groups.contains(&task.group)
    }
}

/// Owns transition handling for the coordinator. Updates for a single task
/// are totally ordered because everything funnels through the one updates
/// channel consumed by the dispatcher.
pub struct StateMachine {
    store: TaskStore,
    registry: Arc<Registry>,
    updates: mpsc::UnboundedSender<Update>,
    pub tracking: Tracking,
}

impl StateMachine {
    pub fn new(
        store: TaskStore,
        registry: Arc<Registry>,
        updates: mpsc::UnboundedSender<Update>,
    ) -> Self {
        Self {
            store,
            registry,
            updates,
            tracking: Tracking::default(),
        }
    }

    fn emit_status(&self, task: &Task, status: TaskStatus, extras: StatusExtras) {
        if task.updates.wants_status() {
            let _ = self.updates.send(Update::Status(StatusUpdate {
                task: task.clone(),
                status,
                exception: extras.exception,
                response_body: extras.response_body,
                mime_type: extras.mime_type,
                char_set: extras.char_set,
            }));
        }
        // Non-success states mirror as a sentinel progress value.
        if task.updates.wants_progress() {
            if let Some(sentinel) = status.progress_sentinel() {
                self.emit_progress(task, sentinel, extras.expected_file_size, -1.0, -1000);
            }
        }
    }

    pub fn emit_progress(
        &self,
        task: &Task,
        progress: f64,
        expected_file_size: i64,
        network_speed: f64,
        time_remaining_ms: i64,
    ) {
        if !task.updates.wants_progress() {
            return;
        }
        let _ = self.updates.send(Update::Progress(ProgressUpdate {
            task: task.clone(),
            progress,
            expected_file_size,
            network_speed,
            time_remaining_ms,
        }));
    }

    async fn put_record(
        &self,
        task: &Task,
        status: TaskStatus,
        progress: f64,
        expected_file_size: i64,
    ) {
        let record = TaskRecord::new(task.clone(), status, progress, expected_file_size);
        if let Err(e) = self.store.store_task_record(&record).await {
            tracing::warn!(task_id = %task.task_id, "cannot store task record: {e}");
        }
    }

    /// Task admitted into the holding queue.
    pub async fn task_enqueued(&self, task: &Task) {
        self.put_record(task, TaskStatus::Enqueued, 0.0, -1).await;
        self.emit_status(task, TaskStatus::Enqueued, StatusExtras::default());
    }

    /// First activity observed on a running transfer.
    pub async fn task_running(&self, task: &Task) {
        self.put_record(task, TaskStatus::Running, 0.0, -1).await;
        self.emit_status(task, TaskStatus::Running, StatusExtras::default());
    }

    /// Forward a gated progress emission and keep the record's progress
    /// column current.
    pub async fn task_progress(
        &self,
        task: &Task,
        progress: f64,
        expected_file_size: i64,
        network_speed: f64,
        time_remaining_ms: i64,
    ) {
        self.emit_progress(
            task,
            progress,
            expected_file_size,
            network_speed,
            time_remaining_ms,
        );
        self.put_record(task, TaskStatus::Running, progress, expected_file_size)
            .await;
    }

    /// Task failed with retries left: emit `waitingToRetry`; the caller
    /// schedules exactly one timer.
    pub async fn task_waiting_to_retry(&self, task: &Task) {
        self.put_record(task, TaskStatus::WaitingToRetry, -4.0, -1)
            .await;
        self.emit_status(task, TaskStatus::WaitingToRetry, StatusExtras::default());
        self.registry.purge(&task.task_id);
    }

    /// Terminal processing for a finished transfer: persist, emit ordered
    /// updates, and purge every registry entry for the id.
    pub async fn task_finished(&self, task: &Task, outcome: &TransferOutcome) -> Result<()> {
        let status = outcome.status();
        let id = task.task_id.as_str();

        match status {
            TaskStatus::Paused => {
                if let Some(resume) = &outcome.resume_data {
                    self.store.store_resume_data(resume).await?;
                    self.store.store_paused_task(task).await?;
                    let _ = self.updates.send(Update::Resume {
                        task: task.clone(),
                        data: resume.clone(),
                    });
                }
            }
            TaskStatus::Failed => {
                // A failed range-capable download may still hand out resume
                // data so the caller can retry from the byte offset.
                if let Some(resume) = &outcome.resume_data {
                    self.store.store_resume_data(resume).await?;
                    let _ = self.updates.send(Update::Resume {
                        task: task.clone(),
                        data: resume.clone(),
                    });
                } else {
                    self.store.remove_resume_data(id).await?;
                }
                self.store.remove_paused_task(id).await?;
            }
            TaskStatus::Complete | TaskStatus::NotFound | TaskStatus::Canceled => {
                self.store.remove_resume_data(id).await?;
                self.store.remove_paused_task(id).await?;
                self.store.remove_modified_task(id).await?;
            }
            _ => {}
        }

        let progress = match status {
            TaskStatus::Complete => 1.0,
            _ => status.progress_sentinel().unwrap_or(0.0),
        };
        if self.tracking.covers(task) {
            self.put_record(task, status, progress, outcome.expected_file_size)
                .await;
        } else {
            self.store.remove_task_record(Some(id)).await?;
        }

        if status == TaskStatus::Complete && task.updates.wants_progress() {
            self.emit_progress(task, 1.0, outcome.expected_file_size, -1.0, -1000);
        }
        self.emit_status(
            task,
            status,
            StatusExtras {
                exception: outcome.exception.clone(),
                response_body: outcome.response_body.clone(),
                mime_type: outcome.mime_type.clone(),
                char_set: outcome.charset.clone(),
                expected_file_size: outcome.expected_file_size,
            },
        );

        self.registry.purge(id);
        Ok(())
    }

    /// Synthetic cancel for a task that never started (removed from the
    /// holding queue or from the retry wait).
    pub async fn task_canceled_before_start(&self, task: &Task) -> Result<()> {
        let outcome = TransferOutcome {
            status: Some(TaskStatus::Canceled),
            ..Default::default()
        };
        self.task_finished(task, &outcome).await
    }
}

#[derive(Default)]
struct StatusExtras {
    exception: Option<crate::error::TaskError>,
    response_body: Option<String>,
    mime_type: Option<String>,
    char_set: Option<String>,
    expected_file_size: i64,
}
