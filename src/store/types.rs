//! Types stored by the task store.

use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskStatus};

/// Durable record of a task's last known state.
///
/// `progress` carries the sentinel values for non-success states
/// (-1 failed, -2 canceled, -3 notFound, -4 waitingToRetry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub progress: f64,
    pub expected_file_size: i64,
}

impl TaskRecord {
    pub fn new(task: Task, status: TaskStatus, progress: f64, expected_file_size: i64) -> Self {
        Self {
            task,
            status,
            progress,
            expected_file_size,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }
}

/// The minimal state required to restart a paused or failed transfer at a
/// byte offset. For downloads `data` is the path of the temp file holding
/// the partial body; for uploads it is the serialized byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeData {
    pub task_id: String,
    pub data: String,
    pub required_start_byte: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
}

/// Filter for task record queries; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub group: Option<String>,
    pub status: Option<TaskStatus>,
    /// Only records with `creation_time >= since` (ms since epoch).
    pub created_since: Option<i64>,
}
