//! Transfer engine: performs one HTTP transfer per task.
//!
//! `run` is the sole entry point; it dispatches on the task kind and always
//! returns a [`TransferOutcome`] (errors are folded into the outcome, never
//! propagated). The engine holds no references back into the coordinator:
//! it reads cancel/pause flags from the shared registry at suspension points
//! and reports through an event channel.

mod client;
mod download;
mod multipart;
mod parallel;
mod resume;
mod space;
mod upload;

pub use client::build_client;
pub use multipart::MULTIPART_BOUNDARY;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::paths::EnginePaths;
use crate::registry::Registry;
use crate::store::ResumeData;
use crate::task::{Task, TaskKind, TaskStatus};

/// Mid-flight event from a running transfer to the coordinator.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// First sign of transfer activity; drives the `running` status update.
    Started,
    /// The task was rewritten mid-flight (server-suggested filename); the
    /// replacement must be persisted so it survives a restart.
    TaskModified(Task),
    /// A gated progress emission.
    Progress {
        progress: f64,
        expected_file_size: i64,
        network_speed: f64,
        time_remaining_ms: i64,
    },
    /// Sent by the transfer wrapper once `run` returns, on the same channel
    /// as the other events so nothing overtakes the final outcome.
    Finished(TransferOutcome),
}

/// Everything a transfer needs; owned by the transfer, shared pieces are
/// behind `Arc`.
pub struct TransferContext {
    pub task: Task,
    pub config: Arc<EngineConfig>,
    pub paths: Arc<EnginePaths>,
    pub registry: Arc<Registry>,
    pub client: reqwest::Client,
    pub events: mpsc::UnboundedSender<(String, TransferEvent)>,
    pub resume: Option<ResumeData>,
}

impl TransferContext {
    pub(crate) fn send_event(&self, event: TransferEvent) {
        let _ = self.events.send((self.task.task_id.clone(), event));
    }
}

/// Result of one transfer run, normalized for the state machine.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub status: Option<TaskStatus>,
    pub exception: Option<TaskError>,
    pub response_body: Option<String>,
    pub resume_data: Option<ResumeData>,
    pub mime_type: Option<String>,
    pub charset: Option<String>,
    /// Expected total size of the transfer in bytes, -1 when unknown.
    pub expected_file_size: i64,
    /// Set when the task should re-enter the holding queue after a delay
    /// (timeout auto-pause) instead of ending in `paused`.
    pub reenqueue_after: Option<Duration>,
}

impl Default for TransferOutcome {
    fn default() -> Self {
        Self {
            status: None,
            exception: None,
            response_body: None,
            resume_data: None,
            mime_type: None,
            charset: None,
            expected_file_size: -1,
            reenqueue_after: None,
        }
    }
}

impl TransferOutcome {
    pub fn status(&self) -> TaskStatus {
        self.status.unwrap_or(TaskStatus::Failed)
    }

    pub(crate) fn complete() -> Self {
        Self {
            status: Some(TaskStatus::Complete),
            ..Default::default()
        }
    }

    pub(crate) fn canceled() -> Self {
        Self {
            status: Some(TaskStatus::Canceled),
            ..Default::default()
        }
    }

    pub(crate) fn not_found(response_body: Option<String>) -> Self {
        Self {
            status: Some(TaskStatus::NotFound),
            response_body,
            ..Default::default()
        }
    }

    pub(crate) fn failed(exception: TaskError) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            exception: Some(exception),
            ..Default::default()
        }
    }

    pub(crate) fn paused(resume_data: ResumeData) -> Self {
        Self {
            status: Some(TaskStatus::Paused),
            resume_data: Some(resume_data),
            ..Default::default()
        }
    }
}

/// Run one task to completion and classify the result.
pub async fn run(ctx: TransferContext) -> TransferOutcome {
    let kind = ctx.task.task_type;
    let task_id = ctx.task.task_id.clone();
    tracing::debug!(task_id = %task_id, ?kind, "transfer starting");
    let outcome = match kind {
        TaskKind::DownloadTask => download::run_download(&ctx).await,
        TaskKind::DataTask => download::run_data(&ctx).await,
        TaskKind::ParallelDownloadTask => parallel::run_parallel(&ctx).await,
        TaskKind::UploadTask | TaskKind::MultiUploadTask => upload::run_upload(&ctx).await,
    };
    tracing::debug!(task_id = %task_id, status = ?outcome.status(), "transfer finished");
    outcome
}
