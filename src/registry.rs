//! In-memory registry of in-flight task state, shared between the
//! coordinator and running transfers.
//!
//! Everything here is transient; durable state belongs to the store. All
//! maps sit behind one RwLock with bounded critical sections. Transfers read
//! their cancel/pause flags at suspension points; the coordinator owns the
//! writes and purges every entry for an id when the task reaches a final
//! state.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::progress::ProgressInfo;
use crate::task::Task;

/// Window within which a repeated cancel for the same id is a no-op.
pub const CANCEL_GUARD: Duration = Duration::from_millis(1000);

#[derive(Default)]
struct RegistryInner {
    paused_task_ids: HashSet<String>,
    canceled_task_ids: HashMap<String, Instant>,
    stopped_task_ids: HashSet<String>,
    task_ids_requiring_wifi: HashSet<String>,
    task_ids_that_can_resume: HashSet<String>,
    task_ids_programmatically_canceled: HashSet<String>,
    progress_info: HashMap<String, ProgressInfo>,
    remaining_bytes_to_download: HashMap<String, i64>,
    mime_types: HashMap<String, String>,
    char_sets: HashMap<String, String>,
    tasks_with_suggested_filename: HashMap<String, Task>,
    content_length_overrides: HashMap<String, i64>,
    response_body_data: HashMap<String, Vec<Vec<u8>>>,
}

/// Process-wide registry. Cheap to share as `Arc<Registry>`.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- cancellation ------------------------------------------------------

    /// Record a cancel request for `id`. Returns false when a cancel for the
    /// same id landed within [`CANCEL_GUARD`], making this one a no-op.
    pub fn mark_canceled(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let now = Instant::now();
        if let Some(prev) = inner.canceled_task_ids.get(id) {
            if now.duration_since(*prev) < CANCEL_GUARD {
                return false;
            }
        }
        inner.canceled_task_ids.insert(id.to_string(), now);
        true
    }

    pub fn was_canceled(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .canceled_task_ids
            .contains_key(id)
    }

    /// Request that the running transfer for `id` stop at its next
    /// suspension point.
    pub fn request_stop(&self, id: &str) {
        self.inner
            .write()
            .unwrap()
            .stopped_task_ids
            .insert(id.to_string());
    }

    pub fn is_stopped(&self, id: &str) -> bool {
        self.inner.read().unwrap().stopped_task_ids.contains(id)
    }

    /// Mark a cancel that arrived after the transfer started, so a transport
    /// abort is reported as `canceled` rather than `failed`.
    pub fn mark_programmatic_cancel(&self, id: &str) {
        self.inner
            .write()
            .unwrap()
            .task_ids_programmatically_canceled
            .insert(id.to_string());
    }

    pub fn is_programmatic_cancel(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .task_ids_programmatically_canceled
            .contains(id)
    }

    // -- pause -------------------------------------------------------------

    pub fn mark_paused(&self, id: &str) {
        self.inner
            .write()
            .unwrap()
            .paused_task_ids
            .insert(id.to_string());
    }

    pub fn is_paused(&self, id: &str) -> bool {
        self.inner.read().unwrap().paused_task_ids.contains(id)
    }

    // -- wifi / resume flags ----------------------------------------------

    pub fn set_requires_wifi(&self, id: &str, requires: bool) {
        let mut inner = self.inner.write().unwrap();
        if requires {
            inner.task_ids_requiring_wifi.insert(id.to_string());
        } else {
            inner.task_ids_requiring_wifi.remove(id);
        }
    }

    pub fn requires_wifi(&self, id: &str) -> bool {
        self.inner.read().unwrap().task_ids_requiring_wifi.contains(id)
    }

    pub fn set_can_resume(&self, id: &str, can: bool) {
        let mut inner = self.inner.write().unwrap();
        if can {
            inner.task_ids_that_can_resume.insert(id.to_string());
        } else {
            inner.task_ids_that_can_resume.remove(id);
        }
    }

    pub fn can_resume(&self, id: &str) -> bool {
        self.inner.read().unwrap().task_ids_that_can_resume.contains(id)
    }

    // -- per-task transfer state ------------------------------------------

    pub fn progress_info(&self, id: &str) -> Option<ProgressInfo> {
        self.inner.read().unwrap().progress_info.get(id).cloned()
    }

    pub fn set_progress_info(&self, id: &str, info: ProgressInfo) {
        self.inner
            .write()
            .unwrap()
            .progress_info
            .insert(id.to_string(), info);
    }

    pub fn set_remaining_bytes(&self, id: &str, bytes: i64) {
        self.inner
            .write()
            .unwrap()
            .remaining_bytes_to_download
            .insert(id.to_string(), bytes);
    }

    /// Sum of expected bytes still to be written across all active
    /// downloads; input to the free-space check.
    pub fn total_remaining_bytes(&self) -> i64 {
        self.inner
            .read()
            .unwrap()
            .remaining_bytes_to_download
            .values()
            .sum()
    }

    pub fn set_mime_type(&self, id: &str, mime: String) {
        self.inner
            .write()
            .unwrap()
            .mime_types
            .insert(id.to_string(), mime);
    }

    pub fn mime_type(&self, id: &str) -> Option<String> {
        self.inner.read().unwrap().mime_types.get(id).cloned()
    }

    pub fn set_char_set(&self, id: &str, charset: String) {
        self.inner
            .write()
            .unwrap()
            .char_sets
            .insert(id.to_string(), charset);
    }

    pub fn char_set(&self, id: &str) -> Option<String> {
        self.inner.read().unwrap().char_sets.get(id).cloned()
    }

    pub fn set_task_with_suggested_filename(&self, id: &str, task: Task) {
        self.inner
            .write()
            .unwrap()
            .tasks_with_suggested_filename
            .insert(id.to_string(), task);
    }

    pub fn task_with_suggested_filename(&self, id: &str) -> Option<Task> {
        self.inner
            .read()
            .unwrap()
            .tasks_with_suggested_filename
            .get(id)
            .cloned()
    }

    pub fn set_content_length_override(&self, id: &str, length: i64) {
        self.inner
            .write()
            .unwrap()
            .content_length_overrides
            .insert(id.to_string(), length);
    }

    pub fn content_length_override(&self, id: &str) -> Option<i64> {
        self.inner
            .read()
            .unwrap()
            .content_length_overrides
            .get(id)
            .copied()
    }

    pub fn push_response_body(&self, id: &str, chunk: Vec<u8>) {
        self.inner
            .write()
            .unwrap()
            .response_body_data
            .entry(id.to_string())
            .or_default()
            .push(chunk);
    }

    pub fn take_response_body(&self, id: &str) -> Option<Vec<u8>> {
        self.inner
            .write()
            .unwrap()
            .response_body_data
            .remove(id)
            .map(|chunks| chunks.concat())
    }

    // -- lifecycle ---------------------------------------------------------

    /// Remove every entry for `id` in a single critical section. Called when
    /// a task reaches a final state. The canceled-ids timestamp survives so
    /// the idempotence guard keeps working after the purge.
    pub fn purge(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.paused_task_ids.remove(id);
        inner.stopped_task_ids.remove(id);
        inner.task_ids_requiring_wifi.remove(id);
        inner.task_ids_that_can_resume.remove(id);
        inner.task_ids_programmatically_canceled.remove(id);
        inner.progress_info.remove(id);
        inner.remaining_bytes_to_download.remove(id);
        inner.mime_types.remove(id);
        inner.char_sets.remove(id);
        inner.tasks_with_suggested_filename.remove(id);
        inner.content_length_overrides.remove(id);
        inner.response_body_data.remove(id);
        // Drop cancel timestamps older than the guard window while we hold
        // the lock anyway.
        let now = Instant::now();
        inner
            .canceled_task_ids
            .retain(|_, t| now.duration_since(*t) < CANCEL_GUARD);
    }
}
