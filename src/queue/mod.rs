//! Holding queue: admission control over pending tasks.
//!
//! Waiting tasks are ordered by `(priority, creationTime, taskId)`; the
//! queue is advanced on enqueue, on any final state, on a Wi-Fi policy or
//! network change, and when a retry timer fires. A task is admitted when the
//! global, per-host, and per-group caps all have room and its effective
//! Wi-Fi requirement is compatible with the current network. A head blocked
//! only by capacity does not starve the rest: the scan continues downward
//! and promotes the first admissible task, while the head keeps its spot for
//! the next tick.

use std::collections::{BTreeMap, HashMap};

use crate::config::EngineConfig;
use crate::store::ResumeData;
use crate::task::{NetworkType, RequireWiFi, Task};

/// One pending enqueue request: the task plus resume state when this entry
/// continues a paused transfer.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub task: Task,
    pub resume: Option<ResumeData>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: u8,
    creation_time: i64,
    task_id: String,
}

impl QueueKey {
    fn for_task(task: &Task) -> Self {
        Self {
            priority: task.priority,
            creation_time: task.creation_time,
            task_id: task.task_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct RunningSlot {
    host: String,
    group: String,
}

/// Admission inputs that can change at runtime.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    pub config: &'a EngineConfig,
    pub network: NetworkType,
}

/// Effective Wi-Fi requirement for a task under the process-wide policy.
pub fn effective_requires_wifi(policy: RequireWiFi, task: &Task) -> bool {
    match policy {
        RequireWiFi::ForAllTasks => true,
        RequireWiFi::ForNoTasks => false,
        RequireWiFi::AsSetByTask => task.requires_wi_fi,
    }
}

#[derive(Default)]
pub struct HoldingQueue {
    waiting: BTreeMap<QueueKey, QueueItem>,
    running: HashMap<String, RunningSlot>,
}

impl HoldingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending task. Ordering follows the task's priority and original
    /// creation time, so a re-enqueued task keeps its place in line.
    pub fn push(&mut self, item: QueueItem) {
        self.waiting.insert(QueueKey::for_task(&item.task), item);
    }

    /// Remove a waiting task by id (cancellation before start).
    pub fn remove_waiting(&mut self, task_id: &str) -> Option<QueueItem> {
        let key = self
            .waiting
            .keys()
            .find(|k| k.task_id == task_id)
            .cloned()?;
        self.waiting.remove(&key)
    }

    pub fn is_waiting(&self, task_id: &str) -> bool {
        self.waiting.keys().any(|k| k.task_id == task_id)
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    /// A task id is active while it waits or runs; active ids may not be
    /// enqueued again.
    pub fn is_active(&self, task_id: &str) -> bool {
        self.is_waiting(task_id) || self.is_running(task_id)
    }

    pub fn waiting_ids(&self) -> Vec<String> {
        self.waiting.keys().map(|k| k.task_id.clone()).collect()
    }

    /// The waiting task with the given id, if any.
    pub fn waiting_task(&self, task_id: &str) -> Option<&Task> {
        self.waiting
            .iter()
            .find(|(k, _)| k.task_id == task_id)
            .map(|(_, item)| &item.task)
    }

    /// All waiting tasks in queue order.
    pub fn waiting_tasks(&self) -> impl Iterator<Item = &Task> {
        self.waiting.values().map(|item| &item.task)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Release the execution slot for a finished task.
    pub fn finish_running(&mut self, task_id: &str) {
        self.running.remove(task_id);
    }

    /// Move admissible tasks from the waiting set into execution slots and
    /// return them in admission order.
    pub fn advance(&mut self, ctx: AdmissionContext<'_>) -> Vec<QueueItem> {
        let mut admitted = Vec::new();
        let keys: Vec<QueueKey> = self.waiting.keys().cloned().collect();
        for key in keys {
            if self.running.len() >= ctx.config.max_concurrent {
                break;
            }
            let item = &self.waiting[&key];
            if !self.admissible(&item.task, ctx) {
                continue;
            }
            let item = self.waiting.remove(&key).unwrap();
            self.running.insert(
                item.task.task_id.clone(),
                RunningSlot {
                    host: item.task.host(),
                    group: item.task.group.clone(),
                },
            );
            admitted.push(item);
        }
        admitted
    }

    fn admissible(&self, task: &Task, ctx: AdmissionContext<'_>) -> bool {
        let cfg = ctx.config;
        if cfg.max_concurrent_by_host > 0 {
            let host = task.host();
            let by_host = self.running.values().filter(|s| s.host == host).count();
            if by_host >= cfg.max_concurrent_by_host {
                return false;
            }
        }
        if cfg.max_concurrent_by_group > 0 {
            let by_group = self
                .running
                .values()
                .filter(|s| s.group == task.group)
                .count();
            if by_group >= cfg.max_concurrent_by_group {
                return false;
            }
        }
        if effective_requires_wifi(cfg.require_wifi, task) && !ctx.network.is_wifi() {
            return false;
        }
        true
    }
}
