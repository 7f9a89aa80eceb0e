//! Transfer manager: the coordinator task and the engine's public API.
//!
//! A single coordinator owns the holding queue, the running-task table, and
//! the state machine; transfers run on the shared runtime and talk back over
//! the command channel. This keeps every registry/queue mutation on one
//! task, so per-task update ordering falls out of channel FIFO order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::{self, CallbackBridge, Update};
use crate::config::EngineConfig;
use crate::engine::{self, TransferContext, TransferEvent, TransferOutcome};
use crate::paths::EnginePaths;
use crate::queue::{effective_requires_wifi, AdmissionContext, HoldingQueue, QueueItem};
use crate::registry::Registry;
use crate::state::{retry_delay, StateMachine};
use crate::store::{ResumeData, TaskStore, DEFAULT_PURGE_AGE};
use crate::task::{NetworkType, RequireWiFi, Task, TaskKind, TaskStatus};

enum Command {
    Enqueue {
        task: Task,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        ids: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    Pause {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    SetRequireWiFi {
        policy: RequireWiFi,
        reschedule_running: bool,
        reply: oneshot::Sender<()>,
    },
    NetworkChanged(NetworkType),
    SetTrackAll(bool),
    SetTrackGroup {
        group: String,
        on: bool,
    },
    AllTaskIds {
        group: Option<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    TaskForId {
        id: String,
        reply: oneshot::Sender<Option<Task>>,
    },
    Reset {
        group: String,
        reply: oneshot::Sender<usize>,
    },
    TimerFired {
        id: String,
    },
    Event {
        id: String,
        event: TransferEvent,
    },
    Done {
        id: String,
        outcome: TransferOutcome,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct RunningTask {
    task: Task,
    join: JoinHandle<()>,
    started: bool,
}

/// A task waiting on a timer: retry backoff, or the delayed re-enqueue after
/// a timeout auto-pause.
struct PendingEnqueue {
    task: Task,
    resume: Option<ResumeData>,
    /// True for retry timers: consume one retry when the timer fires.
    consume_retry: bool,
    timer: JoinHandle<()>,
}

/// How a transfer interrupted by a Wi-Fi policy flip re-enters the queue.
enum RequeueMode {
    /// No progress was made: cancel quietly and put the task back.
    Silent,
    /// Progress exists: full pause processing, then back into the queue
    /// with resume data.
    AfterPause,
}

/// Public handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct TransferManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    store: TaskStore,
    bridge: Arc<dyn CallbackBridge>,
}

impl TransferManager {
    /// Start the engine: build the HTTP client, purge aged store rows, and
    /// spawn the coordinator and update dispatcher.
    pub async fn start(
        config: EngineConfig,
        store: TaskStore,
        paths: EnginePaths,
        bridge: Arc<dyn CallbackBridge>,
    ) -> Result<Self> {
        let client = engine::build_client(&config).context("engine startup failed")?;
        store.purge_old(DEFAULT_PURGE_AGE).await?;

        let (update_tx, update_rx) = mpsc::unbounded_channel::<Update>();
        tokio::spawn(bridge::run_dispatcher(
            update_rx,
            Arc::clone(&bridge),
            store.clone(),
        ));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let registry = Arc::new(Registry::new());

        // One relay forwards engine events onto the command channel so the
        // coordinator stays the single consumer of everything.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(String, TransferEvent)>();
        let relay_cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some((id, event)) = event_rx.recv().await {
                let command = match event {
                    TransferEvent::Finished(outcome) => Command::Done { id, outcome },
                    event => Command::Event { id, event },
                };
                if relay_cmd_tx.send(command).is_err() {
                    break;
                }
            }
        });

        let coordinator = Coordinator {
            config: Arc::new(config),
            paths: Arc::new(paths),
            store: store.clone(),
            registry: Arc::clone(&registry),
            client,
            queue: HoldingQueue::new(),
            state: StateMachine::new(store.clone(), registry, update_tx.clone()),
            network: NetworkType::WiFi,
            running: HashMap::new(),
            pending: HashMap::new(),
            requeue_on_finish: HashMap::new(),
            cmd_tx: cmd_tx.clone(),
            events_tx: event_tx,
        };
        tokio::spawn(coordinator.run(cmd_rx));

        Ok(Self {
            cmd_tx,
            store,
            bridge,
        })
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command, fallback: T) -> T {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(make(tx)).is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }

    /// Submit a task. Returns false when the id is already active or the
    /// engine is shut down.
    pub async fn enqueue(&self, task: Task) -> bool {
        self.ask(|reply| Command::Enqueue { task, reply }, false).await
    }

    /// Cancel the given ids. Repeated cancels within one second are no-ops.
    pub async fn cancel_tasks_with_ids(&self, ids: &[String]) -> bool {
        self.ask(
            |reply| Command::Cancel {
                ids: ids.to_vec(),
                reply,
            },
            false,
        )
        .await
    }

    /// Pause a running download that allows pause. Returns false otherwise.
    pub async fn pause(&self, task_id: &str) -> bool {
        self.ask(
            |reply| Command::Pause {
                id: task_id.to_string(),
                reply,
            },
            false,
        )
        .await
    }

    /// Resume a previously paused task from its stored resume data.
    pub async fn resume(&self, task_id: &str) -> bool {
        self.ask(
            |reply| Command::Resume {
                id: task_id.to_string(),
                reply,
            },
            false,
        )
        .await
    }

    /// Hot-apply a new Wi-Fi requirement. With `reschedule_running`, running
    /// tasks that become inadmissible are paused (or quietly restarted when
    /// they made no progress) and put back in the queue.
    pub async fn set_require_wifi(&self, policy: RequireWiFi, reschedule_running: bool) {
        self.ask(
            |reply| Command::SetRequireWiFi {
                policy,
                reschedule_running,
                reply,
            },
            (),
        )
        .await
    }

    /// Report a change in the active network interface.
    pub fn network_changed(&self, network: NetworkType) {
        let _ = self.cmd_tx.send(Command::NetworkChanged(network));
    }

    pub fn set_track_tasks(&self, on: bool) {
        let _ = self.cmd_tx.send(Command::SetTrackAll(on));
    }

    pub fn set_track_group(&self, group: &str, on: bool) {
        let _ = self.cmd_tx.send(Command::SetTrackGroup {
            group: group.to_string(),
            on,
        });
    }

    /// Ids of all active tasks (waiting, running, or waiting to retry),
    /// optionally restricted to a group.
    pub async fn all_task_ids(&self, group: Option<&str>) -> Vec<String> {
        self.ask(
            |reply| Command::AllTaskIds {
                group: group.map(str::to_string),
                reply,
            },
            Vec::new(),
        )
        .await
    }

    pub async fn task_for_id(&self, task_id: &str) -> Option<Task> {
        self.ask(
            |reply| Command::TaskForId {
                id: task_id.to_string(),
                reply,
            },
            None,
        )
        .await
    }

    /// Cancel every active task in a group; returns how many were affected.
    pub async fn reset(&self, group: &str) -> usize {
        self.ask(
            |reply| Command::Reset {
                group: group.to_string(),
                reply,
            },
            0,
        )
        .await
    }

    /// Replay updates that could not be delivered while the host was away.
    pub async fn resume_from_background(&self) -> Result<usize> {
        bridge::resume_from_background(&self.bridge, &self.store).await
    }

    /// Direct access to the persistent store for record queries.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Stop the coordinator, aborting running transfers and timers.
    pub async fn shutdown(&self) {
        self.ask(|reply| Command::Shutdown { reply }, ()).await
    }
}

struct Coordinator {
    config: Arc<EngineConfig>,
    paths: Arc<EnginePaths>,
    store: TaskStore,
    registry: Arc<Registry>,
    client: reqwest::Client,
    queue: HoldingQueue,
    state: StateMachine,
    network: NetworkType,
    running: HashMap<String, RunningTask>,
    pending: HashMap<String, PendingEnqueue>,
    requeue_on_finish: HashMap<String, RequeueMode>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_tx: mpsc::UnboundedSender<(String, TransferEvent)>,
}

impl Coordinator {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Enqueue { task, reply } => {
                    let _ = reply.send(self.enqueue(task, None, true).await);
                }
                Command::Cancel { ids, reply } => {
                    self.cancel(&ids).await;
                    let _ = reply.send(true);
                    self.advance().await;
                }
                Command::Pause { id, reply } => {
                    let _ = reply.send(self.pause(&id));
                }
                Command::Resume { id, reply } => {
                    let _ = reply.send(self.resume(&id).await);
                }
                Command::SetRequireWiFi {
                    policy,
                    reschedule_running,
                    reply,
                } => {
                    self.set_require_wifi(policy, reschedule_running);
                    let _ = reply.send(());
                    self.advance().await;
                }
                Command::NetworkChanged(network) => {
                    if self.network != network {
                        tracing::info!(?network, "network changed");
                        self.network = network;
                        self.advance().await;
                    }
                }
                Command::SetTrackAll(on) => self.state.tracking.set_all(on),
                Command::SetTrackGroup { group, on } => self.state.tracking.set_group(&group, on),
                Command::AllTaskIds { group, reply } => {
                    let _ = reply.send(self.all_task_ids(group.as_deref()));
                }
                Command::TaskForId { id, reply } => {
                    let _ = reply.send(self.task_for_id(&id));
                }
                Command::Reset { group, reply } => {
                    let ids = self.all_task_ids(Some(&group));
                    self.cancel(&ids).await;
                    let _ = reply.send(ids.len());
                    self.advance().await;
                }
                Command::TimerFired { id } => {
                    self.timer_fired(&id).await;
                }
                Command::Event { id, event } => {
                    self.transfer_event(&id, event).await;
                }
                Command::Done { id, outcome } => {
                    self.transfer_done(&id, outcome).await;
                }
                Command::Shutdown { reply } => {
                    for (_, running) in self.running.drain() {
                        running.join.abort();
                    }
                    for (_, pending) in self.pending.drain() {
                        pending.timer.abort();
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    /// Admit a task. `fresh` enqueues reset the retry budget and reject
    /// duplicate active ids; internal re-enqueues bypass both.
    async fn enqueue(&mut self, mut task: Task, resume: Option<ResumeData>, fresh: bool) -> bool {
        let id = task.task_id.clone();
        if fresh {
            if self.is_active(&id) {
                tracing::warn!(task_id = %id, "rejected enqueue: id already active");
                return false;
            }
            task.retries = task.retries.min(10);
            task.retries_remaining = task.retries;
        }
        self.state.task_enqueued(&task).await;
        self.queue.push(QueueItem { task, resume });
        self.advance().await;
        true
    }

    fn is_active(&self, id: &str) -> bool {
        self.queue.is_active(id) || self.running.contains_key(id) || self.pending.contains_key(id)
    }

    fn all_task_ids(&self, group: Option<&str>) -> Vec<String> {
        let mut ids = Vec::new();
        let matches = |task: &Task| group.map(|g| task.group == g).unwrap_or(true);
        for running in self.running.values() {
            if matches(&running.task) {
                ids.push(running.task.task_id.clone());
            }
        }
        for pending in self.pending.values() {
            if matches(&pending.task) {
                ids.push(pending.task.task_id.clone());
            }
        }
        for task in self.queue.waiting_tasks() {
            if matches(task) {
                ids.push(task.task_id.clone());
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    fn task_for_id(&self, id: &str) -> Option<Task> {
        if let Some(running) = self.running.get(id) {
            return Some(running.task.clone());
        }
        if let Some(pending) = self.pending.get(id) {
            return Some(pending.task.clone());
        }
        self.queue.waiting_task(id).cloned()
    }

    /// Move admissible tasks into execution slots and spawn their transfers.
    async fn advance(&mut self) {
        let ctx = AdmissionContext {
            config: &self.config,
            network: self.network,
        };
        let admitted = self.queue.advance(ctx);
        for item in admitted {
            self.spawn_transfer(item);
        }
    }

    fn spawn_transfer(&mut self, item: QueueItem) {
        let task = item.task.clone();
        let id = task.task_id.clone();
        self.registry.set_requires_wifi(
            &id,
            effective_requires_wifi(self.config.require_wifi, &task),
        );
        let ctx = TransferContext {
            task: task.clone(),
            config: Arc::clone(&self.config),
            paths: Arc::clone(&self.paths),
            registry: Arc::clone(&self.registry),
            client: self.client.clone(),
            events: self.events_tx.clone(),
            resume: item.resume,
        };
        let events_tx = self.events_tx.clone();
        let done_id = id.clone();
        let join = tokio::spawn(async move {
            let outcome = engine::run(ctx).await;
            let _ = events_tx.send((done_id, TransferEvent::Finished(outcome)));
        });
        self.running.insert(
            id,
            RunningTask {
                task,
                join,
                started: false,
            },
        );
    }

    async fn transfer_event(&mut self, id: &str, event: TransferEvent) {
        let Some(running) = self.running.get_mut(id) else {
            return;
        };
        match event {
            TransferEvent::Started => {
                if !running.started {
                    running.started = true;
                    let task = running.task.clone();
                    self.state.task_running(&task).await;
                }
            }
            TransferEvent::TaskModified(new_task) => {
                if let Err(e) = self.store.store_modified_task(&new_task).await {
                    tracing::warn!(task_id = %id, "cannot store modified task: {e}");
                }
                running.task = new_task;
            }
            TransferEvent::Progress {
                progress,
                expected_file_size,
                network_speed,
                time_remaining_ms,
            } => {
                let task = running.task.clone();
                self.state
                    .task_progress(
                        &task,
                        progress,
                        expected_file_size,
                        network_speed,
                        time_remaining_ms,
                    )
                    .await;
            }
            TransferEvent::Finished(_) => unreachable!(
                "Finished events are routed to Command::Done before reaching transfer_event"
            ),
        }
    }

    async fn transfer_done(&mut self, id: &str, outcome: TransferOutcome) {
        let Some(running) = self.running.remove(id) else {
            return;
        };
        self.queue.finish_running(id);
        let task = running.task;

        if let Some(mode) = self.requeue_on_finish.remove(id) {
            match mode {
                RequeueMode::Silent => {
                    // Quietly restarted (no progress had been made): no
                    // canceled update, straight back into the queue.
                    self.registry.purge(id);
                    self.enqueue(task, None, false).await;
                    return;
                }
                RequeueMode::AfterPause => {
                    if outcome.status() == TaskStatus::Paused {
                        let resume = outcome.resume_data.clone();
                        if let Err(e) = self.state.task_finished(&task, &outcome).await {
                            tracing::warn!(task_id = %id, "pause processing failed: {e}");
                        }
                        self.enqueue(task, resume, false).await;
                        return;
                    }
                    // The transfer ended some other way before the pause
                    // landed; fall through to normal processing.
                }
            }
        }

        match outcome.status() {
            TaskStatus::Failed if task.retries_remaining > 0 => {
                self.state.task_waiting_to_retry(&task).await;
                let delay = retry_delay(&task);
                self.schedule_timer(task, outcome.resume_data.clone(), true, delay);
            }
            TaskStatus::Paused if outcome.reenqueue_after.is_some() => {
                // Timeout auto-pause: persist resume state, then re-enqueue
                // after the delay without a paused update.
                if let Some(resume) = &outcome.resume_data {
                    if let Err(e) = self.store.store_resume_data(resume).await {
                        tracing::warn!(task_id = %id, "cannot store resume data: {e}");
                    }
                }
                self.registry.purge(id);
                let delay = outcome.reenqueue_after.unwrap_or(Duration::from_secs(1));
                let resume = outcome.resume_data.clone();
                self.schedule_timer(task, resume, false, delay);
            }
            _ => {
                if let Err(e) = self.state.task_finished(&task, &outcome).await {
                    tracing::warn!(task_id = %id, "final-state processing failed: {e}");
                }
            }
        }
        self.advance().await;
    }

    fn schedule_timer(
        &mut self,
        task: Task,
        resume: Option<ResumeData>,
        consume_retry: bool,
        delay: Duration,
    ) {
        let id = task.task_id.clone();
        let cmd_tx = self.cmd_tx.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::TimerFired { id: timer_id });
        });
        self.pending.insert(
            id,
            PendingEnqueue {
                task,
                resume,
                consume_retry,
                timer,
            },
        );
    }

    async fn timer_fired(&mut self, id: &str) {
        let Some(pending) = self.pending.remove(id) else {
            return;
        };
        let mut task = pending.task;
        if pending.consume_retry {
            task.retries_remaining = task.retries_remaining.saturating_sub(1);
        }
        self.enqueue(task, pending.resume, false).await;
    }

    async fn cancel(&mut self, ids: &[String]) {
        for id in ids {
            if !self.registry.mark_canceled(id) {
                tracing::debug!(task_id = %id, "cancel ignored (within guard window)");
                continue;
            }
            if let Some(item) = self.queue.remove_waiting(id) {
                if let Err(e) = self.state.task_canceled_before_start(&item.task).await {
                    tracing::warn!(task_id = %id, "cancel processing failed: {e}");
                }
                continue;
            }
            if let Some(pending) = self.pending.remove(id) {
                pending.timer.abort();
                if let Err(e) = self.state.task_canceled_before_start(&pending.task).await {
                    tracing::warn!(task_id = %id, "cancel processing failed: {e}");
                }
                continue;
            }
            if self.running.contains_key(id) {
                self.registry.mark_programmatic_cancel(id);
                self.registry.request_stop(id);
            }
        }
    }

    fn pause(&mut self, id: &str) -> bool {
        let Some(running) = self.running.get(id) else {
            return false;
        };
        let task = &running.task;
        if task.task_type != TaskKind::DownloadTask || !task.allow_pause {
            return false;
        }
        self.registry.mark_paused(id);
        true
    }

    async fn resume(&mut self, id: &str) -> bool {
        if self.is_active(id) {
            return false;
        }
        let paused = match self.store.retrieve_paused_task(id).await {
            Ok(Some(t)) => t,
            _ => return false,
        };
        // A mid-flight rewrite (suggested filename) replaces the original.
        let task = match self.store.retrieve_modified_task(id).await {
            Ok(Some(modified)) => modified,
            _ => paused,
        };
        let resume = self.store.retrieve_resume_data(id).await.ok().flatten();
        self.enqueue(task, resume, false).await
    }

    fn set_require_wifi(&mut self, policy: RequireWiFi, reschedule_running: bool) {
        let mut config = (*self.config).clone();
        config.require_wifi = policy;
        self.config = Arc::new(config);

        for (id, running) in &self.running {
            let required = effective_requires_wifi(policy, &running.task);
            self.registry.set_requires_wifi(id, required);
            if !(required && !self.network.is_wifi()) {
                continue;
            }
            let progressed = self
                .registry
                .progress_info(id)
                .map(|p| p.last_bytes_done > 0)
                .unwrap_or(false);
            if !progressed {
                self.requeue_on_finish.insert(id.clone(), RequeueMode::Silent);
                self.registry.request_stop(id);
            } else if reschedule_running {
                self.requeue_on_finish
                    .insert(id.clone(), RequeueMode::AfterPause);
                self.registry.mark_paused(id);
            }
        }
    }
}
