//! Bounded-concurrency transfer queue.
//!
//! `enqueue` never waits for the transfer: it registers the task, spawns a
//! worker that will wait for one of `concurrency` permits, and returns a
//! [`TaskHandle`] the caller may await later. Retries happen inside the
//! worker, which goes back to waiting for a permit after the backoff delay.
//!
//! Batch progress is tracked by task identity: a batch is the set of ids
//! queued since the last reset, and it is complete when every one of them
//! is in the finished set.

use crate::sync::retry::RetryPolicy;
use crate::sync::sink::SessionLog;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sorng_core::error::{SyncError, SyncResult};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use uuid::Uuid;

// ─── Tasks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
    Delete,
}

impl TransferDirection {
    fn verb(self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
            TransferDirection::Delete => "delete",
        }
    }

    fn past(self) -> &'static str {
        match self {
            TransferDirection::Upload => "Uploaded",
            TransferDirection::Download => "Downloaded",
            TransferDirection::Delete => "Deleted",
        }
    }
}

/// Who created a task; decides the retry ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskOrigin {
    Watcher,
    Reconcile,
    Manual,
    Bulk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Path relative to the session roots, used in log lines.
    pub relative: String,
    pub origin: TaskOrigin,
    /// 1-based number of the current try.
    pub attempt: u32,
}

impl TransferTask {
    pub fn new(
        direction: TransferDirection,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        relative: impl Into<String>,
        origin: TaskOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            relative: relative.into(),
            origin,
            attempt: 1,
        }
    }

    fn label(&self) -> &str {
        if self.relative.is_empty() {
            &self.remote_path
        } else {
            &self.relative
        }
    }

    fn key(&self) -> TaskKey {
        (self.direction, self.remote_path.clone())
    }

    /// Same work under a new identity.
    fn again(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            attempt: 1,
            ..self.clone()
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDone {
    Transferred(u64),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TaskOutcome {
    Completed { bytes: u64 },
    Skipped { reason: String },
    Failed { error: SyncError, attempts: u32 },
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

/// Executes one try of a task.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: &TransferTask) -> SyncResult<TaskDone>;
}

/// Told about every task that failed with a fatal error, after the failure
/// is logged.
pub type FatalHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Completion handle returned by `enqueue`.
pub struct TaskHandle {
    pub id: String,
    rx: watch::Receiver<Option<TaskOutcome>>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl TaskHandle {
    pub async fn wait(mut self) -> TaskOutcome {
        match self.rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(lost_outcome),
            Err(_) => lost_outcome(),
        }
    }
}

fn lost_outcome() -> TaskOutcome {
    TaskOutcome::Failed {
        error: SyncError::internal("worker ended without reporting an outcome"),
        attempts: 0,
    }
}

// ─── Stats ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub queued: usize,
    pub completed: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub concurrency: usize,
    /// Waiting for a worker slot.
    pub pending: usize,
    pub active: usize,
    /// Sleeping before another try.
    pub retrying: usize,
    pub completed_total: u64,
    pub skipped_total: u64,
    pub failed_total: u64,
    pub batch: BatchProgress,
}

// ─── State ──────────────────────────────────────────────────────────

type TaskKey = (TransferDirection, String);

#[derive(Default)]
struct KeyState {
    running: bool,
    rerun: Option<TransferTask>,
}

#[derive(Default)]
struct Batch {
    queued: HashSet<String>,
    finished: HashSet<String>,
    generation: u64,
}

#[derive(Default)]
struct QueueState {
    keys: HashMap<TaskKey, KeyState>,
    batch: Batch,
    pending: usize,
    active: usize,
    retrying: usize,
    completed_total: u64,
    skipped_total: u64,
    failed_total: u64,
}

impl QueueState {
    fn drained(&self) -> bool {
        self.pending == 0 && self.active == 0 && self.retrying == 0
    }
}

struct Inner<R> {
    runner: Arc<R>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    retry: RetryPolicy,
    log: SessionLog,
    grace: Duration,
    state: Mutex<QueueState>,
    epoch: AtomicU64,
    cancel: Notify,
    idle: Notify,
    on_fatal: Mutex<Option<FatalHook>>,
}

impl<R> Inner<R> {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

// ─── Queue ──────────────────────────────────────────────────────────

pub struct TransferQueue<R: TaskRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: TaskRunner> Clone for TransferQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: TaskRunner> TransferQueue<R> {
    pub fn new(
        runner: Arc<R>,
        concurrency: usize,
        retry: RetryPolicy,
        log: SessionLog,
        grace: Duration,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                runner,
                permits: Arc::new(Semaphore::new(concurrency)),
                concurrency,
                retry,
                log,
                grace,
                state: Mutex::new(QueueState::default()),
                epoch: AtomicU64::new(0),
                cancel: Notify::new(),
                idle: Notify::new(),
                on_fatal: Mutex::new(None),
            }),
        }
    }

    /// Install the callback for fatal task failures, replacing any earlier
    /// one.
    pub fn on_fatal(&self, hook: FatalHook) {
        *self.inner.on_fatal.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Queue a task without waiting for it.
    ///
    /// Returns `None` when the same transfer is already waiting. If the same
    /// transfer is currently running it is scheduled once more after it
    /// finishes, and `None` is returned as well.
    pub fn enqueue(&self, task: TransferTask) -> Option<TaskHandle> {
        let inner = &self.inner;
        let key = task.key();
        let running = {
            let mut st = inner.lock();
            let running = st.keys.get(&key).map(|k| k.running);
            match running {
                Some(true) => {
                    if let Some(k) = st.keys.get_mut(&key) {
                        k.rerun = Some(task.clone());
                    }
                }
                Some(false) => {}
                None => {
                    st.keys.insert(key, KeyState::default());
                    register(&mut st, &task.id);
                }
            }
            running
        };

        match running {
            Some(true) => {
                inner.log.debug(format!(
                    "{} of {} is running; queued once more",
                    task.direction.verb(),
                    task.label()
                ));
                None
            }
            Some(false) => {
                inner.log.info(format!(
                    "Skipped duplicate {} of {} (already queued)",
                    task.direction.verb(),
                    task.label()
                ));
                None
            }
            None => {
                inner.log.debug(format!("Queued {} of {}", task.direction.verb(), task.label()));
                Some(spawn_worker(inner.clone(), task, inner.epoch()))
            }
        }
    }

    /// Finish every task still waiting for a worker as skipped. Running
    /// transfers complete; their retries do not happen.
    pub fn cancel_pending(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel.notify_waiters();
    }

    pub fn is_drained(&self) -> bool {
        self.inner.lock().drained()
    }

    /// Resolve once nothing is pending, running or waiting to retry.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.inner.lock();
        let queued = st.batch.queued.len();
        let completed = st.batch.finished.len();
        QueueStats {
            concurrency: self.inner.concurrency,
            pending: st.pending,
            active: st.active,
            retrying: st.retrying,
            completed_total: st.completed_total,
            skipped_total: st.skipped_total,
            failed_total: st.failed_total,
            batch: BatchProgress {
                queued,
                completed,
                percent: if queued == 0 {
                    0.0
                } else {
                    completed as f64 / queued as f64 * 100.0
                },
            },
        }
    }
}

fn register(st: &mut QueueState, id: &str) {
    st.pending += 1;
    st.batch.queued.insert(id.to_string());
    st.batch.generation += 1;
}

// ─── Worker ─────────────────────────────────────────────────────────

fn spawn_worker<R: TaskRunner>(inner: Arc<Inner<R>>, task: TransferTask, epoch: u64) -> TaskHandle {
    let (tx, rx) = watch::channel(None);
    let id = task.id.clone();
    tokio::spawn(async move {
        let outcome = drive(&inner, task.clone(), epoch).await;
        finish(&inner, &task, &outcome, epoch);
        let _ = tx.send(Some(outcome));
    });
    TaskHandle { id, rx }
}

async fn drive<R: TaskRunner>(inner: &Inner<R>, mut task: TransferTask, epoch: u64) -> TaskOutcome {
    let stopped = || TaskOutcome::Skipped {
        reason: "session stopped".into(),
    };

    loop {
        let permit = match inner.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                inner.lock().pending -= 1;
                return stopped();
            }
        };
        {
            let mut st = inner.lock();
            st.pending -= 1;
            if inner.epoch() != epoch {
                return stopped();
            }
            st.active += 1;
            if let Some(k) = st.keys.get_mut(&task.key()) {
                k.running = true;
            }
        }

        let result = AssertUnwindSafe(inner.runner.run(&task)).catch_unwind().await;
        drop(permit);
        inner.lock().active -= 1;

        let error = match result {
            Ok(Ok(TaskDone::Transferred(bytes))) => return TaskOutcome::Completed { bytes },
            Ok(Ok(TaskDone::Skipped(reason))) => return TaskOutcome::Skipped { reason },
            Ok(Err(e)) => e,
            Err(_) => SyncError::internal(format!("{} task panicked", task.direction.verb())),
        };

        if !inner.retry.should_retry(&error, task.origin, task.attempt) {
            return TaskOutcome::Failed {
                error,
                attempts: task.attempt,
            };
        }

        let delay = inner.retry.delay(task.attempt);
        inner.log.warn(format!(
            "Retrying {} of {} in {}ms (attempt {} failed: {})",
            task.direction.verb(),
            task.label(),
            delay.as_millis(),
            task.attempt,
            error
        ));
        inner.lock().retrying += 1;
        let cancelled = inner.cancel.notified();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled => {}
        }
        {
            let mut st = inner.lock();
            st.retrying -= 1;
            st.pending += 1;
        }
        task.attempt += 1;
    }
}

fn finish<R: TaskRunner>(inner: &Arc<Inner<R>>, task: &TransferTask, outcome: &TaskOutcome, epoch: u64) {
    match outcome {
        TaskOutcome::Completed { bytes } => {
            inner.log.info(format!(
                "{} {} ({} bytes)",
                task.direction.past(),
                task.label(),
                bytes
            ));
            if task.direction != TransferDirection::Delete {
                inner.log.transferred(*bytes, task.direction);
            }
        }
        TaskOutcome::Skipped { reason } => {
            inner.log.info(format!(
                "Skipped {} of {}: {}",
                task.direction.verb(),
                task.label(),
                reason
            ));
        }
        TaskOutcome::Failed { error, attempts } => {
            inner.log.error(format!(
                "Failed to {} {} after {} attempt(s): {}",
                task.direction.verb(),
                task.label(),
                attempts,
                error
            ));
            if error.is_fatal() {
                let hook = inner.on_fatal.lock().unwrap_or_else(|e| e.into_inner()).clone();
                if let Some(hook) = hook {
                    hook(error);
                }
            }
        }
    }

    let rerun = {
        let mut st = inner.lock();
        match outcome {
            TaskOutcome::Completed { .. } => st.completed_total += 1,
            TaskOutcome::Skipped { .. } => st.skipped_total += 1,
            TaskOutcome::Failed { .. } => st.failed_total += 1,
        }
        if st.batch.queued.contains(&task.id) {
            st.batch.finished.insert(task.id.clone());
        }

        let rerun = st
            .keys
            .remove(&task.key())
            .and_then(|k| k.rerun)
            .filter(|_| inner.epoch() == epoch)
            .map(|t| t.again());
        if let Some(next) = &rerun {
            st.keys.insert(next.key(), KeyState::default());
            register(&mut st, &next.id);
        }

        if st.drained() && st.batch.finished.len() >= st.batch.queued.len() {
            schedule_reset(inner.clone(), st.batch.generation);
        }
        rerun
    };

    if let Some(next) = rerun {
        drop(spawn_worker(inner.clone(), next, epoch));
    }
    inner.idle.notify_waiters();
}

/// Clear the batch totals after the grace period, unless new work arrived.
fn schedule_reset<R: TaskRunner>(inner: Arc<Inner<R>>, generation: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(inner.grace).await;
        let mut st = inner.lock();
        if st.batch.generation == generation && st.drained() {
            st.batch = Batch {
                generation,
                ..Batch::default()
            };
        }
    });
}
