//! One sync session per connection profile.
//!
//! A session owns the pool, queue, ignore matcher, change detector and
//! reconciliation timer for one endpoint. All transfers, whatever created
//! them, go through its queue.

use crate::sync::client::ClientFactory;
use crate::sync::conflict::{self, ConflictDecision};
use crate::sync::diff::{self, DiffEntry, FileMeta};
use crate::sync::dircache::RemoteDirCache;
use crate::sync::ignore::IgnoreMatcher;
use crate::sync::pool::{ConnectionPool, PoolSettings, PoolStats};
use crate::sync::progress::{ProgressRecord, ProgressTracker};
use crate::sync::queue::{
    BatchProgress, QueueStats, TaskDone, TaskHandle, TaskOrigin, TaskRunner, TransferDirection,
    TransferQueue, TransferTask,
};
use crate::sync::retry::RetryPolicy;
use crate::sync::sink::{LogEntry, LogSink, SessionLog};
use crate::sync::watcher::{Change, ChangeDetector, ChangeKind, ChangeSink, EchoGuard, WatchSettings};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use sorng_core::client::{ProgressFn, RemoteEntry, TransferClient};
use sorng_core::config::EngineConfig;
use sorng_core::error::{SyncError, SyncResult};
use sorng_core::paths::{is_safe_relative, join_remote, local_relative, remote_relative};
use sorng_core::profile::{ConnectionProfile, SyncMode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

// ─── Public types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: usize,
    pub queued: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub connection_id: String,
    pub state: SessionState,
    pub mode: SyncMode,
    pub endpoint: String,
    pub local_root: PathBuf,
    pub remote_root: String,
    pub watching: bool,
    pub pool: PoolStats,
    pub queue: QueueStats,
    pub last_reconcile: Option<ReconcileReport>,
    pub recent_log: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub transfers: Vec<ProgressRecord>,
    pub batch: BatchProgress,
}

/// Result of a bulk operation's scan phase.
pub struct BulkScan {
    pub queued: usize,
    /// Already queued by someone else.
    pub duplicates: usize,
    pub errors: Vec<String>,
    pub handles: Vec<TaskHandle>,
}

impl BulkScan {
    fn new() -> Self {
        Self {
            queued: 0,
            duplicates: 0,
            errors: Vec::new(),
            handles: Vec::new(),
        }
    }

    fn record(&mut self, handle: Option<TaskHandle>) {
        match handle {
            Some(h) => {
                self.queued += 1;
                self.handles.push(h);
            }
            None => self.duplicates += 1,
        }
    }
}

// ─── Engine (task runner) ───────────────────────────────────────────

/// Executes transfer tasks against pooled connections.
pub struct Engine<F: ClientFactory> {
    profile: ConnectionProfile,
    remote_root: String,
    pool: ConnectionPool<F>,
    dirs: RemoteDirCache,
    progress: ProgressTracker,
    echo: Arc<EchoGuard>,
}

/// Ends a progress record however the transfer ends.
struct ProgressGuard<'a> {
    tracker: &'a ProgressTracker,
    id: &'a str,
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.tracker.finish(self.id);
    }
}

#[async_trait]
impl<F: ClientFactory> TaskRunner for Engine<F> {
    async fn run(&self, task: &TransferTask) -> SyncResult<TaskDone> {
        match task.direction {
            TransferDirection::Upload => self.upload(task).await,
            TransferDirection::Download => self.download(task).await,
            TransferDirection::Delete => self.delete(task).await,
        }
    }
}

impl<F: ClientFactory> Engine<F> {
    async fn upload(&self, task: &TransferTask) -> SyncResult<TaskDone> {
        let meta = match tokio::fs::metadata(&task.local_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TaskDone::Skipped("local file no longer exists".into()))
            }
            Err(e) => return Err(SyncError::from(e).with_path(task.local_path.display().to_string())),
        };
        if meta.is_dir() {
            return Ok(TaskDone::Skipped("is a directory".into()));
        }
        let local = FileMeta::from_metadata(&meta);

        let mut client = self.pool.acquire().await?;
        let result = self.upload_with(&mut *client, task, &local).await;
        self.pool.settle(client, &result).await;
        result
    }

    async fn upload_with(
        &self,
        client: &mut F::Client,
        task: &TransferTask,
        local: &FileMeta,
    ) -> SyncResult<TaskDone> {
        let decision =
            conflict::check_upload(client, self.profile.conflict_policy, local, &task.remote_path).await;
        if let ConflictDecision::Skip(reason) = decision {
            return Ok(TaskDone::Skipped(reason));
        }
        self.dirs.ensure_parent(client, &task.remote_path).await?;

        self.progress.begin(&task.id, &task.relative, local.size);
        let _guard = ProgressGuard {
            tracker: &self.progress,
            id: &task.id,
        };
        let on_progress: &ProgressFn<'_> = &|done: u64, total: Option<u64>| {
            self.progress.update(&task.id, done, total);
        };
        let bytes = client
            .upload_from(&task.local_path, &task.remote_path, on_progress)
            .await?;
        Ok(TaskDone::Transferred(bytes))
    }

    async fn download(&self, task: &TransferTask) -> SyncResult<TaskDone> {
        let mut client = self.pool.acquire().await?;
        let result = self.download_with(&mut *client, task).await;
        self.pool.settle(client, &result).await;
        result
    }

    async fn download_with(&self, client: &mut F::Client, task: &TransferTask) -> SyncResult<TaskDone> {
        let entry = client.stat(&task.remote_path).await?.ok_or_else(|| {
            SyncError::not_found(format!("{}: No such file", task.remote_path))
                .with_path(&task.remote_path)
        })?;
        if entry.is_directory {
            return Ok(TaskDone::Skipped("is a directory".into()));
        }

        self.progress.begin(&task.id, &task.relative, entry.size);
        let _guard = ProgressGuard {
            tracker: &self.progress,
            id: &task.id,
        };
        let on_progress: &ProgressFn<'_> = &|done: u64, total: Option<u64>| {
            self.progress.update(&task.id, done, total);
        };
        if let Some(parent) = task.local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::from(e).with_path(parent.display().to_string()))?;
        }
        self.echo.note(&task.local_path);
        let bytes = client
            .download_to(&task.remote_path, &task.local_path, on_progress)
            .await?;

        if let Some(modified) = entry.modified {
            let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
            if let Err(e) = filetime::set_file_mtime(&task.local_path, mtime) {
                log::debug!("could not set mtime on {}: {}", task.local_path.display(), e);
            }
        }
        self.echo.note(&task.local_path);
        Ok(TaskDone::Transferred(bytes))
    }

    async fn delete(&self, task: &TransferTask) -> SyncResult<TaskDone> {
        let mut client = self.pool.acquire().await?;
        let result = client.remove(&task.remote_path).await.map(|_| TaskDone::Transferred(0));
        self.pool.settle(client, &result).await;
        if result.is_ok() {
            self.dirs.forget_under(&task.remote_path);
        }
        result
    }
}

// ─── Session ────────────────────────────────────────────────────────

#[derive(Default)]
struct Lifecycle {
    detector: Option<ChangeDetector>,
    timer: Option<JoinHandle<()>>,
}

pub struct SyncSession<F: ClientFactory> {
    profile: ConnectionProfile,
    config: EngineConfig,
    engine: Arc<Engine<F>>,
    queue: TransferQueue<Engine<F>>,
    ignore: Arc<IgnoreMatcher>,
    log: SessionLog,
    state: Mutex<SessionState>,
    /// Bumped by every `stop`; a start that sees it move gives up.
    epoch: AtomicU64,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    /// Serializes remote listing steps.
    listing: tokio::sync::Mutex<()>,
    reconciling: AtomicBool,
    watching: AtomicBool,
    last_reconcile: Mutex<Option<ReconcileReport>>,
}

impl<F: ClientFactory> SyncSession<F> {
    pub fn new(
        profile: ConnectionProfile,
        config: EngineConfig,
        factory: F,
        sink: Arc<dyn LogSink>,
    ) -> Arc<Self> {
        let log = SessionLog::new(profile.id.clone(), sink, config.log_capacity);
        let engine = Arc::new(Engine {
            remote_root: profile.normalized_remote_root(),
            pool: ConnectionPool::new(factory, PoolSettings::new(&profile, &config)),
            dirs: RemoteDirCache::new(),
            progress: ProgressTracker::new(config.progress_throttle()),
            echo: Arc::new(EchoGuard::new(config.echo_suppression())),
            profile: profile.clone(),
        });
        let queue = TransferQueue::new(
            engine.clone(),
            profile.effective_pool_size(),
            RetryPolicy::new(&config),
            log.clone(),
            config.batch_reset_grace(),
        );
        let ignore = Arc::new(IgnoreMatcher::new(
            profile.local_root.clone(),
            config.ignore_file_name.clone(),
            profile.exclude_list(),
        ));
        let session = Arc::new(Self {
            profile,
            config,
            engine,
            queue,
            ignore,
            log,
            state: Mutex::new(SessionState::Stopped),
            epoch: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            listing: tokio::sync::Mutex::new(()),
            reconciling: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            last_reconcile: Mutex::new(None),
        });
        let weak = Arc::downgrade(&session);
        session.queue.on_fatal(Arc::new(move |error: &SyncError| {
            if let Some(session) = weak.upgrade() {
                session.halt(error);
            }
        }));
        session
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn remote_root(&self) -> &str {
        &self.engine.remote_root
    }

    fn local_root(&self) -> &Path {
        &self.profile.local_root
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Bring the session up. A no-op when already starting or running.
    ///
    /// Fails, leaving the session stopped, when the local root cannot be
    /// created or the first connection cannot be established.
    ///
    /// A `stop` that lands while the session is starting wins: whatever was
    /// already attached is torn down and this returns a cancelled error.
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        let epoch = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *st {
                SessionState::Starting | SessionState::Running => return Ok(()),
                SessionState::Stopping => {
                    return Err(SyncError::internal("session is still stopping"));
                }
                SessionState::Stopped => *st = SessionState::Starting,
            }
            self.epoch.load(Ordering::SeqCst)
        };
        self.log.info(format!(
            "Starting {:?} sync {} <-> {}",
            self.profile.sync_mode,
            self.local_root().display(),
            self.engine.pool.factory().endpoint()
        ));

        match self.bring_up(epoch).await {
            Ok(()) => {
                let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if *st == SessionState::Starting && self.is_current(epoch) {
                    *st = SessionState::Running;
                    return Ok(());
                }
                drop(st);
                self.log.info("Start abandoned; the session was stopped");
                Err(start_cancelled())
            }
            // `stop` owns the teardown once it has run.
            Err(e) if !self.is_current(epoch) => {
                self.log.info("Start abandoned; the session was stopped");
                Err(e)
            }
            Err(e) => {
                self.log.error(format!("Session failed to start: {}", e));
                self.teardown().await;
                let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if *st == SessionState::Starting {
                    *st = SessionState::Stopped;
                }
                Err(e)
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn still_starting(&self, epoch: u64) -> SyncResult<()> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(start_cancelled())
        }
    }

    /// Every await is followed by an epoch check. Detector and timer are
    /// attached under the lifecycle lock after a passing check, so a `stop`
    /// that bumped the epoch either prevents them or tears them down.
    async fn bring_up(self: &Arc<Self>, epoch: u64) -> SyncResult<()> {
        tokio::fs::create_dir_all(self.local_root())
            .await
            .map_err(|e| SyncError::from(e).with_path(self.local_root().display().to_string()))?;
        self.still_starting(epoch)?;
        self.engine.dirs.clear();
        self.ignore.invalidate();

        // The first connection proves the endpoint and the credentials.
        let client = self.engine.pool.acquire().await?;
        self.engine.pool.release(client).await;
        self.still_starting(epoch)?;

        let mode = self.profile.sync_mode;
        let mut lc = self.lifecycle.lock().await;
        self.still_starting(epoch)?;
        if mode.watches_local() {
            let detector = ChangeDetector::start(
                self.local_root(),
                WatchSettings {
                    stability: self.config.stability_window(),
                    delete_sync: self.profile.delete_sync,
                },
                self.ignore.clone(),
                self.engine.echo.clone(),
                self.change_sink(),
            )?;
            lc.detector = Some(detector);
            self.watching.store(true, Ordering::SeqCst);
        }
        drop(lc);

        if mode.reconciles_remote() {
            self.reconcile_now().await;
            let mut lc = self.lifecycle.lock().await;
            self.still_starting(epoch)?;
            lc.timer = Some(spawn_reconcile_timer(
                Arc::downgrade(self),
                self.config.reconcile_interval(),
            ));
        }
        Ok(())
    }

    /// Detach the watcher, stop the timer, cancel waiting tasks and close
    /// every pooled connection. Transfers already running finish on their
    /// own connection, which is closed instead of being pooled.
    pub async fn stop(&self) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *st == SessionState::Stopped {
                return;
            }
            *st = SessionState::Stopping;
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.teardown().await;
        self.set_state(SessionState::Stopped);
        self.log.info("Session stopped");
    }

    /// A task failed in a way no retry or reconnect can fix, such as
    /// rejected credentials. Stop in the background; the failing worker
    /// must not wait on its own teardown.
    fn halt(self: &Arc<Self>, error: &SyncError) {
        if matches!(self.state(), SessionState::Stopped | SessionState::Stopping) {
            return;
        }
        self.log.error(format!("Stopping session: {}", error));
        let session = self.clone();
        tokio::spawn(async move {
            session.stop().await;
        });
    }

    async fn teardown(&self) {
        let mut lc = self.lifecycle.lock().await;
        if let Some(detector) = lc.detector.take() {
            detector.stop();
        }
        if let Some(timer) = lc.timer.take() {
            timer.abort();
        }
        drop(lc);
        self.watching.store(false, Ordering::SeqCst);
        self.queue.cancel_pending();
        self.engine.pool.close_all().await;
    }

    /// Watcher output → upload / delete tasks.
    fn change_sink(&self) -> ChangeSink {
        let queue = self.queue.clone();
        let remote_root = self.remote_root().to_string();
        Arc::new(move |changes: Vec<Change>| {
            for change in changes {
                let remote = join_remote(&remote_root, &change.relative);
                let direction = match change.kind {
                    ChangeKind::Upsert => TransferDirection::Upload,
                    ChangeKind::Remove => TransferDirection::Delete,
                };
                let task = TransferTask::new(direction, change.path, remote, change.relative, TaskOrigin::Watcher);
                let _ = queue.enqueue(task);
            }
        })
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Run one reconciliation pass unless one is already running.
    pub async fn reconcile_now(&self) -> Option<ReconcileReport> {
        if self
            .reconciling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.log.debug("Reconciliation skipped; previous pass still running");
            return None;
        }
        let report = {
            let _flag = FlagReset(&self.reconciling);
            self.reconcile().await
        };

        match &report.error {
            Some(e) => self.log.warn(format!("Reconciliation failed: {}", e)),
            None if report.queued > 0 => self.log.info(format!(
                "Reconciliation queued {} download(s) out of {} remote file(s)",
                report.queued, report.scanned
            )),
            None => self.log.debug(format!("Reconciliation: {} remote file(s) in sync", report.scanned)),
        }
        *self.last_reconcile.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        Some(report)
    }

    async fn reconcile(&self) -> ReconcileReport {
        let started_at = Utc::now();
        let mut scanned = 0;
        let mut queued = 0;
        let mut error = None;
        let mut stack = vec![(String::new(), self.remote_root().to_string())];

        while let Some((rel_dir, remote_dir)) = stack.pop() {
            let entries = match self.list_dir(&remote_dir).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() && rel_dir.is_empty() => break,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            };
            for entry in entries {
                if !is_plain_name(&entry.name) {
                    continue;
                }
                let rel = diff::join_relative(&rel_dir, &entry.name);
                if self.ignore.is_ignored(&rel, entry.is_directory) {
                    continue;
                }
                if entry.is_directory {
                    stack.push((rel, entry.path.clone()));
                    continue;
                }
                scanned += 1;
                let local_path = local_path(self.local_root(), &rel);
                let local = std::fs::metadata(&local_path).ok().map(|m| FileMeta::from_metadata(&m));
                if diff::should_download(local.as_ref(), &FileMeta::from(&entry)) {
                    let task = TransferTask::new(
                        TransferDirection::Download,
                        local_path,
                        entry.path.clone(),
                        rel,
                        TaskOrigin::Reconcile,
                    );
                    if self.queue.enqueue(task).is_some() {
                        queued += 1;
                    }
                }
            }
        }

        ReconcileReport {
            started_at,
            finished_at: Utc::now(),
            scanned,
            queued,
            error,
        }
    }

    // ── Remote listing ───────────────────────────────────────────────

    /// One directory listing; holds the listing lock only for this step.
    async fn list_dir(&self, dir: &str) -> SyncResult<Vec<RemoteEntry>> {
        let _step = self.listing.lock().await;
        let mut client = self.engine.pool.acquire().await?;
        let result = client.list(dir).await;
        self.engine.pool.settle(client, &result).await;
        result.map_err(|e| if e.path.is_none() { e.with_path(dir) } else { e })
    }

    /// Interactive single-folder listing. `path` is absolute or relative to
    /// the remote root.
    pub async fn list_remote(&self, path: &str) -> SyncResult<Vec<RemoteEntry>> {
        let dir = self.resolve_remote(path)?;
        let mut entries = self.list_dir(&dir).await?;
        entries.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    async fn stat_remote(&self, path: &str) -> SyncResult<Option<RemoteEntry>> {
        let mut client = self.engine.pool.acquire().await?;
        let result = client.stat(path).await;
        self.engine.pool.settle(client, &result).await;
        result
    }

    fn resolve_remote(&self, path: &str) -> SyncResult<String> {
        let path = path.trim();
        let abs = if path.starts_with('/') {
            let trimmed = path.trim_end_matches('/');
            if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            }
        } else {
            join_remote(self.remote_root(), path.trim_end_matches('/'))
        };
        if !is_safe_relative(&abs) {
            return Err(SyncError::invalid_config(format!("Path {} leaves the remote root", path)));
        }
        let root = self.remote_root();
        let inside = root == "/" || abs == root || abs.starts_with(&format!("{}/", root));
        if !inside {
            return Err(SyncError::invalid_config(format!(
                "{} is outside the remote root {}",
                abs, root
            )));
        }
        Ok(abs)
    }

    // ── Manual transfers ─────────────────────────────────────────────

    /// Queue one upload. `local_name` is relative to the local root;
    /// `remote_name` defaults to the same relative path under the remote
    /// root.
    pub async fn manual_upload(
        &self,
        local_name: &str,
        remote_name: Option<&str>,
    ) -> SyncResult<Option<TaskHandle>> {
        let rel = clean_relative(local_name)?;
        let local = local_path(self.local_root(), &rel);
        let meta = tokio::fs::metadata(&local)
            .await
            .map_err(|e| SyncError::from(e).with_path(local.display().to_string()))?;
        if !meta.is_file() {
            return Err(SyncError::invalid_config(format!("{} is not a file", rel)));
        }
        let remote = match remote_name {
            Some(name) => self.resolve_remote(name)?,
            None => join_remote(self.remote_root(), &rel),
        };
        Ok(self.queue.enqueue(TransferTask::new(
            TransferDirection::Upload,
            local,
            remote,
            rel,
            TaskOrigin::Manual,
        )))
    }

    /// Queue one download into the matching place under the local root.
    pub async fn manual_download(&self, remote_path: &str) -> SyncResult<Option<TaskHandle>> {
        let remote = self.resolve_remote(remote_path)?;
        let rel = remote_relative(self.remote_root(), &remote);
        if rel.is_empty() {
            return Err(SyncError::invalid_config("Cannot download the remote root as a file"));
        }
        Ok(self.queue.enqueue(TransferTask::new(
            TransferDirection::Download,
            local_path(self.local_root(), &rel),
            remote,
            rel,
            TaskOrigin::Manual,
        )))
    }

    /// Queue every file under `items` (relative to `base_path`). Returns
    /// at once; the handle resolves when scanning and queuing are done,
    /// not when the transfers are.
    pub fn bulk_sync(
        self: &Arc<Self>,
        items: Vec<String>,
        base_path: &str,
        direction: TransferDirection,
    ) -> JoinHandle<BulkScan> {
        let session = self.clone();
        let base = base_path.trim_matches('/').to_string();
        tokio::spawn(async move {
            let mut scan = BulkScan::new();
            for item in items {
                let joined = diff::join_relative(&base, item.trim_matches('/'));
                let result = match direction {
                    TransferDirection::Download => session.bulk_download(&joined, &mut scan).await,
                    _ => session.bulk_upload(&joined, &mut scan).await,
                };
                if let Err(e) = result {
                    session.log.warn(format!("Bulk sync of {}: {}", joined, e));
                    scan.errors.push(format!("{}: {}", joined, e));
                }
            }
            session.log.info(format!(
                "Bulk sync queued {} file(s), {} already queued",
                scan.queued, scan.duplicates
            ));
            scan
        })
    }

    async fn bulk_upload(&self, item: &str, scan: &mut BulkScan) -> SyncResult<()> {
        let rel = clean_relative(item)?;
        let path = local_path(self.local_root(), &rel);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SyncError::from(e).with_path(path.display().to_string()))?;

        let files: Vec<(PathBuf, String)> = if meta.is_dir() {
            let root = self.local_root().to_path_buf();
            let ignore = self.ignore.clone();
            tokio::task::spawn_blocking(move || walk_local(&root, &path, &ignore))
                .await
                .map_err(|e| SyncError::internal(format!("scan task failed: {}", e)))?
        } else {
            vec![(path, rel)]
        };

        for (path, rel) in files {
            let remote = join_remote(self.remote_root(), &rel);
            scan.record(self.queue.enqueue(TransferTask::new(
                TransferDirection::Upload,
                path,
                remote,
                rel,
                TaskOrigin::Bulk,
            )));
        }
        Ok(())
    }

    async fn bulk_download(&self, item: &str, scan: &mut BulkScan) -> SyncResult<()> {
        let remote = self.resolve_remote(item)?;
        let entry = self
            .stat_remote(&remote)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("{}: No such file or directory", remote)))?;

        if !entry.is_directory {
            self.queue_download(&remote, scan);
            return Ok(());
        }
        let mut stack = vec![remote];
        while let Some(dir) = stack.pop() {
            for e in self.list_dir(&dir).await? {
                if !is_plain_name(&e.name) {
                    continue;
                }
                let rel = remote_relative(self.remote_root(), &e.path);
                if self.ignore.is_ignored(&rel, e.is_directory) {
                    continue;
                }
                if e.is_directory {
                    stack.push(e.path);
                } else {
                    self.queue_download(&e.path, scan);
                }
            }
        }
        Ok(())
    }

    fn queue_download(&self, remote: &str, scan: &mut BulkScan) {
        let rel = remote_relative(self.remote_root(), remote);
        scan.record(self.queue.enqueue(TransferTask::new(
            TransferDirection::Download,
            local_path(self.local_root(), &rel),
            remote,
            rel,
            TaskOrigin::Bulk,
        )));
    }

    // ── Folder diff ──────────────────────────────────────────────────

    /// Diff one remote folder (absolute or relative to the remote root)
    /// against its local counterpart, optionally descending.
    pub async fn compare_folder(&self, path: &str, recursive: bool) -> SyncResult<Vec<DiffEntry>> {
        let remote_dir = self.resolve_remote(path)?;
        let rel_dir = remote_relative(self.remote_root(), &remote_dir);
        let mut out = Vec::new();
        let mut stack = vec![(rel_dir, remote_dir)];

        while let Some((rel_dir, remote_dir)) = stack.pop() {
            let remote = match self.list_dir(&remote_dir).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e),
            };
            let local_dir = local_path(self.local_root(), &rel_dir);
            let local = tokio::task::spawn_blocking(move || diff::local_listing(&local_dir))
                .await
                .map_err(|e| SyncError::internal(format!("scan task failed: {}", e)))??;

            let remote: Vec<RemoteEntry> = remote.into_iter().filter(|e| is_plain_name(&e.name)).collect();
            let entries: Vec<DiffEntry> = diff::diff_folder(&rel_dir, &remote_dir, local, &remote)
                .into_iter()
                .filter(|e| !self.ignore.is_ignored(&e.relative, e.is_directory))
                .collect();
            if recursive {
                for e in entries.iter().filter(|e| e.is_directory) {
                    stack.push((e.relative.clone(), e.remote_path.clone()));
                }
            }
            out.extend(entries);
        }

        if recursive {
            diff::mark_changes(&mut out);
        }
        Ok(out)
    }

    // ── Status ───────────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connection_id: self.profile.id.clone(),
            state: self.state(),
            mode: self.profile.sync_mode,
            endpoint: self.engine.pool.factory().endpoint(),
            local_root: self.profile.local_root.clone(),
            remote_root: self.remote_root().to_string(),
            watching: self.watching.load(Ordering::SeqCst),
            pool: self.engine.pool.stats(),
            queue: self.queue.stats(),
            last_reconcile: self.last_reconcile.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            recent_log: self.log.recent(50),
        }
    }

    pub fn progress(&self) -> SessionProgress {
        SessionProgress {
            transfers: self.engine.progress.snapshot(),
            batch: self.queue.stats().batch,
        }
    }

    /// Resolve once the queue has nothing left to do.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }
}

fn spawn_reconcile_timer<F: ClientFactory>(session: Weak<SyncSession<F>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else { break };
            session.reconcile_now().await;
        }
    })
}

/// Clears a busy flag even when the pass is aborted mid-way.
struct FlagReset<'a>(&'a AtomicBool);

impl Drop for FlagReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ─── Path helpers ───────────────────────────────────────────────────

fn local_path(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |p, seg| p.join(seg))
}

/// A listing entry name that maps onto exactly one local path component.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\\')
}

fn clean_relative(name: &str) -> SyncResult<String> {
    let rel = name.replace('\\', "/").trim_matches('/').to_string();
    if rel.is_empty() || !is_safe_relative(&rel) {
        return Err(SyncError::invalid_config(format!("Invalid relative path: {}", name)));
    }
    Ok(rel)
}

fn start_cancelled() -> SyncError {
    SyncError::cancelled("Session was stopped while starting")
}

fn walk_local(root: &Path, dir: &Path, ignore: &IgnoreMatcher) -> Vec<(PathBuf, String)> {
    let mut out = Vec::new();
    let walker = WalkDir::new(dir).into_iter().filter_entry(|e| {
        match local_relative(root, e.path()) {
            Some(rel) => rel.is_empty() || !ignore.is_ignored(&rel, e.file_type().is_dir()),
            None => false,
        }
    });
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(rel) = local_relative(root, entry.path()) {
            out.push((entry.into_path(), rel));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::diff::DiffStatus;
    use crate::sync::memory::{MemoryFactory, MemoryRemote};
    use crate::sync::queue::TaskOutcome;
    use crate::sync::sink::MemorySink;
    use sorng_core::error::SyncErrorKind;
    use sorng_core::profile::{ConflictPolicy, Credential, Protocol};
    use tempfile::TempDir;

    fn profile(dir: &Path, mode: SyncMode) -> ConnectionProfile {
        ConnectionProfile {
            id: "s1".into(),
            name: None,
            host: "memory".into(),
            port: None,
            username: "u".into(),
            credential: Credential::Password {
                password: "p".into(),
            },
            protocol: Protocol::Sftp,
            remote_root: "/site".into(),
            local_root: dir.to_path_buf(),
            sync_mode: mode,
            pool_size: 2,
            buffer_size_mb: 1.0,
            conflict_policy: ConflictPolicy::Overwrite,
            delete_sync: false,
            exclude_patterns: String::new(),
            accept_invalid_certs: false,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            connect_jitter_ms: 0,
            retry_base_delay_ms: 5,
            stability_window_ms: 20,
            batch_reset_grace_ms: 20,
            ..EngineConfig::default()
        }
    }

    fn session(
        dir: &Path,
        mode: SyncMode,
        remote: &MemoryRemote,
    ) -> (Arc<SyncSession<MemoryFactory>>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new(1000));
        let s = SyncSession::new(profile(dir, mode), config(), remote.factory(), sink.clone());
        (s, sink)
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_closes_everything() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let (s, _) = session(dir.path(), SyncMode::DownloadOnly, &remote);
        s.start().await.unwrap();
        s.start().await.unwrap();
        assert_eq!(s.state(), SessionState::Running);
        assert!(!s.status().watching);
        s.stop().await;
        assert_eq!(s.state(), SessionState::Stopped);
        assert_eq!(remote.counters().live_connections, 0);
    }

    #[tokio::test]
    async fn credential_failure_leaves_the_session_stopped() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote.fail_connects(vec![SyncError::auth_failed("530 Login incorrect")]);
        let (s, sink) = session(dir.path(), SyncMode::UploadOnly, &remote);
        let err = s.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(sink.contains("Session failed to start"));
    }

    #[tokio::test]
    async fn stop_during_start_wins() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new().with_connect_delay(Duration::from_millis(200));
        let (s, _) = session(dir.path(), SyncMode::UploadOnly, &remote);
        let starting = {
            let s = s.clone();
            tokio::spawn(async move { s.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.state(), SessionState::Starting);
        s.stop().await;
        assert_eq!(s.state(), SessionState::Stopped);

        let err = starting.await.unwrap().unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::Cancelled);
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(!s.status().watching);
        assert_eq!(remote.counters().live_connections, 0);

        // Nothing was left behind that keeps a fresh start from working.
        s.start().await.unwrap();
        assert_eq!(s.state(), SessionState::Running);
        s.stop().await;
    }

    #[tokio::test]
    async fn rejected_credentials_after_start_stop_the_session() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let remote = MemoryRemote::new();
        let (s, sink) = session(dir.path(), SyncMode::DownloadOnly, &remote);
        s.start().await.unwrap();

        remote.fail_connects(vec![SyncError::auth_failed("530 Login incorrect")]);
        s.engine.pool.close_all().await;
        let h = s.manual_upload("a.txt", None).await.unwrap().unwrap();
        assert!(matches!(h.wait().await, TaskOutcome::Failed { attempts: 1, .. }));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while s.state() != SessionState::Stopped && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(sink.contains("Stopping session"));
        assert_eq!(remote.counters().live_connections, 0);
    }

    #[tokio::test]
    async fn overlapping_reconcile_is_skipped() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new().with_list_delay(Duration::from_millis(150));
        remote.put_file("/site/index.html", b"<html>", Utc::now());
        let (s, _) = session(dir.path(), SyncMode::DownloadOnly, &remote);

        let (first, second) = tokio::join!(s.reconcile_now(), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            s.reconcile_now().await
        });
        let first = first.unwrap();
        assert!(second.is_none());
        assert_eq!(first.queued, 1);
        assert_eq!(s.status().last_reconcile, Some(first));

        // The guard is released once the pass ends.
        s.wait_idle().await;
        assert!(s.reconcile_now().await.is_some());
    }

    #[tokio::test]
    async fn deleted_remote_directory_is_recreated_on_upload() {
        let dir = TempDir::new().unwrap();
        let dist = dir.path().join("dist");
        std::fs::create_dir_all(&dist).unwrap();
        std::fs::write(dist.join("a.js"), "a").unwrap();
        let remote = MemoryRemote::new();
        let (s, _) = session(dir.path(), SyncMode::UploadOnly, &remote);

        let h = s.manual_upload("dist/a.js", None).await.unwrap().unwrap();
        assert!(h.wait().await.is_completed());

        std::fs::remove_dir_all(&dist).unwrap();
        (s.change_sink())(vec![Change {
            path: dist.clone(),
            relative: "dist".into(),
            kind: ChangeKind::Remove,
        }]);
        s.wait_idle().await;
        assert!(!remote.is_dir("/site/dist"));

        std::fs::create_dir_all(&dist).unwrap();
        std::fs::write(dist.join("b.js"), "b").unwrap();
        let h = s.manual_upload("dist/b.js", None).await.unwrap().unwrap();
        assert!(h.wait().await.is_completed());
        assert_eq!(remote.file("/site/dist/b.js").unwrap(), b"b");
    }

    #[tokio::test]
    async fn reconcile_downloads_missing_files() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote.put_file("/site/index.html", b"<html>", Utc::now());
        remote.put_file("/site/css/a.css", b"body{}", Utc::now());
        remote.put_file("/site/debug.log", b"x", Utc::now());
        let (s, _) = session(dir.path(), SyncMode::Bidirectional, &remote);
        s.start().await.unwrap();
        s.wait_idle().await;

        assert_eq!(std::fs::read(dir.path().join("index.html")).unwrap(), b"<html>");
        assert_eq!(std::fs::read(dir.path().join("css/a.css")).unwrap(), b"body{}");
        assert!(!dir.path().join("debug.log").exists());
        let report = s.status().last_reconcile.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.queued, 2);

        // Everything is in step now.
        let again = s.reconcile_now().await.unwrap();
        assert_eq!(again.queued, 0);
        s.stop().await;
    }

    #[tokio::test]
    async fn manual_upload_creates_remote_directories_once() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/one.txt"), "1").unwrap();
        std::fs::write(dir.path().join("a/b/two.txt"), "22").unwrap();
        let remote = MemoryRemote::new();
        let (s, _) = session(dir.path(), SyncMode::DownloadOnly, &remote);

        let h = s.manual_upload("a/b/one.txt", None).await.unwrap().unwrap();
        assert!(h.wait().await.is_completed());
        let h = s.manual_upload("a/b/two.txt", None).await.unwrap().unwrap();
        assert!(h.wait().await.is_completed());

        assert_eq!(remote.file("/site/a/b/two.txt").unwrap(), b"22");
        assert_eq!(remote.counters().ensure_dir_calls, 1);
    }

    #[tokio::test]
    async fn manual_paths_are_validated() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let (s, _) = session(dir.path(), SyncMode::DownloadOnly, &remote);
        assert!(s.manual_upload("../etc/passwd", None).await.is_err());
        assert!(s.manual_upload("missing.txt", None).await.unwrap_err().is_not_found());
        assert!(s.manual_download("/elsewhere/x").await.is_err());
    }

    #[tokio::test]
    async fn downloads_keep_the_remote_mtime() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let stamp = Utc::now() - chrono::Duration::hours(3);
        remote.put_file("/site/old.txt", b"old", stamp);
        let (s, _) = session(dir.path(), SyncMode::DownloadOnly, &remote);
        let h = s.manual_download("old.txt").await.unwrap().unwrap();
        assert!(h.wait().await.is_completed());

        let entries = s.compare_folder("", false).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, DiffStatus::Synchronized);
    }

    #[tokio::test]
    async fn missing_remote_download_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let (s, sink) = session(dir.path(), SyncMode::DownloadOnly, &remote);
        let h = s.manual_download("nope.txt").await.unwrap().unwrap();
        assert!(matches!(h.wait().await, TaskOutcome::Failed { attempts: 1, .. }));
        assert!(sink.contains("Failed to download nope.txt"));
    }

    #[tokio::test]
    async fn recursive_compare_flags_changed_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/new.md"), "n").unwrap();
        let remote = MemoryRemote::new();
        remote.mkdir("/site/docs");
        let (s, _) = session(dir.path(), SyncMode::DownloadOnly, &remote);

        let entries = s.compare_folder("/site", true).await.unwrap();
        let docs = entries.iter().find(|e| e.relative == "docs").unwrap();
        assert_eq!(docs.status, DiffStatus::Synchronized);
        assert!(docs.contains_changes);
        let new = entries.iter().find(|e| e.relative == "docs/new.md").unwrap();
        assert_eq!(new.status, DiffStatus::MissingRemote);
    }

    #[tokio::test]
    async fn bulk_download_walks_remote_directories() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote.put_file("/site/img/a.png", b"a", Utc::now());
        remote.put_file("/site/img/sub/b.png", b"b", Utc::now());
        let (s, _) = session(dir.path(), SyncMode::DownloadOnly, &remote);
        let scan = s
            .bulk_sync(vec!["img".into()], "", TransferDirection::Download)
            .await
            .unwrap();
        assert_eq!(scan.queued, 2);
        for h in scan.handles {
            assert!(h.wait().await.is_completed());
        }
        assert!(dir.path().join("img/sub/b.png").exists());
    }

    #[tokio::test]
    async fn list_remote_sorts_directories_first() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote.put_file("/site/z.txt", b"z", Utc::now());
        remote.mkdir("/site/a");
        let (s, _) = session(dir.path(), SyncMode::DownloadOnly, &remote);
        let entries = s.list_remote("").await.unwrap();
        assert_eq!(entries[0].name, "a");
        assert!(entries[0].is_directory);
        assert_eq!(entries[1].name, "z.txt");
    }
}
