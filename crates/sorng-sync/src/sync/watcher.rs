//! Debounced local change detection.
//!
//! Raw filesystem events land in a pending map keyed by path. Each event
//! pushes a single flush deadline back by the stability window; when the
//! deadline passes the whole map is taken in one move, files that were
//! modified too recently go back to pending, and the rest are filtered and
//! handed to the sink as one batch.

use crate::sync::ignore::IgnoreMatcher;
use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sorng_core::error::{SyncError, SyncResult};
use sorng_core::paths::local_relative;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use walkdir::WalkDir;

/// Directory names dropped before any other filtering, along with every
/// hidden entry.
const WATCH_SKIP_DIRS: &[&str] = &[".git", ".svn", ".hg", "node_modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or modified.
    Upsert,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    /// `/`-separated, relative to the watched root.
    pub relative: String,
    pub kind: ChangeKind,
}

pub type ChangeSink = Arc<dyn Fn(Vec<Change>) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub stability: Duration,
    pub delete_sync: bool,
}

// ─── Echo suppression ───────────────────────────────────────────────

/// Local files the engine itself just wrote.
#[derive(Debug)]
pub struct EchoGuard {
    window: Duration,
    written: DashMap<PathBuf, std::time::Instant>,
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            written: DashMap::new(),
        }
    }

    pub fn note(&self, path: &Path) {
        let window = self.window;
        self.written.retain(|_, at| at.elapsed() < window);
        self.written.insert(path.to_path_buf(), std::time::Instant::now());
    }

    pub fn is_echo(&self, path: &Path) -> bool {
        let recent = self
            .written
            .get(path)
            .map(|t| t.elapsed() < self.window)
            .unwrap_or(false);
        if !recent {
            self.written.remove(path);
        }
        recent
    }
}

// ─── Detector ───────────────────────────────────────────────────────

pub struct ChangeDetector {
    tx: mpsc::UnboundedSender<(PathBuf, ChangeKind)>,
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
}

struct Filter {
    root: PathBuf,
    settings: WatchSettings,
    ignore: Arc<IgnoreMatcher>,
    echo: Arc<EchoGuard>,
}

impl ChangeDetector {
    /// Watch `root` recursively.
    pub fn start(
        root: &Path,
        settings: WatchSettings,
        ignore: Arc<IgnoreMatcher>,
        echo: Arc<EchoGuard>,
        sink: ChangeSink,
    ) -> SyncResult<Self> {
        let mut detector = Self::detached(root, settings, ignore, echo, sink);
        let tx = detector.tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in convert_event(event) {
                    let _ = tx.send(change);
                }
            }
            Err(e) => log::error!("watcher: {}", e),
        })
        .map_err(|e| SyncError::io_error(format!("Failed to create watcher: {}", e)))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::io_error(format!("Failed to watch {}: {}", root.display(), e)))?;
        log::info!("watcher: watching {}", root.display());
        detector.watcher = Some(watcher);
        Ok(detector)
    }

    /// Debounce pipeline without an OS watcher; events come from
    /// [`inject`](Self::inject) only.
    pub fn detached(
        root: &Path,
        settings: WatchSettings,
        ignore: Arc<IgnoreMatcher>,
        echo: Arc<EchoGuard>,
        sink: ChangeSink,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = Filter {
            root: root.to_path_buf(),
            settings,
            ignore,
            echo,
        };
        let task = tokio::spawn(debounce(rx, filter, sink));
        Self {
            tx,
            watcher: None,
            task,
        }
    }

    pub fn inject(&self, path: impl Into<PathBuf>, kind: ChangeKind) {
        let _ = self.tx.send((path.into(), kind));
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn stop(mut self) {
        self.watcher = None;
        self.task.abort();
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn convert_event(event: Event) -> Vec<(PathBuf, ChangeKind)> {
    let mut paths = event.paths.into_iter();
    match event.kind {
        EventKind::Create(_) => paths.map(|p| (p, ChangeKind::Upsert)).collect(),
        EventKind::Remove(_) => paths.map(|p| (p, ChangeKind::Remove)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = paths.next() {
                out.push((from, ChangeKind::Remove));
            }
            if let Some(to) = paths.next() {
                out.push((to, ChangeKind::Upsert));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.map(|p| (p, ChangeKind::Remove)).collect()
        }
        // Metadata-only changes are not worth a transfer.
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) | EventKind::Any => paths.map(|p| (p, ChangeKind::Upsert)).collect(),
        _ => Vec::new(),
    }
}

fn skipped_by_watcher(rel: &str) -> bool {
    rel.split('/')
        .any(|seg| seg.starts_with('.') || WATCH_SKIP_DIRS.contains(&seg))
}

async fn debounce(
    mut rx: mpsc::UnboundedReceiver<(PathBuf, ChangeKind)>,
    filter: Filter,
    sink: ChangeSink,
) {
    let stability = filter.settings.stability;
    let mut pending: HashMap<PathBuf, ChangeKind> = HashMap::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            ev = rx.recv() => {
                let Some((path, kind)) = ev else { break };
                match local_relative(&filter.root, &path) {
                    Some(rel) if rel == filter.ignore.file_name() => {
                        log::debug!("watcher: {} changed; reloading ignore rules", rel);
                        filter.ignore.invalidate();
                    }
                    Some(rel) if !rel.is_empty() && !skipped_by_watcher(&rel) => {
                        pending.insert(path, kind);
                        deadline = Some(Instant::now() + stability);
                    }
                    _ => {}
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                let batch = std::mem::take(&mut pending);
                let (ready, unstable) = settle(batch, stability);
                if !unstable.is_empty() {
                    pending.extend(unstable);
                    deadline = Some(Instant::now() + stability);
                }
                let changes = filter.apply(ready);
                if !changes.is_empty() {
                    log::debug!("watcher: flushing {} change(s)", changes.len());
                    sink(changes);
                }
            }
        }
    }
}

/// Split into changes ready to act on and files still being written.
fn settle(
    batch: HashMap<PathBuf, ChangeKind>,
    stability: Duration,
) -> (Vec<(PathBuf, ChangeKind)>, Vec<(PathBuf, ChangeKind)>) {
    let now = SystemTime::now();
    let mut ready = Vec::new();
    let mut unstable = Vec::new();
    for (path, kind) in batch {
        if kind == ChangeKind::Remove {
            ready.push((path, kind));
            continue;
        }
        match std::fs::metadata(&path) {
            Err(_) => ready.push((path, ChangeKind::Remove)),
            Ok(meta) => {
                let fresh = meta
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .map(|age| age < stability)
                    .unwrap_or(false);
                if fresh && meta.is_file() {
                    unstable.push((path, kind));
                } else {
                    ready.push((path, kind));
                }
            }
        }
    }
    (ready, unstable)
}

impl Filter {
    fn apply(&self, ready: Vec<(PathBuf, ChangeKind)>) -> Vec<Change> {
        let mut out = Vec::new();
        for (path, kind) in ready {
            if path.is_dir() {
                if kind == ChangeKind::Upsert {
                    // A directory that appeared in one go: take its files.
                    let walker = WalkDir::new(&path).into_iter().filter_entry(|e| {
                        e.depth() == 0 || !self.ignore.is_ignored_path(e.path(), e.file_type().is_dir())
                    });
                    for entry in walker.filter_map(|e| e.ok()) {
                        if entry.file_type().is_file() {
                            self.push(&mut out, entry.into_path(), ChangeKind::Upsert);
                        }
                    }
                }
                continue;
            }
            self.push(&mut out, path, kind);
        }
        out
    }

    fn push(&self, out: &mut Vec<Change>, path: PathBuf, kind: ChangeKind) {
        let Some(relative) = local_relative(&self.root, &path) else {
            return;
        };
        if skipped_by_watcher(&relative) || self.ignore.is_ignored(&relative, false) {
            log::trace!("watcher: ignoring {}", relative);
            return;
        }
        if kind == ChangeKind::Remove && !self.settings.delete_sync {
            log::debug!("watcher: {} deleted locally; delete sync is off", relative);
            return;
        }
        if kind == ChangeKind::Upsert && self.echo.is_echo(&path) {
            log::trace!("watcher: {} was just downloaded", relative);
            return;
        }
        out.push(Change {
            path,
            relative,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        seen: Arc<Mutex<Vec<Change>>>,
        detector: ChangeDetector,
        echo: Arc<EchoGuard>,
    }

    fn harness(delete_sync: bool, ignore_file: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        if let Some(body) = ignore_file {
            std::fs::write(dir.path().join(".syncignore"), body).unwrap();
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ChangeSink = Arc::new(move |changes: Vec<Change>| sink_seen.lock().unwrap().extend(changes));
        let ignore = Arc::new(IgnoreMatcher::new(dir.path(), ".syncignore", Vec::new()));
        let echo = Arc::new(EchoGuard::new(Duration::from_secs(5)));
        let detector = ChangeDetector::detached(
            dir.path(),
            WatchSettings {
                stability: Duration::from_millis(30),
                delete_sync,
            },
            ignore,
            echo.clone(),
            sink,
        );
        Harness {
            dir,
            seen,
            detector,
            echo,
        }
    }

    fn write_old(path: &Path, body: &str) {
        std::fs::write(path, body).unwrap();
        let old = SystemTime::now() - Duration::from_secs(60);
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(old)).unwrap();
    }

    #[tokio::test]
    async fn bursts_are_coalesced_into_one_change() {
        let h = harness(false, None);
        let file = h.dir.path().join("a.txt");
        write_old(&file, "x");
        for _ in 0..5 {
            h.detector.inject(&file, ChangeKind::Upsert);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        let seen = h.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].relative, "a.txt");
    }

    #[tokio::test]
    async fn ignored_files_never_reach_the_sink() {
        let h = harness(false, Some("*.log\n"));
        let log = h.dir.path().join("debug.log");
        write_old(&log, "noise");
        h.detector.inject(&log, ChangeKind::Upsert);
        h.detector.inject(h.dir.path().join(".git/HEAD"), ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletes_need_delete_sync() {
        let off = harness(false, None);
        off.detector.inject(off.dir.path().join("gone.txt"), ChangeKind::Remove);
        let on = harness(true, None);
        on.detector.inject(on.dir.path().join("gone.txt"), ChangeKind::Remove);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(off.seen.lock().unwrap().is_empty());
        let seen = on.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, ChangeKind::Remove);
    }

    #[tokio::test]
    async fn freshly_written_files_wait_until_stable() {
        let h = harness(false, None);
        let file = h.dir.path().join("big.bin");
        std::fs::write(&file, "partial").unwrap();
        h.detector.inject(&file, ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.seen.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn downloaded_files_are_not_echoed() {
        let h = harness(false, None);
        let file = h.dir.path().join("pulled.txt");
        write_old(&file, "remote");
        h.echo.note(&file);
        h.detector.inject(&file, ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_directories_expand_to_their_files() {
        let h = harness(false, None);
        let sub = h.dir.path().join("assets/img");
        std::fs::create_dir_all(&sub).unwrap();
        write_old(&sub.join("a.png"), "a");
        write_old(&h.dir.path().join("assets/b.css"), "b");
        h.detector.inject(h.dir.path().join("assets"), ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut rels: Vec<String> = h.seen.lock().unwrap().iter().map(|c| c.relative.clone()).collect();
        rels.sort();
        assert_eq!(rels, vec!["assets/b.css", "assets/img/a.png"]);
    }

    #[tokio::test]
    async fn hidden_entries_are_dropped_first() {
        let h = harness(false, None);
        write_old(&h.dir.path().join(".env"), "SECRET=1");
        std::fs::create_dir_all(h.dir.path().join(".cache")).unwrap();
        write_old(&h.dir.path().join(".cache/blob"), "x");
        write_old(&h.dir.path().join("index.html"), "<p>");
        h.detector.inject(h.dir.path().join(".env"), ChangeKind::Upsert);
        h.detector.inject(h.dir.path().join(".cache/blob"), ChangeKind::Upsert);
        h.detector.inject(h.dir.path().join("index.html"), ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let seen = h.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].relative, "index.html");
    }

    #[tokio::test]
    async fn editing_the_override_file_reloads_the_rules() {
        let h = harness(false, Some("*.tmp\n"));
        let rules = h.dir.path().join(".syncignore");
        let stamp = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&rules).unwrap());
        let tmp = h.dir.path().join("a.tmp");
        write_old(&tmp, "t");
        h.detector.inject(&tmp, ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.seen.lock().unwrap().is_empty());

        // Same mtime, new content: only the change event can reveal it.
        std::fs::write(&rules, "*.log\n").unwrap();
        filetime::set_file_mtime(&rules, stamp).unwrap();
        h.detector.inject(&rules, ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(20)).await;
        write_old(&h.dir.path().join("b.log"), "l");
        h.detector.inject(&tmp, ChangeKind::Upsert);
        h.detector.inject(h.dir.path().join("b.log"), ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let seen = h.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].relative, "a.tmp");
    }

    #[tokio::test]
    async fn ignored_subdirectories_are_not_expanded() {
        let h = harness(false, Some("cache/\n"));
        let sub = h.dir.path().join("site/cache");
        std::fs::create_dir_all(&sub).unwrap();
        write_old(&sub.join("page.html"), "c");
        write_old(&h.dir.path().join("site/index.html"), "i");
        h.detector.inject(h.dir.path().join("site"), ChangeKind::Upsert);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let rels: Vec<String> = h.seen.lock().unwrap().iter().map(|c| c.relative.clone()).collect();
        assert_eq!(rels, vec!["site/index.html"]);
    }

    #[test]
    fn echo_entries_expire_as_new_ones_arrive() {
        let echo = EchoGuard::new(Duration::from_millis(20));
        for i in 0..50 {
            echo.note(Path::new(&format!("/r/old{}.txt", i)));
        }
        std::thread::sleep(Duration::from_millis(40));
        echo.note(Path::new("/r/new.txt"));
        assert_eq!(echo.written.len(), 1);
        assert!(echo.is_echo(Path::new("/r/new.txt")));
    }

    #[test]
    fn rename_becomes_remove_and_upsert() {
        let ev = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/r/old"))
            .add_path(PathBuf::from("/r/new"));
        assert_eq!(
            convert_event(ev),
            vec![
                (PathBuf::from("/r/old"), ChangeKind::Remove),
                (PathBuf::from("/r/new"), ChangeKind::Upsert)
            ]
        );
    }
}
