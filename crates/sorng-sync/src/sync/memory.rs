//! In-process remote endpoint.
//!
//! `MemoryRemote` behaves like a server holding a directory tree: clients
//! opened through [`MemoryFactory`] share it. It can delay transfers, refuse
//! connections, fail a chosen upload once and counts what happened, which is
//! what the engine's concurrency tests need. No network is involved.

use crate::sync::client::ClientFactory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sorng_core::client::{ProgressFn, RemoteEntry, TransferClient};
use sorng_core::error::{SyncError, SyncResult};
use sorng_core::paths::{remote_file_name, remote_parent};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Snapshot of the remote's activity counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub connects: usize,
    pub refused_connects: usize,
    pub live_connections: usize,
    pub peak_connections: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub stats: usize,
    pub probes: usize,
    pub ensure_dir_calls: usize,
    pub removes: usize,
}

#[derive(Default)]
struct MemState {
    files: BTreeMap<String, MemFile>,
    dirs: BTreeSet<String>,
    counters: MemoryCounters,
    max_connections: Option<usize>,
    connect_failures: Vec<SyncError>,
    upload_failures: HashMap<String, SyncError>,
    probes_fail: bool,
}

#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemState>>,
    transfer_delay: Duration,
    connect_delay: Duration,
    list_delay: Duration,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut state = MemState::default();
        state.dirs.insert("/".into());
        Self {
            state: Arc::new(Mutex::new(state)),
            transfer_delay: Duration::ZERO,
            connect_delay: Duration::ZERO,
            list_delay: Duration::ZERO,
        }
    }

    /// Every upload and download takes at least `delay`.
    pub fn with_transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = delay;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Every directory listing takes at least `delay`.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn factory(&self) -> MemoryFactory {
        MemoryFactory {
            remote: self.clone(),
        }
    }

    /// A connected client that bypasses limits and injected failures.
    pub fn client(&self) -> MemoryClient {
        let mut st = self.lock();
        st.counters.connects += 1;
        st.counters.live_connections += 1;
        st.counters.peak_connections = st.counters.peak_connections.max(st.counters.live_connections);
        MemoryClient {
            remote: self.clone(),
            closed: false,
        }
    }

    pub fn counters(&self) -> MemoryCounters {
        self.lock().counters.clone()
    }

    /// Refuse connections beyond `max` with a "too many connections" error.
    pub fn set_max_connections(&self, max: usize) {
        self.lock().max_connections = Some(max);
    }

    /// Fail the next connection attempts with these errors, in order.
    pub fn fail_connects(&self, errors: Vec<SyncError>) {
        self.lock().connect_failures = errors;
    }

    /// Fail the next upload to `path` once with `error`.
    pub fn fail_upload_once(&self, path: &str, error: SyncError) {
        self.lock().upload_failures.insert(path.to_string(), error);
    }

    pub fn set_probes_fail(&self, fail: bool) {
        self.lock().probes_fail = fail;
    }

    pub fn put_file(&self, path: &str, data: &[u8], modified: DateTime<Utc>) {
        let mut st = self.lock();
        add_ancestors(&mut st.dirs, path);
        st.files.insert(
            path.to_string(),
            MemFile {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn mkdir(&self, path: &str) {
        let mut st = self.lock();
        add_ancestors(&mut st.dirs, path);
        st.dirs.insert(path.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).map(|f| f.data.clone())
    }

    pub fn modified(&self, path: &str) -> Option<DateTime<Utc>> {
        self.lock().files.get(path).map(|f| f.modified)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    fn open_connection(&self) -> SyncResult<MemoryClient> {
        let mut st = self.lock();
        if !st.connect_failures.is_empty() {
            let err = st.connect_failures.remove(0);
            st.counters.refused_connects += 1;
            return Err(err);
        }
        if let Some(max) = st.max_connections {
            if st.counters.live_connections >= max {
                st.counters.refused_connects += 1;
                return Err(SyncError::connection_limit(format!(
                    "421 Too many connections ({}) from this IP",
                    max
                )));
            }
        }
        drop(st);
        Ok(self.client())
    }
}

fn add_ancestors(dirs: &mut BTreeSet<String>, path: &str) {
    let mut parent = remote_parent(path);
    while let Some(p) = parent {
        parent = remote_parent(&p);
        dirs.insert(p);
    }
}

fn is_below(path: &str, dir: &str) -> bool {
    dir == "/" || path.starts_with(&format!("{}/", dir.trim_end_matches('/')))
}

// ─── Factory ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryFactory {
    remote: MemoryRemote,
}

#[async_trait]
impl ClientFactory for MemoryFactory {
    type Client = MemoryClient;

    async fn connect(&self) -> SyncResult<MemoryClient> {
        if !self.remote.connect_delay.is_zero() {
            tokio::time::sleep(self.remote.connect_delay).await;
        }
        self.remote.open_connection()
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

// ─── Client ─────────────────────────────────────────────────────────

pub struct MemoryClient {
    remote: MemoryRemote,
    closed: bool,
}

/// Counts a transfer as in flight for as long as it lives.
struct InFlight<'a>(&'a MemoryRemote);

impl<'a> InFlight<'a> {
    fn start(remote: &'a MemoryRemote) -> Self {
        let mut st = remote.lock();
        st.counters.in_flight += 1;
        st.counters.peak_in_flight = st.counters.peak_in_flight.max(st.counters.in_flight);
        Self(remote)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().counters.in_flight -= 1;
    }
}

impl MemoryClient {
    fn check_open(&self) -> SyncResult<()> {
        if self.closed {
            Err(SyncError::connection_lost("not connected"))
        } else {
            Ok(())
        }
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.remote.lock().counters.live_connections -= 1;
        }
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl TransferClient for MemoryClient {
    async fn list(&mut self, path: &str) -> SyncResult<Vec<RemoteEntry>> {
        self.check_open()?;
        if !self.remote.list_delay.is_zero() {
            tokio::time::sleep(self.remote.list_delay).await;
        }
        let st = self.remote.lock();
        if !st.dirs.contains(path) {
            return Err(SyncError::not_found(format!("{}: No such directory", path)).with_path(path));
        }
        let parent = Some(path.to_string());
        let mut out: Vec<RemoteEntry> = st
            .dirs
            .iter()
            .filter(|d| d.as_str() != "/" && remote_parent(d) == parent)
            .map(|d| RemoteEntry {
                name: remote_file_name(d).to_string(),
                path: d.clone(),
                size: 0,
                modified: None,
                is_directory: true,
            })
            .collect();
        out.extend(
            st.files
                .iter()
                .filter(|(p, _)| remote_parent(p) == parent)
                .map(|(p, f)| RemoteEntry {
                    name: remote_file_name(p).to_string(),
                    path: p.clone(),
                    size: f.data.len() as u64,
                    modified: Some(f.modified),
                    is_directory: false,
                }),
        );
        Ok(out)
    }

    async fn stat(&mut self, path: &str) -> SyncResult<Option<RemoteEntry>> {
        self.check_open()?;
        let mut st = self.remote.lock();
        st.counters.stats += 1;
        if let Some(f) = st.files.get(path) {
            return Ok(Some(RemoteEntry {
                name: remote_file_name(path).to_string(),
                path: path.to_string(),
                size: f.data.len() as u64,
                modified: Some(f.modified),
                is_directory: false,
            }));
        }
        Ok(st.dirs.contains(path).then(|| RemoteEntry {
            name: remote_file_name(path).to_string(),
            path: path.to_string(),
            size: 0,
            modified: None,
            is_directory: true,
        }))
    }

    async fn upload_from(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &ProgressFn<'_>,
    ) -> SyncResult<u64> {
        self.check_open()?;
        let _flight = InFlight::start(&self.remote);
        if !self.remote.transfer_delay.is_zero() {
            tokio::time::sleep(self.remote.transfer_delay).await;
        }
        if let Some(err) = self.remote.lock().upload_failures.remove(remote) {
            return Err(err.with_path(remote));
        }

        let data = tokio::fs::read(local).await?;
        let modified = tokio::fs::metadata(local)
            .await?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let len = data.len() as u64;

        let mut st = self.remote.lock();
        let parent = remote_parent(remote).unwrap_or_else(|| "/".into());
        if !st.dirs.contains(&parent) {
            return Err(SyncError::not_found(format!("{}: parent directory missing", remote))
                .with_path(remote));
        }
        st.files.insert(remote.to_string(), MemFile { data, modified });
        st.counters.uploads += 1;
        drop(st);

        progress(len / 2, Some(len));
        progress(len, Some(len));
        Ok(len)
    }

    async fn download_to(
        &mut self,
        remote: &str,
        local: &Path,
        progress: &ProgressFn<'_>,
    ) -> SyncResult<u64> {
        self.check_open()?;
        let _flight = InFlight::start(&self.remote);
        if !self.remote.transfer_delay.is_zero() {
            tokio::time::sleep(self.remote.transfer_delay).await;
        }
        let file = self.remote.lock().files.get(remote).cloned().ok_or_else(|| {
            SyncError::not_found(format!("{}: No such file", remote)).with_path(remote)
        })?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &file.data).await?;
        self.remote.lock().counters.downloads += 1;
        let len = file.data.len() as u64;
        progress(len, Some(len));
        Ok(len)
    }

    async fn ensure_dir(&mut self, path: &str) -> SyncResult<()> {
        self.check_open()?;
        let mut st = self.remote.lock();
        st.counters.ensure_dir_calls += 1;
        if st.files.contains_key(path) {
            return Err(SyncError::command_rejected(format!("{} is a file", path)));
        }
        add_ancestors(&mut st.dirs, path);
        st.dirs.insert(path.to_string());
        Ok(())
    }

    async fn remove(&mut self, path: &str) -> SyncResult<()> {
        self.check_open()?;
        let mut st = self.remote.lock();
        st.counters.removes += 1;
        if st.files.remove(path).is_some() {
            return Ok(());
        }
        if st.dirs.remove(path) {
            st.files.retain(|p, _| !is_below(p, path));
            st.dirs.retain(|d| !is_below(d, path) || d == "/");
        }
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str) -> SyncResult<()> {
        self.check_open()?;
        let mut st = self.remote.lock();
        match st.files.remove(from) {
            Some(f) => {
                st.files.insert(to.to_string(), f);
                Ok(())
            }
            None => Err(SyncError::not_found(format!("{}: No such file", from)).with_path(from)),
        }
    }

    async fn check_connection(&mut self) -> bool {
        let mut st = self.remote.lock();
        st.counters.probes += 1;
        !self.closed && !st.probes_fail
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_dir_is_idempotent() {
        let remote = MemoryRemote::new();
        let mut c = remote.client();
        c.ensure_dir("/a/b").await.unwrap();
        c.ensure_dir("/a/b").await.unwrap();
        assert!(remote.is_dir("/a"));
        let listing = c.list("/a").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_directory);
    }

    #[tokio::test]
    async fn remove_missing_is_ok_rename_missing_is_not() {
        let remote = MemoryRemote::new();
        let mut c = remote.client();
        c.remove("/nope").await.unwrap();
        let err = c.rename("/nope", "/other").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn connection_limit_and_close_accounting() {
        let remote = MemoryRemote::new();
        remote.set_max_connections(1);
        let factory = remote.factory();
        let mut first = factory.connect().await.unwrap();
        let err = factory.connect().await.err().unwrap();
        assert!(err.is_transient());
        first.close().await;
        first.close().await;
        assert_eq!(remote.counters().live_connections, 0);
        assert!(factory.connect().await.is_ok());
    }
}
