//! Session registry.
//!
//! `SyncManager` is created once by the host and passed around by
//! reference. It builds sessions lazily from the profile store, caches them
//! by connection id, and replaces a session when its stored profile changes.

use crate::sync::client::{check_connection, ClientFactory, ProtocolFactory};
use crate::sync::diff::DiffEntry;
use crate::sync::queue::{TaskHandle, TransferDirection};
use crate::sync::session::{BulkScan, ReconcileReport, SessionProgress, SessionStatus, SyncSession};
use crate::sync::sink::{LogCrateSink, LogSink};
use log::{info, warn};
use sorng_core::client::RemoteEntry;
use sorng_core::config::EngineConfig;
use sorng_core::diagnostics::ConnectionReport;
use sorng_core::error::{SyncError, SyncResult};
use sorng_core::profile::ConnectionProfile;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

// ─── Profile store ──────────────────────────────────────────────────

/// Source of connection profiles, credentials already decrypted.
pub trait ProfileStore: Send + Sync {
    fn get(&self, id: &str) -> SyncResult<ConnectionProfile>;

    fn ids(&self) -> Vec<String>;
}

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<String, ConnectionProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts either a JSON array of profiles or an object keyed by id.
    pub fn from_json(raw: &str) -> SyncResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| SyncError::invalid_config(format!("Invalid profiles file: {}", e)))?;
        let profiles: Vec<ConnectionProfile> = match value {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(_, v)| serde_json::from_value(v))
                .collect::<Result<_, _>>(),
            other => serde_json::from_value(other),
        }
        .map_err(|e| SyncError::invalid_config(format!("Invalid profile: {}", e)))?;

        let store = Self::new();
        for p in profiles {
            store.insert(p);
        }
        Ok(store)
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::from(e).with_path(path.display().to_string()))?;
        Self::from_json(&raw)
    }

    /// Insert or replace; returns the previous profile.
    pub fn insert(&self, profile: ConnectionProfile) -> Option<ConnectionProfile> {
        self.profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(profile.id.clone(), profile)
    }

    pub fn remove(&self, id: &str) -> Option<ConnectionProfile> {
        self.profiles.write().unwrap_or_else(|e| e.into_inner()).remove(id)
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, id: &str) -> SyncResult<ConnectionProfile> {
        self.profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::session_not_found(id))
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

// ─── Registry ───────────────────────────────────────────────────────

/// Builds the client factory for a profile.
pub type FactoryBuilder<F> = Arc<dyn Fn(&ConnectionProfile, &EngineConfig) -> SyncResult<F> + Send + Sync>;

/// Shared handle the host keeps for the lifetime of the process.
pub type SyncManagerState<F = ProtocolFactory> = Arc<SyncManager<F>>;

pub struct SyncManager<F: ClientFactory = ProtocolFactory> {
    store: Arc<dyn ProfileStore>,
    config: EngineConfig,
    sink: Arc<dyn LogSink>,
    build: FactoryBuilder<F>,
    sessions: Mutex<HashMap<String, Arc<SyncSession<F>>>>,
}

impl SyncManager<ProtocolFactory> {
    /// Registry over real FTP / FTPS / SFTP connections.
    pub fn new(store: Arc<dyn ProfileStore>, config: EngineConfig) -> SyncManagerState {
        Arc::new(Self::with_factory(
            store,
            config,
            Arc::new(LogCrateSink),
            Arc::new(ProtocolFactory::new),
        ))
    }
}

impl<F: ClientFactory> SyncManager<F> {
    pub fn with_factory(
        store: Arc<dyn ProfileStore>,
        config: EngineConfig,
        sink: Arc<dyn LogSink>,
        build: FactoryBuilder<F>,
    ) -> Self {
        Self {
            store,
            config,
            sink,
            build,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Cached session for `id`, created on first use. A session whose
    /// profile no longer matches the store is stopped and replaced.
    pub async fn get_or_create(&self, id: &str) -> SyncResult<Arc<SyncSession<F>>> {
        let profile = self.store.get(id)?;
        profile.validate()?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(id) {
            if existing.profile() == &profile {
                return Ok(existing.clone());
            }
            info!("sync: profile {} changed, replacing its session", id);
            if let Some(stale) = sessions.remove(id) {
                stale.stop().await;
            }
        }

        let factory = (self.build)(&profile, &self.config)?;
        let session = SyncSession::new(profile, self.config.clone(), factory, self.sink.clone());
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    /// Existing session only; never creates one.
    pub async fn session(&self, id: &str) -> Option<Arc<SyncSession<F>>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Stop and forget a session. Returns whether one existed.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    /// Drop the cached session so the next reference rebuilds it from the
    /// store.
    pub async fn invalidate(&self, id: &str) {
        if self.remove(id).await {
            info!("sync: session {} invalidated", id);
        }
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every session and empty the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (id, session) in drained {
            session.stop().await;
            info!("sync: session {} shut down", id);
        }
    }

    /// Connect, probe and list the remote root without touching the
    /// registry.
    pub async fn test_connection(&self, profile: &ConnectionProfile) -> SyncResult<ConnectionReport> {
        let factory = (self.build)(profile, &self.config)?;
        let report = check_connection(&factory, profile).await;
        if !report.success {
            warn!("sync: connection check for {} failed: {}", profile.display_name(), report.summary);
        }
        Ok(report)
    }

    // ─── Per-session operations ──────────────────────────────────

    pub async fn start(&self, id: &str) -> SyncResult<SessionStatus> {
        let session = self.get_or_create(id).await?;
        session.start().await?;
        Ok(session.status())
    }

    /// Stopping an unknown or idle session is not an error.
    pub async fn stop(&self, id: &str) -> SyncResult<()> {
        if let Some(session) = self.session(id).await {
            session.stop().await;
        }
        Ok(())
    }

    pub async fn manual_upload(
        &self,
        id: &str,
        local_name: &str,
        remote_name: Option<&str>,
    ) -> SyncResult<Option<TaskHandle>> {
        self.get_or_create(id).await?.manual_upload(local_name, remote_name).await
    }

    pub async fn manual_download(&self, id: &str, remote_path: &str) -> SyncResult<Option<TaskHandle>> {
        self.get_or_create(id).await?.manual_download(remote_path).await
    }

    pub async fn bulk_sync(
        &self,
        id: &str,
        items: Vec<String>,
        base_path: &str,
        direction: TransferDirection,
    ) -> SyncResult<JoinHandle<BulkScan>> {
        Ok(self.get_or_create(id).await?.bulk_sync(items, base_path, direction))
    }

    pub async fn reconcile_now(&self, id: &str) -> SyncResult<Option<ReconcileReport>> {
        Ok(self.get_or_create(id).await?.reconcile_now().await)
    }

    pub async fn status(&self, id: &str) -> SyncResult<SessionStatus> {
        Ok(self.get_or_create(id).await?.status())
    }

    pub async fn progress(&self, id: &str) -> SyncResult<SessionProgress> {
        Ok(self.get_or_create(id).await?.progress())
    }

    pub async fn compare_folder(&self, id: &str, path: &str, recursive: bool) -> SyncResult<Vec<DiffEntry>> {
        self.get_or_create(id).await?.compare_folder(path, recursive).await
    }

    pub async fn list_remote(&self, id: &str, path: &str) -> SyncResult<Vec<RemoteEntry>> {
        self.get_or_create(id).await?.list_remote(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::{MemoryFactory, MemoryRemote};
    use crate::sync::session::SessionState;
    use crate::sync::sink::MemorySink;
    use sorng_core::profile::{ConflictPolicy, Credential, Protocol, SyncMode};
    use tempfile::TempDir;

    fn profile(id: &str, dir: &Path) -> ConnectionProfile {
        ConnectionProfile {
            id: id.into(),
            name: None,
            host: "memory".into(),
            port: None,
            username: "u".into(),
            credential: Credential::Password {
                password: "p".into(),
            },
            protocol: Protocol::Ftp,
            remote_root: "/".into(),
            local_root: dir.to_path_buf(),
            sync_mode: SyncMode::DownloadOnly,
            pool_size: 2,
            buffer_size_mb: 1.0,
            conflict_policy: ConflictPolicy::Overwrite,
            delete_sync: false,
            exclude_patterns: String::new(),
            accept_invalid_certs: false,
        }
    }

    fn manager(store: Arc<MemoryProfileStore>, remote: &MemoryRemote) -> SyncManager<MemoryFactory> {
        let remote = remote.clone();
        SyncManager::with_factory(
            store,
            EngineConfig {
                connect_jitter_ms: 0,
                ..EngineConfig::default()
            },
            Arc::new(MemorySink::new(100)),
            Arc::new(move |_: &ConnectionProfile, _: &EngineConfig| -> SyncResult<MemoryFactory> {
                Ok(remote.factory())
            }),
        )
    }

    #[tokio::test]
    async fn sessions_are_cached_by_id() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryProfileStore::new());
        store.insert(profile("a", dir.path()));
        let m = manager(store, &MemoryRemote::new());

        let first = m.get_or_create("a").await.unwrap();
        let second = m.get_or_create("a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(m.active_sessions().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn unknown_id_is_session_not_found() {
        let m = manager(Arc::new(MemoryProfileStore::new()), &MemoryRemote::new());
        let err = m.status("missing").await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn profile_edit_replaces_the_session() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryProfileStore::new());
        store.insert(profile("a", dir.path()));
        let m = manager(store.clone(), &MemoryRemote::new());

        let before = m.get_or_create("a").await.unwrap();
        m.start("a").await.unwrap();
        let mut edited = profile("a", dir.path());
        edited.pool_size = 4;
        store.insert(edited);

        let after = m.get_or_create("a").await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.state(), SessionState::Stopped);
        assert_eq!(after.profile().pool_size, 4);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryProfileStore::new());
        store.insert(profile("a", dir.path()));
        store.insert(profile("b", dir.path()));
        let remote = MemoryRemote::new();
        let m = manager(store, &remote);
        m.start("a").await.unwrap();
        m.start("b").await.unwrap();
        assert!(remote.counters().live_connections > 0);

        m.shutdown().await;
        assert!(m.active_sessions().await.is_empty());
        assert_eq!(remote.counters().live_connections, 0);
        assert!(m.stop("a").await.is_ok());
    }

    #[tokio::test]
    async fn remove_reports_whether_a_session_existed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryProfileStore::new());
        store.insert(profile("a", dir.path()));
        let m = manager(store, &MemoryRemote::new());
        assert!(!m.remove("a").await);
        m.get_or_create("a").await.unwrap();
        assert!(m.remove("a").await);
        assert!(m.session("a").await.is_none());
    }

    #[tokio::test]
    async fn connection_check_does_not_register() {
        let dir = TempDir::new().unwrap();
        let m = manager(Arc::new(MemoryProfileStore::new()), &MemoryRemote::new());
        let report = m.test_connection(&profile("x", dir.path())).await.unwrap();
        assert!(report.success);
        assert!(m.active_sessions().await.is_empty());
    }

    #[test]
    fn profiles_load_from_array_or_map() {
        let one = r#"{"id":"a","host":"h","username":"u","credential":{"type":"password","password":"p"},
                      "protocol":"sftp","remoteRoot":"/","localRoot":"/tmp/a"}"#;
        let array = format!("[{}]", one);
        let map = format!("{{\"a\": {}}}", one);
        assert_eq!(MemoryProfileStore::from_json(&array).unwrap().ids(), vec!["a"]);
        assert_eq!(MemoryProfileStore::from_json(&map).unwrap().ids(), vec!["a"]);
        assert!(MemoryProfileStore::from_json("{").is_err());
    }
}
