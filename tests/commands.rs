use app_lib::commands::*;
use app_lib::{MemoryProfileStore, SyncManager};
use sorng_core::config::EngineConfig;
use sorng_core::error::SyncResult;
use sorng_core::profile::{ConflictPolicy, ConnectionProfile, Credential, Protocol, SyncMode};
use sorng_sync::sync::memory::{MemoryFactory, MemoryRemote};
use sorng_sync::sync::{DiffStatus, MemorySink, SessionState, TransferDirection};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn profile(dir: &Path) -> ConnectionProfile {
  ConnectionProfile {
    id: "blog".into(),
    name: None,
    host: "memory".into(),
    port: None,
    username: "deploy".into(),
    credential: Credential::Password {
      password: "pw".into(),
    },
    protocol: Protocol::Ftps,
    remote_root: "/public".into(),
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

fn manager(dir: &Path, remote: &MemoryRemote) -> SyncManager<MemoryFactory> {
  let store = MemoryProfileStore::new();
  store.insert(profile(dir));
  let remote = remote.clone();
  SyncManager::with_factory(
    Arc::new(store),
    EngineConfig {
      connect_jitter_ms: 0,
      ..EngineConfig::default()
    },
    Arc::new(MemorySink::new(200)),
    Arc::new(move |_: &ConnectionProfile, _: &EngineConfig| -> SyncResult<MemoryFactory> {
      Ok(remote.factory())
    }),
  )
}

#[tokio::test]
async fn start_status_stop_round() {
  let dir = TempDir::new().unwrap();
  let m = manager(dir.path(), &MemoryRemote::new());

  let status = sync_start(&m, "blog".into()).await.unwrap();
  assert_eq!(status.state, SessionState::Running);
  assert_eq!(sync_list_sessions(&m).await.unwrap(), vec!["blog".to_string()]);

  sync_stop(&m, "blog".into()).await.unwrap();
  let status = sync_get_status(&m, "blog".into()).await.unwrap();
  assert_eq!(status.state, SessionState::Stopped);
}

#[tokio::test]
async fn errors_come_back_as_strings() {
  let dir = TempDir::new().unwrap();
  let m = manager(dir.path(), &MemoryRemote::new());
  let err = sync_get_status(&m, "nope".into()).await.unwrap_err();
  assert!(err.contains("nope"));
  let err = sync_manual_upload(&m, "blog".into(), "../x".into(), None).await.unwrap_err();
  assert!(!err.is_empty());
  let err = sync_bulk(&m, "blog".into(), vec![], String::new(), Some(TransferDirection::Delete))
    .await
    .unwrap_err();
  assert!(err.contains("Bulk sync"));
}

#[tokio::test]
async fn manual_upload_then_compare() {
  let dir = TempDir::new().unwrap();
  std::fs::write(dir.path().join("post.md"), "hello").unwrap();
  let remote = MemoryRemote::new();
  let m = manager(dir.path(), &remote);

  let queued = sync_manual_upload(&m, "blog".into(), "post.md".into(), None).await.unwrap();
  assert!(queued.task_id.is_some());
  let session = m.session("blog").await.unwrap();
  session.wait_idle().await;

  assert_eq!(remote.file("/public/post.md").unwrap(), b"hello");
  let diff = sync_compare_folder(&m, "blog".into(), String::new(), false).await.unwrap();
  assert_eq!(diff.len(), 1);
  assert_eq!(diff[0].status, DiffStatus::Synchronized);

  let listing = sync_list_remote(&m, "blog".into(), "/public".into()).await.unwrap();
  assert_eq!(listing[0].name, "post.md");
}

#[tokio::test]
async fn bulk_download_is_fire_and_forget() {
  let dir = TempDir::new().unwrap();
  let remote = MemoryRemote::new();
  remote.put_file("/public/a/1.txt", b"1", chrono::Utc::now());
  remote.put_file("/public/a/2.txt", b"2", chrono::Utc::now());
  let m = manager(dir.path(), &remote);

  sync_bulk(&m, "blog".into(), vec!["a".into()], String::new(), Some(TransferDirection::Download))
    .await
    .unwrap();

  let deadline = std::time::Instant::now() + Duration::from_secs(5);
  while !dir.path().join("a/2.txt").exists() && std::time::Instant::now() < deadline {
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  m.session("blog").await.unwrap().wait_idle().await;
  assert_eq!(std::fs::read(dir.path().join("a/1.txt")).unwrap(), b"1");
  assert_eq!(std::fs::read(dir.path().join("a/2.txt")).unwrap(), b"2");
  let progress = sync_get_progress(&m, "blog".into()).await.unwrap();
  assert!(progress.transfers.is_empty());
}

#[tokio::test]
async fn connection_check_reports_steps() {
  let dir = TempDir::new().unwrap();
  let m = manager(dir.path(), &MemoryRemote::new());
  let report = sync_test_connection(&m, profile(dir.path())).await.unwrap();
  assert!(report.steps.iter().any(|s| s.name == "Login"));
}
