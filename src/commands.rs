//! Command bindings for the sync engine.
//!
//! Thin wrappers that take the registry and delegate to it. Every command
//! returns `Result<T, String>` so an RPC layer can hand errors straight to
//! its caller.

use serde::{Deserialize, Serialize};
use sorng_core::client::RemoteEntry;
use sorng_core::diagnostics::ConnectionReport;
use sorng_core::profile::ConnectionProfile;
use sorng_sync::sync::client::ClientFactory;
use sorng_sync::sync::session::{ReconcileReport, SessionProgress, SessionStatus};
use sorng_sync::sync::{DiffEntry, SyncManager, TransferDirection};

/// What a queueing command reports back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
  /// `None` when an identical transfer was already queued.
  pub task_id: Option<String>,
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

pub async fn sync_start<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
) -> Result<SessionStatus, String> {
  Ok(state.start(&connection_id).await?)
}

pub async fn sync_stop<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
) -> Result<(), String> {
  Ok(state.stop(&connection_id).await?)
}

/// Forget the cached session so the next command rebuilds it from the
/// store. Hosts call this after editing a profile.
pub async fn sync_invalidate<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
) -> Result<(), String> {
  state.invalidate(&connection_id).await;
  Ok(())
}

pub async fn sync_test_connection<F: ClientFactory>(
  state: &SyncManager<F>,
  profile: ConnectionProfile,
) -> Result<ConnectionReport, String> {
  Ok(state.test_connection(&profile).await?)
}

// ── Transfers ────────────────────────────────────────────────────────────────

pub async fn sync_manual_upload<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
  local_name: String,
  remote_name: Option<String>,
) -> Result<QueuedTask, String> {
  let handle = state
    .manual_upload(&connection_id, &local_name, remote_name.as_deref())
    .await?;
  Ok(QueuedTask {
    task_id: handle.map(|h| h.id),
  })
}

pub async fn sync_manual_download<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
  remote_path: String,
) -> Result<QueuedTask, String> {
  let handle = state.manual_download(&connection_id, &remote_path).await?;
  Ok(QueuedTask {
    task_id: handle.map(|h| h.id),
  })
}

/// Starts the scan and returns; progress shows up in `sync_get_progress`.
pub async fn sync_bulk<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
  items: Vec<String>,
  base_path: String,
  direction: Option<TransferDirection>,
) -> Result<(), String> {
  let direction = direction.unwrap_or(TransferDirection::Upload);
  if direction == TransferDirection::Delete {
    return Err("Bulk sync only uploads or downloads".to_string());
  }
  state
    .bulk_sync(&connection_id, items, &base_path, direction)
    .await?;
  Ok(())
}

pub async fn sync_reconcile_now<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
) -> Result<Option<ReconcileReport>, String> {
  Ok(state.reconcile_now(&connection_id).await?)
}

// ── Queries ──────────────────────────────────────────────────────────────────

pub async fn sync_get_status<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
) -> Result<SessionStatus, String> {
  Ok(state.status(&connection_id).await?)
}

pub async fn sync_get_progress<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
) -> Result<SessionProgress, String> {
  Ok(state.progress(&connection_id).await?)
}

pub async fn sync_compare_folder<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
  path: String,
  recursive: bool,
) -> Result<Vec<DiffEntry>, String> {
  Ok(state.compare_folder(&connection_id, &path, recursive).await?)
}

pub async fn sync_list_remote<F: ClientFactory>(
  state: &SyncManager<F>,
  connection_id: String,
  path: String,
) -> Result<Vec<RemoteEntry>, String> {
  Ok(state.list_remote(&connection_id, &path).await?)
}

pub async fn sync_list_sessions<F: ClientFactory>(state: &SyncManager<F>) -> Result<Vec<String>, String> {
  Ok(state.active_sessions().await)
}
