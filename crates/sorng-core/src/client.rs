//! The protocol-neutral transfer contract.
//!
//! Both adapters (FTP/FTPS and SFTP) implement [`TransferClient`]; the sync
//! engine only ever talks to this trait. Connecting is the adapters' own
//! business (each exposes an async `connect`), everything after the
//! handshake goes through here.

use crate::error::SyncResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One entry of a remote listing or a remote stat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    /// Absolute remote path.
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
}

/// Progress callback: `(bytes transferred so far, total bytes if known)`.
pub type ProgressFn<'a> = dyn Fn(u64, Option<u64>) + Send + Sync + 'a;

#[async_trait]
pub trait TransferClient: Send {
    /// List a directory. Fails with `NotFound` / `PermissionDenied`.
    async fn list(&mut self, path: &str) -> SyncResult<Vec<RemoteEntry>>;

    /// Stat a path. A missing target is `Ok(None)`, not an error.
    async fn stat(&mut self, path: &str) -> SyncResult<Option<RemoteEntry>>;

    /// Stream a local file to `remote`, returning the bytes written.
    async fn upload_from(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &ProgressFn<'_>,
    ) -> SyncResult<u64>;

    /// Stream `remote` into a local file, returning the bytes read.
    async fn download_to(
        &mut self,
        remote: &str,
        local: &Path,
        progress: &ProgressFn<'_>,
    ) -> SyncResult<u64>;

    /// Create `path` and any missing parents. Existing directories are fine.
    async fn ensure_dir(&mut self, path: &str) -> SyncResult<()>;

    /// Remove a file or directory tree. A missing target counts as success.
    async fn remove(&mut self, path: &str) -> SyncResult<()>;

    /// Rename / move. A missing source is an error.
    async fn rename(&mut self, from: &str, to: &str) -> SyncResult<()>;

    /// Cheap liveness probe with no side effects on the remote tree.
    async fn check_connection(&mut self) -> bool;

    fn is_closed(&self) -> bool;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self);
}
