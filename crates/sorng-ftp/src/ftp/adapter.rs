//! `TransferClient` implementation for [`FtpClient`].

use crate::ftp::client::FtpClient;
use crate::ftp::directory::may_be_directory;
use crate::ftp::error::{FtpError, FtpErrorKind};
use crate::ftp::types::{FtpEntry, FtpEntryKind};
use async_trait::async_trait;
use sorng_core::client::{ProgressFn, RemoteEntry, TransferClient};
use sorng_core::error::{SyncError, SyncResult};
use sorng_core::paths::join_remote;
use std::path::Path;

fn to_remote_entry(dir: &str, e: FtpEntry) -> RemoteEntry {
    RemoteEntry {
        path: join_remote(dir, &e.name),
        is_directory: e.kind == FtpEntryKind::Directory,
        name: e.name,
        size: e.size,
        modified: e.modified,
    }
}

fn sync_err(e: FtpError, path: &str) -> SyncError {
    SyncError::from(e).with_path(path)
}

#[async_trait]
impl TransferClient for FtpClient {
    async fn list(&mut self, path: &str) -> SyncResult<Vec<RemoteEntry>> {
        let entries = FtpClient::list(self, path)
            .await
            .map_err(|e| sync_err(e, path))?;
        Ok(entries
            .into_iter()
            .map(|e| to_remote_entry(path, e))
            .collect())
    }

    async fn stat(&mut self, path: &str) -> SyncResult<Option<RemoteEntry>> {
        let entry = FtpClient::stat(self, path)
            .await
            .map_err(|e| sync_err(e, path))?;
        Ok(entry.map(|e| RemoteEntry {
            path: path.to_string(),
            is_directory: e.kind == FtpEntryKind::Directory,
            name: e.name,
            size: e.size,
            modified: e.modified,
        }))
    }

    async fn upload_from(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &ProgressFn<'_>,
    ) -> SyncResult<u64> {
        self.upload(local, remote, progress)
            .await
            .map_err(|e| sync_err(e, remote))
    }

    async fn download_to(
        &mut self,
        remote: &str,
        local: &Path,
        progress: &ProgressFn<'_>,
    ) -> SyncResult<u64> {
        self.download(remote, local, progress)
            .await
            .map_err(|e| sync_err(e, remote))
    }

    async fn ensure_dir(&mut self, path: &str) -> SyncResult<()> {
        self.mkdir_all(path).await.map_err(|e| sync_err(e, path))
    }

    async fn remove(&mut self, path: &str) -> SyncResult<()> {
        let dele = match self.delete(path).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if !may_be_directory(&dele) {
            return Err(sync_err(dele, path));
        }
        match self.rmdir_recursive(path).await {
            Ok(()) => Ok(()),
            // Neither a file nor a directory: already gone.
            Err(e) if e.is_unavailable() || e.kind == FtpErrorKind::NotFound => {
                log::debug!("Remote {} already absent", path);
                Ok(())
            }
            Err(e) => Err(sync_err(e, path)),
        }
    }

    async fn rename(&mut self, from: &str, to: &str) -> SyncResult<()> {
        FtpClient::rename(self, from, to)
            .await
            .map_err(|e| sync_err(e, from))
    }

    async fn check_connection(&mut self) -> bool {
        self.noop().await.is_ok()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        self.quit().await
    }
}
