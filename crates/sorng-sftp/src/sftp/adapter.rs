// ── TransferClient implementation ────────────────────────────────────────────

use crate::sftp::client::SftpClient;
use crate::sftp::error::SftpError;
use async_trait::async_trait;
use sorng_core::client::{ProgressFn, RemoteEntry, TransferClient};
use sorng_core::error::{SyncError, SyncResult};
use std::path::Path;

fn sync_err(e: SftpError, path: &str) -> SyncError {
    SyncError::from(e).with_path(path)
}

#[async_trait]
impl TransferClient for SftpClient {
    async fn list(&mut self, path: &str) -> SyncResult<Vec<RemoteEntry>> {
        self.list_directory(path).await.map_err(|e| sync_err(e, path))
    }

    async fn stat(&mut self, path: &str) -> SyncResult<Option<RemoteEntry>> {
        self.stat_path(path).await.map_err(|e| sync_err(e, path))
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
        self.create_dir_all(path).await.map_err(|e| sync_err(e, path))
    }

    async fn remove(&mut self, path: &str) -> SyncResult<()> {
        self.remove_path(path).await.map_err(|e| sync_err(e, path))
    }

    async fn rename(&mut self, from: &str, to: &str) -> SyncResult<()> {
        self.rename_path(from, to).await.map_err(|e| sync_err(e, from))
    }

    async fn check_connection(&mut self) -> bool {
        self.ping().await.is_ok()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        self.disconnect().await
    }
}
