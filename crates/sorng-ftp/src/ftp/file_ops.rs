//! File-level operations: streaming RETR / STOR.

use crate::ftp::client::FtpClient;
use crate::ftp::error::{FtpError, FtpResult};
use chrono::{DateTime, Utc};
use sorng_core::client::ProgressFn;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

impl FtpClient {
    // ─── DOWNLOAD (RETR) ─────────────────────────────────────────

    /// Download a remote file to a local path, creating parent directories.
    pub async fn download(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        progress: &ProgressFn<'_>,
    ) -> FtpResult<u64> {
        self.ensure_open()?;
        let r = self.download_inner(remote_path, local_path, progress).await;
        self.track(r)
    }

    async fn download_inner(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        progress: &ProgressFn<'_>,
    ) -> FtpResult<u64> {
        // Size for progress, best effort.
        let total_bytes = if self.features.size {
            match self.size(remote_path).await {
                Ok(n) => Some(n),
                Err(e) if e.breaks_connection() => return Err(e),
                Err(_) => None,
            }
        } else {
            None
        };

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FtpError::local(parent, e))?;
        }

        let mut ds = self.begin_transfer(&format!("RETR {}", remote_path)).await?;
        let mut file = fs::File::create(local_path)
            .await
            .map_err(|e| FtpError::local(local_path, e))?;

        let mut transferred = 0u64;
        let mut buf = vec![0u8; self.config.chunk_size.max(4096)];
        loop {
            let n = ds
                .read(&mut buf)
                .await
                .map_err(|e| FtpError::data_channel(format!("RETR {}: {}", remote_path, e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| FtpError::local(local_path, e))?;
            transferred += n as u64;
            progress(transferred, total_bytes);
        }

        file.flush().await.map_err(|e| FtpError::local(local_path, e))?;
        drop(file);
        drop(ds);

        self.finish_transfer().await?;
        self.bytes_downloaded += transferred;
        log::debug!("RETR {} → {} ({} bytes)", remote_path, local_path.display(), transferred);
        Ok(transferred)
    }

    // ─── UPLOAD (STOR) ───────────────────────────────────────────

    /// Upload a local file to a remote path.
    pub async fn upload(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        progress: &ProgressFn<'_>,
    ) -> FtpResult<u64> {
        self.ensure_open()?;
        let r = self.upload_inner(local_path, remote_path, progress).await;
        self.track(r)
    }

    async fn upload_inner(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        progress: &ProgressFn<'_>,
    ) -> FtpResult<u64> {
        // Open before STOR so a vanished local file never truncates the remote one.
        let mut file = fs::File::open(local_path)
            .await
            .map_err(|e| FtpError::local(local_path, e))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| FtpError::local(local_path, e))?;
        let total_bytes = meta.len();

        let mut ds = self.begin_transfer(&format!("STOR {}", remote_path)).await?;

        let mut transferred = 0u64;
        let mut buf = vec![0u8; self.config.chunk_size.max(4096)];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| FtpError::local(local_path, e))?;
            if n == 0 {
                break;
            }
            ds.write_all(&buf[..n])
                .await
                .map_err(|e| FtpError::data_channel(format!("STOR {}: {}", remote_path, e)))?;
            transferred += n as u64;
            progress(transferred, Some(total_bytes));
        }
        ds.flush()
            .await
            .map_err(|e| FtpError::data_channel(format!("STOR {}: {}", remote_path, e)))?;
        ds.shutdown()
            .await
            .map_err(|e| FtpError::data_channel(format!("STOR {} close: {}", remote_path, e)))?;
        drop(ds);

        self.finish_transfer().await?;
        self.bytes_uploaded += transferred;
        log::debug!("STOR {} → {} ({} bytes)", local_path.display(), remote_path, transferred);

        // Carry the local mtime over so later comparisons see both sides equal.
        if self.features.mfmt {
            if let Ok(mtime) = meta.modified() {
                match self.set_modified(remote_path, DateTime::<Utc>::from(mtime)).await {
                    Ok(()) => {}
                    Err(e) if e.breaks_connection() => return Err(e),
                    Err(e) => log::debug!("MFMT {} ignored: {}", remote_path, e),
                }
            }
        }
        Ok(transferred)
    }
}
