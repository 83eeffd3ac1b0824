// ── Streaming uploads & downloads ────────────────────────────────────────────
//
// The copy loop runs on the blocking pool; progress is sent back over an
// unbounded channel and reported from the async side, so the caller's
// callback never runs on a libssh2 thread.

use crate::sftp::client::{SessionHandle, SftpClient};
use crate::sftp::error::{SftpError, SftpResult};
use sorng_core::client::ProgressFn;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::sync::mpsc;

type ProgressTx = mpsc::UnboundedSender<(u64, Option<u64>)>;

fn upload_blocking(
    h: &mut SessionHandle,
    local: &Path,
    remote: &str,
    chunk_size: usize,
    tx: ProgressTx,
) -> SftpResult<u64> {
    // Open locally first so a vanished source never truncates the remote file.
    let mut src = std::fs::File::open(local).map_err(|e| SftpError::local(local, e))?;
    let meta = src.metadata().map_err(|e| SftpError::local(local, e))?;
    let total = meta.len();

    let mut dst = h
        .sftp
        .open_mode(
            Path::new(remote),
            ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE,
            0o644,
            ssh2::OpenType::File,
        )
        .map_err(|e| SftpError::from_ssh(&format!("open {}", remote), e))?;

    let mut transferred = 0u64;
    let mut buf = vec![0u8; chunk_size.max(4096)];
    loop {
        let n = src.read(&mut buf).map_err(|e| SftpError::local(local, e))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .map_err(|e| SftpError::disconnected(format!("write {}: {}", remote, e)))?;
        transferred += n as u64;
        let _ = tx.send((transferred, Some(total)));
    }
    drop(dst);

    // Carry the local mtime over so later comparisons see both sides equal.
    if let Some(secs) = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
    {
        let stat = ssh2::FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(secs),
            mtime: Some(secs),
        };
        if let Err(e) = h.sftp.setstat(Path::new(remote), stat) {
            log::debug!("setstat {} ignored: {}", remote, e);
        }
    }
    Ok(transferred)
}

fn download_blocking(
    h: &mut SessionHandle,
    remote: &str,
    local: &Path,
    chunk_size: usize,
    tx: ProgressTx,
) -> SftpResult<u64> {
    let mut src = h
        .sftp
        .open(Path::new(remote))
        .map_err(|e| SftpError::from_ssh(&format!("open {}", remote), e))?;
    let total = src.stat().ok().and_then(|s| s.size);

    if let Some(parent) = local.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SftpError::local(parent, e))?;
    }
    let mut dst = std::fs::File::create(local).map_err(|e| SftpError::local(local, e))?;

    let mut transferred = 0u64;
    let mut buf = vec![0u8; chunk_size.max(4096)];
    loop {
        let n = src
            .read(&mut buf)
            .map_err(|e| SftpError::disconnected(format!("read {}: {}", remote, e)))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .map_err(|e| SftpError::local(local, e))?;
        transferred += n as u64;
        let _ = tx.send((transferred, total));
    }
    dst.flush().map_err(|e| SftpError::local(local, e))?;
    Ok(transferred)
}

impl SftpClient {
    pub async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &ProgressFn<'_>,
    ) -> SftpResult<u64> {
        self.ensure_open()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (local_owned, remote_owned): (PathBuf, String) = (local.to_path_buf(), remote.to_string());
        let chunk = self.config.chunk_size;
        let task = self.spawn(move |h| upload_blocking(h, &local_owned, &remote_owned, chunk, tx));

        // The sender lives in the task; the channel closes when it finishes.
        while let Some((done, total)) = rx.recv().await {
            progress(done, total);
        }
        let n = self.join(task).await?;
        self.bytes_uploaded += n;
        log::debug!("SFTP put {} → {} ({} bytes)", local.display(), remote, n);
        Ok(n)
    }

    pub async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        progress: &ProgressFn<'_>,
    ) -> SftpResult<u64> {
        self.ensure_open()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (remote_owned, local_owned): (String, PathBuf) = (remote.to_string(), local.to_path_buf());
        let chunk = self.config.chunk_size;
        let task = self.spawn(move |h| download_blocking(h, &remote_owned, &local_owned, chunk, tx));

        while let Some((done, total)) = rx.recv().await {
            progress(done, total);
        }
        let n = self.join(task).await?;
        self.bytes_downloaded += n;
        log::debug!("SFTP get {} → {} ({} bytes)", remote, local.display(), n);
        Ok(n)
    }
}
