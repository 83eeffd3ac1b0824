// ── Directory operations ─────────────────────────────────────────────────────

use crate::sftp::client::{SessionHandle, SftpClient};
use crate::sftp::error::{SftpError, SftpErrorKind, SftpResult};
use chrono::{DateTime, TimeZone, Utc};
use sorng_core::client::RemoteEntry;
use sorng_core::paths::{join_remote, remote_file_name};
use ssh2::{FileStat, Sftp};
use std::path::Path;

pub(crate) fn stat_time(stat: &FileStat) -> Option<DateTime<Utc>> {
    stat.mtime
        .and_then(|t| Utc.timestamp_opt(t as i64, 0).single())
}

fn to_entry(path: &str, stat: &FileStat) -> RemoteEntry {
    RemoteEntry {
        name: remote_file_name(path).to_string(),
        path: path.to_string(),
        size: stat.size.unwrap_or(0),
        modified: stat_time(stat),
        is_directory: stat.is_dir(),
    }
}

// ── Blocking helpers ─────────────────────────────────────────────────────────

fn read_dir(sftp: &Sftp, path: &str) -> SftpResult<Vec<RemoteEntry>> {
    let raw = sftp
        .readdir(Path::new(path))
        .map_err(|e| SftpError::from_ssh(&format!("readdir {}", path), e))?;
    Ok(raw
        .into_iter()
        .filter_map(|(p, stat)| {
            let name = p.file_name()?.to_string_lossy().into_owned();
            if name == "." || name == ".." {
                return None;
            }
            Some(to_entry(&join_remote(path, &name), &stat))
        })
        .collect())
}

fn lookup(sftp: &Sftp, path: &str) -> SftpResult<Option<FileStat>> {
    match sftp.stat(Path::new(path)) {
        Ok(s) => Ok(Some(s)),
        Err(e) => {
            let e = SftpError::from_ssh(&format!("stat {}", path), e);
            if e.kind == SftpErrorKind::NotFound {
                Ok(None)
            } else {
                Err(e)
            }
        }
    }
}

fn mkdir_all(sftp: &Sftp, path: &str) -> SftpResult<()> {
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);

        match lookup(sftp, &current)? {
            Some(s) if s.is_dir() => continue,
            Some(_) => {
                return Err(SftpError::failure(format!(
                    "{} exists and is not a directory",
                    current
                )))
            }
            None => {}
        }
        if let Err(e) = sftp.mkdir(Path::new(&current), 0o755) {
            // Another connection may have created it in the meantime.
            match lookup(sftp, &current)? {
                Some(s) if s.is_dir() => {}
                _ => return Err(SftpError::from_ssh(&format!("mkdir {}", current), e)),
            }
        } else {
            log::debug!("Created remote directory {}", current);
        }
    }
    Ok(())
}

fn remove_tree(sftp: &Sftp, path: &str) -> SftpResult<()> {
    let stat = match sftp.lstat(Path::new(path)) {
        Ok(s) => s,
        Err(e) => {
            let e = SftpError::from_ssh(&format!("lstat {}", path), e);
            return if e.kind == SftpErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            };
        }
    };

    if stat.is_dir() {
        for child in read_dir(sftp, path)? {
            remove_tree(sftp, &child.path)?;
        }
        sftp.rmdir(Path::new(path))
            .map_err(|e| SftpError::from_ssh(&format!("rmdir {}", path), e))
    } else {
        match sftp.unlink(Path::new(path)) {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = SftpError::from_ssh(&format!("unlink {}", path), e);
                if e.kind == SftpErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

// ── Async surface ────────────────────────────────────────────────────────────

impl SftpClient {
    pub async fn list_directory(&mut self, path: &str) -> SftpResult<Vec<RemoteEntry>> {
        let path = path.to_string();
        self.run(move |h: &mut SessionHandle| read_dir(&h.sftp, &path))
            .await
    }

    /// `None` when the path does not exist.
    pub async fn stat_path(&mut self, path: &str) -> SftpResult<Option<RemoteEntry>> {
        let path = path.to_string();
        self.run(move |h: &mut SessionHandle| {
            Ok(lookup(&h.sftp, &path)?.map(|s| to_entry(&path, &s)))
        })
        .await
    }

    pub async fn create_dir_all(&mut self, path: &str) -> SftpResult<()> {
        let path = path.to_string();
        self.run(move |h: &mut SessionHandle| mkdir_all(&h.sftp, &path))
            .await
    }

    /// Remove a file, or a directory and everything below it.
    pub async fn remove_path(&mut self, path: &str) -> SftpResult<()> {
        let path = path.to_string();
        self.run(move |h: &mut SessionHandle| remove_tree(&h.sftp, &path))
            .await
    }

    pub async fn rename_path(&mut self, from: &str, to: &str) -> SftpResult<()> {
        let (from, to) = (from.to_string(), to.to_string());
        self.run(move |h: &mut SessionHandle| {
            h.sftp
                .rename(Path::new(&from), Path::new(&to), None)
                .map_err(|e| SftpError::from_ssh(&format!("rename {} -> {}", from, to), e))
        })
        .await
    }
}
