//! Directory operations: MKD, RMD, DELE, RNFR/RNTO, MLST, MFMT.

use crate::ftp::client::{parse_quoted_path, FtpClient};
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::parser;
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

impl FtpClient {
    // ─── MKD ─────────────────────────────────────────────────────

    /// Create a single directory. Returns the path the server reports.
    pub async fn mkdir(&mut self, path: &str) -> FtpResult<String> {
        self.ensure_open()?;
        let r = self.codec.expect_ok(&format!("MKD {}", path)).await;
        let resp = self.track(r)?;
        Ok(parse_quoted_path(&resp.text()).unwrap_or_else(|| path.to_string()))
    }

    /// Create a directory and all missing parents (FTP has no `mkdir -p`).
    pub async fn mkdir_all(&mut self, path: &str) -> FtpResult<()> {
        self.ensure_open()?;
        let r = self.mkdir_all_inner(path).await;
        self.track(r)
    }

    async fn mkdir_all_inner(&mut self, path: &str) -> FtpResult<()> {
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);

            if self.codec.execute(&format!("CWD {}", current)).await?.is_success() {
                continue;
            }
            let mkd = self.codec.execute(&format!("MKD {}", current)).await?;
            if mkd.is_success() {
                log::debug!(
                    "Created remote directory {}",
                    parse_quoted_path(&mkd.text()).unwrap_or_else(|| current.clone())
                );
                continue;
            }
            // Lost a race with another connection creating the same directory?
            if !self.codec.execute(&format!("CWD {}", current)).await?.is_success() {
                return Err(FtpError::from_reply(mkd.code, &mkd.text()));
            }
        }
        // Return to the root so relative commands never depend on CWD state.
        let _ = self.codec.execute("CWD /").await?;
        Ok(())
    }

    // ─── RMD / DELE ──────────────────────────────────────────────

    /// Remove an empty directory.
    pub async fn rmdir(&mut self, path: &str) -> FtpResult<()> {
        self.ensure_open()?;
        let r = self.codec.expect_ok(&format!("RMD {}", path)).await.map(|_| ());
        self.track(r)
    }

    /// Remove a directory and everything below it.
    pub fn rmdir_recursive<'a>(
        &'a mut self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = FtpResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let entries = self.list(path).await?;
            for entry in entries {
                let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
                match entry.kind {
                    FtpEntryKind::Directory => self.rmdir_recursive(&child).await?,
                    _ => self.delete(&child).await?,
                }
            }
            self.rmdir(path).await
        })
    }

    /// Delete a file.
    pub async fn delete(&mut self, path: &str) -> FtpResult<()> {
        self.ensure_open()?;
        let r = self.codec.expect_ok(&format!("DELE {}", path)).await.map(|_| ());
        self.track(r)
    }

    // ─── RNFR / RNTO ─────────────────────────────────────────────

    /// Rename or move a file or directory.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        self.ensure_open()?;
        let r = self.rename_inner(from, to).await;
        self.track(r)
    }

    async fn rename_inner(&mut self, from: &str, to: &str) -> FtpResult<()> {
        let rnfr = self.codec.execute(&format!("RNFR {}", from)).await?;
        if !rnfr.is_intermediate() {
            return Err(FtpError::from_reply(rnfr.code, &rnfr.text()));
        }
        self.codec.expect_ok(&format!("RNTO {}", to)).await?;
        Ok(())
    }

    // ─── MLST / stat ─────────────────────────────────────────────

    /// Metadata for a single path, or `None` when it does not exist.
    pub async fn stat(&mut self, path: &str) -> FtpResult<Option<FtpEntry>> {
        self.ensure_open()?;
        let r = if self.features.mlst {
            self.stat_mlst(path).await
        } else {
            self.stat_by_listing(path).await
        };
        match self.track(r) {
            Err(e) if e.is_unavailable() => Ok(None),
            other => other,
        }
    }

    async fn stat_mlst(&mut self, path: &str) -> FtpResult<Option<FtpEntry>> {
        let resp = self.codec.expect_ok(&format!("MLST {}", path)).await?;
        // 250-Listing /path
        //  type=file;size=12;modify=20260101120000; /path
        // 250 End
        let fact_line = resp
            .lines
            .iter()
            .skip(1)
            .find(|l| l.contains('=') && l.contains(';'));
        let Some(entry) = fact_line.and_then(|l| parser::parse_line(l)) else {
            return Err(FtpError::protocol_error(format!(
                "Cannot parse MLST reply: {}",
                resp.text()
            )));
        };
        Ok(Some(FtpEntry {
            name: leaf_name(path).to_string(),
            ..entry
        }))
    }

    async fn stat_by_listing(&mut self, path: &str) -> FtpResult<Option<FtpEntry>> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Some(FtpEntry {
                name: "/".into(),
                kind: FtpEntryKind::Directory,
                size: 0,
                modified: None,
                link_target: None,
            }));
        }
        let parent = match trimmed.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &trimmed[..i],
        };
        let name = leaf_name(trimmed);
        let entries = self.list(parent).await?;
        Ok(entries.into_iter().find(|e| e.name == name))
    }

    // ─── MFMT ────────────────────────────────────────────────────

    /// Set a remote file's modification time (draft-somers-ftp-mfxx).
    pub async fn set_modified(&mut self, path: &str, when: DateTime<Utc>) -> FtpResult<()> {
        self.ensure_open()?;
        if !self.features.mfmt {
            return Err(FtpError::unsupported("Server does not support MFMT"));
        }
        let cmd = format!("MFMT {} {}", parser::format_mlsd_time(when), path);
        let r = self.codec.expect_ok(&cmd).await.map(|_| ());
        self.track(r)
    }
}

fn leaf_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Whether a failed DELE suggests the target is actually a directory.
pub(crate) fn may_be_directory(e: &FtpError) -> bool {
    e.is_unavailable() && e.kind != FtpErrorKind::PermissionDenied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_names() {
        assert_eq!(leaf_name("/a/b/c.txt"), "c.txt");
        assert_eq!(leaf_name("/a/b/"), "b");
        assert_eq!(leaf_name("top"), "top");
    }

    #[test]
    fn dele_failures_that_hint_at_a_directory() {
        assert!(may_be_directory(&FtpError::from_reply(550, "550 Not a plain file")));
        assert!(!may_be_directory(&FtpError::from_reply(550, "550 Permission denied")));
        assert!(!may_be_directory(&FtpError::from_reply(553, "553 Bad name")));
    }
}
