//! Local-versus-remote classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sorng_core::client::RemoteEntry;
use sorng_core::paths::join_remote;
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::Path;

/// Timestamps closer than this are considered equal.
pub const MTIME_TOLERANCE_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    MissingLocal,
    MissingRemote,
    DifferentSize,
    NewerLocal,
    NewerRemote,
    Synchronized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
}

impl FileMeta {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            is_directory: meta.is_dir(),
        }
    }
}

impl From<&RemoteEntry> for FileMeta {
    fn from(e: &RemoteEntry) -> Self {
        Self {
            size: e.size,
            modified: e.modified,
            is_directory: e.is_directory,
        }
    }
}

/// `local - remote` in milliseconds, when both are known.
fn skew_ms(local: &FileMeta, remote: &FileMeta) -> Option<i64> {
    Some((local.modified? - remote.modified?).num_milliseconds())
}

pub fn classify(local: Option<&FileMeta>, remote: Option<&FileMeta>) -> DiffStatus {
    let (l, r) = match (local, remote) {
        (None, None) => return DiffStatus::Synchronized,
        (None, Some(_)) => return DiffStatus::MissingLocal,
        (Some(_), None) => return DiffStatus::MissingRemote,
        (Some(l), Some(r)) => (l, r),
    };
    match (l.is_directory, r.is_directory) {
        (true, true) => return DiffStatus::Synchronized,
        (true, false) | (false, true) => return DiffStatus::DifferentSize,
        _ => {}
    }
    if l.size != r.size {
        return DiffStatus::DifferentSize;
    }
    match skew_ms(l, r) {
        Some(d) if d > MTIME_TOLERANCE_MS => DiffStatus::NewerLocal,
        Some(d) if d < -MTIME_TOLERANCE_MS => DiffStatus::NewerRemote,
        _ => DiffStatus::Synchronized,
    }
}

/// Whether a reconciliation pass should pull the remote file down.
///
/// A size mismatch only counts when the remote copy is not older than the
/// local one; otherwise the local edit is on its way up.
pub fn should_download(local: Option<&FileMeta>, remote: &FileMeta) -> bool {
    if remote.is_directory {
        return false;
    }
    match classify(local, Some(remote)) {
        DiffStatus::MissingLocal | DiffStatus::NewerRemote => true,
        DiffStatus::DifferentSize => match local {
            Some(l) if !l.is_directory => {
                matches!(skew_ms(l, remote), Some(d) if d <= MTIME_TOLERANCE_MS)
            }
            _ => false,
        },
        _ => false,
    }
}

// ─── Folder diff ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub name: String,
    /// Path relative to the session roots.
    pub relative: String,
    pub remote_path: String,
    pub is_directory: bool,
    pub status: DiffStatus,
    pub local_size: Option<u64>,
    pub remote_size: Option<u64>,
    pub local_modified: Option<DateTime<Utc>>,
    pub remote_modified: Option<DateTime<Utc>>,
    /// Directories only: some descendant is not synchronized.
    pub contains_changes: bool,
}

/// Immediate children of a local directory. A missing directory is empty.
pub fn local_listing(dir: &Path) -> std::io::Result<Vec<(String, FileMeta)>> {
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        out.push((
            entry.file_name().to_string_lossy().into_owned(),
            FileMeta::from_metadata(&meta),
        ));
    }
    Ok(out)
}

/// Merge one directory's local and remote listings by name.
///
/// `relative_dir` is the directory relative to the roots ("" for the root),
/// `remote_dir` its absolute remote path. Directories sort first.
pub fn diff_folder(
    relative_dir: &str,
    remote_dir: &str,
    local: Vec<(String, FileMeta)>,
    remote: &[RemoteEntry],
) -> Vec<DiffEntry> {
    let mut merged: BTreeMap<String, (Option<FileMeta>, Option<FileMeta>)> = BTreeMap::new();
    for (name, meta) in local {
        merged.entry(name).or_default().0 = Some(meta);
    }
    for e in remote {
        merged.entry(e.name.clone()).or_default().1 = Some(FileMeta::from(e));
    }

    let mut out: Vec<DiffEntry> = merged
        .into_iter()
        .map(|(name, (l, r))| {
            let is_directory = l.as_ref().map(|m| m.is_directory).unwrap_or(false)
                || r.as_ref().map(|m| m.is_directory).unwrap_or(false);
            DiffEntry {
                relative: join_relative(relative_dir, &name),
                remote_path: join_remote(remote_dir, &name),
                status: classify(l.as_ref(), r.as_ref()),
                local_size: l.as_ref().filter(|m| !m.is_directory).map(|m| m.size),
                remote_size: r.as_ref().filter(|m| !m.is_directory).map(|m| m.size),
                local_modified: l.as_ref().and_then(|m| m.modified),
                remote_modified: r.as_ref().and_then(|m| m.modified),
                contains_changes: false,
                is_directory,
                name,
            }
        })
        .collect();
    out.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then_with(|| a.name.cmp(&b.name)));
    out
}

pub fn join_relative(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Flag every directory entry that has a non-synchronized descendant in
/// the same flat list.
pub fn mark_changes(entries: &mut [DiffEntry]) {
    let changed: Vec<String> = entries
        .iter()
        .filter(|e| e.status != DiffStatus::Synchronized)
        .map(|e| e.relative.clone())
        .collect();
    for e in entries.iter_mut().filter(|e| e.is_directory) {
        let prefix = format!("{}/", e.relative);
        e.contains_changes = changed.iter().any(|c| c.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn file(size: u64, modified: DateTime<Utc>) -> FileMeta {
        FileMeta {
            size,
            modified: Some(modified),
            is_directory: false,
        }
    }

    fn dir() -> FileMeta {
        FileMeta {
            size: 0,
            modified: None,
            is_directory: true,
        }
    }

    #[test]
    fn presence_and_size() {
        let now = Utc::now();
        assert_eq!(classify(None, Some(&file(1, now))), DiffStatus::MissingLocal);
        assert_eq!(classify(Some(&file(1, now)), None), DiffStatus::MissingRemote);
        assert_eq!(
            classify(Some(&file(1, now)), Some(&file(2, now))),
            DiffStatus::DifferentSize
        );
    }

    #[test]
    fn tolerance_window_is_two_seconds() {
        let t = Utc::now();
        let same = |skew_ms: i64| {
            classify(
                Some(&file(5, t + Duration::milliseconds(skew_ms))),
                Some(&file(5, t)),
            )
        };
        assert_eq!(same(0), DiffStatus::Synchronized);
        assert_eq!(same(2_000), DiffStatus::Synchronized);
        assert_eq!(same(-2_000), DiffStatus::Synchronized);
        assert_eq!(same(2_001), DiffStatus::NewerLocal);
        assert_eq!(same(-2_001), DiffStatus::NewerRemote);
    }

    #[test]
    fn directories_ignore_contents() {
        assert_eq!(classify(Some(&dir()), Some(&dir())), DiffStatus::Synchronized);
        assert_eq!(
            classify(Some(&dir()), Some(&file(0, Utc::now()))),
            DiffStatus::DifferentSize
        );
    }

    #[test]
    fn unknown_mtimes_compare_by_size_only() {
        let a = FileMeta {
            size: 3,
            modified: None,
            is_directory: false,
        };
        assert_eq!(classify(Some(&a), Some(&file(3, Utc::now()))), DiffStatus::Synchronized);
    }

    #[test]
    fn download_decisions() {
        let t = Utc::now();
        let old = t - Duration::seconds(60);
        assert!(should_download(None, &file(1, t)));
        assert!(should_download(Some(&file(1, old)), &file(1, t)));
        // Larger local file edited after the remote one is not pulled back.
        assert!(!should_download(Some(&file(9, t)), &file(1, old)));
        assert!(should_download(Some(&file(9, old)), &file(1, t)));
        assert!(!should_download(Some(&file(1, t)), &file(1, old)));
        assert!(!should_download(None, &dir()));
    }

    #[test]
    fn folder_merge_and_change_marking() {
        let t = Utc::now();
        let remote = vec![
            RemoteEntry {
                name: "css".into(),
                path: "/www/css".into(),
                size: 0,
                modified: None,
                is_directory: true,
            },
            RemoteEntry {
                name: "index.html".into(),
                path: "/www/index.html".into(),
                size: 10,
                modified: Some(t),
                is_directory: false,
            },
        ];
        let local = vec![
            ("css".to_string(), dir()),
            ("index.html".to_string(), file(10, t)),
            ("new.txt".to_string(), file(3, t)),
        ];
        let mut entries = diff_folder("", "/www", local, &remote);
        assert_eq!(entries[0].name, "css");
        assert!(entries[0].is_directory);
        let new = entries.iter().find(|e| e.name == "new.txt").unwrap();
        assert_eq!(new.status, DiffStatus::MissingRemote);
        assert_eq!(new.remote_path, "/www/new.txt");

        entries.push(DiffEntry {
            name: "site.css".into(),
            relative: "css/site.css".into(),
            remote_path: "/www/css/site.css".into(),
            is_directory: false,
            status: DiffStatus::NewerLocal,
            local_size: Some(1),
            remote_size: Some(1),
            local_modified: None,
            remote_modified: None,
            contains_changes: false,
        });
        mark_changes(&mut entries);
        assert!(entries[0].contains_changes);
        assert_eq!(entries[0].status, DiffStatus::Synchronized);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&DiffStatus::MissingLocal).unwrap(),
            "\"missing_local\""
        );
    }
}
