//! Remote path helpers. Remote paths are always `/`-separated.

use std::path::{Component, Path};

/// Join a relative `/`-separated path onto a remote base.
pub fn join_remote(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return if base.is_empty() { "/".into() } else { base.to_string() };
    }
    if base.is_empty() || base == "/" {
        format!("/{}", rel)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel)
    }
}

/// Parent of a remote path (`/a/b` → `/a`, `/a` → `/`).
pub fn remote_parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".into()),
        Some(pos) => Some(trimmed[..pos].to_string()),
        None => None,
    }
}

/// Last component of a remote path.
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Strip a remote root from an absolute remote path, yielding the relative
/// part. Relative input is returned cleaned up as-is.
pub fn remote_relative(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    if !root.is_empty() {
        if let Some(rest) = path.strip_prefix(root) {
            if rest.is_empty() || rest.starts_with('/') {
                return rest.trim_matches('/').to_string();
            }
        }
    }
    path.trim_matches('/').to_string()
}

/// Convert a local path relative to `root` into a `/`-separated string.
/// `None` when `path` is outside `root` or escapes it with `..`.
pub fn local_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Reject relative paths that climb out of their root.
pub fn is_safe_relative(rel: &str) -> bool {
    !rel.split(|c| c == '/' || c == '\\').any(|seg| seg == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn join_handles_root_and_slashes() {
        assert_eq!(join_remote("/", "a/b.txt"), "/a/b.txt");
        assert_eq!(join_remote("/www/", "/a"), "/www/a");
        assert_eq!(join_remote("/www", ""), "/www");
    }

    #[test]
    fn parent_and_name() {
        assert_eq!(remote_parent("/a/b/c.txt").as_deref(), Some("/a/b"));
        assert_eq!(remote_parent("/a").as_deref(), Some("/"));
        assert_eq!(remote_parent("/"), None);
        assert_eq!(remote_file_name("/a/b/c.txt"), "c.txt");
    }

    #[test]
    fn relative_from_remote_root() {
        assert_eq!(remote_relative("/www", "/www/css/site.css"), "css/site.css");
        assert_eq!(remote_relative("/www", "/wwwroot/x"), "wwwroot/x");
        assert_eq!(remote_relative("/", "/a/b"), "a/b");
        assert_eq!(remote_relative("/www", "css/a.css"), "css/a.css");
    }

    #[test]
    fn local_relative_uses_forward_slashes() {
        let root = PathBuf::from("/home/u/site");
        let p = root.join("css").join("a.css");
        assert_eq!(local_relative(&root, &p).as_deref(), Some("css/a.css"));
        assert_eq!(local_relative(&root, Path::new("/etc/passwd")), None);
    }

    #[test]
    fn dot_dot_is_unsafe() {
        assert!(is_safe_relative("a/b.txt"));
        assert!(!is_safe_relative("../etc/passwd"));
        assert!(!is_safe_relative("a\\..\\b"));
    }
}
