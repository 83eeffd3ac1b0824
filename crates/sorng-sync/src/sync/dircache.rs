//! Remote directories already known to exist.
//!
//! Lock-free: two workers racing to create the same directory both call
//! `ensure_dir`, which is idempotent, and both insert. Entries only leave
//! when the engine deletes a remote path itself.

use dashmap::DashSet;
use sorng_core::client::TransferClient;
use sorng_core::error::SyncResult;
use sorng_core::paths::remote_parent;

#[derive(Debug, Default)]
pub struct RemoteDirCache {
    known: DashSet<String>,
}

impl RemoteDirCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, dir: &str) -> bool {
        dir == "/" || self.known.contains(dir)
    }

    pub fn insert(&self, dir: &str) {
        self.known.insert(dir.to_string());
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn clear(&self) {
        self.known.clear();
    }

    /// Drop `path` and everything cached below it.
    pub fn forget_under(&self, path: &str) {
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            self.known.clear();
            return;
        }
        let prefix = format!("{}/", path);
        self.known.retain(|d| d != path && !d.starts_with(&prefix));
    }

    /// Make sure the parent directory of `remote_file` exists.
    pub async fn ensure_parent<C>(&self, client: &mut C, remote_file: &str) -> SyncResult<()>
    where
        C: TransferClient + ?Sized,
    {
        match remote_parent(remote_file) {
            Some(dir) => self.ensure(client, &dir).await,
            None => Ok(()),
        }
    }

    pub async fn ensure<C>(&self, client: &mut C, dir: &str) -> SyncResult<()>
    where
        C: TransferClient + ?Sized,
    {
        if self.contains(dir) {
            return Ok(());
        }
        client.ensure_dir(dir).await?;
        // Every ancestor exists now too.
        let mut current = Some(dir.to_string());
        while let Some(d) = current {
            if d == "/" {
                break;
            }
            current = remote_parent(&d);
            self.known.insert(d);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::MemoryRemote;

    #[tokio::test]
    async fn creates_once_and_remembers_ancestors() {
        let remote = MemoryRemote::new();
        let mut client = remote.client();
        let cache = RemoteDirCache::new();

        cache.ensure_parent(&mut client, "/www/css/site.css").await.unwrap();
        assert!(cache.contains("/www/css"));
        assert!(cache.contains("/www"));
        assert_eq!(remote.counters().ensure_dir_calls, 1);

        cache.ensure(&mut client, "/www").await.unwrap();
        cache.ensure_parent(&mut client, "/www/css/other.css").await.unwrap();
        assert_eq!(remote.counters().ensure_dir_calls, 1);
        assert!(remote.is_dir("/www/css"));
    }

    #[tokio::test]
    async fn deleted_directories_are_created_again() {
        let remote = MemoryRemote::new();
        let mut client = remote.client();
        let cache = RemoteDirCache::new();
        cache.ensure_parent(&mut client, "/www/dist/js/a.js").await.unwrap();
        cache.insert("/www/distant");

        client.remove("/www/dist").await.unwrap();
        cache.forget_under("/www/dist");
        assert!(!cache.contains("/www/dist"));
        assert!(!cache.contains("/www/dist/js"));
        assert!(cache.contains("/www"));
        assert!(cache.contains("/www/distant"));

        cache.ensure_parent(&mut client, "/www/dist/b.js").await.unwrap();
        assert!(remote.is_dir("/www/dist"));
        assert_eq!(remote.counters().ensure_dir_calls, 2);
    }

    #[tokio::test]
    async fn root_needs_no_call() {
        let remote = MemoryRemote::new();
        let mut client = remote.client();
        let cache = RemoteDirCache::new();
        cache.ensure_parent(&mut client, "/top.txt").await.unwrap();
        assert_eq!(remote.counters().ensure_dir_calls, 0);
        assert!(cache.is_empty());
    }
}
