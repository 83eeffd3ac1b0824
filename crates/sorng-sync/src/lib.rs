//! # SortOfRemote NG – Sync Engine
//!
//! Keeps a local folder and a remote folder in step over FTP, FTPS or SFTP:
//!   • Bounded connection pool per endpoint with freshness-based liveness probes
//!   • Non-blocking transfer queue with per-batch progress and retry/backoff
//!   • Local vs remote diff classification and upload conflict policy
//!   • Gitignore-style exclusion with a per-root override file
//!   • Debounced filesystem watcher with stability window and echo suppression
//!   • One `SyncSession` per connection, held by an explicit `SyncManager`

pub mod sync;
