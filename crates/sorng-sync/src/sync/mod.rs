//! Sync engine module.
//!
//! ## Architecture
//!
//! - **client**: `RemoteClient` enum over the FTP/FTPS/SFTP adapters, `ClientFactory`
//! - **pool**: bounded, freshness-probed connection pool
//! - **queue**: non-blocking transfer queue with batch tracking
//! - **retry**: transient-failure classification and backoff
//! - **diff**: local vs remote classification, folder diff
//! - **conflict**: pre-upload conflict policy
//! - **ignore**: gitignore-style matcher with per-root override file
//! - **watcher**: debounced change detector, echo suppression
//! - **progress**: throttled per-transfer progress
//! - **dircache**: remote directories known to exist
//! - **sink**: log / transfer-stat sinks
//! - **session**: one `SyncSession` per connection profile
//! - **manager**: `SyncManager` registry and `ProfileStore`
//! - **memory**: in-process remote used by tests and embedders

pub mod client;
pub mod conflict;
pub mod diff;
pub mod dircache;
pub mod ignore;
pub mod manager;
pub mod memory;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod session;
pub mod sink;
pub mod watcher;

pub use client::{ClientFactory, ProtocolFactory, RemoteClient};
pub use diff::{DiffEntry, DiffStatus};
pub use manager::{MemoryProfileStore, ProfileStore, SyncManager, SyncManagerState};
pub use queue::{TaskHandle, TaskOrigin, TaskOutcome, TransferDirection};
pub use session::{SessionState, SessionStatus, SyncSession};
pub use sink::{LogCrateSink, LogSink, MemorySink};
