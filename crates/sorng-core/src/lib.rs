//! # SortOfRemote NG – Sync Core
//!
//! Types shared by the protocol adapters and the sync engine: connection
//! profiles, engine settings, the [`TransferClient`](client::TransferClient)
//! contract and the [`SyncError`](error::SyncError) taxonomy.

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod paths;
pub mod profile;

pub use client::{ProgressFn, RemoteEntry, TransferClient};
pub use config::EngineConfig;
pub use error::{ErrorClass, SyncError, SyncErrorKind, SyncResult};
pub use profile::{ConflictPolicy, ConnectionProfile, Credential, Protocol, SyncMode};
