// ── sorng-sftp / sftp module ──────────────────────────────────────────────────
//
// SFTP adapter for the sync engine:
//   • types    – connection config, auth method
//   • error    – SftpError with libssh2 / SFTP status classification
//   • client   – connect, authenticate, blocking bridge, disconnect
//   • dir_ops  – readdir, stat, mkdir -p, recursive remove, rename
//   • file_ops – streaming put / get with progress relay
//   • adapter  – TransferClient implementation

pub mod adapter;
pub mod client;
pub mod dir_ops;
pub mod error;
pub mod file_ops;
pub mod types;

pub use client::SftpClient;
pub use error::{SftpError, SftpErrorKind, SftpResult};
pub use types::*;
