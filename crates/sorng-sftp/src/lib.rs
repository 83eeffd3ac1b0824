//! # SortOfRemote NG – SFTP
//!
//! SFTP transfer client used by the sync engine:
//!   • libssh2 session with password, private-key and keyboard-interactive auth
//!   • Blocking SFTP calls moved off the async runtime
//!   • Streaming upload / download with progress relayed back to the caller
//!   • Recursive directory creation and removal
//!   • Implementation of the protocol-neutral `TransferClient` contract

pub mod sftp;
