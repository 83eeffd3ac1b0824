//! FTP/FTPS client module.
//!
//! ## Architecture
//!
//! - **types**: connection config, replies, listing entries, FEAT flags
//! - **error**: `FtpError` with reply-code classification
//! - **protocol**: command/response codec over plain or TLS halves
//! - **tls**: rustls connector, AUTH TLS upgrade, data-channel wrapping
//! - **connection**: TCP connect with timeout, banner read
//! - **transfer**: PASV / EPSV data channels
//! - **parser**: MLSD / Unix LIST / Windows LIST parsing
//! - **client**: login sequence, FEAT probe, listing, SIZE/MDTM, QUIT
//! - **file_ops**: streaming RETR / STOR
//! - **directory**: MKD, RMD, DELE, RNFR/RNTO, MLST, MFMT
//! - **adapter**: `TransferClient` implementation

pub mod adapter;
pub mod client;
pub mod connection;
pub mod directory;
pub mod error;
pub mod file_ops;
pub mod parser;
pub mod protocol;
pub mod tls;
pub mod transfer;
pub mod types;

pub use client::FtpClient;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use types::{DataChannelMode, FtpConnectionConfig, FtpSecurityMode};
