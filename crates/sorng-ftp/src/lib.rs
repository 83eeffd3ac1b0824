//! # SortOfRemote NG – FTP
//!
//! FTP / explicit-FTPS transfer client used by the sync engine:
//!   • Control channel codec with multi-line replies
//!   • AUTH TLS upgrade via rustls, protected (PROT P) data channels
//!   • PASV / EPSV data connections
//!   • MLSD listing with Unix / Windows LIST fallback
//!   • Streaming upload / download with progress callbacks
//!   • Implementation of the protocol-neutral `TransferClient` contract

pub mod ftp;
