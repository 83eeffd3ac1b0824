//! FTP-specific error type.

use serde::{Deserialize, Serialize};
use sorng_core::error::{SyncError, SyncErrorKind};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP response code that triggered the error, if any.
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP / DNS resolution failure.
    ConnectionFailed,
    /// Server refused the session: too many connections / login limit.
    ConnectionLimit,
    /// AUTH TLS / TLS handshake failure.
    TlsFailed,
    /// Wrong username/password.
    AuthFailed,
    /// Server returned a 4xx/5xx for a command.
    CommandRejected,
    /// Data channel could not be established or broke mid-transfer.
    DataChannelFailed,
    /// Transfer aborted or incomplete on the server side.
    TransferFailed,
    /// Server sent an un-parseable response.
    ProtocolError,
    /// An I/O error on the local side (file read/write).
    IoError,
    /// Operation timed out.
    Timeout,
    /// Control connection is gone.
    Disconnected,
    /// Permission denied on the server.
    PermissionDenied,
    /// File/directory not found on the server.
    NotFound,
    /// Disk quota exceeded.
    QuotaExceeded,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Server lacks an optional extension.
    Unsupported,
    /// Local file could not be read or written; the session is unaffected.
    LocalFile,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Unsupported, msg)
    }

    /// Wrap an error from the local filesystem side of a transfer.
    pub fn local(path: &std::path::Path, e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => FtpErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => FtpErrorKind::PermissionDenied,
            _ => FtpErrorKind::LocalFile,
        };
        Self::new(kind, format!("{}: {}", path.display(), e))
    }

    /// Classify an FTP reply code into the most appropriate error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let lower = text.to_lowercase();
        let limit = lower.contains("too many")
            || lower.contains("limit")
            || lower.contains("maximum number");
        let kind = match code {
            421 if limit => FtpErrorKind::ConnectionLimit,
            421 => FtpErrorKind::Disconnected,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            530 if limit => FtpErrorKind::ConnectionLimit,
            430 | 530 => FtpErrorKind::AuthFailed,
            450 | 550 | 553 => {
                if lower.contains("permission")
                    || lower.contains("denied")
                    || lower.contains("not permitted")
                {
                    FtpErrorKind::PermissionDenied
                } else if lower.contains("not found")
                    || lower.contains("no such")
                    || lower.contains("does not exist")
                    || lower.contains("doesn't exist")
                    || lower.contains("can't find")
                    || lower.contains("cannot find")
                {
                    FtpErrorKind::NotFound
                } else if lower.contains("quota") {
                    FtpErrorKind::QuotaExceeded
                } else {
                    FtpErrorKind::CommandRejected
                }
            }
            451 | 452 | 552 => FtpErrorKind::TransferFailed,
            _ => FtpErrorKind::CommandRejected,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
        }
    }

    /// Reply code 550 ("file unavailable"), whatever its wording.
    pub fn is_unavailable(&self) -> bool {
        self.code == Some(550) || self.kind == FtpErrorKind::NotFound
    }

    /// Errors after which the control connection cannot be trusted.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::Disconnected
                | FtpErrorKind::Timeout
                | FtpErrorKind::IoError
                | FtpErrorKind::ProtocolError
                | FtpErrorKind::ConnectionLimit
        )
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::io_error(e.to_string())
        }
    }
}

impl From<FtpError> for SyncError {
    fn from(e: FtpError) -> Self {
        let kind = match e.kind {
            FtpErrorKind::ConnectionFailed | FtpErrorKind::TlsFailed => {
                SyncErrorKind::ConnectionFailed
            }
            FtpErrorKind::ConnectionLimit => SyncErrorKind::ConnectionLimit,
            FtpErrorKind::Disconnected | FtpErrorKind::DataChannelFailed => {
                SyncErrorKind::ConnectionLost
            }
            // Control-channel I/O failures are indistinguishable from a dropped link.
            FtpErrorKind::IoError => SyncErrorKind::ConnectionLost,
            FtpErrorKind::Timeout => SyncErrorKind::Timeout,
            FtpErrorKind::AuthFailed => SyncErrorKind::AuthFailed,
            FtpErrorKind::PermissionDenied => SyncErrorKind::PermissionDenied,
            FtpErrorKind::NotFound => SyncErrorKind::NotFound,
            FtpErrorKind::ProtocolError => SyncErrorKind::ProtocolError,
            FtpErrorKind::InvalidConfig => SyncErrorKind::InvalidConfig,
            FtpErrorKind::LocalFile => SyncErrorKind::IoError,
            FtpErrorKind::CommandRejected
            | FtpErrorKind::TransferFailed
            | FtpErrorKind::QuotaExceeded
            | FtpErrorKind::Unsupported => SyncErrorKind::CommandRejected,
        };
        let mut out = SyncError::new(kind, e.message);
        out.code = e.code;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sorng_core::error::ErrorClass;

    #[test]
    fn too_many_connections_is_a_limit() {
        let e = FtpError::from_reply(421, "421 Too many connections (8) from this IP");
        assert_eq!(e.kind, FtpErrorKind::ConnectionLimit);
        let s: SyncError = e.into();
        assert_eq!(s.class(), ErrorClass::Transient);
    }

    #[test]
    fn plain_421_is_disconnect() {
        let e = FtpError::from_reply(421, "421 Service not available, closing control connection");
        assert_eq!(e.kind, FtpErrorKind::Disconnected);
        assert!(e.breaks_connection());
    }

    #[test]
    fn login_incorrect_is_fatal() {
        let s: SyncError = FtpError::from_reply(530, "530 Login incorrect.").into();
        assert_eq!(s.kind, SyncErrorKind::AuthFailed);
        assert_eq!(s.class(), ErrorClass::Fatal);
    }

    #[test]
    fn login_limit_530_is_transient() {
        let s: SyncError = FtpError::from_reply(530, "530 Sorry, max 5 users -- try again later (login limit)").into();
        assert_eq!(s.class(), ErrorClass::Transient);
    }

    #[test]
    fn classifies_550_by_text() {
        assert_eq!(
            FtpError::from_reply(550, "550 a.txt: No such file or directory").kind,
            FtpErrorKind::NotFound
        );
        assert_eq!(
            FtpError::from_reply(550, "550 Permission denied").kind,
            FtpErrorKind::PermissionDenied
        );
        let e = FtpError::from_reply(550, "550 Create directory operation failed.");
        assert_eq!(e.kind, FtpErrorKind::CommandRejected);
        assert!(e.is_unavailable());
    }

    #[test]
    fn local_errors_keep_the_session() {
        let e = FtpError::local(
            std::path::Path::new("/tmp/gone"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert_eq!(e.kind, FtpErrorKind::NotFound);
        assert!(!e.breaks_connection());
        let e = FtpError::local(std::path::Path::new("/tmp/x"), std::io::Error::other("disk full"));
        assert_eq!(e.kind, FtpErrorKind::LocalFile);
        assert!(!e.breaks_connection());
    }

    #[test]
    fn conversion_keeps_code() {
        let s: SyncError = FtpError::from_reply(553, "553 Could not create file.").into();
        assert_eq!(s.code, Some(553));
        assert_eq!(s.class(), ErrorClass::Terminal);
    }
}
