// ── SFTP error type ──────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use sorng_core::error::{SyncError, SyncErrorKind};
use ssh2::ErrorCode;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpError {
    pub kind: SftpErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SftpErrorKind {
    /// TCP connect / DNS failure.
    ConnectionFailed,
    /// SSH banner exchange or key exchange failed.
    HandshakeFailed,
    AuthFailed,
    Timeout,
    /// Transport-level failure: the session is gone.
    Disconnected,
    NotFound,
    PermissionDenied,
    /// SSH_FX_FAILURE and friends.
    Failure,
    Unsupported,
    QuotaExceeded,
    /// Local file could not be read or written; the session is unaffected.
    LocalFile,
    InvalidConfig,
    /// Worker thread died or the session lock was poisoned.
    Internal,
}

pub type SftpResult<T> = Result<T, SftpError>;

// SFTP status codes (draft-ietf-secsh-filexfer-02 and later).
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_CONNECTION: i32 = 6;
const FX_CONNECTION_LOST: i32 = 7;
const FX_OP_UNSUPPORTED: i32 = 8;
const FX_NO_SUCH_PATH: i32 = 10;
const FX_WRITE_PROTECT: i32 = 12;
const FX_NO_SPACE: i32 = 14;
const FX_QUOTA_EXCEEDED: i32 = 15;

// libssh2 session error codes.
const LIBSSH2_ERROR_BANNER_RECV: i32 = -2;
const LIBSSH2_ERROR_KEX_FAILURE: i32 = -5;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;

impl SftpError {
    pub fn new(kind: SftpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::ConnectionFailed, msg)
    }

    pub fn handshake_failed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::HandshakeFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::AuthFailed, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Disconnected, msg)
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Failure, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::InvalidConfig, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Internal, msg)
    }

    /// Wrap an error from the local filesystem side of a transfer.
    pub fn local(path: &std::path::Path, e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => SftpErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => SftpErrorKind::PermissionDenied,
            _ => SftpErrorKind::LocalFile,
        };
        Self::new(kind, format!("{}: {}", path.display(), e))
    }

    /// Classify a libssh2 error, prefixing the operation that raised it.
    pub fn from_ssh(op: &str, e: ssh2::Error) -> Self {
        let kind = match e.code() {
            ErrorCode::SFTP(FX_NO_SUCH_FILE) | ErrorCode::SFTP(FX_NO_SUCH_PATH) => {
                SftpErrorKind::NotFound
            }
            ErrorCode::SFTP(FX_PERMISSION_DENIED) | ErrorCode::SFTP(FX_WRITE_PROTECT) => {
                SftpErrorKind::PermissionDenied
            }
            ErrorCode::SFTP(FX_NO_CONNECTION) | ErrorCode::SFTP(FX_CONNECTION_LOST) => {
                SftpErrorKind::Disconnected
            }
            ErrorCode::SFTP(FX_OP_UNSUPPORTED) => SftpErrorKind::Unsupported,
            ErrorCode::SFTP(FX_NO_SPACE) | ErrorCode::SFTP(FX_QUOTA_EXCEEDED) => {
                SftpErrorKind::QuotaExceeded
            }
            ErrorCode::SFTP(_) => SftpErrorKind::Failure,
            ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
            | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => SftpErrorKind::AuthFailed,
            ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)
            | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_TIMEOUT) => SftpErrorKind::Timeout,
            ErrorCode::Session(LIBSSH2_ERROR_BANNER_RECV)
            | ErrorCode::Session(LIBSSH2_ERROR_KEX_FAILURE) => SftpErrorKind::HandshakeFailed,
            ErrorCode::Session(_) => SftpErrorKind::Disconnected,
        };
        Self::new(kind, format!("{}: {}", op, e.message()))
    }

    /// Errors after which the session cannot be trusted.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self.kind,
            SftpErrorKind::Disconnected | SftpErrorKind::Timeout | SftpErrorKind::Internal
        )
    }
}

impl fmt::Display for SftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[SFTP {:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for SftpError {}

impl From<SftpError> for SyncError {
    fn from(e: SftpError) -> Self {
        let kind = match e.kind {
            SftpErrorKind::ConnectionFailed | SftpErrorKind::HandshakeFailed => {
                SyncErrorKind::ConnectionFailed
            }
            SftpErrorKind::AuthFailed => SyncErrorKind::AuthFailed,
            SftpErrorKind::Timeout => SyncErrorKind::Timeout,
            SftpErrorKind::Disconnected => SyncErrorKind::ConnectionLost,
            SftpErrorKind::NotFound => SyncErrorKind::NotFound,
            SftpErrorKind::PermissionDenied => SyncErrorKind::PermissionDenied,
            SftpErrorKind::Failure | SftpErrorKind::Unsupported | SftpErrorKind::QuotaExceeded => {
                SyncErrorKind::CommandRejected
            }
            SftpErrorKind::LocalFile => SyncErrorKind::IoError,
            SftpErrorKind::InvalidConfig => SyncErrorKind::InvalidConfig,
            SftpErrorKind::Internal => SyncErrorKind::Internal,
        };
        SyncError::new(kind, e.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sorng_core::error::ErrorClass;

    #[test]
    fn sftp_status_codes() {
        let e = SftpError::from_ssh("stat /x", ssh2::Error::new(ErrorCode::SFTP(2), "no such file"));
        assert_eq!(e.kind, SftpErrorKind::NotFound);
        assert!(e.message.starts_with("stat /x"));
        let e = SftpError::from_ssh("open", ssh2::Error::new(ErrorCode::SFTP(3), "denied"));
        assert_eq!(e.kind, SftpErrorKind::PermissionDenied);
        let e = SftpError::from_ssh("mkdir", ssh2::Error::new(ErrorCode::SFTP(4), "failure"));
        assert_eq!(e.kind, SftpErrorKind::Failure);
        assert!(!e.breaks_connection());
    }

    #[test]
    fn session_errors_break_the_connection() {
        let e = SftpError::from_ssh("read", ssh2::Error::new(ErrorCode::Session(-7), "send failed"));
        assert_eq!(e.kind, SftpErrorKind::Disconnected);
        assert!(e.breaks_connection());
        let s: SyncError = e.into();
        assert_eq!(s.class(), ErrorClass::Transient);
    }

    #[test]
    fn auth_failure_is_fatal() {
        let e = SftpError::from_ssh("auth", ssh2::Error::new(ErrorCode::Session(-18), "bad"));
        let s: SyncError = e.into();
        assert_eq!(s.class(), ErrorClass::Fatal);
    }
}
