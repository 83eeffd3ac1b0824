//! Error taxonomy shared by the protocol adapters and the sync engine.
//!
//! Every failure carries a [`SyncErrorKind`]; the kind (plus a few
//! well-known server phrases) decides the [`ErrorClass`], which in turn
//! decides whether the engine retries, gives up on the task, or stops the
//! session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised sync error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
    /// Protocol reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Path the failing operation was working on.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncErrorKind {
    /// TCP / DNS / handshake failure while opening a connection.
    ConnectionFailed,
    /// Server refused because of its connection or login limit.
    ConnectionLimit,
    /// Connection was closed or reset underneath an operation.
    ConnectionLost,
    /// Operation timed out.
    Timeout,
    /// Wrong username, password or key.
    AuthFailed,
    /// Permission denied on the server.
    PermissionDenied,
    /// File/directory not found on the server.
    NotFound,
    /// Server rejected a command for another reason.
    CommandRejected,
    /// Server sent something we could not understand.
    ProtocolError,
    /// Local file read/write failure.
    IoError,
    /// Invalid profile or parameter.
    InvalidConfig,
    /// No session registered under the requested id.
    SessionNotFound,
    /// Operation cancelled because the session stopped.
    Cancelled,
    /// Internal bookkeeping went wrong.
    Internal,
}

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    /// Retry-eligible; the connection involved is discarded.
    Transient,
    /// The task fails, the batch continues.
    Terminal,
    /// The session cannot proceed.
    Fatal,
    /// Should not happen; the task is abandoned.
    Invariant,
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Server phrases that mean "try again later" regardless of the reply code.
const TRANSIENT_PHRASES: &[&str] = &[
    "too many connections",
    "too many users",
    "too many open",
    "login limit",
    "connection limit",
    "maximum number of",
    "connection reset",
    "connection closed",
    "connection aborted",
    "broken pipe",
    "not connected",
    "econnreset",
    "operation not permitted",
];

// ── Construction helpers ─────────────────────────────────────────────

impl SyncError {
    pub fn new(kind: SyncErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            path: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::ConnectionFailed, msg)
    }

    pub fn connection_limit(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::ConnectionLimit, msg)
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::ConnectionLost, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Timeout, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::AuthFailed, msg)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::PermissionDenied, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::NotFound, msg)
    }

    pub fn command_rejected(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::CommandRejected, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::IoError, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::InvalidConfig, msg)
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new(
            SyncErrorKind::SessionNotFound,
            format!("Sync session '{}' not found", id),
        )
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Cancelled, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Internal, msg)
    }

    // ── Classification ───────────────────────────────────────────

    pub fn class(&self) -> ErrorClass {
        match self.kind {
            SyncErrorKind::ConnectionFailed
            | SyncErrorKind::ConnectionLimit
            | SyncErrorKind::ConnectionLost
            | SyncErrorKind::Timeout => ErrorClass::Transient,
            SyncErrorKind::AuthFailed if !self.mentions_transient_phrase() => ErrorClass::Fatal,
            SyncErrorKind::InvalidConfig => ErrorClass::Fatal,
            SyncErrorKind::Internal => ErrorClass::Invariant,
            _ if self.mentions_transient_phrase() => ErrorClass::Transient,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == SyncErrorKind::NotFound
    }

    /// Whether the connection that produced this error must not be reused.
    pub fn forces_discard(&self) -> bool {
        self.is_transient() || self.kind == SyncErrorKind::ProtocolError
    }

    fn mentions_transient_phrase(&self) -> bool {
        let lower = self.message.to_lowercase();
        TRANSIENT_PHRASES.iter().any(|p| lower.contains(p))
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.path) {
            (Some(code), Some(path)) => {
                write!(f, "[{:?} {}] {} ({})", self.kind, code, self.message, path)
            }
            (Some(code), None) => write!(f, "[{:?} {}] {}", self.kind, code, self.message),
            (None, Some(path)) => write!(f, "[{:?}] {} ({})", self.kind, self.message, path),
            (None, None) => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Self::connection_lost(e.to_string()),
            ErrorKind::ConnectionRefused => Self::connection_failed(e.to_string()),
            ErrorKind::NotFound => Self::not_found(e.to_string()),
            ErrorKind::PermissionDenied => Self::permission_denied(e.to_string()),
            _ => Self::io_error(e.to_string()),
        }
    }
}

impl From<SyncError> for String {
    fn from(e: SyncError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_kinds_are_transient() {
        assert!(SyncError::connection_lost("reset").is_transient());
        assert!(SyncError::connection_limit("421").is_transient());
        assert!(SyncError::timeout("slow").is_transient());
        assert!(SyncError::connection_lost("x").forces_discard());
    }

    #[test]
    fn login_limit_reported_as_auth_is_still_transient() {
        let e = SyncError::auth_failed("530 Sorry, login limit exceeded").with_code(530);
        assert_eq!(e.class(), ErrorClass::Transient);
        let e = SyncError::auth_failed("530 Login incorrect").with_code(530);
        assert_eq!(e.class(), ErrorClass::Fatal);
    }

    #[test]
    fn operation_not_permitted_is_transient() {
        let e = SyncError::permission_denied("Operation not permitted");
        assert!(e.is_transient());
        let e = SyncError::permission_denied("Permission denied");
        assert_eq!(e.class(), ErrorClass::Terminal);
    }

    #[test]
    fn not_found_is_terminal() {
        let e = SyncError::not_found("no such file");
        assert_eq!(e.class(), ErrorClass::Terminal);
        assert!(!e.forces_discard());
        assert!(e.is_not_found());
    }

    #[test]
    fn internal_is_invariant() {
        assert_eq!(SyncError::internal("oops").class(), ErrorClass::Invariant);
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let e: SyncError = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert_eq!(e.kind, SyncErrorKind::ConnectionLost);
        let e: SyncError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind, SyncErrorKind::NotFound);
    }

    #[test]
    fn display_includes_code_and_path() {
        let e = SyncError::not_found("gone").with_code(550).with_path("/a.txt");
        assert_eq!(e.to_string(), "[NotFound 550] gone (/a.txt)");
    }
}
