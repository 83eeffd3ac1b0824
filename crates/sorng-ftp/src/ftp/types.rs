//! Shared types for the FTP crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Connection ──────────────────────────────────────────────────────

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpSecurityMode {
    /// Plain-text FTP.
    None,
    /// Explicit FTPS: starts plain then upgrades via AUTH TLS.
    Explicit,
}

impl Default for FtpSecurityMode {
    fn default() -> Self {
        Self::None
    }
}

/// How the data connection is opened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DataChannelMode {
    /// EPSV when the server advertises it, PASV otherwise.
    Auto,
    Passive,
    ExtendedPassive,
}

impl Default for DataChannelMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Configuration for a single FTP connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub security: FtpSecurityMode,
    #[serde(default)]
    pub data_channel_mode: DataChannelMode,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Data-channel and reply timeout in seconds.
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
    /// Accept self-signed / untrusted certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Read/write chunk size for transfers (bytes).
    #[serde(default = "default_chunk")]
    pub chunk_size: usize,
}

fn default_connect_timeout() -> u64 {
    15
}
fn default_data_timeout() -> u64 {
    30
}
fn default_chunk() -> usize {
    65_536
}

impl Default for FtpConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 21,
            username: "anonymous".into(),
            password: "anonymous@".into(),
            security: FtpSecurityMode::None,
            data_channel_mode: DataChannelMode::Auto,
            connect_timeout_sec: default_connect_timeout(),
            data_timeout_sec: default_data_timeout(),
            accept_invalid_certs: false,
            chunk_size: default_chunk(),
        }
    }
}

impl std::fmt::Debug for FtpConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("security", &self.security)
            .field("data_channel_mode", &self.data_channel_mode)
            .finish_non_exhaustive()
    }
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpEntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// One entry from a directory listing (parsed from LIST or MLSD output).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpEntry {
    pub name: String,
    pub kind: FtpEntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub link_target: Option<String>,
}

// ─── FTP Response ────────────────────────────────────────────────────

/// A single FTP response (may be multi-line).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    /// Full response text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Whether the response code indicates success (1xx–3xx).
    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    /// Whether this is a positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Whether this is a positive-intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

// ─── Server Capabilities ─────────────────────────────────────────────

/// Parsed FEAT response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    pub mlsd: bool,
    pub mlst: bool,
    pub size: bool,
    pub mdtm: bool,
    pub utf8: bool,
    pub epsv: bool,
    pub mfmt: bool,
    pub raw_features: Vec<String>,
}

impl ServerFeatures {
    /// Parse the body of a 211 FEAT reply.
    pub fn from_feat_lines(lines: &[String]) -> Self {
        let raw: Vec<String> = lines
            .iter()
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .filter(|l| !l.is_empty())
            .collect();

        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        Self {
            mlsd: has("MLSD") || has("MLST"),
            mlst: has("MLST"),
            size: has("SIZE"),
            mdtm: has("MDTM"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            mfmt: has("MFMT"),
            raw_features: raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feat_lines_are_parsed() {
        let lines: Vec<String> = [
            "211-Features:",
            " MDTM",
            " MLST type*;size*;modify*;",
            " SIZE",
            " UTF8",
            " EPSV",
            "211 End",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let f = ServerFeatures::from_feat_lines(&lines);
        assert!(f.mlst && f.mlsd && f.size && f.mdtm && f.utf8 && f.epsv);
        assert!(!f.mfmt);
        assert_eq!(f.raw_features.len(), 5);
    }

    #[test]
    fn response_classes() {
        let r = FtpResponse {
            code: 150,
            lines: vec!["150 Opening".into()],
        };
        assert!(r.is_preliminary() && r.is_success());
        let r = FtpResponse {
            code: 350,
            lines: vec!["350 Ready for RNTO".into()],
        };
        assert!(r.is_intermediate());
        let r = FtpResponse {
            code: 550,
            lines: vec!["550 No such file".into()],
        };
        assert!(!r.is_success());
    }

    #[test]
    fn config_debug_hides_password() {
        let cfg = FtpConnectionConfig {
            password: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }
}
