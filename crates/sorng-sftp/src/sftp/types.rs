// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_sftp_port() -> u16 {
    22
}
fn default_chunk_size() -> usize {
    1_048_576 // 1 MiB
}
fn default_timeout_secs() -> u64 {
    15
}
fn default_data_timeout_secs() -> u64 {
    30
}
fn default_keepalive_secs() -> u64 {
    60
}

// ── Connection & Authentication ──────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpConnectionConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PEM / OpenSSH private key contents.
    #[serde(default)]
    pub private_key_data: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    /// TCP connect + handshake timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound for any single blocking libssh2 call once connected.
    #[serde(default = "default_data_timeout_secs")]
    pub data_timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SftpConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_sftp_port(),
            username: String::new(),
            password: None,
            private_key_data: None,
            private_key_passphrase: None,
            timeout_secs: default_timeout_secs(),
            data_timeout_secs: default_data_timeout_secs(),
            keepalive_interval_secs: default_keepalive_secs(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl std::fmt::Debug for SftpConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("private_key_data", &self.private_key_data.as_ref().map(|_| "****"))
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

// ── Auth outcome ─────────────────────────────────────────────────────────────

/// Which method finally authenticated the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    PublicKey,
    Password,
    KeyboardInteractive,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AuthMethod::PublicKey => "publickey",
            AuthMethod::Password => "password",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
        })
    }
}
