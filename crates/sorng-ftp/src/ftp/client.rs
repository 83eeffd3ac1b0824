//! Stateful FTP client: owns the control connection and issues commands.
//!
//! Lifecycle: `connect()` → optional AUTH TLS → USER/PASS → FEAT probe →
//! OPTS UTF8 → TYPE I. After that the client is ready for `directory.rs`
//! and `file_ops.rs`, and is handed to the sync engine through the
//! `TransferClient` implementation in `adapter.rs`.

use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser;
use crate::ftp::protocol::FtpCodec;
use crate::ftp::tls;
use crate::ftp::transfer::{self, DataStream, PassiveKind};
use crate::ftp::types::*;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_rustls::TlsConnector;
use uuid::Uuid;

/// A connected FTP client session.
pub struct FtpClient {
    pub id: String,
    pub(crate) codec: FtpCodec,
    pub config: FtpConnectionConfig,
    pub features: ServerFeatures,
    /// Kept for PROT P data channels; `None` on plain FTP.
    pub(crate) tls: Option<TlsConnector>,
    pub(crate) control_peer: Option<IpAddr>,
    pub(crate) closed: bool,
    /// Set once EPSV was refused so later transfers go straight to PASV.
    pub(crate) epsv_refused: bool,
    /// A data command was accepted with 1xx; its 226 is still unread.
    pub(crate) awaiting_completion: bool,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl FtpClient {
    /// Establish a new, authenticated FTP session.
    pub async fn connect(config: FtpConnectionConfig) -> FtpResult<Self> {
        if config.host.trim().is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }

        let id = Uuid::new_v4().to_string();
        let (mut codec, _banner) = connection::connect(&config).await?;
        let control_peer = match &codec.reader {
            crate::ftp::protocol::ReadHalf::Plain(r) => r.get_ref().peer_addr().ok().map(|a| a.ip()),
            crate::ftp::protocol::ReadHalf::Tls(_) => None,
        };

        // ── Explicit FTPS: AUTH TLS ──────────────────────────────
        let tls = if config.security == FtpSecurityMode::Explicit {
            let resp = codec.execute("AUTH TLS").await?;
            if resp.code != 234 && !resp.is_success() {
                return Err(FtpError::tls_failed(format!(
                    "AUTH TLS rejected: {}",
                    resp.text()
                )));
            }
            let connector = tls::build_tls_connector(config.accept_invalid_certs)?;
            codec = tls::upgrade_to_tls(codec, &config.host, &connector).await?;
            codec.expect_ok("PBSZ 0").await?;
            codec.expect_ok("PROT P").await?;
            Some(connector)
        } else {
            None
        };

        // ── Authenticate ─────────────────────────────────────────
        let user_resp = codec.execute(&format!("USER {}", config.username)).await?;
        if user_resp.code == 331 || user_resp.code == 332 {
            let pass_resp = codec.execute(&format!("PASS {}", config.password)).await?;
            if !pass_resp.is_success() {
                return Err(login_error(pass_resp.code, &pass_resp.text()));
            }
        } else if !user_resp.is_success() {
            return Err(login_error(user_resp.code, &user_resp.text()));
        }

        // ── FEAT ─────────────────────────────────────────────────
        let features = match codec.execute("FEAT").await {
            Ok(r) if r.is_success() => ServerFeatures::from_feat_lines(&r.lines),
            Ok(_) => ServerFeatures::default(),
            Err(e) if e.breaks_connection() => return Err(e),
            Err(_) => ServerFeatures::default(),
        };

        if features.utf8 {
            let _ = codec.execute("OPTS UTF8 ON").await?;
        }
        codec.expect_ok("TYPE I").await?;

        log::info!(
            "FTP session {} connected to {}:{} as {}{}",
            id,
            config.host,
            config.port,
            config.username,
            if tls.is_some() { " (TLS)" } else { "" }
        );

        Ok(Self {
            id,
            codec,
            config,
            features,
            tls,
            control_peer,
            closed: false,
            epsv_refused: false,
            awaiting_completion: false,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        })
    }

    // ─── Connection state ────────────────────────────────────────

    /// Mark the session dead after errors that leave the control channel
    /// in an unknown state.
    pub(crate) fn track<T>(&mut self, result: FtpResult<T>) -> FtpResult<T> {
        if let Err(ref e) = result {
            if e.breaks_connection() {
                log::debug!("FTP session {} marked closed after: {}", self.id, e);
                self.closed = true;
            }
        }
        result
    }

    pub(crate) fn ensure_open(&self) -> FtpResult<()> {
        if self.closed {
            Err(FtpError::disconnected("FTP session is closed"))
        } else {
            Ok(())
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed
    }

    /// Send a NOOP to check the control connection.
    pub async fn noop(&mut self) -> FtpResult<()> {
        self.ensure_open()?;
        let r = self.codec.expect_ok("NOOP").await.map(|_| ());
        self.track(r)
    }

    // ─── Data channel helper ─────────────────────────────────────

    fn passive_kind(&self) -> PassiveKind {
        match self.config.data_channel_mode {
            DataChannelMode::Passive => PassiveKind::Pasv,
            DataChannelMode::ExtendedPassive => PassiveKind::Epsv,
            DataChannelMode::Auto if self.features.epsv && !self.epsv_refused => PassiveKind::Epsv,
            DataChannelMode::Auto => PassiveKind::Pasv,
        }
    }

    /// Open a data connection, send `cmd` on the control channel and wait
    /// for the server to accept it. Returns the (possibly TLS) data stream.
    pub(crate) async fn begin_transfer(&mut self, cmd: &str) -> FtpResult<DataStream> {
        let data_timeout = Duration::from_secs(self.config.data_timeout_sec);
        let kind = self.passive_kind();
        let tcp = match transfer::open_passive(
            &mut self.codec,
            kind,
            &self.config.host,
            self.control_peer,
            data_timeout,
        )
        .await
        {
            Ok(tcp) => tcp,
            Err(e) if kind == PassiveKind::Epsv && !e.breaks_connection() => {
                log::debug!("EPSV failed ({}), falling back to PASV", e);
                self.epsv_refused = true;
                transfer::open_passive(
                    &mut self.codec,
                    PassiveKind::Pasv,
                    &self.config.host,
                    self.control_peer,
                    data_timeout,
                )
                .await?
            }
            Err(e) => return Err(e),
        };

        let resp = self.codec.execute(cmd).await?;
        if resp.is_preliminary() {
            self.awaiting_completion = true;
        } else if resp.is_success() {
            // Some servers answer 2xx straight away for empty transfers.
            log::trace!("'{}' completed without a 1xx reply", cmd);
            self.awaiting_completion = false;
        } else {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }

        transfer::secure(tcp, &self.config.host, self.tls.as_ref()).await
    }

    /// Read the final 226/250 reply that closes a data transfer.
    pub(crate) async fn finish_transfer(&mut self) -> FtpResult<()> {
        if !std::mem::take(&mut self.awaiting_completion) {
            return Ok(());
        }
        let done = self.codec.read_response().await?;
        if !done.is_success() {
            return Err(FtpError::from_reply(done.code, &done.text()));
        }
        Ok(())
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// Retrieve a directory listing (prefers MLSD, falls back to LIST).
    pub async fn list(&mut self, path: &str) -> FtpResult<Vec<FtpEntry>> {
        self.ensure_open()?;
        let cmd = if self.features.mlsd {
            format!("MLSD {}", path)
        } else {
            // -a keeps dot-files in the listing on servers that honour it.
            format!("LIST -a {}", path)
        };
        let r = self.retrieve_data_as_string(&cmd).await;
        let data = self.track(r)?;
        Ok(parser::parse_listing(&data))
    }

    /// Open data channel, send command, collect body as String.
    pub async fn retrieve_data_as_string(&mut self, cmd: &str) -> FtpResult<String> {
        let mut ds = self.begin_transfer(cmd).await?;
        let mut buf = Vec::new();
        ds.read_to_end(&mut buf).await.map_err(|e| {
            FtpError::data_channel(format!("Reading '{}' data: {}", cmd, e))
        })?;
        drop(ds);
        self.finish_transfer().await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    // ─── SIZE / MDTM ────────────────────────────────────────────

    /// Get the size of a remote file (RFC 3659 SIZE).
    pub async fn size(&mut self, path: &str) -> FtpResult<u64> {
        self.ensure_open()?;
        let r = self.codec.expect_ok(&format!("SIZE {}", path)).await;
        let resp = self.track(r)?;
        let text = resp.text();
        text.split_whitespace()
            .nth(1)
            .and_then(|n| n.trim().parse::<u64>().ok())
            .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse SIZE: {}", text)))
    }

    /// Get the modification time of a remote file (RFC 3659 MDTM).
    pub async fn mdtm(&mut self, path: &str) -> FtpResult<chrono::DateTime<chrono::Utc>> {
        self.ensure_open()?;
        let r = self.codec.expect_ok(&format!("MDTM {}", path)).await;
        let resp = self.track(r)?;
        let text = resp.text();
        text.split_whitespace()
            .nth(1)
            .and_then(parser::parse_mlsd_time)
            .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse MDTM: {}", text)))
    }

    // ─── QUIT ────────────────────────────────────────────────────

    /// Gracefully close the session. Safe to call repeatedly.
    pub async fn quit(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let quit = tokio::time::timeout(Duration::from_secs(3), self.codec.execute("QUIT"));
        match quit.await {
            Ok(Ok(_)) => log::debug!("FTP session {} closed", self.id),
            Ok(Err(e)) => log::debug!("FTP session {} QUIT failed: {}", self.id, e),
            Err(_) => log::debug!("FTP session {} QUIT timed out", self.id),
        }
    }
}

/// USER/PASS rejection: keep limit replies transient, everything else is a
/// credential failure.
fn login_error(code: u16, text: &str) -> FtpError {
    let classified = FtpError::from_reply(code, text);
    match classified.kind {
        crate::ftp::error::FtpErrorKind::ConnectionLimit => classified,
        _ => FtpError::auth_failed(format!("Login failed: {}", text)).with_code(code),
    }
}

/// Parse `257 "/some/path"` into the path string.
pub(crate) fn parse_quoted_path(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let rest = &text[start + 1..];
    // Embedded quotes are doubled ("") per RFC 959.
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                out.push('"');
                chars.next();
            } else {
                return Some(out);
            }
        } else {
            out.push(c);
        }
    }
    None
}
