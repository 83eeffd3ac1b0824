// ── SftpClient – session lifecycle ──────────────────────────────────────────
//
// libssh2 is blocking. The session lives behind an `Arc<Mutex<_>>` and every
// call runs on tokio's blocking pool, so a slow server never stalls the
// runtime. One client is one SSH session with one SFTP channel; concurrency
// comes from opening several clients.

use crate::sftp::error::{SftpError, SftpErrorKind, SftpResult};
use crate::sftp::types::*;
use log::{debug, info};
use ssh2::{Session, Sftp};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub(crate) struct SessionHandle {
    pub session: Session,
    pub sftp: Sftp,
    #[allow(dead_code)] // held to keep the TCP connection alive
    pub tcp: TcpStream,
}

pub struct SftpClient {
    pub id: String,
    pub config: SftpConnectionConfig,
    pub auth_method: AuthMethod,
    pub remote_home: Option<String>,
    pub(crate) handle: Arc<Mutex<SessionHandle>>,
    pub(crate) closed: bool,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl SftpClient {
    // ── Connect ──────────────────────────────────────────────────────────────

    pub async fn connect(config: SftpConnectionConfig) -> SftpResult<Self> {
        if config.host.trim().is_empty() {
            return Err(SftpError::invalid_config("Host must not be empty"));
        }
        if config.password.is_none() && config.private_key_data.is_none() {
            return Err(SftpError::invalid_config(
                "Either a password or a private key is required",
            ));
        }

        let cfg = config.clone();
        let (handle, auth_method, remote_home) =
            tokio::task::spawn_blocking(move || open_session(&cfg))
                .await
                .map_err(|e| SftpError::internal(format!("Connect task failed: {}", e)))??;

        let id = Uuid::new_v4().to_string();
        info!(
            "SFTP session {} connected to {}:{} as {} via {}",
            id, config.host, config.port, config.username, auth_method
        );

        Ok(Self {
            id,
            config,
            auth_method,
            remote_home,
            handle: Arc::new(Mutex::new(handle)),
            closed: false,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        })
    }

    // ── Blocking bridge ──────────────────────────────────────────────────────

    /// Run `op` against the session on the blocking pool.
    pub(crate) fn spawn<T, F>(&self, op: F) -> JoinHandle<SftpResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut SessionHandle) -> SftpResult<T> + Send + 'static,
    {
        let handle = self.handle.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = handle
                .lock()
                .map_err(|_| SftpError::internal("SFTP session lock poisoned"))?;
            op(&mut guard)
        })
    }

    /// Await a spawned operation and record whether it killed the session.
    pub(crate) async fn join<T>(&mut self, task: JoinHandle<SftpResult<T>>) -> SftpResult<T> {
        let result = match task.await {
            Ok(r) => r,
            Err(e) => Err(SftpError::internal(format!("SFTP worker failed: {}", e))),
        };
        if let Err(ref e) = result {
            if e.breaks_connection() {
                debug!("SFTP session {} marked closed after: {}", self.id, e);
                self.closed = true;
            }
        }
        result
    }

    pub(crate) async fn run<T, F>(&mut self, op: F) -> SftpResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SessionHandle) -> SftpResult<T> + Send + 'static,
    {
        self.ensure_open()?;
        let task = self.spawn(op);
        self.join(task).await
    }

    pub(crate) fn ensure_open(&self) -> SftpResult<()> {
        if self.closed {
            Err(SftpError::disconnected("SFTP session is closed"))
        } else {
            Ok(())
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed
    }

    // ── Liveness / disconnect ────────────────────────────────────────────────

    /// Resolve `.` on the server; cheap and side-effect free.
    pub async fn ping(&mut self) -> SftpResult<String> {
        self.run(|h| {
            h.sftp
                .realpath(Path::new("."))
                .map(|p| p.to_string_lossy().into_owned())
                .map_err(|e| SftpError::from_ssh("realpath .", e))
        })
        .await
    }

    /// Close the SSH session. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let task = self.spawn(|h| {
            h.session
                .disconnect(None, "Client disconnecting", None)
                .map_err(|e| SftpError::from_ssh("disconnect", e))
        });
        match task.await {
            Ok(Ok(())) => info!("SFTP session {} disconnected", self.id),
            Ok(Err(e)) => debug!("SFTP session {} disconnect: {}", self.id, e),
            Err(e) => debug!("SFTP session {} disconnect task: {}", self.id, e),
        }
    }
}

// ── Session setup (blocking) ─────────────────────────────────────────────────

fn open_session(
    config: &SftpConnectionConfig,
) -> SftpResult<(SessionHandle, AuthMethod, Option<String>)> {
    let addr = format!("{}:{}", config.host, config.port);
    let timeout = Duration::from_secs(config.timeout_secs.max(1));

    let tcp = connect_tcp(&addr, timeout)?;

    let mut session =
        Session::new().map_err(|e| SftpError::handshake_failed(format!("SSH session: {}", e)))?;
    session.set_tcp_stream(
        tcp.try_clone()
            .map_err(|e| SftpError::connection_failed(format!("{}: {}", addr, e)))?,
    );
    session.set_timeout(timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| SftpError::from_ssh("SSH handshake", e))
        .map_err(|e| match e.kind {
            SftpErrorKind::Timeout => e,
            _ => SftpError::handshake_failed(e.message),
        })?;

    let auth_method = authenticate(&mut session, config)?;

    session.set_keepalive(
        config.keepalive_interval_secs > 0,
        config.keepalive_interval_secs as u32,
    );
    session.set_timeout((config.data_timeout_secs.max(1) * 1000) as u32);

    let sftp = session
        .sftp()
        .map_err(|e| SftpError::from_ssh("SFTP subsystem", e))?;
    let remote_home = sftp
        .realpath(Path::new("."))
        .ok()
        .map(|p| p.to_string_lossy().into_owned());

    Ok((SessionHandle { session, sftp, tcp }, auth_method, remote_home))
}

fn connect_tcp(addr: &str, timeout: Duration) -> SftpResult<TcpStream> {
    let targets = addr
        .to_socket_addrs()
        .map_err(|e| SftpError::connection_failed(format!("Cannot resolve {}: {}", addr, e)))?;

    let mut last_err = None;
    for target in targets {
        match TcpStream::connect_timeout(&target, timeout) {
            Ok(tcp) => {
                tcp.set_nodelay(true).ok();
                return Ok(tcp);
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                last_err = Some(SftpError::new(
                    SftpErrorKind::Timeout,
                    format!("TCP connect to {} timed out", target),
                ));
            }
            Err(e) => {
                last_err = Some(SftpError::connection_failed(format!(
                    "TCP connect to {}: {}",
                    target, e
                )));
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| SftpError::connection_failed(format!("No addresses for {}", addr))))
}

// ── Authentication ───────────────────────────────────────────────────────────

struct PasswordPrompt {
    password: String,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt {
    fn prompt(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

fn authenticate(session: &mut Session, config: &SftpConnectionConfig) -> SftpResult<AuthMethod> {
    let mut failures = Vec::new();

    // 1. Private-key data: ssh2 has no in-memory pubkey auth; go through a temp file.
    if let Some(ref key_data) = config.private_key_data {
        let tmp_key = std::env::temp_dir().join(format!("sorng_sftp_key_{}", Uuid::new_v4()));
        match std::fs::write(&tmp_key, key_data.as_bytes()) {
            Ok(()) => {
                let result = session.userauth_pubkey_file(
                    &config.username,
                    None,
                    &tmp_key,
                    config.private_key_passphrase.as_deref(),
                );
                let _ = std::fs::remove_file(&tmp_key);
                match result {
                    Ok(()) if session.authenticated() => return Ok(AuthMethod::PublicKey),
                    Ok(()) => failures.push("publickey: not accepted".to_string()),
                    Err(e) => failures.push(format!("publickey: {}", e.message())),
                }
            }
            Err(e) => failures.push(format!("publickey: cannot stage key: {}", e)),
        }
    }

    // 2. Password, then keyboard-interactive with the same secret.
    if let Some(ref password) = config.password {
        match session.userauth_password(&config.username, password) {
            Ok(()) if session.authenticated() => return Ok(AuthMethod::Password),
            Ok(()) => failures.push("password: not accepted".to_string()),
            Err(e) => failures.push(format!("password: {}", e.message())),
        }

        let mut prompt = PasswordPrompt {
            password: password.clone(),
        };
        match session.userauth_keyboard_interactive(&config.username, &mut prompt) {
            Ok(()) if session.authenticated() => return Ok(AuthMethod::KeyboardInteractive),
            Ok(()) => failures.push("keyboard-interactive: not accepted".to_string()),
            Err(e) => failures.push(format!("keyboard-interactive: {}", e.message())),
        }
    }

    Err(SftpError::auth_failed(format!(
        "No authentication method succeeded for {} ({})",
        config.username,
        failures.join("; ")
    )))
}
