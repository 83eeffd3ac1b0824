//! TCP transport: establishes the FTP control connection.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::types::{FtpConnectionConfig, FtpResponse};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Open the control connection and read the server welcome banner.
///
/// A 421 banner ("too many connections") surfaces as a `ConnectionLimit`
/// error from the codec. Explicit FTPS upgrades later, in `client.rs`.
pub async fn connect(config: &FtpConnectionConfig) -> FtpResult<(FtpCodec, FtpResponse)> {
    let addr = format!("{}:{}", config.host, config.port);
    let dur = Duration::from_secs(config.connect_timeout_sec);

    let tcp = timeout(dur, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();

    let mut codec = FtpCodec::from_tcp(tcp, Duration::from_secs(config.data_timeout_sec));
    let banner = codec.read_response().await?;
    if !banner.is_success() {
        return Err(FtpError::from_reply(banner.code, &banner.text()));
    }
    log::debug!("FTP {} banner: {}", addr, banner.text());
    Ok((codec, banner))
}
