//! Data-channel management for FTP transfers.
//!
//! Passive modes only (RFC 959 PASV, RFC 2428 EPSV); the client always
//! dials out, which is what works behind NAT. The socket is TLS-wrapped
//! for FTPS after the server has accepted the transfer command.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::tls;
use regex::Regex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Passive-mode variant actually used for one data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveKind {
    Pasv,
    Epsv,
}

/// Abstraction over a plain or TLS-wrapped data stream.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Negotiate a passive data port and connect to it.
///
/// `control_peer` is the address of the control connection; it replaces
/// PASV addresses that are unusable from here (0.0.0.0, or a private
/// address handed out by a server behind NAT).
pub async fn open_passive(
    codec: &mut FtpCodec,
    kind: PassiveKind,
    host: &str,
    control_peer: Option<IpAddr>,
    data_timeout: Duration,
) -> FtpResult<TcpStream> {
    let target = match kind {
        PassiveKind::Pasv => {
            let resp = codec.expect_ok("PASV").await?;
            let advertised = parse_pasv_response(&resp.text())?;
            let ip = usable_pasv_ip(advertised.ip(), control_peer);
            SocketAddr::new(ip, advertised.port()).to_string()
        }
        PassiveKind::Epsv => {
            let resp = codec.expect_ok("EPSV").await?;
            let port = parse_epsv_response(&resp.text())?;
            match control_peer {
                Some(ip) => SocketAddr::new(ip, port).to_string(),
                None => format!("{}:{}", host, port),
            }
        }
    };

    let tcp = timeout(data_timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| FtpError::data_channel(format!("Data connect to {} timed out", target)))?
        .map_err(|e| FtpError::data_channel(format!("Data connect to {}: {}", target, e)))?;
    tcp.set_nodelay(true).ok();
    Ok(tcp)
}

/// Wrap the data socket in TLS when the control channel is protected.
pub async fn secure(
    tcp: TcpStream,
    host: &str,
    connector: Option<&TlsConnector>,
) -> FtpResult<DataStream> {
    match connector {
        Some(c) => Ok(DataStream::Tls(Box::new(
            tls::wrap_data_stream(tcp, host, c).await?,
        ))),
        None => Ok(DataStream::Plain(tcp)),
    }
}

fn usable_pasv_ip(advertised: IpAddr, control_peer: Option<IpAddr>) -> IpAddr {
    let Some(peer) = control_peer else {
        return advertised;
    };
    let unusable = match advertised {
        IpAddr::V4(v4) => v4.is_unspecified() || (v4.is_private() && !is_private(peer)),
        IpAddr::V6(v6) => v6.is_unspecified(),
    };
    if unusable {
        log::debug!("Ignoring PASV address {}, using {}", advertised, peer);
        peer
    } else {
        advertised
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// ─── Reply parsing ───────────────────────────────────────────────────

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 response.
fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").ok())
        .as_ref()
        .ok_or_else(|| FtpError::protocol_error("PASV pattern failed to compile"))?;
    let caps = re
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;

    let nums = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

/// Parse the port from `229 Entering Extended Passive Mode (|||port|)`.
fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"\((.)(.)(.)(\d+)(.)\)").ok())
        .as_ref()
        .ok_or_else(|| FtpError::protocol_error("EPSV pattern failed to compile"))?;
    let caps = re
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse EPSV: {}", text)))?;
    caps[4]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error("EPSV port out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_pasv() {
        let addr = parse_pasv_response("227 Entering Passive Mode (192,168,1,10,195,80).").unwrap();
        assert_eq!(addr.ip(), IpAddr::from([192, 168, 1, 10]));
        assert_eq!(addr.port(), 195 * 256 + 80);
    }

    #[test]
    fn parses_pasv_without_parentheses() {
        let addr = parse_pasv_response("227 Entering Passive Mode 10,0,0,5,4,1").unwrap();
        assert_eq!(addr.port(), 1025);
    }

    #[test]
    fn rejects_out_of_range_pasv() {
        assert!(parse_pasv_response("227 (300,1,1,1,1,1)").is_err());
        assert!(parse_pasv_response("227 garbage").is_err());
    }

    #[test]
    fn parses_epsv() {
        assert_eq!(
            parse_epsv_response("229 Entering Extended Passive Mode (|||50123|)").unwrap(),
            50123
        );
        assert_eq!(parse_epsv_response("229 ok (!!!2121!)").unwrap(), 2121);
    }

    #[test]
    fn private_pasv_address_from_public_server_is_replaced() {
        let public = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let private = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(usable_pasv_ip(private, Some(public)), public);
        assert_eq!(usable_pasv_ip(public, Some(public)), public);
        let lan_peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(usable_pasv_ip(private, Some(lan_peer)), private);
        assert_eq!(
            usable_pasv_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED), Some(lan_peer)),
            lan_peer
        );
    }
}
