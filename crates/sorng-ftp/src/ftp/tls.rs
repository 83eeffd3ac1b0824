//! TLS helpers for explicit FTPS (RFC 4217).
//!
//! - Builds a rustls `TlsConnector` from the platform trust store, with an
//!   opt-in verifier that accepts any certificate.
//! - `upgrade_to_tls` wraps an existing plain control connection.
//! - `wrap_data_stream` protects a data connection (PROT P). The same
//!   connector is reused so the server sees a resumed TLS session.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{FtpCodec, ReadHalf, WriteHalf};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Build a `TlsConnector` according to our configuration.
pub fn build_tls_connector(accept_invalid_certs: bool) -> FtpResult<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        log::debug!("Skipping unreadable native certificate: {}", err);
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    log::trace!("Loaded {} native root certificates ({} ignored)", added, ignored);

    if root_store.is_empty() && !accept_invalid_certs {
        return Err(FtpError::tls_failed(
            "No trusted root certificates available on this system",
        ));
    }

    let mut tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        log::warn!("FTPS certificate verification disabled – insecure!");
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier));
    }

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

fn server_name(host: &str) -> FtpResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| FtpError::tls_failed(format!("Invalid server name '{}': {}", host, e)))
}

/// Upgrade an existing **plain** control connection to TLS.
///
/// Called after a successful `AUTH TLS` + 234 reply. Consumes the plain
/// codec, performs the handshake and returns a TLS codec.
pub async fn upgrade_to_tls(
    codec: FtpCodec,
    host: &str,
    connector: &TlsConnector,
) -> FtpResult<FtpCodec> {
    let reply_timeout = codec.reply_timeout;
    let tcp = reunite_plain(codec)?;
    let tls = connector
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| FtpError::tls_failed(format!("Explicit TLS handshake: {}", e)))?;
    Ok(FtpCodec::from_tls(tls, reply_timeout))
}

/// Reunite the read + write halves back into a `TcpStream`.
/// Only works when both halves are `Plain`.
fn reunite_plain(codec: FtpCodec) -> FtpResult<TcpStream> {
    let (rd, wr) = match (codec.reader, codec.writer) {
        (ReadHalf::Plain(br), WriteHalf::Plain(w)) => (br.into_inner(), w),
        _ => {
            return Err(FtpError::protocol_error(
                "Cannot upgrade: connection is already TLS",
            ))
        }
    };
    rd.reunite(wr)
        .map_err(|e| FtpError::protocol_error(format!("Reunite failed: {}", e)))
}

/// Create a TLS-wrapped data channel for FTPS.
pub async fn wrap_data_stream(
    tcp: TcpStream,
    host: &str,
    connector: &TlsConnector,
) -> FtpResult<TlsStream<TcpStream>> {
    connector
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| FtpError::data_channel(format!("Data channel TLS: {}", e)))
}

// ─── NoCertVerifier (for self-signed certs) ─────────────────────────

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
