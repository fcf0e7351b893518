use crate::error::ProbeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `proxy.tls_verify` is off: the probe tolerates
/// interception-grade exit proxies where encryption is desired but the
/// upstream identity cannot be validated.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the client connector once per task. SNI is always sent; certificate
/// verification follows the `tls_verify` flag.
pub fn connector(tls_verify: bool) -> TlsConnector {
    let config = if tls_verify {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// TLS handshake over an already-established tunnel (SOCKS5 or direct),
/// with `host` as SNI.
pub async fn handshake<S>(
    connector: &TlsConnector,
    host: &str,
    stream: S,
) -> Result<TlsStream<S>, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::ProxyBroken(format!("bad SNI host {:?}: {}", host, e)))?;
    tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| ProbeError::ProxyBroken("tls handshake timed out".to_string()))?
        .map_err(|e| ProbeError::ProxyBroken(format!("tls handshake: {}", e)))
}

/// Some sites drop the connection without a close_notify. That surfaces as
/// an unexpected-EOF I/O error while the close-delimited response body is
/// read, and is not a probe failure.
pub fn is_benign_close(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::UnexpectedEof
}
