//! Byte transports.
//!
//! The driver is generic over a [`Transport`]: any duplex byte stream
//! that can report whether it is TLS-protected and perform an in-place
//! TLS upgrade. [`ImapStream`] is the production transport (plain TCP or
//! TLS over TCP); tests drive the core through in-memory transports.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

use super::config::{Config, Security, TrustDecider};

/// A duplex byte stream the connection core can drive.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sized + 'static {
    /// Returns true if the stream is currently TLS-protected.
    fn is_secure(&self) -> bool;

    /// Performs an in-place TLS upgrade (STARTTLS).
    fn upgrade_tls(self, config: &Config) -> impl Future<Output = Result<Self>> + Send;
}

/// A stream that can be either plaintext or TLS.
pub enum ImapStream {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport for ImapStream {
    fn is_secure(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    fn upgrade_tls(self, config: &Config) -> impl Future<Output = Result<Self>> + Send {
        async move {
            match self {
                Self::Plain(tcp) => {
                    let connector = tls_connector(config)?;
                    let server_name = ServerName::try_from(config.host.clone())?;
                    let tls = timeout(config.connect_timeout, connector.connect(server_name, tcp))
                        .await
                        .map_err(|_| Error::Timeout(config.connect_timeout))??;
                    Ok(Self::Tls(Box::new(tls)))
                }
                Self::Tls(_) => Err(Error::InvalidState("stream is already TLS".to_string())),
            }
        }
    }
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("ImapStream::Plain"),
            Self::Tls(_) => f.write_str("ImapStream::Tls"),
        }
    }
}

/// Opens the transport described by the configuration.
///
/// Completes when the socket (and, for implicit TLS, the handshake) is
/// open; the IMAP greeting has not necessarily arrived yet.
pub async fn connect(config: &Config) -> Result<ImapStream> {
    tracing::debug!(host = %config.host, port = config.port, "connecting");
    let tcp = timeout(
        config.connect_timeout,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| Error::Timeout(config.connect_timeout))??;
    tcp.set_nodelay(true)?;

    match config.security {
        Security::None | Security::StartTls => Ok(ImapStream::Plain(tcp)),
        Security::Implicit => {
            let connector = tls_connector(config)?;
            let server_name = ServerName::try_from(config.host.clone())?;
            let tls = timeout(config.connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| Error::Timeout(config.connect_timeout))??;
            Ok(ImapStream::Tls(Box::new(tls)))
        }
    }
}

/// Builds a TLS connector from the configuration's trust settings.
pub(crate) fn tls_connector(config: &Config) -> Result<TlsConnector> {
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    let mut roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(anchor) = &config.trust_anchor {
        roots.add(anchor.clone())?;
    }

    let tls_config = if let Some(decider) = &config.trust_decider {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::TlsConfig(e.to_string()))?;
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DecidingVerifier {
                inner,
                decider: Arc::clone(decider),
            }))
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// WebPKI verification with an application fallback: certificates the
/// root store rejects are offered to the configured trust decider.
struct DecidingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    decider: TrustDecider,
}

impl std::fmt::Debug for DecidingVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecidingVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for DecidingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(error) => {
                if (self.decider)(end_entity) {
                    tracing::warn!(%error, "certificate accepted by trust decider");
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(error)
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_connector_builds_with_defaults() {
        let config = Config::new("imap.example.com");
        assert!(tls_connector(&config).is_ok());
    }

    #[test]
    fn test_tls_connector_builds_with_decider() {
        let config = Config::builder("imap.example.com")
            .trust_decider(Arc::new(|_cert| false))
            .build();
        assert!(tls_connector(&config).is_ok());
    }
}
