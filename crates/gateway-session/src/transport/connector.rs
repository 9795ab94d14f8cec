//! Opening transports to the gateway.

use crate::error::{ConnectionError, Error, Result};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Byte stream a session runs over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Owned, type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Opens a fresh transport for every connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport to the gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be established.
    async fn connect(&self) -> Result<BoxedTransport>;
}

/// Client certificate presented during the TLS handshake.
pub struct ClientIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    /// Load a certificate chain and private key from PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if either PEM block is missing or unreadable.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ConnectionError::InvalidIdentity(e.to_string()))?;
        if certs.is_empty() {
            return Err(ConnectionError::InvalidIdentity("no certificate found".to_string()).into());
        }

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| ConnectionError::InvalidIdentity(e.to_string()))?
            .ok_or_else(|| ConnectionError::InvalidIdentity("no private key found".to_string()))?;

        Ok(Self { certs, key })
    }
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// Accepts whatever certificate the gateway presents.
///
/// Gateways ship self-signed certificates, so trust is established by the
/// password login instead. Handshake signatures are still checked.
#[derive(Debug)]
struct AcceptGatewayCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptGatewayCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Connects to the gateway over TCP and TLS.
#[derive(Clone)]
pub struct TlsConnector {
    host: String,
    port: u16,
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Create a connector for `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be built.
    pub fn new(host: impl Into<String>, port: u16, identity: Option<&ClientIdentity>) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ConnectionError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptGatewayCertificate { provider }));

        let config = match identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())
                .map_err(|e| ConnectionError::InvalidIdentity(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };

        Ok(Self {
            host: host.into(),
            port,
            config: Arc::new(config),
        })
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedTransport> {
        let addr = format!("{}:{}", self.host, self.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ConnectionError::ConnectFailed {
                addr: addr.clone(),
                source: Arc::new(e),
            })?;
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| ConnectionError::Tls(format!("invalid server name {}: {e}", self.host)))?;
        let stream = tokio_rustls::TlsConnector::from(Arc::clone(&self.config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::from(ConnectionError::Tls(e.to_string())))?;

        debug!("TLS session established with {}", addr);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_requires_certificate() {
        let result = ClientIdentity::from_pem(b"", b"");

        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::InvalidIdentity(_)))
        ));
    }

    #[test]
    fn test_connector_without_identity() {
        let connector = TlsConnector::new("192.168.0.10", 51200, None).unwrap();

        assert_eq!(connector.port, 51200);
        assert!(format!("{connector:?}").contains("192.168.0.10"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Reserve a port, then release it so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TlsConnector::new("127.0.0.1", port, None).unwrap();
        let result = connector.connect().await;

        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::ConnectFailed { .. }))
        ));
    }
}
