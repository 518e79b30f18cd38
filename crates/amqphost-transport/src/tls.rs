//! TLS support for `amqps` and `wss` listeners.
//!
//! The listener authenticates with a configured certificate. Client
//! certificates can be requested, required, checked against a client CA or
//! handed to an application validation callback.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::transport::{write_all_vectored, CloseSignal, Transport};

pub use tokio_rustls::TlsAcceptor as TlsAcceptorInner;
pub use tokio_rustls::TlsConnector as TlsConnectorInner;

/// Server-side TLS configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM-encoded certificate chain presented by the listener.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key of the listener certificate.
    pub private_key_pem: Vec<u8>,
    /// PEM-encoded CA certificates that client certificates must chain to.
    pub client_ca_pem: Option<Vec<u8>>,
    /// Whether clients must present a certificate.
    pub require_client_cert: bool,
}

/// Application check of a client certificate chain (end entity first, DER).
pub trait CertificateValidator: Send + Sync {
    /// Returns true to accept the chain.
    fn validate(&self, chain: &[Vec<u8>]) -> bool;
}

impl<F> CertificateValidator for F
where
    F: Fn(&[Vec<u8>]) -> bool + Send + Sync,
{
    fn validate(&self, chain: &[Vec<u8>]) -> bool {
        self(chain)
    }
}

/// Client certificate verifier delegating the trust decision to a callback.
struct CallbackClientVerifier {
    validator: Arc<dyn CertificateValidator>,
    mandatory: bool,
    algorithms: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for CallbackClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackClientVerifier")
            .field("mandatory", &self.mandatory)
            .finish()
    }
}

impl ClientCertVerifier for CallbackClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let chain: Vec<Vec<u8>> = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|c| c.as_ref().to_vec())
            .collect();
        if self.validator.validate(&chain) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::General("client certificate rejected".to_string()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn root_store(pem: &[u8]) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs_from_pem(pem)? {
        roots.add(cert).map_err(|e| TransportError::TlsError {
            reason: format!("failed to add CA cert: {}", e),
        })?;
    }
    Ok(roots)
}

/// Server-side TLS acceptor.
pub struct TlsAcceptor {
    inner: TlsAcceptorInner,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Creates an acceptor. A `validator` replaces CA based client certificate checks.
    pub fn new(config: &TlsConfig, validator: Option<Arc<dyn CertificateValidator>>) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let builder = rustls::ServerConfig::builder();
        let builder = match (validator, &config.client_ca_pem) {
            (Some(validator), _) => {
                let verifier = CallbackClientVerifier {
                    validator,
                    mandatory: config.require_client_cert,
                    algorithms: rustls::crypto::ring::default_provider()
                        .signature_verification_algorithms,
                };
                builder.with_client_cert_verifier(Arc::new(verifier))
            }
            (None, Some(ca_pem)) => {
                let mut verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca_pem)?));
                if !config.require_client_cert {
                    verifier = verifier.allow_unauthenticated();
                }
                let verifier = verifier.build().map_err(|e| TransportError::TlsError {
                    reason: format!("failed to build client verifier: {}", e),
                })?;
                builder.with_client_cert_verifier(verifier)
            }
            (None, None) if config.require_client_cert => {
                return Err(TransportError::TlsError {
                    reason: "client certificates required but no client CA or validator configured"
                        .to_string(),
                })
            }
            (None, None) => builder.with_no_client_auth(),
        };

        let server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError {
                reason: format!("failed to set server cert: {}", e),
            })?;

        Ok(Self {
            inner: TlsAcceptorInner::from(Arc::new(server_config)),
        })
    }

    /// Runs the server handshake over an accepted stream.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: format!("TLS handshake failed: {}", e),
            })?;
        Ok(TlsStream::Server(stream))
    }
}

/// Client-side TLS connector, used by tools and tests that dial a listener.
pub struct TlsConnector {
    inner: TlsConnectorInner,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Creates a connector trusting `ca_pem`, optionally presenting a client
    /// certificate given as `(cert_chain_pem, private_key_pem)`.
    pub fn new(ca_pem: &[u8], client_identity: Option<(&[u8], &[u8])>) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store(ca_pem)?);
        let client_config = match client_identity {
            Some((cert_pem, key_pem)) => builder
                .with_client_auth_cert(load_certs_from_pem(cert_pem)?, load_private_key_from_pem(key_pem)?)
                .map_err(|e| TransportError::TlsError {
                    reason: format!("failed to create client config: {}", e),
                })?,
            None => builder.with_no_client_auth(),
        };
        Ok(Self {
            inner: TlsConnectorInner::from(Arc::new(client_config)),
        })
    }

    /// Runs the client handshake, authenticating the server against `host`.
    pub async fn connect<IO>(&self, host: &str, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let domain = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(host.to_string()).map_err(|e| TransportError::TlsError {
                reason: format!("invalid domain: {}", e),
            })?
        };
        let stream = self
            .inner
            .connect(domain, stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: format!("TLS handshake failed: {}", e),
            })?;
        Ok(TlsStream::Client(stream))
    }
}

/// A TLS stream that can be either client or server side.
#[derive(Debug)]
pub enum TlsStream<IO> {
    /// Client-side TLS stream.
    Client(tokio_rustls::client::TlsStream<IO>),
    /// Server-side TLS stream.
    Server(tokio_rustls::server::TlsStream<IO>),
}

impl<IO> TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Returns the peer's certificate chain, if one was presented.
    pub fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        let certs = match self {
            TlsStream::Client(s) => s.get_ref().1.peer_certificates(),
            TlsStream::Server(s) => s.get_ref().1.peer_certificates(),
        };
        certs.map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
    }
}

impl<IO> AsyncRead for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO> AsyncWrite for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Transport over an established TLS stream.
pub struct TlsTransport<IO> {
    read: Mutex<ReadHalf<TlsStream<IO>>>,
    write: Mutex<WriteHalf<TlsStream<IO>>>,
    close: CloseSignal,
    peer_addr: String,
    local_addr: String,
    peer_certificates: Option<Vec<Vec<u8>>>,
}

impl<IO> TlsTransport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a completed TLS stream.
    pub fn new(stream: TlsStream<IO>, peer_addr: String, local_addr: String) -> Self {
        let peer_certificates = stream.peer_certificates();
        let (read, write) = tokio::io::split(stream);
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            close: CloseSignal::default(),
            peer_addr,
            local_addr,
            peer_certificates,
        }
    }
}

#[async_trait]
impl<IO> Transport for TlsTransport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, buf: Bytes) -> Result<()> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut write = self.write.lock().await;
        tokio::select! {
            result = async {
                write.write_all(&buf).await?;
                write.flush().await
            } => result.map_err(TransportError::IoError),
            _ = self.close.closed() => Err(TransportError::Closed),
        }
    }

    async fn send_vectored(&self, bufs: Vec<Bytes>) -> Result<()> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut write = self.write.lock().await;
        tokio::select! {
            result = write_all_vectored(&mut *write, bufs) => result.map_err(TransportError::IoError),
            _ = self.close.closed() => Err(TransportError::Closed),
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut read = self.read.lock().await;
        tokio::select! {
            result = read.read(buf) => result.map_err(TransportError::IoError),
            _ = self.close.closed() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.close.close() {
            let mut write = self.write.lock().await;
            if let Err(e) = write.shutdown().await {
                tracing::debug!(peer = %self.peer_addr, error = %e, "TLS shutdown failed");
            }
        }
        Ok(())
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }

    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        self.peer_certificates.clone()
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cursor)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| TransportError::TlsError {
            reason: format!("invalid certificate PEM: {}", e),
        })?;

    if certs.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no certificates found in PEM".to_string(),
        });
    }

    Ok(certs)
}

/// Loads the first private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| TransportError::TlsError {
            reason: format!("invalid private key PEM: {}", e),
        })?
        .ok_or_else(|| TransportError::TlsError {
            reason: "no private key found in PEM".to_string(),
        })
}

/// Generates a self-signed CA certificate and key pair using rcgen.
///
/// Returns (CA certificate PEM, CA key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| TransportError::TlsError {
        reason: format!("failed to generate CA key: {}", e),
    })?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::TlsError {
            reason: format!("failed to create CA certificate: {}", e),
        })?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Issues a certificate for `name` signed by the given CA.
///
/// Returns (certificate PEM, key PEM).
pub fn generate_signed_cert(
    ca_cert_pem: &[u8],
    ca_key_pem: &[u8],
    name: &str,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let tls_error = |what: &str, e: &dyn fmt::Display| TransportError::TlsError {
        reason: format!("{}: {}", what, e),
    };

    let ca_key_pem = std::str::from_utf8(ca_key_pem).map_err(|e| tls_error("invalid CA key PEM", &e))?;
    let ca_key = rcgen::KeyPair::from_pem(ca_key_pem).map_err(|e| tls_error("failed to parse CA key", &e))?;
    let ca_cert_pem =
        std::str::from_utf8(ca_cert_pem).map_err(|e| tls_error("invalid CA cert PEM", &e))?;
    let ca_cert = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| tls_error("failed to parse CA certificate", &e))?
        .self_signed(&ca_key)
        .map_err(|e| tls_error("failed to reconstruct CA certificate", &e))?;

    let key = rcgen::KeyPair::generate().map_err(|e| tls_error("failed to generate key", &e))?;
    let cert = rcgen::CertificateParams::new(vec![name.to_string()])
        .map_err(|e| tls_error("failed to create certificate params", &e))?
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| tls_error("failed to sign certificate", &e))?;

    Ok((cert.pem().into_bytes(), key.serialize_pem().into_bytes()))
}
