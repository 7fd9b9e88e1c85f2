//! TLS client plumbing: curated crypto policy, connection ownership, and
//! the dialer seam the fetch pipeline runs on.
//!
//! Cipher suites and key-exchange groups are policy-fixed to a strong set;
//! there is no user choice. The minimum protocol version is configurable
//! for legacy servers and defaults to TLS 1.3. Session resumption is
//! disabled on every config built here: a channel that is reused for the
//! card-authentication transport must never silently resume onto a
//! different TLS session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, WebPkiServerVerifier};
use rustls::crypto::aws_lc_rs::{cipher_suite, default_provider, kx_group};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AddressError, TransportError};

/// Timeout for establishing the TCP connection.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for completing the TLS handshake.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum TLS protocol version accepted by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MinTlsVersion {
    /// Allow TLS 1.2 for legacy servers.
    Tls12,
    /// TLS 1.3 only.
    #[default]
    Tls13,
}

impl MinTlsVersion {
    pub(crate) fn versions(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        static TLS13_AND_12: [&rustls::SupportedProtocolVersion; 2] =
            [&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS13];
        match self {
            MinTlsVersion::Tls12 => &TLS13_AND_12,
            MinTlsVersion::Tls13 => &TLS13_ONLY,
        }
    }
}

/// The fixed crypto policy: AEAD suites with forward secrecy only.
pub fn crypto_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        kx_groups: vec![kx_group::X25519, kx_group::SECP256R1, kx_group::SECP384R1],
        ..default_provider()
    }
}

/// SHA-256 fingerprint of a DER-encoded certificate.
pub fn certificate_fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

fn webpki_roots_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

fn finish_config(
    builder: rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>,
) -> ClientConfig {
    let mut config = builder.with_no_client_auth();
    config.resumption = Resumption::disabled();
    config
}

/// Client config trusting the standard web PKI roots.
pub fn default_client_config(min_version: MinTlsVersion) -> Result<ClientConfig, TransportError> {
    let builder = ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_protocol_versions(min_version.versions())
        .map_err(rustls::Error::from)?
        .with_root_certificates(webpki_roots_store());
    Ok(finish_config(builder))
}

/// Client config trusting a caller-supplied root store. Used by tests and
/// by deployments with their own trust anchors.
pub fn client_config_with_roots(
    min_version: MinTlsVersion,
    roots: RootCertStore,
) -> Result<ClientConfig, TransportError> {
    let builder = ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_protocol_versions(min_version.versions())
        .map_err(rustls::Error::from)?
        .with_root_certificates(roots);
    Ok(finish_config(builder))
}

/// A verifier that performs standard web-PKI validation and additionally
/// pins the end-entity certificate across connections of one logical
/// session: the certificate seen on the first handshake must be presented
/// on every later one.
#[derive(Debug)]
pub struct SessionPinVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pinned: Mutex<Option<[u8; 32]>>,
}

impl SessionPinVerifier {
    /// Create a verifier with no pin yet; the first handshake sets it.
    pub fn new(roots: RootCertStore) -> Result<Arc<Self>, TransportError> {
        let inner = WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::new(crypto_provider()),
        )
        .build()
        .map_err(|err| TransportError::MalformedResponse(err.to_string()))?;
        Ok(Arc::new(Self {
            inner,
            pinned: Mutex::new(None),
        }))
    }

    /// Create a verifier already pinned to a known certificate, e.g. the one
    /// observed while fetching the token.
    pub fn pinned_to(roots: RootCertStore, der: &[u8]) -> Result<Arc<Self>, TransportError> {
        let verifier = Self::new(roots)?;
        *verifier.pinned.lock().expect("pin lock poisoned") =
            Some(certificate_fingerprint(der));
        Ok(verifier)
    }

    /// The currently pinned fingerprint, if a handshake happened.
    pub fn current_pin(&self) -> Option<[u8; 32]> {
        *self.pinned.lock().expect("pin lock poisoned")
    }
}

impl ServerCertVerifier for SessionPinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        let fingerprint = certificate_fingerprint(end_entity.as_ref());
        let mut pinned = self.pinned.lock().expect("pin lock poisoned");
        match *pinned {
            None => {
                *pinned = Some(fingerprint);
                Ok(ServerCertVerified::assertion())
            }
            Some(expected) if expected == fingerprint => Ok(ServerCertVerified::assertion()),
            Some(_) => {
                warn!("server certificate changed within one session");
                Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Byte stream of an established channel.
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

/// An established TLS channel plus the certificate chain the server
/// presented during its handshake.
///
/// The connection has exactly one owner at a time and must be closed
/// exactly once; closing is idempotent, use after close fails with
/// [`TransportError::ChannelClosed`].
pub struct Connection {
    stream: Option<Box<dyn ChannelStream>>,
    certificates: Vec<CertificateDer<'static>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.stream.is_some())
            .field("certificates", &self.certificates.len())
            .finish()
    }
}

impl Connection {
    /// Wrap an established stream and the observed server certificates.
    pub fn new(stream: Box<dyn ChannelStream>, certificates: Vec<CertificateDer<'static>>) -> Self {
        Self {
            stream: Some(stream),
            certificates,
        }
    }

    /// The server certificate chain observed during the handshake, end
    /// entity first.
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Whether the channel is still open.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Mutable access to the byte stream.
    pub fn stream_mut(&mut self) -> Result<&mut dyn ChannelStream, TransportError> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream.as_mut()),
            None => Err(TransportError::ChannelClosed),
        }
    }

    /// Shut the channel down. Idempotent: only the first call touches the
    /// socket.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(%err, "error shutting down TLS channel");
            }
        }
    }
}

/// Opens TLS channels for the fetch pipeline. The seam exists so tests can
/// substitute in-memory streams for real sockets.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a channel to the host of `url`. The URL must be `https`.
    async fn dial(&self, url: &Url) -> Result<Connection, TransportError>;
}

/// The production dialer: TCP + rustls with the curated policy.
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    /// Dialer trusting the standard web PKI roots.
    pub fn new(min_version: MinTlsVersion) -> Result<Self, TransportError> {
        Ok(Self::from_config(default_client_config(min_version)?))
    }

    /// Dialer with a caller-supplied client config.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, url: &Url) -> Result<Connection, TransportError> {
        let host = url
            .host_str()
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::other(
                    AddressError::Malformed(url.to_string()).to_string(),
                ))
            })?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        debug!(%host, port, "opening TLS channel");
        let tcp = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| TransportError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))??;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(host.clone()).map_err(|_| {
            TransportError::Io(std::io::Error::other(format!("invalid server name `{host}`")))
        })?;
        let stream = timeout(TLS_HANDSHAKE_TIMEOUT, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))??;

        let certificates = stream
            .get_ref()
            .1
            .peer_certificates()
            .unwrap_or_default()
            .iter()
            .map(|cert| cert.clone().into_owned())
            .collect();

        Ok(Connection::new(Box::new(stream), certificates))
    }
}
