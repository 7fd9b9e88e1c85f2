//! TLS channel selection for the card-authentication transport.
//!
//! Given the verified token and the channel left open by the token fetch,
//! decide between literal reuse of that channel, a fresh PSK-authenticated
//! channel, and a fresh mutually-authenticated channel with a card-sourced
//! client credential. Cipher-suite policy is fixed; only the minimum
//! protocol version is configurable.

use std::fmt;
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::pki_types::CertificateDer;
use rustls::sign::{CertifiedKey, SigningKey};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{ActivationError, CardError, TransportError};
use crate::tls::{crypto_provider, Connection, Dialer, MinTlsVersion, SessionPinVerifier, TlsDialer};
use crate::verify::{PathSecurity, VerifiedToken};

/// Which kind of channel the transport will run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStrategy {
    /// Reuse the exact channel the token was fetched over.
    SameChannel,
    /// Fresh channel authenticated with the token's pre-shared key.
    Psk,
    /// Fresh channel with mutual TLS using a card credential.
    MutualTls,
}

impl ChannelStrategy {
    /// The strategy a verified token demands.
    pub fn for_token(token: &VerifiedToken) -> Self {
        match token.path_security {
            PathSecurity::SameChannel => ChannelStrategy::SameChannel,
            PathSecurity::Psk(_) => ChannelStrategy::Psk,
            PathSecurity::Tls => ChannelStrategy::MutualTls,
        }
    }
}

/// Everything the external transport needs to run a TLS-PSK handshake:
/// the identity and key from the token plus the version policy. The
/// handshake itself is owned by the transport layer.
pub struct PskParameters {
    /// PSK identity; the token's session identifier.
    pub identity: Vec<u8>,
    /// Key material, zeroized on drop.
    pub key: Zeroizing<Vec<u8>>,
    /// Minimum protocol version for the handshake.
    pub min_version: MinTlsVersion,
}

impl fmt::Debug for PskParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskParameters")
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .field("key", &format_args!("{} bytes", self.key.len()))
            .field("min_version", &self.min_version)
            .finish()
    }
}

/// A client credential sourced from the connected smart card.
#[derive(Clone)]
pub struct ClientCredential {
    /// The certificate chain presented to the server.
    pub chain: Vec<CertificateDer<'static>>,
    /// The signing key, possibly backed by the card itself.
    pub key: Arc<dyn SigningKey>,
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Presents the card credential on every client-certificate request.
#[derive(Debug)]
struct CardCertResolver(Arc<CertifiedKey>);

impl ResolvesClientCert for CardCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// The channel handed to the card-authentication transport.
#[derive(Debug)]
pub enum AuthChannel {
    /// The token-fetch channel, reused as-is.
    Reused(Connection),
    /// Parameters for a PSK handshake owned by the transport.
    Psk(PskParameters),
    /// A freshly opened mutually-authenticated channel.
    Mutual(Connection),
}

impl AuthChannel {
    /// Close any open connection held by this channel.
    pub async fn close(&mut self) {
        match self {
            AuthChannel::Reused(conn) | AuthChannel::Mutual(conn) => conn.close().await,
            AuthChannel::Psk(_) => {}
        }
    }
}

/// Builds the channel for the transport according to the token's demands.
pub struct ChannelSelector {
    min_version: MinTlsVersion,
    roots: RootCertStore,
}

impl ChannelSelector {
    /// Selector trusting the standard web PKI roots.
    pub fn new(min_version: MinTlsVersion) -> Self {
        Self {
            min_version,
            roots: RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            },
        }
    }

    /// Selector with caller-supplied trust anchors.
    pub fn with_roots(min_version: MinTlsVersion, roots: RootCertStore) -> Self {
        Self { min_version, roots }
    }

    /// Construct the channel for `token`.
    ///
    /// `token_channel` is the connection left open by the token fetch and
    /// `pin` the server certificate observed on its final hop. Ownership
    /// of `token_channel` transfers here: it is either reused or closed.
    pub async fn establish(
        &self,
        token: &VerifiedToken,
        mut token_channel: Connection,
        pin: Option<&CertificateDer<'static>>,
        credential: Option<ClientCredential>,
    ) -> Result<AuthChannel, ActivationError> {
        let strategy = ChannelStrategy::for_token(token);
        debug!(?strategy, server = %token.server_address, "establishing transport channel");

        match strategy {
            ChannelStrategy::SameChannel => {
                if !token_channel.is_open() {
                    return Err(TransportError::ChannelClosed.into());
                }
                // Resumption is disabled on every config built by this
                // crate, so the reused channel cannot silently hop onto a
                // different TLS session.
                Ok(AuthChannel::Reused(token_channel))
            }
            ChannelStrategy::Psk => {
                token_channel.close().await;
                let PathSecurity::Psk(ref key) = token.path_security else {
                    // for_token maps Psk strategy only from Psk security
                    return Err(TransportError::ChannelClosed.into());
                };
                Ok(AuthChannel::Psk(PskParameters {
                    identity: token.session_identifier.clone().into_bytes(),
                    key: key.clone(),
                    min_version: self.min_version,
                }))
            }
            ChannelStrategy::MutualTls => {
                token_channel.close().await;
                let credential = credential.ok_or(CardError::NoCredential)?;
                let config = self.mutual_config(credential, pin)?;
                let dialer = TlsDialer::from_config(config);
                let connection = dialer.dial(&token.server_address).await?;
                Ok(AuthChannel::Mutual(connection))
            }
        }
    }

    /// Mutual-TLS config: card credential as client identity, web-PKI
    /// verification plus an end-entity pin so every reconnect of this
    /// logical session must see the same server certificate.
    fn mutual_config(
        &self,
        credential: ClientCredential,
        pin: Option<&CertificateDer<'static>>,
    ) -> Result<ClientConfig, TransportError> {
        let verifier = match pin {
            Some(cert) => SessionPinVerifier::pinned_to(self.roots.clone(), cert.as_ref())?,
            None => SessionPinVerifier::new(self.roots.clone())?,
        };

        let certified = CertifiedKey::new(credential.chain, credential.key);
        let mut config = ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
            .with_protocol_versions(self.min_version.versions())
            .map_err(rustls::Error::from)?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(Arc::new(CardCertResolver(Arc::new(certified))));
        config.resumption = rustls::client::Resumption::disabled();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tctoken::Binding;

    fn verified(path_security: PathSecurity) -> VerifiedToken {
        VerifiedToken {
            server_address: "https://s.example/entry".parse().unwrap(),
            session_identifier: "abc".into(),
            refresh_address: "https://r.example/refresh".parse().unwrap(),
            communication_error_address: None,
            binding: Binding::TlsAuth,
            path_security,
        }
    }

    fn open_connection() -> Connection {
        let (client, server) = tokio::io::duplex(64);
        // keep the far end alive so the near end does not read EOF
        std::mem::forget(server);
        Connection::new(Box::new(client), Vec::new())
    }

    #[test]
    fn strategy_follows_path_security() {
        assert_eq!(
            ChannelStrategy::for_token(&verified(PathSecurity::SameChannel)),
            ChannelStrategy::SameChannel
        );
        assert_eq!(
            ChannelStrategy::for_token(&verified(PathSecurity::Psk(Zeroizing::new(vec![1])))),
            ChannelStrategy::Psk
        );
        assert_eq!(
            ChannelStrategy::for_token(&verified(PathSecurity::Tls)),
            ChannelStrategy::MutualTls
        );
    }

    #[tokio::test]
    async fn same_channel_reuses_the_open_connection() {
        let selector = ChannelSelector::new(MinTlsVersion::Tls13);
        let channel = selector
            .establish(&verified(PathSecurity::SameChannel), open_connection(), None, None)
            .await
            .unwrap();
        match channel {
            AuthChannel::Reused(conn) => assert!(conn.is_open()),
            other => panic!("expected reuse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_channel_rejects_a_closed_connection() {
        let selector = ChannelSelector::new(MinTlsVersion::Tls13);
        let mut conn = open_connection();
        conn.close().await;
        let err = selector
            .establish(&verified(PathSecurity::SameChannel), conn, None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::Transport(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn psk_channel_carries_identity_and_key_and_closes_fetch_channel() {
        let selector = ChannelSelector::new(MinTlsVersion::Tls12);
        let key = Zeroizing::new(vec![0xde, 0xad, 0xbe, 0xef]);
        let channel = selector
            .establish(
                &verified(PathSecurity::Psk(key)),
                open_connection(),
                None,
                None,
            )
            .await
            .unwrap();
        match channel {
            AuthChannel::Psk(params) => {
                assert_eq!(params.identity, b"abc");
                assert_eq!(&params.key[..], &[0xde, 0xad, 0xbe, 0xef]);
                assert_eq!(params.min_version, MinTlsVersion::Tls12);
            }
            other => panic!("expected PSK parameters, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mutual_tls_without_credential_is_a_card_error() {
        let selector = ChannelSelector::new(MinTlsVersion::Tls13);
        let err = selector
            .establish(&verified(PathSecurity::Tls), open_connection(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::Card(CardError::NoCredential)
        ));
    }
}
