//! Field-by-field verification of a parsed TCToken.
//!
//! Checks run in a fixed order because earlier results change the
//! error-redirect target used by later ones. Every failure after the
//! refresh address is known carries a fully-formed redirect URL, so the
//! caller never has to re-derive where to send the user.

use std::fmt;

use tracing::{debug, warn};
use url::Url;
use zeroize::Zeroizing;

use tctoken::{Binding, PathSecurityProtocol, TcToken};

use crate::error::{ActivationError, ErrorKind, RedirectError, TokenFormatError};
use crate::fetch::{fetch, Hop, DEFAULT_HOP_BUDGET};
use crate::redirect::{same_origin, RedirectPolicy};
use crate::session::ActivationContext;
use crate::tls::Dialer;

/// Channel protection demanded by a verified token.
#[derive(Clone)]
pub enum PathSecurity {
    /// Reuse the exact channel the token was fetched over.
    SameChannel,
    /// Fresh TLS channel with a card-sourced client credential.
    Tls,
    /// Fresh TLS channel authenticated with this pre-shared key.
    Psk(Zeroizing<Vec<u8>>),
}

impl fmt::Debug for PathSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSecurity::SameChannel => f.write_str("SameChannel"),
            PathSecurity::Tls => f.write_str("Tls"),
            // Key material stays out of logs.
            PathSecurity::Psk(key) => write!(f, "Psk({} bytes)", key.len()),
        }
    }
}

/// A token that passed every verification step; all fields are typed and
/// internally consistent.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// The remote authentication server.
    pub server_address: Url,
    /// Opaque session identifier, never empty.
    pub session_identifier: String,
    /// Where the browser is redirected after authentication.
    pub refresh_address: Url,
    /// Fallback redirect for pre-authentication failures.
    pub communication_error_address: Option<Url>,
    /// Transport binding for the card-authentication exchange.
    pub binding: Binding,
    /// Channel protection for the card-authentication transport.
    pub path_security: PathSecurity,
}

impl VerifiedToken {
    /// Return a copy with the refresh address replaced by the resolved
    /// one. The token itself is never mutated in place.
    pub fn with_refresh_address(mut self, url: Url) -> Self {
        self.refresh_address = url;
        self
    }
}

/// Verify `token` against the hops recorded while fetching it.
pub async fn verify_token(
    ctx: &ActivationContext,
    dialer: &dyn Dialer,
    token: &TcToken,
    token_hops: &[Hop],
) -> Result<VerifiedToken, ActivationError> {
    // 1. An error token short-circuits the whole flow: the eService already
    // reported a failure and only told us where to send the user.
    if token.is_error_token() {
        let redirect = token
            .communication_error_address()
            .and_then(|raw| parse_https(raw).ok());
        warn!("received an error token from the eService");
        return Err(ActivationError::new(TokenFormatError::ErrorToken).with_redirect_opt(redirect));
    }

    // 2. RefreshAddress. On failure, try to still land the user on a
    // trusted host by resolving the address through the redirect validator.
    let refresh_address = match token.refresh_address() {
        None => {
            let redirect = token
                .communication_error_address()
                .and_then(|raw| parse_https(raw).ok());
            return Err(ActivationError::new(TokenFormatError::MissingField("RefreshAddress"))
                .with_redirect_opt(redirect));
        }
        Some(raw) => match parse_https(raw) {
            Ok(url) => url,
            Err(reason) => {
                let redirect = resolve_error_redirect(ctx, dialer, raw)
                    .await
                    .or_else(|| {
                        token
                            .communication_error_address()
                            .and_then(|raw| parse_https(raw).ok())
                    });
                return Err(ActivationError::new(TokenFormatError::InvalidField {
                    field: "RefreshAddress",
                    reason,
                })
                .with_redirect_opt(redirect));
            }
        },
    };

    // 3. CommunicationErrorAddress, if present, must be https.
    let communication_error_address = match token.communication_error_address() {
        None => None,
        Some(raw) => match parse_https(raw) {
            Ok(url) => Some(url),
            Err(reason) => {
                return Err(ActivationError::new(TokenFormatError::InvalidField {
                    field: "CommunicationErrorAddress",
                    reason,
                })
                .with_redirect(refresh_address));
            }
        },
    };

    // Redirect target for everything below: the communication-error
    // address when the eService supplied one, else the refresh address.
    let error_redirect = communication_error_address
        .clone()
        .unwrap_or_else(|| refresh_address.clone());

    // 4. A cancellation recorded during card selection surfaces here, now
    // that a redirect target is known.
    if ctx.is_cancelled() {
        debug!("pending user cancellation, aborting verification");
        return Err(ActivationError::new(ErrorKind::Cancelled).with_redirect(error_redirect));
    }

    // 5. ServerAddress.
    let server_address = match token.server_address() {
        None => {
            return Err(ActivationError::new(TokenFormatError::MissingField("ServerAddress"))
                .with_redirect(error_redirect));
        }
        Some(raw) => match parse_https(raw) {
            Ok(url) => url,
            Err(reason) => {
                return Err(ActivationError::new(TokenFormatError::InvalidField {
                    field: "ServerAddress",
                    reason,
                })
                .with_redirect(error_redirect));
            }
        },
    };

    // 6. SessionIdentifier.
    let session_identifier = match token.session_identifier() {
        Some(id) => id.to_string(),
        None => {
            return Err(ActivationError::new(TokenFormatError::MissingField("SessionIdentifier"))
                .with_redirect(error_redirect));
        }
    };

    // 7. Binding.
    let binding = match token.binding() {
        None => {
            return Err(ActivationError::new(TokenFormatError::MissingField("Binding"))
                .with_redirect(error_redirect));
        }
        Some(raw) => match raw.parse::<Binding>() {
            Ok(binding) => binding,
            Err(()) => {
                return Err(ActivationError::new(TokenFormatError::InvalidField {
                    field: "Binding",
                    reason: format!("unsupported URN `{raw}`"),
                })
                .with_redirect(error_redirect));
            }
        },
    };

    // 8. Path security. Absent protocol and parameters demand literal
    // reuse of the token-fetch channel, which is only sound if the whole
    // redirect chain used to retrieve the token stayed on the server's
    // origin.
    let path_security = match path_security(token) {
        Ok(security) => security,
        Err(err) => return Err(ActivationError::new(err).with_redirect(error_redirect)),
    };

    if matches!(path_security, PathSecurity::SameChannel) {
        for hop in token_hops {
            if !same_origin(&server_address, &hop.url) {
                warn!(server = %server_address, hop = %hop.url, "token fetch left the server origin");
                return Err(ActivationError::new(RedirectError::SameOriginViolated {
                    expected: server_address.clone(),
                    actual: hop.url.clone(),
                })
                .with_redirect(error_redirect));
            }
        }
    }

    debug!(
        server = %server_address,
        binding = %binding,
        security = ?path_security,
        "token verified"
    );
    Ok(VerifiedToken {
        server_address,
        session_identifier,
        refresh_address,
        communication_error_address,
        binding,
        path_security,
    })
}

fn path_security(token: &TcToken) -> Result<PathSecurity, TokenFormatError> {
    let protocol = match token.path_security_protocol() {
        // No protocol means the parameters are meaningless: the token
        // demands same-channel reuse.
        None => return Ok(PathSecurity::SameChannel),
        Some(raw) => raw
            .parse::<PathSecurityProtocol>()
            .map_err(|()| TokenFormatError::InvalidField {
                field: "PathSecurity-Protocol",
                reason: format!("unsupported URN `{raw}`"),
            })?,
    };

    match protocol {
        PathSecurityProtocol::Tls => Ok(PathSecurity::Tls),
        PathSecurityProtocol::Psk => match token.psk() {
            Some(key) if !key.is_empty() => Ok(PathSecurity::Psk(Zeroizing::new(key.to_vec()))),
            Some(_) => Err(TokenFormatError::InvalidField {
                field: "PSK",
                reason: "empty key material".into(),
            }),
            None if token.psk_invalid() => Err(TokenFormatError::InvalidField {
                field: "PSK",
                reason: "key is not valid even-length hex".into(),
            }),
            // PSK announced without parameters: legacy attached-eID
            // tokens, handled as same-channel reuse.
            None => Ok(PathSecurity::SameChannel),
        },
    }
}

fn parse_https(raw: &str) -> Result<Url, String> {
    let url: Url = raw
        .parse()
        .map_err(|err| format!("not a URL ({err})"))?;
    if url.scheme() != "https" {
        return Err(format!("scheme `{}` is not https", url.scheme()));
    }
    Ok(url)
}

/// Best-effort resolution of a redirect target for the error page: run the
/// address through the fetch pipeline with full TR-03112 validation and
/// use the URL it converges on. Failures leave the caller without a
/// resolved redirect.
async fn resolve_error_redirect(
    ctx: &ActivationContext,
    dialer: &dyn Dialer,
    raw: &str,
) -> Option<Url> {
    let url: Url = raw.parse().ok()?;
    let mut policy = RedirectPolicy::tr03112(ctx);
    match fetch(dialer, ctx.cookies(), url, &mut policy, DEFAULT_HOP_BUDGET).await {
        Ok(mut result) => {
            let resolved = result.final_url().clone();
            result.close().await;
            Some(resolved)
        }
        Err(err) => {
            debug!(%err, "could not resolve a trusted error redirect");
            None
        }
    }
}
