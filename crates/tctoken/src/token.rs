//! Immutable-after-parse representation of a TCToken and its fields.

use std::fmt;
use std::str::FromStr;

use zeroize::Zeroizing;

/// Transport binding requested by the token for the card-authentication
/// exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Reverse-SOAP messaging (`urn:liberty:paos:2006-08`).
    Paos,
    /// Plain TLS-authenticated connection (`urn:ietf:rfc:2616`).
    TlsAuth,
}

impl Binding {
    /// The URN identifying this binding on the wire.
    pub fn urn(&self) -> &'static str {
        match self {
            Binding::Paos => "urn:liberty:paos:2006-08",
            Binding::TlsAuth => "urn:ietf:rfc:2616",
        }
    }
}

impl FromStr for Binding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:liberty:paos:2006-08" => Ok(Binding::Paos),
            "urn:ietf:rfc:2616" => Ok(Binding::TlsAuth),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.urn())
    }
}

/// Protocol protecting the channel to the remote authentication server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSecurityProtocol {
    /// Fresh TLS channel (`urn:ietf:rfc:4346`).
    Tls,
    /// TLS with a pre-shared key from the token (`urn:ietf:rfc:4279`).
    Psk,
}

impl PathSecurityProtocol {
    /// The URN identifying this protocol on the wire.
    pub fn urn(&self) -> &'static str {
        match self {
            PathSecurityProtocol::Tls => "urn:ietf:rfc:4346",
            PathSecurityProtocol::Psk => "urn:ietf:rfc:4279",
        }
    }
}

impl FromStr for PathSecurityProtocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:ietf:rfc:4346" => Ok(PathSecurityProtocol::Tls),
            "urn:ietf:rfc:4279" => Ok(PathSecurityProtocol::Psk),
            _ => Err(()),
        }
    }
}

/// A parsed TCToken, exactly as the eService sent it.
///
/// All fields are raw strings; URL and URN validation happens during token
/// verification, not here, so that even a broken token can still be
/// classified (e.g. as an error token carrying only a communication-error
/// address).
#[derive(Debug, Default, Clone)]
pub struct TcToken {
    pub(crate) server_address: Option<String>,
    pub(crate) session_identifier: Option<String>,
    pub(crate) refresh_address: Option<String>,
    pub(crate) communication_error_address: Option<String>,
    pub(crate) binding: Option<String>,
    pub(crate) path_security_protocol: Option<String>,
    pub(crate) psk: Option<Zeroizing<Vec<u8>>>,
    pub(crate) psk_invalid: bool,
}

impl TcToken {
    /// Address of the remote authentication server, if present.
    pub fn server_address(&self) -> Option<&str> {
        self.server_address.as_deref()
    }

    /// Opaque session identifier, if present.
    pub fn session_identifier(&self) -> Option<&str> {
        self.session_identifier.as_deref()
    }

    /// Address the user's browser is redirected to after authentication.
    pub fn refresh_address(&self) -> Option<&str> {
        self.refresh_address.as_deref()
    }

    /// Fallback redirect used when the token itself is unusable.
    pub fn communication_error_address(&self) -> Option<&str> {
        self.communication_error_address.as_deref()
    }

    /// Raw binding URN, if present.
    pub fn binding(&self) -> Option<&str> {
        self.binding.as_deref()
    }

    /// Raw path-security protocol URN, if present.
    pub fn path_security_protocol(&self) -> Option<&str> {
        self.path_security_protocol.as_deref()
    }

    /// Decoded pre-shared key bytes, if the token carried a valid `<PSK>`.
    pub fn psk(&self) -> Option<&[u8]> {
        self.psk.as_deref().map(|k| k.as_slice())
    }

    /// Whether the token carried a `<PSK>` element that failed hex decoding
    /// (odd length or non-hex characters).
    pub fn psk_invalid(&self) -> bool {
        self.psk_invalid
    }

    /// Whether this is an error token: only the communication-error address
    /// is set and every other field is absent.
    ///
    /// Error tokens short-circuit the whole activation; they never reach
    /// field-by-field verification.
    pub fn is_error_token(&self) -> bool {
        self.communication_error_address.is_some()
            && self.server_address.is_none()
            && self.session_identifier.is_none()
            && self.refresh_address.is_none()
            && self.binding.is_none()
            && self.path_security_protocol.is_none()
            && self.psk.is_none()
    }
}
