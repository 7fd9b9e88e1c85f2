//! Error taxonomy for the activation pipeline.
//!
//! Every error that can occur once the token's refresh address is known
//! carries a pre-computed redirect target, so the user's browser always
//! ends up somewhere. Errors raised before any address is known are
//! terminal and carry no redirect.

// Leading `::` keeps this from resolving to the crate's own `http` module.
use ::http::StatusCode;
use thiserror::Error;
use url::Url;

pub use tctoken::TokenError;

/// eCard-API result major/minor URNs used in the final browser redirect.
pub mod minor {
    /// `ResultMajor` value reported on success.
    pub const MAJOR_OK: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultmajor#ok";
    /// `ResultMajor` value reported on any failure.
    pub const MAJOR_ERROR: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultmajor#error";

    /// The user aborted card selection or the authentication protocol.
    pub const CANCELLATION_BY_USER: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/sal#cancellationByUser";
    /// The trusted channel to the eID server could not be established.
    pub const TRUSTED_CHANNEL_FAILED: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/dp#trustedChannelEstablishmentFailed";
    /// Communication with a remote endpoint failed.
    pub const COMMUNICATION_ERROR: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/dp#communicationError";
    /// A message failed schema validation.
    pub const SCHEMA_VIOLATION: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/il/common#schemaViolation";
    /// Catch-all for unrecognized internal failures.
    pub const INTERNAL_ERROR: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#internalError";

    /// The `ResultMinor` query value is the fragment after the last `#` of
    /// the internal URN.
    pub fn fragment(urn: &str) -> &str {
        urn.rsplit('#').next().unwrap_or(urn)
    }
}

/// Problems with a URL before any connection is attempted.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The string did not parse as a URL at all.
    #[error("malformed URL `{0}`")]
    Malformed(String),

    /// Only `https` endpoints may take part in the activation.
    #[error("URL `{0}` does not use the https scheme")]
    NotHttps(String),
}

/// Violations of the redirect policy during a fetch.
#[derive(Debug, Error)]
pub enum RedirectError {
    /// Two consecutive hops were on different origins.
    #[error("same-origin policy violated between `{expected}` and `{actual}`")]
    SameOriginViolated {
        /// Origin the policy expected.
        expected: Url,
        /// URL that broke it.
        actual: Url,
    },

    /// A terminal response arrived while the validator still demanded
    /// further redirects.
    #[error("redirect chain ended before reaching a trusted endpoint")]
    NoTrustedEndpoint,

    /// The server certificate is not in the pinned communication
    /// certificates of the certificate description.
    #[error("server certificate is not among the pinned communication certificates")]
    CertificateNotPinned,

    /// Neither a certificate description nor a token URL is available to
    /// derive the expected origin from.
    #[error("no subject URL available to enforce the same-origin policy")]
    NoSubjectUrl,

    /// The hop budget ran out.
    #[error("redirect limit of {limit} hops exceeded")]
    TooManyRedirects {
        /// The budget that was exhausted.
        limit: u32,
    },

    /// A `3xx` response without a `Location` header.
    #[error("redirect response is missing a Location header")]
    MissingLocationHeader,

    /// The `Location` header did not resolve to a URL.
    #[error("Location header does not resolve to a valid URL: {0}")]
    InvalidLocation(String),
}

/// Transport-level failures: sockets, TLS, malformed HTTP.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS-level failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A final HTTP status of 400 or above.
    #[error("unexpected HTTP status {status}")]
    InvalidResultStatus {
        /// The offending status code.
        status: StatusCode,
    },

    /// The response could not be parsed as HTTP/1.1.
    #[error("malformed HTTP response: {0}")]
    MalformedResponse(String),

    /// The response body exceeded the configured limit.
    #[error("response exceeds the {limit}-byte limit")]
    ResponseTooLarge {
        /// The limit that was exceeded.
        limit: usize,
    },

    /// The channel was used after it had been closed.
    #[error("TLS channel is already closed")]
    ChannelClosed,
}

/// Malformed or incomplete TCToken content found during verification.
#[derive(Debug, Error)]
pub enum TokenFormatError {
    /// The document did not parse at all.
    #[error(transparent)]
    Parse(#[from] TokenError),

    /// The document was an error token (only a communication-error
    /// address); the eService reported a failure before authentication.
    #[error("eService returned an error token")]
    ErrorToken,

    /// A required element is absent.
    #[error("required element `{0}` is missing")]
    MissingField(&'static str),

    /// An element is present but unusable.
    #[error("element `{field}` is invalid: {reason}")]
    InvalidField {
        /// The element name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Failures reported by the external card layer.
#[derive(Debug, Error)]
pub enum CardError {
    /// No card matching the request is available.
    #[error("no matching card available")]
    NoMatchingCard,

    /// The card layer request/response call itself failed.
    #[error("card dispatcher failure: {0}")]
    Dispatcher(String),

    /// The card does not provide a client credential for mutual TLS.
    #[error("card provides no client credential")]
    NoCredential,
}

/// All failure classes of the activation pipeline.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// See [`AddressError`].
    #[error(transparent)]
    Address(#[from] AddressError),

    /// See [`RedirectError`].
    #[error(transparent)]
    RedirectPolicy(#[from] RedirectError),

    /// See [`TokenFormatError`].
    #[error(transparent)]
    TokenFormat(#[from] TokenFormatError),

    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// See [`CardError`].
    #[error(transparent)]
    Card(#[from] CardError),

    /// The user aborted the activation.
    #[error("authentication cancelled by the user")]
    Cancelled,

    /// The card-authentication transport reported a failure of its own.
    #[error("card-authentication transport failed: {0}")]
    Protocol(String),
}

/// An activation failure, optionally carrying the redirect target the
/// browser must be sent to.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ActivationError {
    kind: ErrorKind,
    redirect: Option<Url>,
    minor: Option<String>,
}

impl ActivationError {
    /// Wrap a failure without a redirect target.
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        Self {
            kind: kind.into(),
            redirect: None,
            minor: None,
        }
    }

    /// Attach the redirect target the browser must end up at.
    pub fn with_redirect(mut self, url: Url) -> Self {
        self.redirect = Some(url);
        self
    }

    /// Attach a redirect target, if one is known.
    pub fn with_redirect_opt(mut self, url: Option<Url>) -> Self {
        if self.redirect.is_none() {
            self.redirect = url;
        }
        self
    }

    /// Override the result-minor URN reported in the redirect. Used when the
    /// card protocol supplied its own minor code.
    pub fn with_minor(mut self, urn: impl Into<String>) -> Self {
        self.minor = Some(urn.into());
        self
    }

    /// The failure class.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The redirect target, if one could be computed.
    pub fn redirect(&self) -> Option<&Url> {
        self.redirect.as_ref()
    }

    /// The result-minor URN for this failure. A protocol-supplied code takes
    /// precedence over the locally inferred one.
    pub fn minor_urn(&self) -> &str {
        if let Some(ref urn) = self.minor {
            return urn;
        }
        match &self.kind {
            ErrorKind::Cancelled => minor::CANCELLATION_BY_USER,
            ErrorKind::Card(_) => minor::INTERNAL_ERROR,
            ErrorKind::Transport(_) => minor::COMMUNICATION_ERROR,
            ErrorKind::Address(_) | ErrorKind::RedirectPolicy(_) => minor::TRUSTED_CHANNEL_FAILED,
            ErrorKind::TokenFormat(_) => minor::COMMUNICATION_ERROR,
            ErrorKind::Protocol(_) => minor::INTERNAL_ERROR,
        }
    }
}

impl<E: Into<ErrorKind>> From<E> for ActivationError {
    fn from(err: E) -> Self {
        ActivationError::new(err)
    }
}
