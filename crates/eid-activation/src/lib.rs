//! Client-side trust establishment for eID activation.
//!
//! Implements the client half of the TR-03112/TR-03124 activation flow:
//! fetching the activation token over TLS with redirect and certificate
//! validation, verifying the token field by field, selecting the channel
//! for the card-authentication transport, and driving one activation
//! attempt end to end until the browser can be redirected with
//! `ResultMajor`/`ResultMinor` parameters.
//!
//! The card layer, the authentication protocol itself, and the user
//! interface are behind the trait seams in [`external`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod activation;
pub mod channel;
pub mod error;
pub mod external;
pub mod fetch;
pub mod http;
pub mod redirect;
pub mod session;
pub mod tls;
pub mod verify;

pub use activation::{ActivationRequest, ActivationResponse, ActivationStatus, Activator};
pub use channel::{AuthChannel, ChannelSelector, ChannelStrategy, ClientCredential, PskParameters};
pub use error::{ActivationError, ErrorKind};
pub use external::{AuthTransport, CardHandle, CardLayer, ConnectedCard, TransportOutcome, UiNotifier};
pub use fetch::{fetch, FetchResult, Hop, DEFAULT_HOP_BUDGET};
pub use redirect::{RedirectPolicy, Verdict};
pub use session::{ActivationContext, CertificateDescription};
pub use tls::{Connection, Dialer, MinTlsVersion, TlsDialer};
pub use verify::{verify_token, PathSecurity, VerifiedToken};
