//! Seams to the subsystems this crate orchestrates but does not own: the
//! smart-card layer, the card-authentication transport, and the user
//! interface.
//!
//! Everything here is a trait so the orchestrator can be driven end to end
//! by in-process doubles. Production implementations live with their
//! subsystems.

use async_trait::async_trait;

use crate::channel::{AuthChannel, ClientCredential};
use crate::error::CardError;
use crate::verify::VerifiedToken;

/// An inserted card known to the card layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardHandle {
    /// Name of the interface device the card sits in.
    pub ifd_name: String,
    /// Card type identifier, matched against the activation request.
    pub card_type: String,
}

/// A card with an open session.
#[derive(Debug, Clone)]
pub struct ConnectedCard {
    /// The handle this session was opened from.
    pub handle: CardHandle,
    /// Card-layer session identifier.
    pub slot_handle: Vec<u8>,
}

/// Access to inserted cards and their credentials.
#[async_trait]
pub trait CardLayer: Send + Sync {
    /// Every currently inserted card.
    async fn available_cards(&self) -> Result<Vec<CardHandle>, CardError>;

    /// Open a session with `handle`.
    async fn connect(&self, handle: &CardHandle) -> Result<ConnectedCard, CardError>;

    /// Close the session. Infallible by contract; implementations log
    /// their own teardown failures.
    async fn disconnect(&self, card: &ConnectedCard);

    /// The TLS client credential this card can present, if any.
    async fn client_credential(
        &self,
        card: &ConnectedCard,
    ) -> Result<Option<ClientCredential>, CardError>;
}

/// How the card-authentication exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// Authentication finished successfully.
    Completed,
    /// The user aborted the exchange.
    Cancelled,
    /// The server sent a message the protocol machine rejected.
    SchemaViolation {
        /// Human-readable description of the violation.
        message: String,
    },
    /// The channel broke before the exchange finished.
    ConnectionFailure {
        /// Human-readable description of the failure.
        message: String,
    },
    /// The exchange finished with a protocol-level failure.
    Failure {
        /// Result-minor URN reported by the server, if any.
        minor: Option<String>,
        /// Human-readable description of the failure.
        message: String,
    },
}

/// Runs the card-authentication exchange over an established channel.
#[async_trait]
pub trait AuthTransport: Send + Sync {
    /// Run the exchange to completion. The channel is consumed; the
    /// transport closes it regardless of outcome.
    async fn run(
        &self,
        card: &ConnectedCard,
        channel: AuthChannel,
        token: &VerifiedToken,
    ) -> TransportOutcome;
}

/// Fire-and-forget user-facing notifications. Implementations must not
/// block; the orchestrator calls these inline.
pub trait UiNotifier: Send + Sync {
    /// No inserted card matched the requested type.
    fn no_matching_card(&self, card_type: &str);

    /// Activation failed; the browser redirect (if any) happens
    /// independently of this notification.
    fn activation_failed(&self, message: &str);
}

/// A notifier that stays silent. Useful for headless deployments and
/// tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl UiNotifier for SilentNotifier {
    fn no_matching_card(&self, _card_type: &str) {}

    fn activation_failed(&self, _message: &str) {}
}
