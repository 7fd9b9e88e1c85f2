//! Per-attempt activation session state.
//!
//! One [`ActivationContext`] is created at the start of an activation
//! attempt and passed by reference through every pipeline stage. Nothing in
//! it survives the attempt. The handful of values filled in late by a
//! concurrently running card-selection flow are modeled as single-assignment
//! cells with both blocking and non-blocking accessors.

use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use url::Url;

use crate::http::CookieStore;

/// A value assigned at most once, possibly by another task.
///
/// Readers can poll with [`LateBound::try_get`] or block with
/// [`LateBound::wait`]. Only the first assignment is kept.
#[derive(Debug)]
pub struct LateBound<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for LateBound<T> {
    fn default() -> Self {
        Self {
            tx: watch::channel(None).0,
        }
    }
}

impl<T: Clone> LateBound<T> {
    /// Create an unassigned cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the value. Returns `false` if a value was already present, in
    /// which case the existing value is kept.
    pub fn set(&self, value: T) -> bool {
        let mut assigned = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                assigned = true;
                true
            } else {
                false
            }
        });
        assigned
    }

    /// Non-blocking read; tolerates "not yet present".
    pub fn try_get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait until the value has been assigned.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let value = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("sender is owned by the same cell");
        value.clone().expect("checked by wait_for")
    }
}

/// Certificate description obtained out-of-band from the card issuer,
/// pinning which server certificates are acceptable.
#[derive(Debug, Clone)]
pub struct CertificateDescription {
    subject_url: Option<Url>,
    communication_certificates: Vec<[u8; 32]>,
}

impl CertificateDescription {
    /// Build a description from the subject URL and the SHA-256
    /// fingerprints of the acceptable communication certificates.
    pub fn new(subject_url: Option<Url>, communication_certificates: Vec<[u8; 32]>) -> Self {
        Self {
            subject_url,
            communication_certificates,
        }
    }

    /// The eService's subject URL, the expected origin of the final
    /// redirect.
    pub fn subject_url(&self) -> Option<&Url> {
        self.subject_url.as_ref()
    }

    /// Whether the DER encoding of a server certificate is pinned.
    pub fn pins(&self, certificate_der: &[u8]) -> bool {
        let fp: [u8; 32] = Sha256::digest(certificate_der).into();
        self.communication_certificates.contains(&fp)
    }
}

/// All state shared between pipeline stages of one activation attempt.
#[derive(Debug)]
pub struct ActivationContext {
    tr03112_checks: bool,
    token_url: Mutex<Option<Url>>,
    card_type: LateBound<String>,
    certificate_description: LateBound<CertificateDescription>,
    cancel_tx: watch::Sender<bool>,
    cookies: CookieStore,
}

impl ActivationContext {
    /// Create the context for one attempt. `tr03112_checks` disables all
    /// redirect/certificate enforcement when `false` (non-eID card types or
    /// an explicit developer override).
    pub fn new(tr03112_checks: bool) -> Self {
        Self {
            tr03112_checks,
            token_url: Mutex::new(None),
            card_type: LateBound::new(),
            certificate_description: LateBound::new(),
            cancel_tx: watch::channel(false).0,
            cookies: CookieStore::default(),
        }
    }

    /// Whether TR-03112 redirect/certificate checks are enforced.
    pub fn checks_enabled(&self) -> bool {
        self.tr03112_checks
    }

    /// Record the URL the activation token was requested from. It is the
    /// object of trust when no certificate description is available.
    pub fn set_token_url(&self, url: Url) {
        *self.token_url.lock().expect("token_url lock poisoned") = Some(url);
    }

    /// The recorded token URL, if any.
    pub fn token_url(&self) -> Option<Url> {
        self.token_url.lock().expect("token_url lock poisoned").clone()
    }

    /// The type of card being activated, filled in by card selection.
    pub fn card_type(&self) -> &LateBound<String> {
        &self.card_type
    }

    /// The out-of-band certificate description, if one was delivered.
    pub fn certificate_description(&self) -> &LateBound<CertificateDescription> {
        &self.certificate_description
    }

    /// Record that the user aborted the attempt.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Whether a cancellation is pending.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Resolves once the user aborts the attempt.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// The cookie store shared by every fetch of this attempt.
    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }
}
