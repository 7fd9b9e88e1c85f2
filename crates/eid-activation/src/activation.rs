//! The activation orchestrator: drives one attempt from the local token
//! URL to the final browser redirect.
//!
//! Stages run in a fixed order. Failures before the token's refresh
//! address is known are terminal and leave the browser where it is; every
//! later failure redirects the browser to the refresh or
//! communication-error address with `ResultMajor`/`ResultMinor` query
//! parameters appended.

use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use tctoken::parse_tc_token;

use crate::channel::ChannelSelector;
use crate::error::{minor, ActivationError, ErrorKind, TokenFormatError, TransportError};
use crate::external::{AuthTransport, CardHandle, CardLayer, TransportOutcome, UiNotifier};
use crate::fetch::{fetch, DEFAULT_HOP_BUDGET};
use crate::redirect::RedirectPolicy;
use crate::session::ActivationContext;
use crate::tls::{Dialer, MinTlsVersion};
use crate::verify::{verify_token, VerifiedToken};

/// One activation request, as delivered by the local activation endpoint.
#[derive(Debug, Clone)]
pub struct ActivationRequest {
    /// Where to fetch the activation token from.
    pub token_url: Url,
    /// The card type this request is for.
    pub card_type: String,
}

/// How an activation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStatus {
    /// Authentication completed; the redirect carries `ResultMajor=ok`.
    Ok,
    /// The attempt failed; the redirect, if any, carries the error minor.
    Error,
}

/// The outcome handed back to the local activation endpoint.
#[derive(Debug)]
pub struct ActivationResponse {
    /// Success or failure.
    pub status: ActivationStatus,
    /// Where to send the browser, result parameters already appended.
    /// `None` when the failure happened before any trusted redirect
    /// target was known.
    pub redirect: Option<Url>,
    /// Human-readable failure description.
    pub message: Option<String>,
}

/// Drives activation attempts. One instance serves many attempts; all
/// per-attempt state lives in the [`ActivationContext`] it creates.
pub struct Activator {
    card_layer: Arc<dyn CardLayer>,
    transport: Arc<dyn AuthTransport>,
    ui: Arc<dyn UiNotifier>,
    dialer: Arc<dyn Dialer>,
    hop_budget: u32,
    min_version: MinTlsVersion,
    developer_override: bool,
}

impl Activator {
    /// Build an activator from its collaborators.
    pub fn new(
        card_layer: Arc<dyn CardLayer>,
        transport: Arc<dyn AuthTransport>,
        ui: Arc<dyn UiNotifier>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            card_layer,
            transport,
            ui,
            dialer,
            hop_budget: DEFAULT_HOP_BUDGET,
            min_version: MinTlsVersion::default(),
            developer_override: false,
        }
    }

    /// Change the redirect hop budget.
    pub fn hop_budget(mut self, budget: u32) -> Self {
        self.hop_budget = budget;
        self
    }

    /// Change the minimum TLS version for all channels.
    pub fn min_tls_version(mut self, version: MinTlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Disable all redirect and certificate enforcement. Development use
    /// only; never enable this in production builds.
    pub fn disable_tr03112_checks(mut self) -> Self {
        warn!("TR-03112 redirect and certificate checks are DISABLED");
        self.developer_override = true;
        self
    }

    /// Create the context for one attempt. Share it (behind an `Arc`) with
    /// the UI so it can cancel the attempt while
    /// [`Activator::activate_with`] runs.
    pub fn new_context(&self) -> ActivationContext {
        ActivationContext::new(!self.developer_override)
    }

    /// Run one activation attempt to completion.
    pub async fn activate(&self, request: ActivationRequest) -> ActivationResponse {
        let ctx = self.new_context();
        self.activate_with(&ctx, request).await
    }

    /// Run one attempt on a caller-owned context, so cancellation can be
    /// requested concurrently.
    pub async fn activate_with(
        &self,
        ctx: &ActivationContext,
        request: ActivationRequest,
    ) -> ActivationResponse {
        info!(token_url = %request.token_url, card_type = %request.card_type, "activation started");
        ctx.set_token_url(request.token_url.clone());
        ctx.card_type().set(request.card_type.clone());

        match self.run_pipeline(ctx, &request).await {
            Ok(redirect) => {
                info!(%redirect, "activation completed");
                ActivationResponse {
                    status: ActivationStatus::Ok,
                    redirect: Some(append_result_params(redirect, minor::MAJOR_OK, None)),
                    message: None,
                }
            }
            Err(err) => {
                warn!(error = %err, minor = minor::fragment(err.minor_urn()), "activation failed");
                self.ui.activation_failed(&err.to_string());
                ActivationResponse {
                    status: ActivationStatus::Error,
                    redirect: err.redirect().map(|url| {
                        append_result_params(url.clone(), minor::MAJOR_ERROR, Some(err.minor_urn()))
                    }),
                    message: Some(err.to_string()),
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        ctx: &ActivationContext,
        request: &ActivationRequest,
    ) -> Result<Url, ActivationError> {
        // Card selection. A missing card records a cancellation instead of
        // failing immediately: verification still runs far enough to learn
        // the refresh address, so even this failure redirects the browser.
        let selected = self.select_card(ctx, &request.card_type).await?;

        // Token fetch. No trust is established yet, so no redirect policy
        // applies and failures are terminal.
        let mut token_fetch = fetch(
            self.dialer.as_ref(),
            ctx.cookies(),
            request.token_url.clone(),
            &mut RedirectPolicy::dont_care(),
            self.hop_budget,
        )
        .await?;

        let token = match token_fetch.payload() {
            Some(payload) => match parse_tc_token(payload) {
                Ok(token) => token,
                Err(err) => {
                    token_fetch.close().await;
                    return Err(TokenFormatError::Parse(err).into());
                }
            },
            None => {
                token_fetch.close().await;
                return Err(TransportError::MalformedResponse(
                    "token endpoint returned no document".into(),
                )
                .into());
            }
        };

        let verified = match verify_token(ctx, self.dialer.as_ref(), &token, token_fetch.hops()).await
        {
            Ok(verified) => verified,
            Err(err) => {
                token_fetch.close().await;
                return Err(self.validate_cancellation_redirect(ctx, err).await);
            }
        };
        let error_redirect = error_redirect(&verified);

        // Verification rejects a pending cancellation, so a card was
        // selected if we get here; if that invariant ever breaks, the
        // attempt still reports a cancellation, not an internal error.
        let handle = match selected {
            Some(handle) => handle,
            None => {
                token_fetch.close().await;
                return Err(ActivationError::new(ErrorKind::Cancelled)
                    .with_redirect(error_redirect));
            }
        };

        let card = match self.card_layer.connect(&handle).await {
            Ok(card) => card,
            Err(err) => {
                token_fetch.close().await;
                return Err(ActivationError::new(err).with_redirect(error_redirect));
            }
        };

        let credential = match self.card_layer.client_credential(&card).await {
            Ok(credential) => credential,
            Err(err) => {
                token_fetch.close().await;
                self.card_layer.disconnect(&card).await;
                return Err(ActivationError::new(err).with_redirect(error_redirect));
            }
        };

        // Channel selection takes over the token-fetch connection: it is
        // either reused for the transport or closed.
        let selector = ChannelSelector::new(self.min_version);
        let pin = token_fetch.final_certificates().first().cloned();
        let connection = token_fetch.into_connection();
        let channel = match selector
            .establish(&verified, connection, pin.as_ref(), credential)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                self.card_layer.disconnect(&card).await;
                return Err(err.with_redirect_opt(Some(error_redirect)));
            }
        };

        // The transport runs on its own task so a user cancellation can
        // interrupt it at any await point.
        let outcome = {
            let transport = self.transport.clone();
            let transport_card = card.clone();
            let transport_token = verified.clone();
            let mut exchange = tokio::spawn(async move {
                transport.run(&transport_card, channel, &transport_token).await
            });
            tokio::select! {
                result = &mut exchange => result.unwrap_or_else(|err| {
                    TransportOutcome::ConnectionFailure {
                        message: format!("transport task failed: {err}"),
                    }
                }),
                () = ctx.cancelled() => {
                    debug!("user cancellation interrupted the transport");
                    exchange.abort();
                    TransportOutcome::Cancelled
                }
            }
        };
        self.card_layer.disconnect(&card).await;
        check_outcome(outcome, error_redirect.clone())?;

        // Resolve the refresh address through the full redirect validator
        // so the browser lands on a trusted origin.
        let verified = self.resolve_refresh(ctx, verified, error_redirect).await?;
        Ok(verified.refresh_address)
    }

    async fn select_card(
        &self,
        ctx: &ActivationContext,
        card_type: &str,
    ) -> Result<Option<CardHandle>, ActivationError> {
        let cards = self.card_layer.available_cards().await?;
        let selected = cards.into_iter().find(|card| card.card_type == card_type);
        if selected.is_none() {
            info!(card_type, "no matching card inserted");
            self.ui.no_matching_card(card_type);
            ctx.cancel();
        }
        Ok(selected)
    }

    /// A cancellation recorded before the transport ran still has to land
    /// the browser on a validated origin: run its redirect target through
    /// the redirect validator, best-effort, keeping the raw address when
    /// resolution fails.
    async fn validate_cancellation_redirect(
        &self,
        ctx: &ActivationContext,
        err: ActivationError,
    ) -> ActivationError {
        if !matches!(err.kind(), ErrorKind::Cancelled) {
            return err;
        }
        let Some(target) = err.redirect().cloned() else {
            return err;
        };
        let mut policy = RedirectPolicy::tr03112(ctx);
        match fetch(
            self.dialer.as_ref(),
            ctx.cookies(),
            target.clone(),
            &mut policy,
            self.hop_budget,
        )
        .await
        {
            Ok(mut result) => {
                let resolved = result.final_url().clone();
                result.close().await;
                debug!(from = %target, to = %resolved, "cancellation redirect resolved");
                err.with_redirect(resolved)
            }
            Err(fetch_err) => {
                debug!(error = %fetch_err, "cancellation redirect not resolvable, using raw address");
                err
            }
        }
    }

    async fn resolve_refresh(
        &self,
        ctx: &ActivationContext,
        verified: VerifiedToken,
        error_redirect: Url,
    ) -> Result<VerifiedToken, ActivationError> {
        let mut policy = RedirectPolicy::tr03112(ctx);
        match fetch(
            self.dialer.as_ref(),
            ctx.cookies(),
            verified.refresh_address.clone(),
            &mut policy,
            self.hop_budget,
        )
        .await
        {
            Ok(mut result) => {
                let resolved = result.final_url().clone();
                result.close().await;
                debug!(from = %verified.refresh_address, to = %resolved, "refresh address resolved");
                Ok(verified.with_refresh_address(resolved))
            }
            Err(err) => Err(err.with_redirect_opt(Some(error_redirect))),
        }
    }
}

/// The redirect target for failures after verification: the
/// communication-error address when the eService supplied one, else the
/// refresh address.
fn error_redirect(token: &VerifiedToken) -> Url {
    token
        .communication_error_address
        .clone()
        .unwrap_or_else(|| token.refresh_address.clone())
}

/// Translate a transport outcome into the pipeline's error taxonomy. A
/// minor code supplied by the protocol takes precedence over the inferred
/// one.
fn check_outcome(outcome: TransportOutcome, redirect: Url) -> Result<(), ActivationError> {
    match outcome {
        TransportOutcome::Completed => Ok(()),
        TransportOutcome::Cancelled => {
            Err(ActivationError::new(ErrorKind::Cancelled).with_redirect(redirect))
        }
        TransportOutcome::SchemaViolation { message } => {
            Err(ActivationError::new(ErrorKind::Protocol(message))
                .with_minor(minor::SCHEMA_VIOLATION)
                .with_redirect(redirect))
        }
        TransportOutcome::ConnectionFailure { message } => {
            Err(ActivationError::new(ErrorKind::Protocol(message))
                .with_minor(minor::TRUSTED_CHANNEL_FAILED)
                .with_redirect(redirect))
        }
        TransportOutcome::Failure { minor, message } => {
            let mut err =
                ActivationError::new(ErrorKind::Protocol(message)).with_redirect(redirect);
            if let Some(urn) = minor {
                err = err.with_minor(urn);
            }
            Err(err)
        }
    }
}

/// Append `ResultMajor` (and `ResultMinor` for failures) to the redirect
/// URL. Values are the fragments of the eCard result URNs.
fn append_result_params(mut url: Url, major: &str, minor_urn: Option<&str>) -> Url {
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("ResultMajor", minor::fragment(major));
        if let Some(urn) = minor_urn {
            pairs.append_pair("ResultMinor", minor::fragment(urn));
        }
    }
    url
}
