//! Secure resource fetch pipeline.
//!
//! Opens a TLS channel, performs an HTTP GET, follows `3xx` redirects
//! under a hop budget, and consults the redirect validator after every
//! handshake. Every certificate chain seen along the way is recorded. The
//! final channel stays open and is owned by the returned [`FetchResult`]
//! until it is explicitly closed or handed off; every error path closes
//! any partially opened channel before propagating.

use std::time::Duration;

use ::http::StatusCode;
use rustls::pki_types::CertificateDer;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ActivationError, AddressError, RedirectError, TransportError};
use crate::http::{self, CookieStore};
use crate::redirect::{RedirectPolicy, Verdict};
use crate::tls::{Connection, Dialer};

/// Default number of redirect hops before a fetch is aborted.
pub const DEFAULT_HOP_BUDGET: u32 = 10;

/// Timeout for one HTTP exchange (request write + response read) on an
/// established channel, matching the dial timeouts in [`crate::tls`].
pub const HTTP_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// One hop of a fetch: the URL connected to and the certificate chain its
/// server presented.
#[derive(Debug, Clone)]
pub struct Hop {
    /// The URL of this hop.
    pub url: Url,
    /// The server certificate chain, end entity first.
    pub certificates: Vec<CertificateDer<'static>>,
}

/// Outcome of a successful fetch.
///
/// Owns the still-open TLS channel of the final hop. Callers must either
/// [`FetchResult::close`] it or take it over with
/// [`FetchResult::into_connection`].
#[derive(Debug)]
pub struct FetchResult {
    payload: Option<Vec<u8>>,
    hops: Vec<Hop>,
    connection: Connection,
}

impl FetchResult {
    /// The response body of the final hop. `None` when the validator
    /// finished the fetch on the handshake alone, before any HTTP exchange.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Every hop visited, oldest first. Never empty.
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// The URL of the final hop.
    pub fn final_url(&self) -> &Url {
        &self
            .hops
            .last()
            .expect("a successful fetch has at least one hop")
            .url
    }

    /// The certificate chain of the final hop.
    pub fn final_certificates(&self) -> &[CertificateDer<'static>] {
        &self
            .hops
            .last()
            .expect("a successful fetch has at least one hop")
            .certificates
    }

    /// Hand over ownership of the open channel.
    pub fn into_connection(self) -> Connection {
        self.connection
    }

    /// Close the channel.
    pub async fn close(&mut self) {
        self.connection.close().await;
    }
}

/// Fetch `url`, following redirects under `hop_budget`, consulting
/// `policy` after every TLS handshake.
pub async fn fetch(
    dialer: &dyn Dialer,
    cookies: &CookieStore,
    url: Url,
    policy: &mut RedirectPolicy<'_>,
    hop_budget: u32,
) -> Result<FetchResult, ActivationError> {
    let mut budget = hop_budget;
    let mut current = url;
    let mut hops: Vec<Hop> = Vec::new();
    let mut last_verdict = Verdict::DontCare;

    loop {
        if budget == 0 {
            info!(limit = hop_budget, "redirect hop budget exhausted");
            return Err(RedirectError::TooManyRedirects { limit: hop_budget }.into());
        }
        budget -= 1;

        if current.scheme() != "https" {
            return Err(AddressError::NotHttps(current.to_string()).into());
        }

        let mut connection = dialer.dial(&current).await?;
        hops.push(Hop {
            url: current.clone(),
            certificates: connection.certificates().to_vec(),
        });

        let verdict = match policy.validate(&current, connection.certificates()) {
            Ok(verdict) => verdict,
            Err(err) => {
                connection.close().await;
                return Err(err);
            }
        };
        if verdict == Verdict::Finish {
            // The handshake alone was conclusive; no HTTP exchange needed.
            debug!(%current, "validator finished fetch on handshake");
            return Ok(FetchResult {
                payload: None,
                hops,
                connection,
            });
        }
        last_verdict = verdict;

        let response = {
            let stream = match connection.stream_mut() {
                Ok(stream) => stream,
                Err(err) => {
                    connection.close().await;
                    return Err(err.into());
                }
            };
            match timeout(HTTP_EXCHANGE_TIMEOUT, http::get(stream, &current, cookies)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    connection.close().await;
                    return Err(err.into());
                }
                Err(_) => {
                    warn!(%current, "HTTP exchange timed out");
                    connection.close().await;
                    return Err(TransportError::Io(std::io::Error::from(
                        std::io::ErrorKind::TimedOut,
                    ))
                    .into());
                }
            }
        };
        cookies.store_response_cookies(&current, &response.headers);

        if is_followed_redirect(response.status) {
            let next = match redirect_target(&current, response.location()) {
                Ok(next) => next,
                Err(err) => {
                    connection.close().await;
                    return Err(err.into());
                }
            };
            debug!(from = %current, to = %next, status = %response.status, "following redirect");
            connection.close().await;
            current = next;
            continue;
        }

        if response.status.as_u16() >= 400 {
            info!(status = %response.status, %current, "fetch ended with error status");
            connection.close().await;
            return Err(TransportError::InvalidResultStatus {
                status: response.status,
            }
            .into());
        }

        if last_verdict == Verdict::Continue {
            // The validator still demanded more redirects, but the server
            // produced a terminal response on an unapproved origin.
            connection.close().await;
            return Err(RedirectError::NoTrustedEndpoint.into());
        }

        debug!(%current, status = %response.status, hops = hops.len(), "fetch complete");
        return Ok(FetchResult {
            payload: Some(response.body),
            hops,
            connection,
        });
    }
}

/// Only 302, 303 and 307 are followed.
fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::FOUND | StatusCode::SEE_OTHER | StatusCode::TEMPORARY_REDIRECT
    )
}

fn redirect_target(current: &Url, location: Option<&str>) -> Result<Url, RedirectError> {
    let location = location.ok_or(RedirectError::MissingLocationHeader)?;
    current
        .join(location)
        .map_err(|_| RedirectError::InvalidLocation(location.to_string()))
}
