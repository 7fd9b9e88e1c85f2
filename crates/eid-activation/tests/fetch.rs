//! End-to-end tests of the fetch pipeline over scripted in-memory
//! channels: redirect following, hop accounting, validator interplay, and
//! the close-exactly-once channel discipline.

mod common;

use anyhow::Result;
use url::Url;

use common::{ok_response, redirect_response, status_response, Script, ScriptedDialer};
use eid_activation::error::{ErrorKind, RedirectError, TransportError};
use eid_activation::fetch::{fetch, DEFAULT_HOP_BUDGET};
use eid_activation::http::CookieStore;
use eid_activation::redirect::RedirectPolicy;
use eid_activation::session::{ActivationContext, CertificateDescription};
use eid_activation::tls::certificate_fingerprint;

fn url(s: &str) -> Url {
    s.parse().unwrap()
}

#[tokio::test]
async fn follows_redirects_and_records_every_hop() -> Result<()> {
    let dialer = ScriptedDialer::new(vec![
        redirect_response("https://b.example/next"),
        redirect_response("/fragment"),
        ok_response("the payload"),
    ]);
    let cookies = CookieStore::default();

    let mut result = fetch(
        &dialer,
        &cookies,
        url("https://a.example/start"),
        &mut RedirectPolicy::dont_care(),
        DEFAULT_HOP_BUDGET,
    )
    .await?;

    assert_eq!(result.payload(), Some(b"the payload".as_ref()));
    let hops: Vec<&str> = result.hops().iter().map(|h| h.url.as_str()).collect();
    assert_eq!(
        hops,
        [
            "https://a.example/start",
            "https://b.example/next",
            "https://b.example/fragment",
        ]
    );
    assert_eq!(result.final_url().as_str(), "https://b.example/fragment");
    assert_eq!(result.final_certificates().len(), 1);
    assert_eq!(dialer.dial_count(), 3);

    // Two redirect hops closed during the fetch, the final channel now.
    assert_eq!(dialer.close_count(), 2);
    result.close().await;
    assert_eq!(dialer.close_count(), 3);
    Ok(())
}

#[tokio::test]
async fn hop_budget_allows_exactly_that_many_dials() {
    let dialer = ScriptedDialer::new(vec![
        redirect_response("https://a.example/1"),
        redirect_response("https://a.example/2"),
        redirect_response("https://a.example/3"),
    ]);
    let cookies = CookieStore::default();

    let err = fetch(
        &dialer,
        &cookies,
        url("https://a.example/0"),
        &mut RedirectPolicy::dont_care(),
        2,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.kind(),
        ErrorKind::RedirectPolicy(RedirectError::TooManyRedirects { limit: 2 })
    ));
    assert_eq!(dialer.dial_count(), 2);
    // Every opened channel was closed before the error propagated.
    assert_eq!(dialer.close_count(), 2);
}

#[tokio::test]
async fn error_status_closes_the_channel() {
    let dialer = ScriptedDialer::new(vec![status_response(404, "Not Found")]);
    let cookies = CookieStore::default();

    let err = fetch(
        &dialer,
        &cookies,
        url("https://a.example/missing"),
        &mut RedirectPolicy::dont_care(),
        DEFAULT_HOP_BUDGET,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.kind(),
        ErrorKind::Transport(TransportError::InvalidResultStatus { status })
            if status.as_u16() == 404
    ));
    assert_eq!(dialer.close_count(), 1);
}

#[tokio::test]
async fn permanent_redirects_are_not_followed() {
    let dialer = ScriptedDialer::new(vec![Script::new(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: https://b.example/\r\nContent-Length: 0\r\n\r\n",
    )]);
    let cookies = CookieStore::default();

    // 301 is neither followed nor an error status: it terminates the fetch.
    let result = fetch(
        &dialer,
        &cookies,
        url("https://a.example/"),
        &mut RedirectPolicy::dont_care(),
        DEFAULT_HOP_BUDGET,
    )
    .await
    .unwrap();
    assert_eq!(result.hops().len(), 1);
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn non_https_address_is_rejected_without_dialing() {
    let dialer = ScriptedDialer::new(vec![]);
    let cookies = CookieStore::default();

    let err = fetch(
        &dialer,
        &cookies,
        url("http://a.example/plain"),
        &mut RedirectPolicy::dont_care(),
        DEFAULT_HOP_BUDGET,
    )
    .await
    .unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::Address(_)));
    assert_eq!(dialer.dial_count(), 0);
}

#[tokio::test]
async fn terminal_response_on_untrusted_origin_fails() {
    let ctx = ActivationContext::new(true);
    ctx.set_token_url(url("https://service.example/token"));

    let dialer = ScriptedDialer::new(vec![ok_response("document")]);
    let err = fetch(
        &dialer,
        ctx.cookies(),
        url("https://portal.example/start"),
        &mut RedirectPolicy::tr03112(&ctx),
        DEFAULT_HOP_BUDGET,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.kind(),
        ErrorKind::RedirectPolicy(RedirectError::NoTrustedEndpoint)
    ));
    assert_eq!(dialer.close_count(), 1);
}

#[tokio::test]
async fn validator_finish_skips_the_http_exchange() {
    let ctx = ActivationContext::new(true);
    let mut script = Script::new("never read");
    ctx.certificate_description().set(CertificateDescription::new(
        Some(url("https://service.example/landing")),
        vec![certificate_fingerprint(b"pinned")],
    ));
    script.certificates = vec![rustls::pki_types::CertificateDer::from(b"pinned".to_vec())];

    let dialer = ScriptedDialer::new(vec![script]);
    let mut result = fetch(
        &dialer,
        ctx.cookies(),
        url("https://service.example/landing"),
        &mut RedirectPolicy::tr03112(&ctx),
        DEFAULT_HOP_BUDGET,
    )
    .await
    .unwrap();

    // The handshake alone was conclusive; no request was written.
    assert!(result.payload().is_none());
    assert!(dialer.requests.lock().unwrap().is_empty());
    result.close().await;
    assert_eq!(dialer.close_count(), 1);
}

// Paused time: the timeout fires as soon as both sides are idle instead
// of after a real 30 s wait.
#[tokio::test(start_paused = true)]
async fn stalled_server_times_out_and_closes_the_channel() {
    let dialer = ScriptedDialer::new(vec![Script::stalled()]);
    let cookies = CookieStore::default();

    let err = fetch(
        &dialer,
        &cookies,
        url("https://slow.example/token"),
        &mut RedirectPolicy::dont_care(),
        DEFAULT_HOP_BUDGET,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.kind(),
        ErrorKind::Transport(TransportError::Io(io)) if io.kind() == std::io::ErrorKind::TimedOut
    ));
    assert_eq!(dialer.close_count(), 1);
}

#[tokio::test]
async fn cookies_persist_across_hops_of_one_attempt() -> Result<()> {
    let dialer = ScriptedDialer::new(vec![
        Script::new(
            "HTTP/1.1 302 Found\r\nLocation: /second\r\nSet-Cookie: sid=abc; Path=/\r\n\
             Content-Length: 0\r\n\r\n",
        ),
        ok_response("done"),
    ]);
    let cookies = CookieStore::default();

    let mut result = fetch(
        &dialer,
        &cookies,
        url("https://a.example/first"),
        &mut RedirectPolicy::dont_care(),
        DEFAULT_HOP_BUDGET,
    )
    .await?;
    result.close().await;

    let requests = dialer.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].contains("Cookie:"));
    assert!(requests[1].contains("Cookie: sid=abc\r\n"));
    Ok(())
}
