//! Certificate/redirect validation consulted after every TLS handshake of
//! a fetch.
//!
//! Validators are stateful across hops: the TR-03112 checker remembers the
//! last URL it approved so consecutive hops can be compared under the
//! same-origin policy. The `DontCare` policy is used only while fetching
//! the activation token itself, before any trust is established.

use rustls::pki_types::CertificateDer;
use tracing::{debug, trace};
use url::Url;

use crate::error::{ActivationError, RedirectError};
use crate::session::ActivationContext;
use crate::tls::certificate_fingerprint;

/// Decision of a validator after one TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep following redirects; the same-origin check applies to the next
    /// hop.
    Continue,
    /// Stop here; whatever the current response carries is the payload.
    Finish,
    /// No policy enforced.
    DontCare,
}

/// The validator strategies, dispatched exhaustively.
pub enum RedirectPolicy<'a> {
    /// No trust established yet; accept every hop.
    DontCare,
    /// TR-03112 certificate pinning and same-origin enforcement.
    Tr03112(Tr03112Checker<'a>),
}

impl<'a> RedirectPolicy<'a> {
    /// The policy used while fetching the activation token.
    pub fn dont_care() -> Self {
        RedirectPolicy::DontCare
    }

    /// The policy used while resolving the refresh address.
    pub fn tr03112(ctx: &'a ActivationContext) -> Self {
        RedirectPolicy::Tr03112(Tr03112Checker { ctx, last_url: None })
    }

    /// Judge one hop: the URL just connected to and the certificate chain
    /// its server presented.
    pub fn validate(
        &mut self,
        url: &Url,
        certificates: &[CertificateDer<'static>],
    ) -> Result<Verdict, ActivationError> {
        match self {
            RedirectPolicy::DontCare => Ok(Verdict::DontCare),
            RedirectPolicy::Tr03112(checker) => checker.validate(url, certificates),
        }
    }
}

/// Whether two URLs share scheme, host and port.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// The TR-03112 redirect checker used while resolving the refresh address.
pub struct Tr03112Checker<'a> {
    ctx: &'a ActivationContext,
    last_url: Option<Url>,
}

impl Tr03112Checker<'_> {
    /// The last URL that received a `Continue` verdict, i.e. the previous
    /// hop the next same-origin comparison is anchored to.
    pub fn last_url(&self) -> Option<&Url> {
        self.last_url.as_ref()
    }

    fn validate(
        &mut self,
        url: &Url,
        certificates: &[CertificateDer<'static>],
    ) -> Result<Verdict, ActivationError> {
        if !self.ctx.checks_enabled() {
            // Non-eID card types or developer override: redirects are left
            // to the browser.
            trace!(%url, "TR-03112 checks disabled, finishing");
            return Ok(Verdict::Finish);
        }

        let description = self.ctx.certificate_description().try_get();

        if let Some(ref description) = description {
            let end_entity = certificates
                .first()
                .ok_or_else(|| ActivationError::new(RedirectError::CertificateNotPinned))?;
            if !description.pins(end_entity.as_ref()) {
                debug!(
                    %url,
                    fingerprint = ?certificate_fingerprint(end_entity.as_ref()),
                    "server certificate not in pinned communication certificates"
                );
                return Err(RedirectError::CertificateNotPinned.into());
            }
        }

        let subject = description
            .as_ref()
            .and_then(|d| d.subject_url().cloned())
            .or_else(|| self.ctx.token_url())
            .ok_or_else(|| ActivationError::new(RedirectError::NoSubjectUrl))?;

        if same_origin(&subject, url) {
            debug!(%url, "redirect chain reached the expected origin");
            Ok(Verdict::Finish)
        } else {
            trace!(%url, %subject, "origin not yet reached, continuing");
            self.last_url = Some(url.clone());
            Ok(Verdict::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CertificateDescription;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    fn cert(bytes: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    #[test]
    fn same_origin_compares_scheme_host_port() {
        assert!(same_origin(&url("https://a.example/x"), &url("https://a.example/y?q=1")));
        assert!(same_origin(&url("https://a.example/"), &url("https://a.example:443/")));
        assert!(!same_origin(&url("https://a.example/"), &url("http://a.example/")));
        assert!(!same_origin(&url("https://a.example/"), &url("https://b.example/")));
        assert!(!same_origin(&url("https://a.example/"), &url("https://a.example:8443/")));
    }

    #[test]
    fn dont_care_never_objects() {
        let mut policy = RedirectPolicy::dont_care();
        let verdict = policy.validate(&url("https://anywhere.example/"), &[]).unwrap();
        assert_eq!(verdict, Verdict::DontCare);
    }

    #[test]
    fn disabled_checks_always_finish() {
        let ctx = ActivationContext::new(false);
        let mut policy = RedirectPolicy::tr03112(&ctx);
        let verdict = policy.validate(&url("https://anywhere.example/"), &[]).unwrap();
        assert_eq!(verdict, Verdict::Finish);
    }

    #[test]
    fn converges_on_subject_origin() {
        let ctx = ActivationContext::new(true);
        let subject = url("https://service.example/landing");
        ctx.certificate_description().set(CertificateDescription::new(
            Some(subject),
            vec![certificate_fingerprint(b"hop-cert")],
        ));

        let mut policy = RedirectPolicy::tr03112(&ctx);
        let chain = [
            url("https://cdn-a.example/start"),
            url("https://cdn-b.example/next"),
            url("https://service.example/landing"),
        ];
        let mut verdicts = Vec::new();
        for hop in &chain {
            verdicts.push(policy.validate(hop, &[cert(b"hop-cert")]).unwrap());
        }
        assert_eq!(
            verdicts,
            [Verdict::Continue, Verdict::Continue, Verdict::Finish]
        );
    }

    #[test]
    fn unpinned_certificate_is_rejected() {
        let ctx = ActivationContext::new(true);
        ctx.certificate_description().set(CertificateDescription::new(
            Some(url("https://service.example/")),
            vec![certificate_fingerprint(b"expected")],
        ));

        let mut policy = RedirectPolicy::tr03112(&ctx);
        let err = policy
            .validate(&url("https://service.example/"), &[cert(b"imposter")])
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::RedirectPolicy(RedirectError::CertificateNotPinned)
        ));
    }

    #[test]
    fn token_url_is_fallback_subject() {
        let ctx = ActivationContext::new(true);
        ctx.set_token_url(url("https://service.example/token"));

        let mut policy = RedirectPolicy::tr03112(&ctx);
        assert_eq!(
            policy.validate(&url("https://other.example/"), &[]).unwrap(),
            Verdict::Continue
        );
        assert_eq!(
            policy.validate(&url("https://service.example/done"), &[]).unwrap(),
            Verdict::Finish
        );
    }

    #[test]
    fn no_subject_is_an_error() {
        let ctx = ActivationContext::new(true);
        let mut policy = RedirectPolicy::tr03112(&ctx);
        let err = policy.validate(&url("https://a.example/"), &[]).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::RedirectPolicy(RedirectError::NoSubjectUrl)
        ));
    }
}
