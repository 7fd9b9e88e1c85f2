//! Lenient parser for TCToken documents.
//!
//! eServices in the field produce two known malformations: a missing
//! trailing "s" on the `PathSecurity-Parameters` element name, and
//! HTML-entity-escaped `<PSK>` tags. Both are corrected by textual
//! substitution before any structural parsing. Unknown elements are
//! ignored; the first `TCTokenType` candidate in the document wins.

use data_encoding::HEXLOWER_PERMISSIVE;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::token::TcToken;

/// Errors produced while parsing a TCToken document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The fetched document was empty.
    #[error("TCToken document is empty")]
    EmptyDocument,

    /// The document contained no `TCTokenType` element.
    #[error("no TCToken found in document")]
    NoToken,
}

/// Parse a TCToken out of raw document bytes.
///
/// Returns the first token candidate found. The result is unvalidated;
/// field verification is the caller's job.
pub fn parse_tc_token(document: &[u8]) -> Result<TcToken, TokenError> {
    if document.is_empty() {
        return Err(TokenError::EmptyDocument);
    }

    let text = String::from_utf8_lossy(document);
    let text = fix_known_malformations(&text);

    let mut candidates = scan_tokens(&text);
    if candidates.len() > 1 {
        warn!(count = candidates.len(), "multiple TCToken candidates, using first");
    }
    match candidates.is_empty() {
        true => Err(TokenError::NoToken),
        false => Ok(candidates.swap_remove(0)),
    }
}

/// Textual corrections for malformations seen in production eServices.
fn fix_known_malformations(text: &str) -> String {
    // The well-formed name ends in "Parameters>", so this only matches the
    // broken singular form.
    let text = text.replace("PathSecurity-Parameter>", "PathSecurity-Parameters>");
    text.replace("&lt;PSK&gt;", "<PSK>")
        .replace("&lt;/PSK&gt;", "</PSK>")
}

/// Extract every `TCTokenType` block from the document, oldest first.
fn scan_tokens(text: &str) -> Vec<TcToken> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while let Some(block) = next_element(rest, "TCTokenType") {
        tokens.push(parse_token_block(block.inner));
        rest = block.remainder;
    }
    tokens
}

fn parse_token_block(block: &str) -> TcToken {
    let mut token = TcToken {
        server_address: element_text(block, "ServerAddress"),
        session_identifier: element_text(block, "SessionIdentifier"),
        refresh_address: element_text(block, "RefreshAddress"),
        communication_error_address: element_text(block, "CommunicationErrorAddress"),
        binding: element_text(block, "Binding"),
        path_security_protocol: element_text(block, "PathSecurity-Protocol"),
        psk: None,
        psk_invalid: false,
    };

    if let Some(params) = next_element(block, "PathSecurity-Parameters") {
        if let Some(psk_hex) = element_text(params.inner, "PSK") {
            match HEXLOWER_PERMISSIVE.decode(psk_hex.as_bytes()) {
                Ok(bytes) => token.psk = Some(Zeroizing::new(bytes)),
                Err(err) => {
                    warn!(%err, "PSK is not valid even-length hex");
                    token.psk_invalid = true;
                }
            }
        }
    }

    debug!(
        error_token = token.is_error_token(),
        has_psk = token.psk.is_some(),
        "parsed TCToken candidate"
    );
    token
}

/// The inner text of one element plus the unconsumed remainder of the input.
struct Element<'a> {
    inner: &'a str,
    remainder: &'a str,
}

/// Find the first `<name ...>inner</name>` in `text`.
///
/// Attributes are skipped; nothing else about XML well-formedness is
/// checked, by design. Returns `None` if the element or its closing tag is
/// missing.
fn next_element<'a>(text: &'a str, name: &str) -> Option<Element<'a>> {
    let open = format!("<{name}");
    let close = format!("</{name}>");

    let mut search = text;
    loop {
        let start = search.find(&open)?;
        let after_name = &search[start + open.len()..];
        // Reject prefix matches like "<PSKx" for name "PSK".
        match after_name.chars().next() {
            Some('>') | Some(' ') | Some('\t') | Some('\r') | Some('\n') | Some('/') => {}
            _ => {
                search = &search[start + open.len()..];
                continue;
            }
        }
        let tag_end = after_name.find('>')?;
        let body = &after_name[tag_end + 1..];
        let end = body.find(&close)?;
        return Some(Element {
            inner: &body[..end],
            remainder: &body[end + close.len()..],
        });
    }
}

/// Inner text of the first matching element, entity-unescaped and trimmed.
/// Whitespace-only content is treated as absent.
fn element_text(text: &str, name: &str) -> Option<String> {
    let element = next_element(text, name)?;
    let value = unescape(element.inner.trim());
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Resolve the five predefined XML entities. Unknown entities pass through.
fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
