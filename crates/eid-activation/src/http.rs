//! Minimal HTTP/1.1 client framing over an owned async stream.
//!
//! The fetch pipeline must keep ownership of the raw TLS stream so it can
//! hand the very same channel to the card-authentication transport
//! afterwards. General-purpose HTTP clients hide the connection, so the
//! single request shape we need (a GET with cookies, returning status,
//! headers and a bounded body) is framed by hand here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ::http::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, LOCATION, SET_COOKIE, TRANSFER_ENCODING,
};
use ::http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use url::Url;

use crate::error::TransportError;

/// Upper bound on the decoded response body.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Upper bound on the response head (status line + headers).
const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Cookie jar shared by every fetch of one activation attempt, keyed by the
/// requesting host and port. Legacy eID servers use session cookies between
/// redirect hops, so `Set-Cookie` values must survive across connections.
#[derive(Debug, Default, Clone)]
pub struct CookieStore {
    // host:port -> cookie name -> value
    inner: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

fn jar_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url.port_or_known_default().unwrap_or(443);
    Some(format!("{host}:{port}"))
}

impl CookieStore {
    /// Persist every `Set-Cookie` header of a response, keyed by the URL
    /// that was requested.
    pub fn store_response_cookies(&self, requested: &Url, headers: &HeaderMap) {
        let Some(key) = jar_key(requested) else {
            return;
        };
        let mut inner = self.inner.lock().expect("cookie store lock poisoned");
        for value in headers.get_all(SET_COOKIE) {
            let Ok(text) = value.to_str() else { continue };
            // "name=value; Path=/; ..." - attributes are not evaluated.
            let Some(pair) = text.split(';').next() else { continue };
            let Some((name, value)) = pair.split_once('=') else { continue };
            trace!(origin = %key, name = name.trim(), "storing cookie");
            inner
                .entry(key.clone())
                .or_default()
                .insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    /// The `Cookie` header value for a request to `url`, if any cookies are
    /// stored for its host and port.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let key = jar_key(url)?;
        let inner = self.inner.lock().expect("cookie store lock poisoned");
        let cookies = inner.get(&key)?;
        if cookies.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = cookies.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        Some(pairs.join("; "))
    }
}

/// A decoded HTTP response.
#[derive(Debug)]
pub struct Response {
    /// The response status.
    pub status: StatusCode,
    /// All response headers.
    pub headers: HeaderMap,
    /// The decoded body, bounded by [`MAX_RESPONSE_BYTES`].
    pub body: Vec<u8>,
}

impl Response {
    /// The `Location` header as text, if present.
    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }
}

/// Perform one `GET` for `url` on an already-connected stream.
pub async fn get<S>(
    stream: &mut S,
    url: &Url,
    cookies: &CookieStore,
) -> Result<Response, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    write_get_request(stream, url, cookies).await?;
    let response = read_response(stream).await?;
    debug!(%url, status = %response.status, body_len = response.body.len(), "HTTP exchange done");
    Ok(response)
}

async fn write_get_request<S>(
    stream: &mut S,
    url: &Url,
    cookies: &CookieStore,
) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::MalformedResponse(format!("URL `{url}` has no host")))?;
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut request = format!(
        "GET {target} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Accept: */*\r\n\
         User-Agent: eid-activation/{}\r\n\
         Connection: keep-alive\r\n",
        env!("CARGO_PKG_VERSION"),
    );
    if let Some(cookie) = cookies.cookie_header(url) {
        request.push_str("Cookie: ");
        request.push_str(&cookie);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Buffered reader over the response bytes; keeps data read past the head
/// available for the body.
struct NetReader<'a, S: ?Sized> {
    stream: &'a mut S,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a, S: AsyncRead + Unpin + ?Sized> NetReader<'a, S> {
    fn new(stream: &'a mut S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Read more bytes from the stream. Returns `false` on EOF.
    async fn fill(&mut self) -> Result<bool, TransportError> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n > 0)
    }

    fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Consume and return exactly `len` bytes.
    async fn take_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        while self.buf.len() - self.pos < len {
            if !self.fill().await? {
                return Err(TransportError::MalformedResponse(
                    "connection closed mid-body".into(),
                ));
            }
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    /// Consume one CRLF-terminated line (without the terminator).
    async fn take_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(idx) = find(self.buffered(), b"\r\n") {
                let line = String::from_utf8_lossy(&self.buffered()[..idx]).into_owned();
                self.pos += idx + 2;
                return Ok(line);
            }
            if self.buf.len() - self.pos > MAX_HEAD_BYTES {
                return Err(TransportError::MalformedResponse("line too long".into()));
            }
            if !self.fill().await? {
                return Err(TransportError::MalformedResponse(
                    "connection closed mid-line".into(),
                ));
            }
        }
    }

    /// Consume everything until EOF, bounded by `limit`.
    async fn take_to_end(&mut self, limit: usize) -> Result<Vec<u8>, TransportError> {
        loop {
            if self.buf.len() - self.pos > limit {
                return Err(TransportError::ResponseTooLarge { limit });
            }
            if !self.fill().await? {
                let out = self.buf[self.pos..].to_vec();
                self.pos = self.buf.len();
                return Ok(out);
            }
        }
    }
}

async fn read_response<S>(stream: &mut S) -> Result<Response, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut reader = NetReader::new(stream);

    let status_line = reader.take_line().await?;
    let status = parse_status_line(&status_line)?;

    let mut headers = HeaderMap::new();
    let mut head_bytes = status_line.len() + 2;
    loop {
        let line = reader.take_line().await?;
        // The cap is cumulative over the whole head; a flood of short
        // header lines must not grow the buffer (or the header map)
        // without bound.
        head_bytes += line.len() + 2;
        if head_bytes > MAX_HEAD_BYTES {
            return Err(TransportError::MalformedResponse(
                "response head exceeds size limit".into(),
            ));
        }
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(TransportError::MalformedResponse(format!(
                "header line without colon: `{line}`"
            )));
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|err| TransportError::MalformedResponse(err.to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|err| TransportError::MalformedResponse(err.to_string()))?;
        headers.append(name, value);
    }

    let body = read_body(&mut reader, &headers, status).await?;
    Ok(Response {
        status,
        headers,
        body,
    })
}

fn parse_status_line(line: &str) -> Result<StatusCode, TransportError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(TransportError::MalformedResponse(format!(
            "unsupported protocol in status line `{line}`"
        )));
    }
    let code = parts
        .next()
        .ok_or_else(|| TransportError::MalformedResponse(format!("bad status line `{line}`")))?;
    code.parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| TransportError::MalformedResponse(format!("bad status code `{code}`")))
}

async fn read_body<S>(
    reader: &mut NetReader<'_, S>,
    headers: &HeaderMap,
    status: StatusCode,
) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    // 1xx/204/304 never carry a body; redirects in practice carry none or a
    // short HTML note which we still read if delimited.
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Vec::new());
    }

    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return read_chunked_body(reader).await;
    }

    if let Some(length) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if length > MAX_RESPONSE_BYTES {
            return Err(TransportError::ResponseTooLarge {
                limit: MAX_RESPONSE_BYTES,
            });
        }
        return reader.take_exact(length).await;
    }

    // No delimiter: the server signals the end by closing the connection.
    reader.take_to_end(MAX_RESPONSE_BYTES).await
}

async fn read_chunked_body<S>(reader: &mut NetReader<'_, S>) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut body = Vec::new();
    loop {
        let size_line = reader.take_line().await?;
        let size_text = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| {
            TransportError::MalformedResponse(format!("bad chunk size `{size_line}`"))
        })?;
        if size == 0 {
            // Trailer section, up to the terminating blank line.
            loop {
                if reader.take_line().await?.is_empty() {
                    return Ok(body);
                }
            }
        }
        if body.len() + size > MAX_RESPONSE_BYTES {
            return Err(TransportError::ResponseTooLarge {
                limit: MAX_RESPONSE_BYTES,
            });
        }
        body.extend_from_slice(&reader.take_exact(size).await?);
        let sep = reader.take_line().await?;
        if !sep.is_empty() {
            return Err(TransportError::MalformedResponse(
                "missing CRLF after chunk".into(),
            ));
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn response_from(raw: &[u8]) -> Result<Response, TransportError> {
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        read_response(&mut cursor).await
    }

    #[tokio::test]
    async fn parses_content_length_body() {
        let resp = response_from(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await
        .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"hello");
    }

    #[tokio::test]
    async fn parses_chunked_body() {
        let resp = response_from(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(resp.body, b"wikipedia");
    }

    #[tokio::test]
    async fn parses_body_delimited_by_close() {
        let resp = response_from(b"HTTP/1.1 200 OK\r\n\r\npayload-until-eof")
            .await
            .unwrap();
        assert_eq!(resp.body, b"payload-until-eof");
    }

    #[tokio::test]
    async fn redirect_location_is_exposed() {
        let resp = response_from(
            b"HTTP/1.1 303 See Other\r\nLocation: https://next.example/x\r\nContent-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(resp.status, StatusCode::SEE_OTHER);
        assert_eq!(resp.location(), Some("https://next.example/x"));
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected() {
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            MAX_RESPONSE_BYTES + 1
        );
        let err = response_from(raw.as_bytes()).await.unwrap_err();
        assert!(matches!(err, TransportError::ResponseTooLarge { .. }));
    }

    #[tokio::test]
    async fn header_flood_is_rejected_not_panicking() {
        let mut raw = b"HTTP/1.1 200 OK\r\n".to_vec();
        for i in 0..40_000 {
            raw.extend_from_slice(format!("x-h{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\nbody");
        let err = response_from(&raw).await.unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn garbage_status_line_is_rejected() {
        let err = response_from(b"ICY 200 OK\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn request_includes_cookies_for_host() {
        let url: Url = "https://service.example/token?foo=1".parse().unwrap();
        let cookies = CookieStore::default();
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("lang=de"));
        cookies.store_response_cookies(&url, &headers);

        let mut out = Vec::new();
        write_get_request(&mut out, &url, &cookies).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /token?foo=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: service.example\r\n"));
        assert!(text.contains("Cookie: lang=de; sid=abc\r\n"));
    }

    #[test]
    fn cookies_are_scoped_to_the_requesting_host() {
        let a: Url = "https://a.example/".parse().unwrap();
        let b: Url = "https://b.example/".parse().unwrap();
        let cookies = CookieStore::default();
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc"));
        cookies.store_response_cookies(&a, &headers);

        assert_eq!(cookies.cookie_header(&a), Some("sid=abc".to_string()));
        assert_eq!(cookies.cookie_header(&b), None);
    }

    #[test]
    fn cookies_do_not_cross_ports_on_one_host() {
        let default_port: Url = "https://a.example/".parse().unwrap();
        let alt_port: Url = "https://a.example:8443/".parse().unwrap();
        let cookies = CookieStore::default();
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc"));
        cookies.store_response_cookies(&default_port, &headers);

        assert_eq!(cookies.cookie_header(&default_port), Some("sid=abc".to_string()));
        assert_eq!(cookies.cookie_header(&alt_port), None);
    }
}
