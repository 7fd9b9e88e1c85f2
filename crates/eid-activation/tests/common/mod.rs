//! Shared doubles for driving the fetch pipeline and the orchestrator
//! without sockets: a dialer that serves scripted HTTP responses over
//! in-memory streams and counts every dial and close.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use url::Url;

use eid_activation::error::TransportError;
use eid_activation::tls::{Connection, Dialer};

/// One canned exchange: the raw response bytes and the certificate chain
/// the fake server "presented".
pub struct Script {
    pub response: Vec<u8>,
    pub certificates: Vec<CertificateDer<'static>>,
    pub stall: bool,
}

impl Script {
    pub fn new(response: impl Into<Vec<u8>>) -> Self {
        Self {
            response: response.into(),
            certificates: vec![CertificateDer::from(b"scripted-cert".to_vec())],
            stall: false,
        }
    }

    /// A server that accepts the request and then never answers.
    pub fn stalled() -> Self {
        Self {
            response: Vec::new(),
            certificates: vec![CertificateDer::from(b"scripted-cert".to_vec())],
            stall: true,
        }
    }
}

/// Convenience constructors for common responses.
pub fn ok_response(body: &str) -> Script {
    Script::new(format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ))
}

pub fn redirect_response(location: &str) -> Script {
    Script::new(format!(
        "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n"
    ))
}

pub fn status_response(status: u16, reason: &str) -> Script {
    Script::new(format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n"
    ))
}

/// Counts shutdowns of the wrapped stream, once per stream.
struct CountingStream {
    inner: tokio::io::DuplexStream,
    closes: Arc<AtomicUsize>,
    counted: bool,
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if matches!(result, Poll::Ready(Ok(()))) && !self.counted {
            self.counted = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

/// A dialer that pops one [`Script`] per dial and serves it over an
/// in-memory duplex stream. Records every dialed URL, every request the
/// client wrote, and how many channels were shut down.
pub struct ScriptedDialer {
    scripts: Mutex<VecDeque<Script>>,
    pub dialed: Mutex<Vec<Url>>,
    pub requests: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedDialer {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            dialed: Mutex::new(Vec::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dialed.lock().unwrap().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, url: &Url) -> Result<Connection, TransportError> {
        self.dialed.lock().unwrap().push(url.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::ChannelClosed)?;

        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let requests = self.requests.clone();
        tokio::spawn(async move {
            // Wait for a full request head before answering, then keep the
            // far end open until the client hangs up.
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match server.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&chunk[..n]),
                }
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            requests
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&request).into_owned());
            if !script.stall && server.write_all(&script.response).await.is_err() {
                return;
            }
            let _ = server.flush().await;
            while let Ok(n) = server.read(&mut chunk).await {
                if n == 0 {
                    return;
                }
            }
        });

        let stream = CountingStream {
            inner: client,
            closes: self.closes.clone(),
            counted: false,
        };
        Ok(Connection::new(Box::new(stream), script.certificates))
    }
}
