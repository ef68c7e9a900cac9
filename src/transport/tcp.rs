//! TCP transport for proxy clients.
//!
//! Each client connection is handled independently in its own task:
//! read a request head, run it through the pipeline, write the response,
//! then either wait for the next request (keep-alive) or close.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{MAX_REQUEST_SIZE, RequestLogger};
use crate::error::{ProxyError, Result};
use crate::http::{self, RequestError, Status, error_response};
use crate::pipeline::{Pipeline, RequestAction};

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// How long a connection may sit idle waiting for the next request.
    pub keep_alive_timeout: Duration,
    pub max_request_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(10),
            max_request_size: MAX_REQUEST_SIZE,
        }
    }
}

/// TCP transport for the proxy.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    pub fn start(self, pipeline: Arc<Pipeline>, settings: ConnectionSettings) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, pipeline, settings))
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    settings: ConnectionSettings,
) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                debug!(client = %peer, "Accepted connection");
                tokio::spawn(handle_connection(client, peer, pipeline.clone(), settings));
            }
            Err(e) => {
                warn!(error = %e, "TCP accept error");
            }
        }
    }
}

/// Serve requests on one connection until the client closes, goes idle,
/// or sends a request without keep-alive.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
    settings: ConnectionSettings,
) {
    let logger = RequestLogger::new(peer);
    let mut reader = RequestReader::new(settings.max_request_size);

    loop {
        let raw = match timeout(settings.keep_alive_timeout, reader.next_request(&mut client)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                logger.closed("peer closed");
                break;
            }
            Ok(Err(ReadError::TooLarge(limit))) => {
                logger.rejected(&ProxyError::from(RequestError::TooLarge(limit)), 0.0);
                pipeline.stats().record_rejected(0.0);
                let response = error_response(
                    Status::BadRequest,
                    http::response_version(reader.pending()),
                    false,
                );
                let _ = client.write_all(&response).await;
                break;
            }
            Ok(Err(ReadError::Io(e))) => {
                debug!(client = %peer, error = %e, "Client read error");
                break;
            }
            Err(_) => {
                logger.closed("idle timeout");
                break;
            }
        };

        if !serve_request(&raw, &mut client, &pipeline, &logger).await {
            break;
        }
    }

    let _ = client.shutdown().await;
}

/// Answer one request. Returns whether the connection should stay open.
async fn serve_request(
    raw: &[u8],
    client: &mut TcpStream,
    pipeline: &Pipeline,
    logger: &RequestLogger,
) -> bool {
    let start = Instant::now();
    let elapsed_ms = || start.elapsed().as_secs_f64() * 1000.0;
    let stats = pipeline.stats();

    match pipeline.process_request(raw).await {
        RequestAction::Rejected {
            response,
            keep_alive,
            error,
        } => {
            let written = client.write_all(&response).await.is_ok();
            logger.rejected(&error, elapsed_ms());
            stats.record_rejected(elapsed_ms());
            written && keep_alive
        }
        RequestAction::Blocked { response, request } => {
            let written = client.write_all(&response).await.is_ok();
            logger.blocked(&request.host, elapsed_ms());
            stats.record_blocked(elapsed_ms());
            written && request.keep_alive
        }
        RequestAction::Cached { payload, request } => {
            let written = client.write_all(&payload).await.is_ok();
            logger.cached(&request.url, payload.len(), elapsed_ms());
            stats.record_cached(elapsed_ms());
            written && request.keep_alive
        }
        RequestAction::Fetch(plan) => {
            let url = plan.request.url.clone();
            let version = plan.request.version;
            let keep_alive = plan.request.keep_alive;
            let stale = plan.stale;

            match pipeline.fetch(plan, client).await {
                Ok(outcome) => {
                    logger.fetched(&url, outcome, stale, elapsed_ms());
                    stats.record_fetched(elapsed_ms());
                    keep_alive
                }
                Err(failure) => {
                    logger.failed(&url, &failure.error, failure.relayed, elapsed_ms());
                    stats.record_failed(elapsed_ms());
                    match failure.response_status() {
                        Some(status) => {
                            let response = error_response(status, version, keep_alive);
                            client.write_all(&response).await.is_ok() && keep_alive
                        }
                        // Part of the origin response already went out.
                        None => false,
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
enum ReadError {
    TooLarge(usize),
    Io(io::Error),
}

/// Splits a client byte stream into request heads.
///
/// Bytes after a head's terminating blank line are kept for the next call.
struct RequestReader {
    buf: Vec<u8>,
    limit: usize,
}

impl RequestReader {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Bytes received but not yet returned as a request.
    fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Read the next request head.
    ///
    /// Returns `None` once the peer closes with nothing buffered. A peer
    /// that closes mid-head yields what was received.
    async fn next_request<R>(&mut self, stream: &mut R) -> std::result::Result<Option<Vec<u8>>, ReadError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; 1024];

        loop {
            if let Some(end) = head_end(&self.buf) {
                let rest = self.buf.split_off(end);
                return Ok(Some(std::mem::replace(&mut self.buf, rest)));
            }
            if self.buf.len() >= self.limit {
                return Err(ReadError::TooLarge(self.limit));
            }

            let n = stream.read(&mut chunk).await.map_err(ReadError::Io)?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buf)));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Offset just past the blank line ending a request head.
fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
