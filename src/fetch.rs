//! Origin fetching.
//!
//! Forwards the raw client request to the origin and relays the response
//! chunk by chunk, writing each chunk to the cache payload and to the client
//! as it arrives. The transfer ends when the origin closes the connection;
//! `Content-Length` and chunked framing are not interpreted. An origin that
//! closes before sending anything is a failure, never an empty response.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cache::PayloadWriter;
use crate::error::ProxyError;
use crate::http::{ProxyRequest, Status};

/// Size of each read from the origin.
pub const CHUNK_SIZE: usize = 8192;

/// Settings for origin connections.
#[derive(Debug, Clone, Copy)]
pub struct OriginConfig {
    /// Port to connect to. Never taken from the URL.
    pub port: u16,
    /// Bound on connecting and on each idle read.
    pub timeout: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            port: 80,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Why a transfer ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The origin closed its side.
    Closed,
    /// The origin went idle after sending data and kept the socket open.
    Idle,
}

/// A completed relay.
#[derive(Debug, Clone, Copy)]
pub struct FetchOutcome {
    pub bytes: u64,
    pub end: StreamEnd,
}

/// A failed relay, with how much had already reached the client.
#[derive(Debug)]
pub struct FetchFailure {
    pub error: ProxyError,
    pub relayed: u64,
}

impl FetchFailure {
    fn new(error: ProxyError, relayed: u64) -> Self {
        Self { error, relayed }
    }

    /// Error page to send, if the client has not seen any response bytes
    /// and is still there to receive one.
    pub fn response_status(&self) -> Option<Status> {
        if self.relayed > 0 {
            return None;
        }
        match self.error {
            ProxyError::OriginTimeout { .. } => Some(Status::GatewayTimeout),
            ProxyError::OriginConnect { .. } | ProxyError::OriginIo { .. } => {
                Some(Status::BadGateway)
            }
            _ => None,
        }
    }
}

/// Fetch `request` from the origin at `addr` and stream the response to
/// `client`, recording every chunk into `payload`.
pub async fn stream_origin<W>(
    request: &ProxyRequest,
    addr: IpAddr,
    config: OriginConfig,
    client: &mut W,
    payload: &mut PayloadWriter,
) -> Result<FetchOutcome, FetchFailure>
where
    W: AsyncWrite + Unpin,
{
    let origin_addr = SocketAddr::new(addr, config.port);

    let mut origin = match timeout(config.timeout, TcpStream::connect(origin_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(FetchFailure::new(
                ProxyError::OriginConnect {
                    addr: origin_addr,
                    source,
                },
                0,
            ));
        }
        Err(_) => {
            return Err(FetchFailure::new(
                ProxyError::OriginTimeout {
                    addr: origin_addr,
                    timeout: config.timeout,
                },
                0,
            ));
        }
    };

    if let Err(source) = origin.write_all(&request.raw).await {
        return Err(FetchFailure::new(
            ProxyError::OriginIo {
                addr: origin_addr,
                source,
            },
            0,
        ));
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut relayed = 0u64;

    let end = loop {
        let n = match timeout(config.timeout, origin.read(&mut buf)).await {
            Ok(Ok(0)) if relayed > 0 => break StreamEnd::Closed,
            Ok(Ok(0)) => {
                return Err(FetchFailure::new(
                    ProxyError::OriginIo {
                        addr: origin_addr,
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "origin closed without a response",
                        ),
                    },
                    0,
                ));
            }
            Ok(Ok(n)) => n,
            Ok(Err(source)) => {
                return Err(FetchFailure::new(
                    ProxyError::OriginIo {
                        addr: origin_addr,
                        source,
                    },
                    relayed,
                ));
            }
            Err(_) if relayed > 0 => break StreamEnd::Idle,
            Err(_) => {
                return Err(FetchFailure::new(
                    ProxyError::OriginTimeout {
                        addr: origin_addr,
                        timeout: config.timeout,
                    },
                    0,
                ));
            }
        };

        payload.write_chunk(&buf[..n]).await;
        if let Err(e) = client.write_all(&buf[..n]).await {
            return Err(FetchFailure::new(ProxyError::Io(e), relayed));
        }
        relayed += n as u64;
    };

    if let Err(e) = client.flush().await {
        return Err(FetchFailure::new(ProxyError::Io(e), relayed));
    }

    Ok(FetchOutcome {
        bytes: relayed,
        end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLookup, ContentCache};
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn request(raw: &[u8]) -> ProxyRequest {
        ProxyRequest::parse(raw).unwrap()
    }

    async fn origin_serving(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream.write_all(response).await.unwrap();
        });
        addr
    }

    fn config(port: u16) -> OriginConfig {
        OriginConfig {
            port,
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn relays_until_origin_closes_and_records_payload() {
        let body: &'static [u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let origin = origin_serving(body).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), Duration::from_secs(60), Arc::new(ManualClock::new(0))).unwrap();
        let req = request(b"GET http://origin.test/ HTTP/1.0\r\n\r\n");

        let mut client = Vec::new();
        let mut payload = cache.begin(&req.url).await;
        let outcome = stream_origin(&req, origin.ip(), config(origin.port()), &mut client, &mut payload)
            .await
            .unwrap();
        cache.commit(payload).await.unwrap();

        assert_eq!(outcome.end, StreamEnd::Closed);
        assert_eq!(outcome.bytes, body.len() as u64);
        assert_eq!(client, body);
        match cache.lookup(&req.url).await {
            CacheLookup::Hit(cached) => assert_eq!(cached, body),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwards_raw_request_unmodified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        let raw: &[u8] = b"GET http://origin.test/a?b=c HTTP/1.1\r\nHost: origin.test\r\nX-Custom: 1\r\n\r\n";
        let seen = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            buf.truncate(n);
            stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            buf
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), Duration::from_secs(60), Arc::new(ManualClock::new(0))).unwrap();

        let req = request(raw);
        let mut payload = cache.begin(&req.url).await;
        let mut client = Vec::new();
        stream_origin(&req, origin.ip(), config(origin.port()), &mut client, &mut payload)
            .await
            .unwrap();

        assert_eq!(seen.await.unwrap(), raw);
    }

    #[tokio::test]
    async fn refused_connection_is_bad_gateway() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), Duration::from_secs(60), Arc::new(ManualClock::new(0))).unwrap();
        let req = request(b"GET http://origin.test/ HTTP/1.1\r\n\r\n");

        let mut payload = cache.begin(&req.url).await;
        let mut client = Vec::new();
        let failure = stream_origin(&req, "127.0.0.1".parse().unwrap(), config(port), &mut client, &mut payload)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ProxyError::OriginConnect { .. }));
        assert_eq!(failure.response_status(), Some(Status::BadGateway));
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn silent_origin_is_gateway_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), Duration::from_secs(60), Arc::new(ManualClock::new(0))).unwrap();
        let req = request(b"GET http://origin.test/ HTTP/1.1\r\n\r\n");

        let mut payload = cache.begin(&req.url).await;
        let mut client = Vec::new();
        let failure = stream_origin(
            &req,
            origin.ip(),
            OriginConfig {
                port: origin.port(),
                timeout: Duration::from_millis(100),
            },
            &mut client,
            &mut payload,
        )
        .await
        .unwrap_err();

        assert!(matches!(failure.error, ProxyError::OriginTimeout { .. }));
        assert_eq!(failure.response_status(), Some(Status::GatewayTimeout));
        hold.abort();
    }

    #[tokio::test]
    async fn idle_origin_after_data_ends_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\nkept open").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), Duration::from_secs(60), Arc::new(ManualClock::new(0))).unwrap();
        let req = request(b"GET http://origin.test/ HTTP/1.1\r\n\r\n");

        let mut payload = cache.begin(&req.url).await;
        let mut client = Vec::new();
        let outcome = stream_origin(
            &req,
            origin.ip(),
            OriginConfig {
                port: origin.port(),
                timeout: Duration::from_millis(100),
            },
            &mut client,
            &mut payload,
        )
        .await
        .unwrap();

        assert_eq!(outcome.end, StreamEnd::Idle);
        assert_eq!(client, b"HTTP/1.1 200 OK\r\n\r\nkept open");
        hold.abort();
    }

    #[tokio::test]
    async fn origin_closing_without_bytes_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), Duration::from_secs(60), Arc::new(ManualClock::new(0))).unwrap();
        let req = request(b"GET http://origin.test/ HTTP/1.1\r\n\r\n");

        let mut payload = cache.begin(&req.url).await;
        let mut client = Vec::new();
        let failure = stream_origin(&req, origin.ip(), config(origin.port()), &mut client, &mut payload)
            .await
            .unwrap_err();

        match &failure.error {
            ProxyError::OriginIo { source, .. } => assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected origin io error, got {other:?}"),
        }
        assert_eq!(failure.relayed, 0);
        assert_eq!(failure.response_status(), Some(Status::BadGateway));
        assert!(client.is_empty());
    }

    #[test]
    fn failure_after_bytes_has_no_error_page() {
        let failure = FetchFailure::new(
            ProxyError::OriginIo {
                addr: "127.0.0.1:80".parse().unwrap(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            },
            10,
        );

        assert_eq!(failure.response_status(), None);
    }
}
