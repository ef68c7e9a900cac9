//! Request processing pipeline.
//!
//! Decides what to do with each request:
//! 1. Validate the request line
//! 2. Filter the host against the blocklist
//! 3. Resolve the host (host store first, then DNS)
//! 4. Look the URL up in the content cache
//!
//! Transports handle the socket I/O, the pipeline handles decisions and
//! drives origin fetches into the cache.

use std::net::IpAddr;

use tokio::io::AsyncWrite;
use tracing::warn;

use crate::cache::{CacheLookup, ContentCache, RefreshGuard};
use crate::error::ProxyError;
use crate::fetch::{FetchFailure, FetchOutcome, OriginConfig, stream_origin};
use crate::filter::{Blocklist, filter_request};
use crate::http::{self, ProxyRequest, Status, error_response};
use crate::resolver::Resolver;
use crate::stats::Stats;

/// Action to take for a request.
pub enum RequestAction {
    /// Invalid request or unresolvable host; send `response`.
    Rejected {
        response: Vec<u8>,
        keep_alive: bool,
        error: ProxyError,
    },
    /// Host is on the blocklist; send `response`.
    Blocked {
        response: Vec<u8>,
        request: ProxyRequest,
    },
    /// Fresh cached payload to send verbatim.
    Cached {
        payload: Vec<u8>,
        request: ProxyRequest,
    },
    /// Fetch from the origin.
    Fetch(FetchPlan),
}

/// A pending origin fetch. Holds the URL's refresh lock until dropped.
pub struct FetchPlan {
    pub request: ProxyRequest,
    pub addr: IpAddr,
    /// Whether this refreshes an expired entry rather than filling a miss.
    pub stale: bool,
    _guard: RefreshGuard,
}

/// Shared request-processing state: blocklist, resolver and cache.
pub struct Pipeline {
    blocklist: Blocklist,
    resolver: Resolver,
    cache: ContentCache,
    origin: OriginConfig,
    stats: Stats,
}

impl Pipeline {
    pub fn new(
        blocklist: Blocklist,
        resolver: Resolver,
        cache: ContentCache,
        origin: OriginConfig,
    ) -> Self {
        Self {
            blocklist,
            resolver,
            cache,
            origin,
            stats: Stats::new(),
        }
    }

    /// Process a raw request head and decide what action to take.
    pub async fn process_request(&self, raw: &[u8]) -> RequestAction {
        let request = match ProxyRequest::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                let keep_alive = http::is_keep_alive(raw);
                return RequestAction::Rejected {
                    response: error_response(
                        Status::BadRequest,
                        http::response_version(raw),
                        keep_alive,
                    ),
                    keep_alive,
                    error: e.into(),
                };
            }
        };

        if let Some(response) = filter_request(&self.blocklist, &request) {
            return RequestAction::Blocked { response, request };
        }

        let addr = match self.resolver.resolve(&request.host).await {
            Ok(resolution) => resolution.addr(),
            Err(error) => {
                return RequestAction::Rejected {
                    response: error_response(
                        Status::NotFound,
                        request.version,
                        request.keep_alive,
                    ),
                    keep_alive: request.keep_alive,
                    error,
                };
            }
        };

        if let CacheLookup::Hit(payload) = self.cache.lookup(&request.url).await {
            return RequestAction::Cached { payload, request };
        }

        // Re-check under the refresh lock: a peer may have refreshed the
        // entry while we waited.
        let guard = self.cache.refresh_guard(&request.url).await;
        let stale = match self.cache.lookup(&request.url).await {
            CacheLookup::Hit(payload) => return RequestAction::Cached { payload, request },
            CacheLookup::Miss => false,
            CacheLookup::Stale { .. } => true,
        };

        RequestAction::Fetch(FetchPlan {
            request,
            addr,
            stale,
            _guard: guard,
        })
    }

    /// Run a fetch: relay the origin response to `client` and commit it to
    /// the cache when the stream ends cleanly.
    ///
    /// Cache failures are logged and never affect the client response.
    pub async fn fetch<W>(
        &self,
        plan: FetchPlan,
        client: &mut W,
    ) -> Result<FetchOutcome, FetchFailure>
    where
        W: AsyncWrite + Unpin,
    {
        let url = plan.request.url.as_str();
        let mut payload = self.cache.begin(url).await;

        let result = stream_origin(&plan.request, plan.addr, self.origin, client, &mut payload).await;

        match &result {
            Ok(_) if payload.is_active() => {
                if let Err(e) = self.cache.commit(payload).await {
                    warn!(url, error = %e, "Failed to commit cache entry");
                }
            }
            _ => self.cache.abort(payload).await,
        }

        result
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Returns the number of entries in the blocklist.
    pub fn blocked_count(&self) -> usize {
        self.blocklist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http::status_code;
    use crate::resolver::HostCache;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pipeline(dir: &Path, blocklist: &str, hosts: &str, clock: Arc<ManualClock>) -> Pipeline {
        pipeline_with_origin(dir, blocklist, hosts, clock, OriginConfig::default())
    }

    fn pipeline_with_origin(
        dir: &Path,
        blocklist: &str,
        hosts: &str,
        clock: Arc<ManualClock>,
        origin: OriginConfig,
    ) -> Pipeline {
        let hosts_path = dir.join("ip_cache.txt");
        std::fs::write(&hosts_path, hosts).unwrap();
        Pipeline::new(
            Blocklist::from_lines(blocklist),
            Resolver::new(HostCache::load(hosts_path).unwrap(), clock.clone()),
            ContentCache::open(dir.join("cache"), Duration::from_secs(60), clock).unwrap(),
            origin,
        )
    }

    /// Origin that reads one request, answers with `response` and closes.
    async fn one_shot_origin(response: &'static [u8]) -> OriginConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream.write_all(response).await.unwrap();
        });
        OriginConfig {
            port,
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn bad_method_is_rejected_with_400() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), "", "", Arc::new(ManualClock::new(0)));

        let action = pipeline
            .process_request(b"POST http://x.com/ HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .await;

        match action {
            RequestAction::Rejected {
                response,
                keep_alive,
                error,
            } => {
                assert_eq!(status_code(&response), Some(400));
                assert!(keep_alive);
                assert!(matches!(error, ProxyError::Request(_)));
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn blocked_host_skips_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), "evil.example.com\n", "", Arc::new(ManualClock::new(0)));

        let action = pipeline
            .process_request(b"GET http://evil.example.com/path HTTP/1.1\r\n\r\n")
            .await;

        match action {
            RequestAction::Blocked { response, .. } => assert_eq!(status_code(&response), Some(403)),
            _ => panic!("expected block"),
        }
        assert!(pipeline.resolver().hosts().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_host_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), "", "", Arc::new(ManualClock::new(0)));

        let action = pipeline
            .process_request(b"GET http://nonexistent.invalid/ HTTP/1.0\r\n\r\n")
            .await;

        match action {
            RequestAction::Rejected {
                response,
                keep_alive,
                error,
            } => {
                assert_eq!(status_code(&response), Some(404));
                assert!(!keep_alive);
                assert!(matches!(error, ProxyError::Resolution { .. }));
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn miss_then_hit_then_stale() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let pipeline = pipeline(dir.path(), "", "origin.test\t127.0.0.1\t0\n", clock.clone());
        let raw: &[u8] = b"GET http://origin.test/ HTTP/1.1\r\n\r\n";

        match pipeline.process_request(raw).await {
            RequestAction::Fetch(plan) => {
                assert!(!plan.stale);
                assert_eq!(plan.addr, "127.0.0.1".parse::<IpAddr>().unwrap());
            }
            _ => panic!("expected fetch"),
        }

        pipeline.cache().store("http://origin.test/", b"body").await.unwrap();
        clock.set(30);
        match pipeline.process_request(raw).await {
            RequestAction::Cached { payload, .. } => assert_eq!(payload, b"body"),
            _ => panic!("expected cached"),
        }

        clock.set(90);
        match pipeline.process_request(raw).await {
            RequestAction::Fetch(plan) => assert!(plan.stale),
            _ => panic!("expected stale fetch"),
        }
    }

    #[tokio::test]
    async fn empty_origin_response_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let origin = one_shot_origin(b"").await;
        let pipeline = pipeline_with_origin(
            dir.path(),
            "",
            "origin.test\t127.0.0.1\t0\n",
            Arc::new(ManualClock::new(0)),
            origin,
        );
        let raw: &[u8] = b"GET http://origin.test/x HTTP/1.1\r\n\r\n";

        let RequestAction::Fetch(plan) = pipeline.process_request(raw).await else {
            panic!("expected fetch");
        };
        let mut client = Vec::new();
        let failure = pipeline.fetch(plan, &mut client).await.unwrap_err();

        assert_eq!(failure.response_status(), Some(Status::BadGateway));
        assert!(client.is_empty());
        assert!(matches!(
            pipeline.cache().lookup("http://origin.test/x").await,
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn cache_write_failure_still_serves_client() {
        let dir = tempfile::tempdir().unwrap();
        let body: &'static [u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let origin = one_shot_origin(body).await;
        let pipeline = pipeline_with_origin(
            dir.path(),
            "",
            "origin.test\t127.0.0.1\t0\n",
            Arc::new(ManualClock::new(0)),
            origin,
        );
        std::fs::remove_dir_all(dir.path().join("cache")).unwrap();
        let raw: &[u8] = b"GET http://origin.test/y HTTP/1.0\r\n\r\n";

        let RequestAction::Fetch(plan) = pipeline.process_request(raw).await else {
            panic!("expected fetch");
        };
        let mut client = Vec::new();
        let outcome = pipeline.fetch(plan, &mut client).await.unwrap();

        assert_eq!(client, body);
        assert_eq!(outcome.bytes, body.len() as u64);
        assert!(!matches!(
            pipeline.cache().lookup("http://origin.test/y").await,
            CacheLookup::Hit(_)
        ));
    }
}
