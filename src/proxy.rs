//! Proxy orchestration.
//!
//! Opens the on-disk stores, binds the listener and runs the proxy server.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::ContentCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError};
use crate::fetch::OriginConfig;
use crate::filter::Blocklist;
use crate::pipeline::Pipeline;
use crate::resolver::{HostCache, Resolver};
use crate::transport::MAX_REQUEST_SIZE;
use crate::transport::tcp::{ConnectionSettings, TcpTransport};

/// File name of the host store inside the data directory.
pub const HOST_STORE_FILE: &str = "ip_cache.txt";
/// Directory of the content cache inside the data directory.
pub const CACHE_DIR: &str = "cache";

/// Configuration for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 0.0.0.0:8080)
    pub bind_addr: SocketAddr,
    /// Maximum age of a cached response before it is refetched.
    pub ttl: Duration,
    /// Idle limit while waiting for a client's next request.
    pub keep_alive_timeout: Duration,
    /// Port used for every origin connection.
    pub origin_port: u16,
    /// Bound on origin connect and on each idle origin read.
    pub origin_timeout: Duration,
    /// Blocklist file, one host substring per line.
    pub blocklist_path: PathBuf,
    /// Directory holding the host store and the content cache.
    pub data_dir: PathBuf,
    pub max_request_size: usize,
    /// How often aggregate stats are logged.
    pub stats_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ttl: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(10),
            origin_port: 80,
            origin_timeout: Duration::from_secs(30),
            blocklist_path: PathBuf::from("blocked.txt"),
            data_dir: PathBuf::from("."),
            max_request_size: MAX_REQUEST_SIZE,
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// A bound, not yet serving, proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    pipeline: Arc<Pipeline>,
    transport: TcpTransport,
}

impl ProxyServer {
    /// Open stores and bind the listener using the system clock.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        Self::bind_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open stores and bind the listener with an explicit clock.
    pub async fn bind_with_clock(config: ProxyConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let blocklist = Blocklist::load(&config.blocklist_path)
            .map_err(|e| StoreError::read(&config.blocklist_path, e))?;
        let hosts = HostCache::load(config.data_dir.join(HOST_STORE_FILE))?;
        let cache = ContentCache::open(config.data_dir.join(CACHE_DIR), config.ttl, clock.clone())?;

        let origin = OriginConfig {
            port: config.origin_port,
            timeout: config.origin_timeout,
        };
        let pipeline = Arc::new(Pipeline::new(
            blocklist,
            Resolver::new(hosts, clock),
            cache,
            origin,
        ));
        let transport = TcpTransport::bind(config.bind_addr).await?;

        Ok(Self {
            config,
            pipeline,
            transport,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Start accepting connections and the periodic stats logger.
    ///
    /// Returns the accept loop's task handle.
    pub async fn start(self) -> JoinHandle<()> {
        let local_addr = self.local_addr().unwrap_or(self.config.bind_addr);
        let cached = self.pipeline.cache().len().await;
        info!(
            addr = %local_addr,
            ttl_secs = self.config.ttl.as_secs(),
            blocked = self.pipeline.blocked_count(),
            hosts = self.pipeline.resolver().hosts().len(),
            cached,
            "Proxy listening"
        );

        spawn_stats_logger(self.pipeline.clone(), self.config.stats_interval);

        let settings = ConnectionSettings {
            keep_alive_timeout: self.config.keep_alive_timeout,
            max_request_size: self.config.max_request_size,
        };
        self.transport.start(self.pipeline, settings)
    }
}

/// Log stats every `interval`.
fn spawn_stats_logger(pipeline: Arc<Pipeline>, interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = pipeline.stats().snapshot_and_reset();
            let cache = pipeline.cache().len().await;
            info!(
                cache,
                hosts = pipeline.resolver().hosts().len(),
                requests = stats.requests,
                fetched = stats.fetched,
                cached = stats.cached,
                blocked = stats.blocked,
                rejected = stats.rejected,
                failed = stats.failed,
                avg_response_ms = stats.avg_response_ms,
                "stats"
            );
        }
    });
}

/// Run the proxy with the given configuration.
///
/// Fails only at startup (stores, bind). Runs indefinitely.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let server = ProxyServer::bind(config).await?;
    let accept_loop = server.start().await;

    accept_loop.await.map_err(io::Error::other)?;

    Ok(())
}
