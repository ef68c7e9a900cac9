//! Hostname resolution with a persistent host store.
//!
//! Successful resolutions are appended to a text file and reused for the
//! lifetime of the store: a host resolved once is never looked up again.
//! Each record is one line, `host<TAB>ip<TAB>unix_secs`.

use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{ProxyError, Result, StoreError};

/// A persisted hostname resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub host: String,
    pub addr: IpAddr,
    pub discovered_at: u64,
}

impl ResolvedHost {
    fn to_line(&self) -> String {
        format!("{}\t{}\t{}\n", self.host, self.addr, self.discovered_at)
    }

    fn from_line(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let host = fields.next()?.trim();
        let addr = fields.next()?.trim().parse().ok()?;
        let discovered_at = fields.next()?.trim().parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            addr,
            discovered_at,
        })
    }
}

/// Append-only store of resolved hosts, indexed in memory by hostname.
pub struct HostCache {
    path: PathBuf,
    entries: RwLock<FxHashMap<String, ResolvedHost>>,
    /// Serializes appends so a host is written at most once.
    append: Mutex<()>,
}

impl HostCache {
    /// Load the store from `path`. A missing file is an empty store.
    ///
    /// Later records for the same host replace earlier ones; malformed
    /// lines are skipped.
    pub fn load(path: impl Into<PathBuf>) -> std::result::Result<Self, StoreError> {
        let path = path.into();
        let mut entries = FxHashMap::default();

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                for line in text.lines() {
                    match ResolvedHost::from_line(line) {
                        Some(record) => {
                            entries.insert(record.host.clone(), record);
                        }
                        None if line.trim().is_empty() => {}
                        None => debug!(path = %path.display(), line, "Skipping malformed host record"),
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::read(path, e)),
        }

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            append: Mutex::new(()),
        })
    }

    /// Look up the stored address for `host`.
    pub fn get(&self, host: &str) -> Option<IpAddr> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .map(|record| record.addr)
    }

    /// Record a resolution unless one already exists for the host.
    ///
    /// Returns the address that is now stored, which is the earlier one if
    /// a concurrent caller got there first. The in-memory entry is kept
    /// even when the file append fails.
    pub async fn insert(&self, record: ResolvedHost) -> (IpAddr, std::result::Result<(), StoreError>) {
        let _guard = self.append.lock().await;

        if let Some(existing) = self.get(&record.host) {
            return (existing, Ok(()));
        }

        let addr = record.addr;
        let written = self.append_line(&record.to_line()).await;
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.host.clone(), record);

        (addr, written)
    }

    async fn append_line(&self, line: &str) -> std::result::Result<(), StoreError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::write(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::write(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::write(&self.path, e))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How an address was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Served from the host store, no DNS query issued.
    Cached(IpAddr),
    /// Freshly resolved and recorded.
    Resolved(IpAddr),
}

impl Resolution {
    pub fn addr(self) -> IpAddr {
        match self {
            Resolution::Cached(addr) | Resolution::Resolved(addr) => addr,
        }
    }
}

/// Resolves hostnames, consulting the host store first.
pub struct Resolver {
    hosts: HostCache,
    clock: Arc<dyn Clock>,
}

impl Resolver {
    pub fn new(hosts: HostCache, clock: Arc<dyn Clock>) -> Self {
        Self { hosts, clock }
    }

    /// Resolve `host`, skipping DNS entirely on a store hit.
    pub async fn resolve(&self, host: &str) -> Result<Resolution> {
        if let Some(addr) = self.hosts.get(host) {
            return Ok(Resolution::Cached(addr));
        }

        let addr = lookup(host).await?;
        let (addr, written) = self
            .hosts
            .insert(ResolvedHost {
                host: host.to_string(),
                addr,
                discovered_at: self.clock.now(),
            })
            .await;
        if let Err(e) = written {
            warn!(host, error = %e, "Failed to persist host record");
        }

        Ok(Resolution::Resolved(addr))
    }

    pub fn hosts(&self) -> &HostCache {
        &self.hosts
    }
}

/// Query the system resolver, preferring an IPv4 address.
async fn lookup(host: &str) -> Result<IpAddr> {
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProxyError::Resolution {
            host: host.to_string(),
            message: e.to_string(),
        })?
        .map(|sa| sa.ip())
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProxyError::Resolution {
            host: host.to_string(),
            message: "no addresses returned".to_string(),
        })
}
