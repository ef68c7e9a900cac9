//! Response cache with TTL-based freshness.
//!
//! Two stores live under the cache directory:
//!
//! - `index`: the freshness index, URL -> unix seconds of the last fetch.
//!   Held in memory and persisted as a snapshot of length-prefixed records
//!   (`u32` BE URL length, URL bytes, `u64` BE timestamp), rewritten
//!   through a temp file on every commit.
//! - payload files named by the 64-bit hash of the URL. Re-fetching a URL
//!   overwrites its payload; two URLs with the same hash share one file.
//!
//! Payloads are streamed into a `.part` file and renamed into place on
//! commit, so readers never see a partial body.

use std::hash::Hasher;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHasher};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StoreError;

const INDEX_FILE: &str = "index";
const INDEX_TMP_FILE: &str = "index.tmp";

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup {
    /// No entry for the URL.
    Miss,
    /// Fresh entry, payload bytes to serve verbatim.
    Hit(Vec<u8>),
    /// Entry older than the TTL; must be refreshed before serving.
    Stale { fetched_at: u64 },
}

/// Exclusive right to refresh one URL. Held from lookup through commit.
pub type RefreshGuard = OwnedMutexGuard<()>;

/// Payload name for a URL: hex of its 64-bit hash.
pub fn payload_key(url: &str) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(url.as_bytes());
    format!("{:016x}", hasher.finish())
}

/// TTL-based content cache backed by the filesystem.
pub struct ContentCache {
    dir: PathBuf,
    ttl_secs: u64,
    clock: Arc<dyn Clock>,
    /// Freshness index. The lock also serializes snapshot writes.
    index: Mutex<FxHashMap<String, u64>>,
    refreshing: std::sync::Mutex<FxHashMap<String, Weak<Mutex<()>>>>,
    part_seq: AtomicU64,
}

impl ContentCache {
    /// Open the cache in `dir`, creating it if needed and loading the index.
    pub fn open(
        dir: impl Into<PathBuf>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::write(&dir, e))?;

        let index_path = dir.join(INDEX_FILE);
        let index = match std::fs::read(&index_path) {
            Ok(data) => decode_index(&data, &index_path),
            Err(e) if e.kind() == ErrorKind::NotFound => FxHashMap::default(),
            Err(e) => return Err(StoreError::read(index_path, e)),
        };

        sweep_parts(&dir);

        Ok(Self {
            dir,
            ttl_secs: ttl.as_secs(),
            clock,
            index: Mutex::new(index),
            refreshing: std::sync::Mutex::new(FxHashMap::default()),
            part_seq: AtomicU64::new(0),
        })
    }

    fn payload_path(&self, url: &str) -> PathBuf {
        self.dir.join(payload_key(url))
    }

    /// Age strictly greater than the TTL is stale.
    fn is_stale(&self, fetched_at: u64, now: u64) -> bool {
        now.saturating_sub(fetched_at) > self.ttl_secs
    }

    /// Look up a URL.
    ///
    /// A fresh entry whose payload cannot be read is reported as a miss.
    pub async fn lookup(&self, url: &str) -> CacheLookup {
        let Some(fetched_at) = self.fetched_at(url).await else {
            return CacheLookup::Miss;
        };

        if self.is_stale(fetched_at, self.clock.now()) {
            return CacheLookup::Stale { fetched_at };
        }

        let path = self.payload_path(url);
        match tokio::fs::read(&path).await {
            Ok(payload) => CacheLookup::Hit(payload),
            Err(e) => {
                warn!(url, path = %path.display(), error = %e, "Cached payload unreadable, refetching");
                CacheLookup::Miss
            }
        }
    }

    /// Timestamp of the last fetch of `url`, if any.
    pub async fn fetched_at(&self, url: &str) -> Option<u64> {
        self.index.lock().await.get(url).copied()
    }

    /// Acquire the refresh lock for `url`.
    ///
    /// Only one task refreshes a URL at a time; later callers wait here and
    /// should look the URL up again once they hold the guard.
    pub async fn refresh_guard(&self, url: &str) -> RefreshGuard {
        let lock = {
            let mut refreshing = self.refreshing.lock().unwrap_or_else(|e| e.into_inner());
            match refreshing.get(url).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    refreshing.retain(|_, lock| lock.strong_count() > 0);
                    let lock = Arc::new(Mutex::new(()));
                    refreshing.insert(url.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Start writing a new payload for `url`.
    ///
    /// Never fails: if the part file cannot be created the writer is
    /// inactive and silently drops chunks.
    pub async fn begin(&self, url: &str) -> PayloadWriter {
        let key = payload_key(url);
        let seq = self.part_seq.fetch_add(1, Ordering::Relaxed);
        let part_path = self.dir.join(format!("{key}.{seq}.part"));

        let file = match tokio::fs::File::create(&part_path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(url, path = %part_path.display(), error = %e, "Failed to create cache payload");
                None
            }
        };

        PayloadWriter {
            url: url.to_string(),
            part_path,
            final_path: self.dir.join(key),
            file,
            len: 0,
        }
    }

    /// Publish a completed payload and stamp the URL as fetched now.
    pub async fn commit(&self, mut writer: PayloadWriter) -> Result<u64, StoreError> {
        let Some(mut file) = writer.file.take() else {
            remove_quietly(&writer.part_path).await;
            return Err(StoreError::write(
                &writer.part_path,
                std::io::Error::other("payload write was abandoned"),
            ));
        };
        if let Err(e) = file.flush().await {
            remove_quietly(&writer.part_path).await;
            return Err(StoreError::write(&writer.part_path, e));
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&writer.part_path, &writer.final_path).await {
            remove_quietly(&writer.part_path).await;
            return Err(StoreError::write(&writer.final_path, e));
        }

        let now = self.clock.now();
        let mut index = self.index.lock().await;
        index.insert(std::mem::take(&mut writer.url), now);
        self.persist_index(&index).await?;

        debug!(path = %writer.final_path.display(), bytes = writer.len, "Cached payload");
        Ok(now)
    }

    /// Discard a partially written payload.
    pub async fn abort(&self, mut writer: PayloadWriter) {
        writer.file = None;
        remove_quietly(&writer.part_path).await;
    }

    /// Store a complete payload in one step.
    pub async fn store(&self, url: &str, payload: &[u8]) -> Result<u64, StoreError> {
        let mut writer = self.begin(url).await;
        writer.write_chunk(payload).await;
        self.commit(writer).await
    }

    async fn persist_index(&self, index: &FxHashMap<String, u64>) -> Result<(), StoreError> {
        let tmp_path = self.dir.join(INDEX_TMP_FILE);
        let index_path = self.dir.join(INDEX_FILE);

        tokio::fs::write(&tmp_path, encode_index(index))
            .await
            .map_err(|e| StoreError::write(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &index_path)
            .await
            .map_err(|e| StoreError::write(&index_path, e))
    }

    /// Number of URLs in the freshness index.
    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// An in-progress payload, appended to chunk by chunk.
pub struct PayloadWriter {
    url: String,
    part_path: PathBuf,
    final_path: PathBuf,
    file: Option<tokio::fs::File>,
    len: u64,
}

impl PayloadWriter {
    /// Append a chunk. The first failure abandons the payload.
    pub async fn write_chunk(&mut self, chunk: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        match file.write_all(chunk).await {
            Ok(()) => self.len += chunk.len() as u64,
            Err(e) => {
                warn!(url = %self.url, error = %e, "Cache write failed, payload abandoned");
                self.file = None;
            }
        }
    }

    /// Whether chunks are still being recorded.
    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Remove `.part` files left behind by an interrupted run.
fn sweep_parts(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "part") {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed stale cache part"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale cache part"),
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to remove partial payload");
        }
    }
}

fn encode_index(index: &FxHashMap<String, u64>) -> Vec<u8> {
    let mut data = Vec::with_capacity(index.len() * 64);
    for (url, fetched_at) in index {
        data.extend_from_slice(&(url.len() as u32).to_be_bytes());
        data.extend_from_slice(url.as_bytes());
        data.extend_from_slice(&fetched_at.to_be_bytes());
    }
    data
}

/// Decode index records, stopping at the first truncated or invalid one.
fn decode_index(data: &[u8], path: &Path) -> FxHashMap<String, u64> {
    let mut index = FxHashMap::default();
    let mut pos = 0;

    while pos < data.len() {
        let Some(record) = decode_record(&data[pos..]) else {
            warn!(
                path = %path.display(),
                offset = pos,
                "Ignoring truncated freshness index tail"
            );
            break;
        };
        let (url, fetched_at, used) = record;
        index.insert(url, fetched_at);
        pos += used;
    }

    index
}

fn decode_record(data: &[u8]) -> Option<(String, u64, usize)> {
    let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let url_len = u32::from_be_bytes(len_bytes) as usize;
    let url = data.get(4..4 + url_len)?;
    let ts_bytes: [u8; 8] = data.get(4 + url_len..12 + url_len)?.try_into().ok()?;
    let url = String::from_utf8(url.to_vec()).ok()?;

    Some((url, u64::from_be_bytes(ts_bytes), 12 + url_len))
}
