use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::models::StreamDescriptor;

/// Process-wide map from a normalized query/URL to its resolved stream.
///
/// The cache is advisory: every failure (unreadable file, corrupt JSON, failed
/// write) degrades to a miss and is only logged.
pub struct StreamCache {
    ttl: Duration,
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, CachedStream>>,
    write_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CachedStream {
    descriptor: StreamDescriptor,
    resolved_at: SystemTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

/// URLs are case sensitive (video ids), free-text queries are not.
pub fn normalize_key(key: &str) -> String {
    let key = key.trim();

    if key.starts_with("http://") || key.starts_with("https://") {
        key.to_string()
    } else {
        key.to_lowercase()
    }
}

impl StreamCache {
    pub fn in_memory(ttl: Duration) -> Self {
        StreamCache {
            ttl,
            path: None,
            entries: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Opens a cache persisted at `path`. A missing or corrupt file yields an empty cache.
    pub async fn open(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        let path = path.into();
        let mut cache = Self::in_memory(ttl);

        let entries = read_entries(&path).await;
        let now = SystemTime::now();
        let fresh: HashMap<String, CachedStream> = entries
            .into_iter()
            .filter(|(_, entry)| age(entry, now) <= ttl)
            .collect();

        info!("Stream cache loaded {} entries from {}", fresh.len(), path.display());

        cache.entries = RwLock::new(fresh);
        cache.path = Some(path);
        cache
    }

    pub async fn lookup(&self, key: &str) -> Option<StreamDescriptor> {
        self.lookup_at(key, SystemTime::now()).await
    }

    async fn lookup_at(&self, key: &str, now: SystemTime) -> Option<StreamDescriptor> {
        let key = normalize_key(key);

        let stale_at = {
            let entries = self.entries.read().await;

            match entries.get(&key) {
                Some(entry) if age(entry, now) <= self.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Stream cache hit for {key}");
                    return Some(entry.descriptor.clone());
                }
                Some(entry) => Some(entry.resolved_at),
                None => None,
            }
        };

        if let Some(resolved_at) = stale_at {
            let mut entries = self.entries.write().await;
            // A concurrent store may have refreshed the entry in the meantime.
            if entries.get(&key).map(|entry| entry.resolved_at) == Some(resolved_at) {
                entries.remove(&key);
                debug!("Evicted stale stream cache entry {key}");
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn store(&self, key: &str, descriptor: StreamDescriptor) {
        let entry = CachedStream {
            descriptor,
            resolved_at: SystemTime::now(),
        };

        self.entries.write().await.insert(normalize_key(key), entry);

        self.flush().await;
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.read().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Writes the current entries to disk, if persistence is enabled.
    pub async fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let _guard = self.write_lock.lock().await;

        let snapshot = {
            let entries = self.entries.read().await;
            serde_json::to_vec(&*entries)
        };

        let bytes = match snapshot {
            Ok(bytes) => bytes,
            Err(why) => {
                warn!("Could not serialize stream cache: {why:?}");
                return;
            }
        };

        let tmp_path = path.with_extension("tmp");

        if let Err(why) = tokio::fs::write(&tmp_path, &bytes).await {
            warn!("Could not write stream cache to {}: {why:?}", tmp_path.display());
            return;
        }

        if let Err(why) = tokio::fs::rename(&tmp_path, path).await {
            warn!("Could not replace stream cache at {}: {why:?}", path.display());
        }
    }
}

async fn read_entries(path: &Path) -> HashMap<String, CachedStream> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(why) => {
            debug!("No stream cache at {}: {why}", path.display());
            return HashMap::new();
        }
    };

    serde_json::from_slice(&bytes).unwrap_or_else(|why| {
        warn!("Ignoring corrupt stream cache at {}: {why}", path.display());
        HashMap::new()
    })
}

fn age(entry: &CachedStream, now: SystemTime) -> Duration {
    now.duration_since(entry.resolved_at).unwrap_or(Duration::ZERO)
}
