//! Content-addressed result cache.
//!
//! Lookups go to an in-process [`DashMap`] first and fall back to the durable
//! store. An entry is only honored while its artifact file exists and it is
//! younger than the configured TTL; anything else is evicted and reported as a
//! miss.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::request::Fingerprint;
use crate::storage::{CacheEntry, Storage};

/// Counters since this cache was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ContentCache<S: Storage> {
    storage: Arc<S>,
    memory: DashMap<Fingerprint, CacheEntry>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<S: Storage> ContentCache<S> {
    pub fn new(storage: Arc<S>, config: &CacheConfig) -> Self {
        Self {
            storage,
            memory: DashMap::new(),
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Path of a valid cached artifact for `fingerprint`, if any.
    ///
    /// Stale entries (missing file, expired) are evicted here and never surface
    /// as errors.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<PathBuf>> {
        let cached = self.memory.get(fingerprint).map(|e| e.value().clone());
        let entry = match cached {
            Some(entry) => Some(entry),
            None => self.storage.get_cache_entry(fingerprint).await?,
        };

        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if self.is_expired(&entry) {
            tracing::debug!(fingerprint = %fingerprint, "Cache entry expired");
            self.evict(fingerprint).await?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let path = PathBuf::from(&entry.artifact_path);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let err = Error::CacheCorruption {
                fingerprint: fingerprint.clone(),
                path: entry.artifact_path.clone(),
            };
            tracing::warn!(fingerprint = %fingerprint, error = %err, "Evicting stale cache entry");
            self.evict(fingerprint).await?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let now = Utc::now();
        self.storage.touch_cache_entry(fingerprint, now).await?;
        let mut entry = entry;
        entry.use_count += 1;
        entry.last_used_at = now;
        self.memory.insert(fingerprint.clone(), entry);
        self.hits.fetch_add(1, Ordering::Relaxed);

        Ok(Some(path))
    }

    /// Record a freshly generated artifact. Storing the same fingerprint twice
    /// keeps the first path and bumps the use count.
    pub async fn store(&self, fingerprint: &Fingerprint, artifact_path: &Path) -> Result<CacheEntry> {
        let size_bytes = tokio::fs::metadata(artifact_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let now = Utc::now();

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            artifact_path: artifact_path.to_string_lossy().into_owned(),
            created_at: now,
            size_bytes,
            use_count: 1,
            last_used_at: now,
        };

        let stored = self.storage.put_cache_entry(&entry).await?;
        self.memory.insert(fingerprint.clone(), stored.clone());
        tracing::debug!(
            fingerprint = %fingerprint,
            path = %stored.artifact_path,
            use_count = stored.use_count,
            "Cached artifact"
        );
        Ok(stored)
    }

    /// Drop an entry from both tiers. The artifact file is left alone.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let in_memory = self.memory.remove(fingerprint).is_some();
        let durable = self.storage.delete_cache_entry(fingerprint).await?;
        Ok(in_memory || durable)
    }

    /// Remove entries older than `max_age` (or the TTL when `None`) and entries
    /// whose file no longer exists. Returns the number removed.
    pub async fn sweep(&self, max_age: Option<Duration>) -> Result<usize> {
        let max_age = max_age.or(self.ttl);
        let now = Utc::now();
        let mut removed = 0;

        for entry in self.storage.list_cache_entries().await? {
            let too_old = max_age.is_some_and(|age| {
                chrono::Duration::from_std(age)
                    .map(|age| now - entry.created_at > age)
                    .unwrap_or(false)
            });
            let missing = !tokio::fs::try_exists(&entry.artifact_path)
                .await
                .unwrap_or(false);

            if too_old || missing {
                self.evict(&entry.fingerprint).await?;
                removed += 1;
            }
        }

        tracing::info!(removed, "Cache sweep finished");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => Utc::now() - entry.created_at > ttl,
            Err(_) => false,
        }
    }

    async fn evict(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.memory.remove(fingerprint);
        self.storage.delete_cache_entry(fingerprint).await?;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
