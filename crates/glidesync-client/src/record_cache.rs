//! Persistent record cache
//!
//! Query results can optionally be cached between runs. The cache is an
//! opaque key/value store with an mtime per key; the staleness protocol
//! (comparing modification counts against the remote) lives in the
//! gateway, not here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glidesync_core::{GlideError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Parse a human TTL such as "1s" or "3d".
pub fn parse_ttl(ttl: &str) -> Result<Duration> {
    humantime::parse_duration(ttl)
        .map_err(|e| GlideError::Configuration(format!("invalid TTL {ttl:?}: {e}")))
}

/// Opaque key/value store for cached query results.
#[async_trait]
pub trait RecordCache: Send + Sync {
    /// Fetch a value no older than `ttl`, or nothing.
    async fn get(&self, key: &str, ttl: Duration) -> Option<serde_json::Value>;

    /// Store a value under `key`, replacing whole.
    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    /// Wall-clock time the key was last written.
    async fn mtime(&self, key: &str) -> Option<DateTime<Utc>>;
}

/// One JSON file per key under a directory.
pub struct DiskRecordCache {
    dir: PathBuf,
}

impl DiskRecordCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are arbitrary query strings; hash them into safe names.
        self.dir.join(format!("{:x}.json", md5::compute(key)))
    }
}

#[async_trait]
impl RecordCache for DiskRecordCache {
    async fn get(&self, key: &str, ttl: Duration) -> Option<serde_json::Value> {
        let path = self.path_for(key);
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        let modified = metadata.modified().ok()?;
        let age = modified.elapsed().unwrap_or_default();
        if age > ttl {
            tracing::debug!(key = %key, age_secs = age.as_secs(), "record cache entry expired");
            return None;
        }
        let content = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(value) => {
                tracing::debug!(key = %key, "record cache hit");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "discarding unreadable cache entry");
                None
            }
        }
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let content = serde_json::to_vec(value)?;
        tokio::fs::write(&path, content).await?;
        tracing::debug!(key = %key, path = ?path, "record cache written");
        Ok(())
    }

    async fn mtime(&self, key: &str) -> Option<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(self.path_for(key)).await.ok()?;
        let modified = metadata.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ttl() {
        assert_eq!(parse_ttl("1s").expect("1s"), Duration::from_secs(1));
        assert_eq!(parse_ttl("3d").expect("3d"), Duration::from_secs(3 * 86_400));
        assert!(parse_ttl("later").is_err());
    }

    #[tokio::test]
    async fn test_disk_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskRecordCache::new(dir.path());

        let value = serde_json::json!([{"u_name": "db01"}]);
        cache.put("u_dm_host?q", &value).await.expect("put");

        let loaded = cache
            .get("u_dm_host?q", Duration::from_secs(60))
            .await
            .expect("hit");
        assert_eq!(loaded, value);
        assert!(cache.mtime("u_dm_host?q").await.is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskRecordCache::new(dir.path());

        cache
            .put("key", &serde_json::json!({"cached": true}))
            .await
            .expect("put");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("key", Duration::from_millis(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskRecordCache::new(dir.path());
        assert!(cache.get("absent", Duration::from_secs(60)).await.is_none());
        assert!(cache.mtime("absent").await.is_none());
    }
}
