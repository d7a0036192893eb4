//! Bucket to region resolution
//!
//! One [`RegionResolver`] belongs to one client and is shared by reference
//! between all requests that client issues. It never performs network calls;
//! entries are created and overwritten by the executor from authoritative
//! responses (redirects and the `x-amz-bucket-region` header).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

/// Cached region of one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCacheEntry {
    pub bucket: String,
    pub region: String,
    pub last_verified_at: DateTime<Utc>,
}

/// Concurrent, last-write-wins cache of bucket regions
#[derive(Debug, Default)]
pub struct RegionResolver {
    entries: DashMap<String, RegionCacheEntry>,
}

impl RegionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached region for `bucket`, or `None` when unknown
    pub fn resolve(&self, bucket: &str) -> Option<String> {
        self.entries.get(bucket).map(|entry| entry.region.clone())
    }

    /// Full cache entry for `bucket`
    pub fn entry(&self, bucket: &str) -> Option<RegionCacheEntry> {
        self.entries.get(bucket).map(|entry| entry.clone())
    }

    /// Overwrite the region for `bucket`
    pub fn record(&self, bucket: &str, region: &str) {
        let entry = RegionCacheEntry {
            bucket: bucket.to_string(),
            region: region.to_string(),
            last_verified_at: Utc::now(),
        };
        match self.entries.insert(bucket.to_string(), entry) {
            Some(previous) if previous.region != region => {
                info!(
                    bucket,
                    from = %previous.region,
                    to = region,
                    "Bucket region changed"
                );
            }
            Some(_) => {}
            None => debug!(bucket, region, "Bucket region cached"),
        }
    }

    /// Forget `bucket`, e.g. after it was deleted
    pub fn invalidate(&self, bucket: &str) {
        if self.entries.remove(bucket).is_some() {
            debug!(bucket, "Bucket region invalidated");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unknown_bucket() {
        let resolver = RegionResolver::new();
        assert_eq!(resolver.resolve("photos"), None);
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_record_overwrites() {
        let resolver = RegionResolver::new();
        resolver.record("photos", "us-west-2");
        assert_eq!(resolver.resolve("photos").as_deref(), Some("us-west-2"));

        let first = resolver.entry("photos").unwrap();
        resolver.record("photos", "eu-central-1");
        let second = resolver.entry("photos").unwrap();
        assert_eq!(second.region, "eu-central-1");
        assert_eq!(second.bucket, "photos");
        assert!(second.last_verified_at >= first.last_verified_at);
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_invalidate() {
        let resolver = RegionResolver::new();
        resolver.record("photos", "us-west-2");
        resolver.invalidate("photos");
        assert_eq!(resolver.resolve("photos"), None);
        // invalidating an unknown bucket is harmless
        resolver.invalidate("photos");
    }

    #[test]
    fn test_instances_are_isolated() {
        let a = RegionResolver::new();
        let b = RegionResolver::new();
        a.record("photos", "us-west-2");
        assert_eq!(b.resolve("photos"), None);
    }

    #[tokio::test]
    async fn test_concurrent_records_last_write_wins() {
        let resolver = Arc::new(RegionResolver::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let resolver = Arc::clone(&resolver);
            handles.push(tokio::spawn(async move {
                let region = if i % 2 == 0 { "us-west-2" } else { "eu-west-1" };
                resolver.record("shared", region);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let region = resolver.resolve("shared").unwrap();
        assert!(region == "us-west-2" || region == "eu-west-1");
        assert_eq!(resolver.len(), 1);
    }
}
