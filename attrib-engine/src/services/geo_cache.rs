//! Cache-aware geolocation
//!
//! Lookup order: in-process memo for this run, then the persistent
//! `geo:{ip}` cache, then the external provider if the run still has call
//! allowance. Provider failures are cached as a distinct failure sentinel
//! with a short expiry so a flaky address is not retried on every
//! conversion. Running out of allowance is not a provider failure and is
//! never persisted.

use crate::context::RunContext;
use crate::models::{GeoCacheEntry, GeoLookup};
use crate::services::geo_client::{GeoError, GeoProvider};
use crate::signals::geo_cache_key;
use attrib_common::store::RecordStore;
use std::sync::Arc;
use std::time::Duration;

pub struct GeoLookupCache {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn GeoProvider>,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl GeoLookupCache {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn GeoProvider>,
        success_ttl: Duration,
        failure_ttl: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            success_ttl,
            failure_ttl,
        }
    }

    pub async fn lookup(&self, ctx: &RunContext, ip: &str) -> GeoLookup {
        if let Some(memo) = ctx.memo_get(ip) {
            return memo;
        }

        let key = geo_cache_key(ip);
        match self.store.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<GeoCacheEntry>(&json) {
                Ok(entry) => {
                    let lookup = entry.into_lookup();
                    ctx.memo_put(ip, lookup.clone());
                    return lookup;
                }
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Ignoring unreadable geo cache entry");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Geo cache read failed, treating as miss");
            }
        }

        if !ctx.try_acquire_geo_call() {
            tracing::debug!(ip = %ip, "Geo call allowance exhausted for this run");
            ctx.memo_put(ip, GeoLookup::Failed);
            return GeoLookup::Failed;
        }

        let (lookup, entry, ttl) = match self.provider.geolocate(ip).await {
            Ok(info) => (
                GeoLookup::Found(info.clone()),
                Some(GeoCacheEntry::found(info)),
                self.success_ttl,
            ),
            // Configuration problem, not a property of the address
            Err(GeoError::MissingToken) => (GeoLookup::Failed, None, self.failure_ttl),
            Err(e) => {
                tracing::warn!(
                    ip = %ip,
                    provider = self.provider.name(),
                    error = %e,
                    "Geolocation failed"
                );
                (GeoLookup::Failed, Some(GeoCacheEntry::failed()), self.failure_ttl)
            }
        };

        if let Some(entry) = entry {
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    if let Err(e) = self.store.set(&key, &json, Some(ttl)).await {
                        tracing::warn!(key = %key, error = %e, "Failed to persist geo cache entry");
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to encode geo cache entry")
                }
            }
        }

        ctx.memo_put(ip, lookup.clone());
        lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeoInfo;
    use async_trait::async_trait;
    use attrib_common::store::MemoryRecordStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl GeoProvider for CountingProvider {
        async fn geolocate(&self, _ip: &str) -> Result<GeoInfo, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(GeoError::Timeout)
            } else {
                Ok(GeoInfo {
                    city: Some("Austin".into()),
                    isp: Some("Comcast".into()),
                    ..Default::default()
                })
            }
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn cache(store: Arc<MemoryRecordStore>, fail: bool) -> (GeoLookupCache, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            fail,
        });
        let cache = GeoLookupCache::new(
            store,
            provider.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        (cache, provider)
    }

    #[tokio::test]
    async fn test_success_is_memoized_and_persisted() {
        let store = Arc::new(MemoryRecordStore::new());
        let (cache, provider) = cache(store.clone(), false);
        let ctx = RunContext::unbounded();

        assert!(matches!(cache.lookup(&ctx, "198.51.100.7").await, GeoLookup::Found(_)));
        assert!(matches!(cache.lookup(&ctx, "198.51.100.7").await, GeoLookup::Found(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // A new run reads the persisted entry instead of calling out
        let next_run = RunContext::unbounded();
        assert!(matches!(cache.lookup(&next_run, "198.51.100.7").await, GeoLookup::Found(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_sentinel_is_cached() {
        let store = Arc::new(MemoryRecordStore::new());
        let (cache, provider) = cache(store.clone(), true);

        assert_eq!(cache.lookup(&RunContext::unbounded(), "2001:db8::1").await, GeoLookup::Failed);
        assert_eq!(cache.lookup(&RunContext::unbounded(), "2001:db8::1").await, GeoLookup::Failed);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let stored: GeoCacheEntry =
            serde_json::from_str(&store.get("geo:2001_db8__1").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.into_lookup(), GeoLookup::Failed);
    }

    #[tokio::test]
    async fn test_exhausted_allowance_is_not_persisted() {
        let store = Arc::new(MemoryRecordStore::new());
        let (cache, provider) = cache(store.clone(), false);
        let ctx = RunContext::new(None, 0);

        assert_eq!(cache.lookup(&ctx, "198.51.100.7").await, GeoLookup::Failed);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(store.get("geo:198.51.100.7").await.unwrap().is_none());
    }
}
