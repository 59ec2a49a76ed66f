//! In-process record store
//!
//! Ordered map with the same scan semantics as the SQLite backend. Used for
//! tests and for dry runs against exported data.

use super::{literal_prefix, matches_pattern, next_cursor, parse_cursor, RecordStore, ScanPage};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Record store backed by an in-memory ordered map
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, StoredValue>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .read()
            .await
            .values()
            .filter(|v| v.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Live keys starting with `prefix`, in key order
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.records
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.is_live(now))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .records
            .read()
            .await
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.records.write().await.insert(key.to_string(), stored);
        Ok(())
    }

    async fn scan(&self, cursor: &str, pattern: &str, page_size: usize) -> Result<ScanPage> {
        let offset = parse_cursor(cursor)?;
        let page_size = page_size.max(1);
        let prefix = literal_prefix(pattern);
        let now = Instant::now();

        let records = self.records.read().await;
        let examined: Vec<&String> = records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.is_live(now))
            .skip(offset)
            .take(page_size)
            .map(|(k, _)| k)
            .collect();

        let keys = examined
            .iter()
            .filter(|k| matches_pattern(pattern, k))
            .map(|k| (*k).clone())
            .collect();

        Ok(ScanPage {
            next_cursor: next_cursor(offset, examined.len(), page_size),
            keys,
        })
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, v| v.is_live(now));
        Ok((before - records.len()) as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TERMINAL_CURSOR;

    async fn scan_all(store: &MemoryRecordStore, pattern: &str, page_size: usize) -> Vec<String> {
        let mut cursor = TERMINAL_CURSOR.to_string();
        let mut keys = Vec::new();
        loop {
            let page = store.scan(&cursor, pattern, page_size).await.unwrap();
            keys.extend(page.keys.iter().cloned());
            if page.is_terminal() {
                break;
            }
            cursor = page.next_cursor;
        }
        keys
    }

    #[tokio::test]
    async fn test_get_set_roundtrip() {
        let store = MemoryRecordStore::new();
        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_keys_read_as_absent() {
        let store = MemoryRecordStore::new();
        store
            .set("short", "x", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_scan_pages_cover_all_matching_keys() {
        let store = MemoryRecordStore::new();
        for i in 0..25 {
            store.set(&format!("visit:{:03}", i), "{}", None).await.unwrap();
        }
        store.set("conversion:1", "{}", None).await.unwrap();

        let keys = scan_all(&store, "visit:*", 7).await;
        assert_eq!(keys.len(), 25);
        assert_eq!(keys[0], "visit:000");
        assert_eq!(keys[24], "visit:024");
    }

    #[tokio::test]
    async fn test_scan_pages_may_be_partial() {
        let store = MemoryRecordStore::new();
        store.set("visit:1:a", "{}", None).await.unwrap();
        store.set("visit:1:b", "{}", None).await.unwrap();
        store.set("visit:2:a", "{}", None).await.unwrap();

        let page = store.scan("0", "visit:*:a", 2).await.unwrap();
        assert_eq!(page.keys, vec!["visit:1:a".to_string()]);
        assert!(!page.is_terminal());

        let page = store.scan(&page.next_cursor, "visit:*:a", 2).await.unwrap();
        assert_eq!(page.keys, vec!["visit:2:a".to_string()]);
        assert!(page.is_terminal());
    }

    #[tokio::test]
    async fn test_invalid_cursor_is_rejected() {
        let store = MemoryRecordStore::new();
        assert!(store.scan("not-a-number", "*", 10).await.is_err());
    }
}
