//! Read access to built index entries

use crate::error::{EngineError, EngineResult};
use crate::models::{IndexEntry, SignalKind, VisitSummary};
use crate::signals::{index_key, normalize_signal};
use attrib_common::store::RecordStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct IndexReader {
    store: Arc<dyn RecordStore>,
}

impl IndexReader {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, key: &str) -> EngineResult<Option<IndexEntry>> {
        let Some(json) = self.store.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| EngineError::malformed(key, e))
    }

    /// Load for matching: failures are logged and read as "no entry"
    pub async fn load_lenient(&self, key: &str) -> Option<IndexEntry> {
        match self.load(key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Index lookup failed, treating as no match");
                None
            }
        }
    }

    /// Entry for a raw (unnormalized) signal value
    pub async fn lookup(
        &self,
        kind: SignalKind,
        raw_value: &str,
    ) -> EngineResult<Option<IndexEntry>> {
        let value = normalize_signal(kind, raw_value).ok_or_else(|| {
            EngineError::InvalidInput(format!("empty or invalid {} value: {:?}", kind, raw_value))
        })?;
        self.load(&index_key(kind, &value)).await
    }

    /// Up to `limit` most recent visits sharing a signal value
    pub async fn query(
        &self,
        kind: SignalKind,
        raw_value: &str,
        limit: usize,
    ) -> EngineResult<Vec<VisitSummary>> {
        let entry = self.lookup(kind, raw_value).await?;
        Ok(entry
            .map(|entry| entry.visits.into_iter().take(limit).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrib_common::store::MemoryRecordStore;

    #[tokio::test]
    async fn test_missing_and_malformed_entries() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set("idx:ip:198.51.100.9", "{broken", None).await.unwrap();
        let reader = IndexReader::new(store);

        assert!(reader.query(SignalKind::Ip, "198.51.100.7", 10).await.unwrap().is_empty());
        assert!(matches!(
            reader.lookup(SignalKind::Ip, "198.51.100.9").await,
            Err(EngineError::Malformed { .. })
        ));
        assert!(reader.load_lenient("idx:ip:198.51.100.9").await.is_none());
        assert!(matches!(
            reader.lookup(SignalKind::Ip, "not-an-ip").await,
            Err(EngineError::InvalidInput(_))
        ));
    }
}
