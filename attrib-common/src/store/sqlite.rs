//! SQLite-backed record store
//!
//! A single `records` table holding key, value, and an optional expiry in
//! epoch milliseconds. Expired rows are invisible to reads and scans and are
//! physically removed by [`RecordStore::purge_expired`].

use super::{
    literal_prefix, matches_pattern, next_cursor, parse_cursor, retry_transient, RecordStore,
    ScanPage,
};
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Record store backed by a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteRecordStore {
    /// Open (creating if missing) the database at `database_url`
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        max_lock_wait_ms: u64,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(max_lock_wait_ms.min(1000)));

        // Every connection to ":memory:" is a separate database
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        tracing::info!(
            url = %database_url,
            max_connections,
            "Record store connection established"
        );

        Self::from_pool(pool, max_lock_wait_ms).await
    }

    /// Wrap an existing pool, creating the schema if needed
    pub async fn from_pool(pool: SqlitePool, max_lock_wait_ms: u64) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                expires_at INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            max_lock_wait_ms,
        })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = now_millis();
        retry_transient("get", self.max_lock_wait_ms, || {
            let pool = self.pool.clone();
            let key = key.to_string();
            async move {
                let value: Option<String> = sqlx::query_scalar(
                    "SELECT value FROM records WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
                )
                .bind(key)
                .bind(now)
                .fetch_optional(&pool)
                .await?;
                Ok::<_, Error>(value)
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = now_millis();
        let expires_at = ttl.map(|ttl| now + ttl.as_millis() as i64);

        retry_transient("set", self.max_lock_wait_ms, || {
            let pool = self.pool.clone();
            let key = key.to_string();
            let value = value.to_string();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO records (key, value, expires_at, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        expires_at = excluded.expires_at,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(expires_at)
                .bind(now)
                .execute(&pool)
                .await?;
                Ok::<_, Error>(())
            }
        })
        .await
    }

    async fn scan(&self, cursor: &str, pattern: &str, page_size: usize) -> Result<ScanPage> {
        let offset = parse_cursor(cursor)?;
        let page_size = page_size.max(1);
        // Literal prefix never contains GLOB metacharacters
        let prefix_glob = format!("{}*", literal_prefix(pattern));
        let now = now_millis();

        let examined: Vec<String> = retry_transient("scan", self.max_lock_wait_ms, || {
            let pool = self.pool.clone();
            let prefix_glob = prefix_glob.clone();
            async move {
                let keys: Vec<String> = sqlx::query_scalar(
                    r#"
                    SELECT key FROM records
                    WHERE key GLOB ? AND (expires_at IS NULL OR expires_at > ?)
                    ORDER BY key
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(prefix_glob)
                .bind(now)
                .bind(page_size as i64)
                .bind(offset as i64)
                .fetch_all(&pool)
                .await?;
                Ok::<_, Error>(keys)
            }
        })
        .await?;

        let next_cursor = next_cursor(offset, examined.len(), page_size);
        let keys = examined
            .into_iter()
            .filter(|k| matches_pattern(pattern, k))
            .collect();

        Ok(ScanPage { next_cursor, keys })
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = now_millis();
        let pool = self.pool.clone();
        let removed = retry_transient("purge_expired", self.max_lock_wait_ms, || {
            let pool = pool.clone();
            async move {
                let result = sqlx::query(
                    "DELETE FROM records WHERE expires_at IS NOT NULL AND expires_at <= ?",
                )
                .bind(now)
                .execute(&pool)
                .await?;
                Ok::<_, Error>(result.rows_affected())
            }
        })
        .await?;

        if removed > 0 {
            tracing::info!(removed, "Purged expired records");
        }
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteRecordStore {
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("records.db").display());
        SqliteRecordStore::connect(&url, 4, 2000).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_set_replace() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.set("idx:ip:203.0.113.5", "v1", None).await.unwrap();
        store.set("idx:ip:203.0.113.5", "v2", None).await.unwrap();

        assert_eq!(
            store.get("idx:ip:203.0.113.5").await.unwrap().as_deref(),
            Some("v2")
        );
        assert_eq!(store.get("idx:ip:missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_rows_are_hidden_and_purged() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .set("geo:1.2.3.4", "{}", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        store.set("geo:5.6.7.8", "{}", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.get("geo:1.2.3.4").await.unwrap(), None);
        let page = store.scan("0", "geo:*", 10).await.unwrap();
        assert_eq!(page.keys, vec!["geo:5.6.7.8".to_string()]);

        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_pages_until_terminal() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        for i in 0..12 {
            store.set(&format!("visit:{:02}", i), "{}", None).await.unwrap();
        }
        store.set("pageview:1", "{}", None).await.unwrap();

        let mut cursor = "0".to_string();
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = store.scan(&cursor, "visit:*", 5).await.unwrap();
            pages += 1;
            seen.extend(page.keys.clone());
            if page.is_terminal() {
                break;
            }
            cursor = page.next_cursor;
        }

        assert_eq!(seen.len(), 12);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn test_memory_url_uses_single_connection() {
        let store = SqliteRecordStore::connect("sqlite::memory:", 8, 1000)
            .await
            .unwrap();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
