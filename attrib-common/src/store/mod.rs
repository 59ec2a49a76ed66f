//! Record Store Adapter
//!
//! The only persistence primitive the engine uses: a schema-less key-value
//! store with `get`, `set` with optional expiry, and cursor-based `scan` by
//! glob pattern. Values are opaque UTF-8 strings (JSON in practice).
//!
//! Scan contract:
//! - A scan starts from cursor `"0"` and is finished when the returned cursor
//!   is `"0"` again.
//! - `page_size` bounds how many keys are *examined* per call, not how many
//!   are returned, so a page may contain fewer keys than requested (or none)
//!   while the cursor is still non-terminal.
//! - Keys written during a scan may or may not be observed.

mod memory;
mod pattern;
mod retry;
#[cfg(feature = "sqlx")]
mod sqlite;

pub use memory::MemoryRecordStore;
pub use pattern::{literal_prefix, matches_pattern};
pub use retry::retry_transient;
#[cfg(feature = "sqlx")]
pub use sqlite::SqliteRecordStore;

use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Cursor value that both starts and terminates a scan
pub const TERMINAL_CURSOR: &str = "0";

/// One page of a cursor scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor to pass to the next call; `"0"` when the scan is complete
    pub next_cursor: String,
    /// Keys matching the pattern among those examined
    pub keys: Vec<String>,
}

impl ScanPage {
    pub fn is_terminal(&self) -> bool {
        self.next_cursor == TERMINAL_CURSOR
    }
}

/// Schema-less key-value store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a value; expired keys read as absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value atomically, replacing any previous value and expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Examine up to `page_size` keys from `cursor`, returning those matching `pattern`
    async fn scan(&self, cursor: &str, pattern: &str, page_size: usize) -> Result<ScanPage>;

    /// Physically remove expired keys, returning how many were removed
    async fn purge_expired(&self) -> Result<u64>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Parse a scan cursor into a key offset
pub(crate) fn parse_cursor(cursor: &str) -> Result<usize> {
    cursor
        .parse::<usize>()
        .map_err(|_| Error::InvalidInput(format!("Invalid scan cursor: {:?}", cursor)))
}

/// Next cursor after examining `examined` keys starting at `offset`
pub(crate) fn next_cursor(offset: usize, examined: usize, page_size: usize) -> String {
    if examined < page_size {
        TERMINAL_CURSOR.to_string()
    } else {
        (offset + examined).to_string()
    }
}
