//! Budget-aware paged scan
//!
//! Drives `RecordStore::scan` from a saved cursor, handing each page to a
//! [`PageHandler`] and stopping cleanly between pages when the run budget,
//! a page limit, or cancellation says so. The returned cursor is always one
//! whose page has not been handled yet, so resuming from it never skips keys.

use crate::context::RunContext;
use crate::error::EngineResult;
use crate::models::StopReason;
use async_trait::async_trait;
use attrib_common::store::{RecordStore, TERMINAL_CURSOR};

/// Consumer of scan pages
#[async_trait]
pub trait PageHandler: Send {
    async fn handle_page(&mut self, ctx: &RunContext, keys: Vec<String>) -> EngineResult<()>;

    /// Called after a page is handled, with the cursor to resume from
    async fn checkpoint(&mut self, _next_cursor: &str) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Complete,
    Paused(StopReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRun {
    pub outcome: ScanOutcome,
    /// Resume cursor; `"0"` when complete
    pub cursor: String,
    pub pages: u32,
    pub keys: u64,
}

pub struct PagedScan<'a> {
    store: &'a dyn RecordStore,
    pattern: &'a str,
    page_size: usize,
    max_pages: Option<u32>,
}

impl<'a> PagedScan<'a> {
    pub fn new(store: &'a dyn RecordStore, pattern: &'a str, page_size: usize) -> Self {
        Self {
            store,
            pattern,
            page_size,
            max_pages: None,
        }
    }

    pub fn with_max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub async fn run(
        &self,
        ctx: &RunContext,
        start_cursor: &str,
        handler: &mut dyn PageHandler,
    ) -> EngineResult<ScanRun> {
        let mut cursor = start_cursor.to_string();
        let mut pages = 0u32;
        let mut keys = 0u64;

        loop {
            let stop = ctx.stop_reason().or_else(|| {
                self.max_pages
                    .filter(|max| pages >= *max)
                    .map(|_| StopReason::PageLimit)
            });
            if let Some(reason) = stop {
                tracing::info!(
                    pattern = self.pattern,
                    cursor = %cursor,
                    pages,
                    reason = ?reason,
                    "Scan paused"
                );
                return Ok(ScanRun {
                    outcome: ScanOutcome::Paused(reason),
                    cursor,
                    pages,
                    keys,
                });
            }

            let page = match self.store.scan(&cursor, self.pattern, self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(
                        pattern = self.pattern,
                        cursor = %cursor,
                        backend = self.store.backend_name(),
                        error = %e,
                        "Scan failed, pausing at last good cursor"
                    );
                    return Ok(ScanRun {
                        outcome: ScanOutcome::Paused(StopReason::StoreUnavailable),
                        cursor,
                        pages,
                        keys,
                    });
                }
            };

            pages += 1;
            keys += page.keys.len() as u64;
            let terminal = page.is_terminal();
            let next_cursor = page.next_cursor;

            handler.handle_page(ctx, page.keys).await?;
            handler.checkpoint(&next_cursor).await?;

            if terminal {
                tracing::debug!(pattern = self.pattern, pages, keys, "Scan complete");
                return Ok(ScanRun {
                    outcome: ScanOutcome::Complete,
                    cursor: TERMINAL_CURSOR.to_string(),
                    pages,
                    keys,
                });
            }
            cursor = next_cursor;
        }
    }
}
