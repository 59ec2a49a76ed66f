//! Index builder
//!
//! Scans raw visit records and writes one entry per (signal, value) holding
//! the most recent visits that share it. A build may span many invocations:
//!
//! 1. **Main scan** over every configured pattern at the normal page size.
//! 2. **Verification** re-scan of high-risk ranges at a small page size to
//!    pick up keys the large pages missed while the keyspace was changing.
//! 3. **Finalize**: merge all staged chunks and write entries in key order.
//!
//! Scanned data is accumulated in memory and flushed to a staging chunk
//! whenever an invocation stops, so nothing scanned is lost. Progress is
//! saved only after its chunk is written; a crash in between rescans from
//! the previous cursor and rewrites the same chunk number.
//!
//! Entries are stamped with the newest visit timestamp in the build rather
//! than the wall clock, so rebuilding unchanged data produces byte-identical
//! entries.

use crate::context::RunContext;
use crate::error::EngineResult;
use crate::models::{
    BuildPhase, BuildProgress, BuildReport, BuildStats, IndexEntry, SignalKind, StopReason, Visit,
    VisitSummary,
};
use crate::services::paged_scan::{PageHandler, PagedScan, ScanOutcome};
use crate::signals::{index_key, stage_key, visit_signals, PROGRESS_KEY};
use async_trait::async_trait;
use attrib_common::store::{RecordStore, TERMINAL_CURSOR};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IndexBuilderConfig {
    /// Raw record patterns scanned by the main pass
    pub patterns: Vec<String>,
    /// Patterns re-scanned by the verification pass
    pub high_risk_ranges: Vec<String>,
    pub page_size: usize,
    pub verification_page_size: usize,
    /// Visits kept per entry
    pub capacity: usize,
    /// Visits kept per hour-bucket entry
    pub hour_capacity: usize,
    /// Concurrent record fetches and entry writes
    pub concurrency: usize,
    pub entry_ttl: Option<Duration>,
    pub stage_ttl: Duration,
    /// Pages per invocation across all phases
    pub max_pages: Option<u32>,
}

impl Default for IndexBuilderConfig {
    fn default() -> Self {
        Self {
            patterns: vec!["visit:*".to_string(), "pageview:*".to_string()],
            high_risk_ranges: vec!["visit:*".to_string()],
            page_size: 500,
            verification_page_size: 50,
            capacity: 50,
            hour_capacity: 500,
            concurrency: 25,
            entry_ttl: Some(Duration::from_secs(7 * 24 * 3600)),
            stage_ttl: Duration::from_secs(2 * 24 * 3600),
            max_pages: None,
        }
    }
}

/// Partial accumulation persisted between invocations
#[derive(Debug, Serialize, Deserialize)]
struct StageChunk {
    build_id: String,
    verification: bool,
    #[serde(default, with = "crate::models::timestamp::option")]
    watermark: Option<DateTime<Utc>>,
    groups: Vec<StagedGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StagedGroup {
    signal: SignalKind,
    value: String,
    visits: Vec<VisitSummary>,
}

type GroupMap = BTreeMap<(SignalKind, String), BTreeMap<String, VisitSummary>>;

#[derive(Default)]
struct Accumulator {
    groups: GroupMap,
    watermark: Option<DateTime<Utc>>,
}

impl Accumulator {
    fn add(&mut self, key: &str, visit: &Visit) {
        let summary = VisitSummary::from_visit(key, visit);
        for signal in visit_signals(visit, &summary) {
            self.groups
                .entry(signal)
                .or_default()
                .insert(key.to_string(), summary.clone());
        }
        self.watermark = self.watermark.max(Some(visit.timestamp));
    }

    fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn into_chunk(self, build_id: &str, verification: bool) -> StageChunk {
        StageChunk {
            build_id: build_id.to_string(),
            verification,
            watermark: self.watermark,
            groups: self
                .groups
                .into_iter()
                .map(|((signal, value), visits)| StagedGroup {
                    signal,
                    value,
                    visits: visits.into_values().collect(),
                })
                .collect(),
        }
    }
}

/// Fetches and accumulates the visits named by one scan page
struct VisitPageHandler<'a> {
    store: &'a dyn RecordStore,
    acc: &'a mut Accumulator,
    concurrency: usize,
    visits_indexed: u64,
    malformed: u64,
    fetch_failures: u64,
}

#[async_trait]
impl<'a> PageHandler for VisitPageHandler<'a> {
    async fn handle_page(&mut self, _ctx: &RunContext, keys: Vec<String>) -> EngineResult<()> {
        let store = self.store;
        let fetched: Vec<(String, attrib_common::Result<Option<String>>)> = stream::iter(keys)
            .map(|key| async move {
                let value = store.get(&key).await;
                (key, value)
            })
            .buffered(self.concurrency.max(1))
            .collect()
            .await;

        for (key, value) in fetched {
            match value {
                Ok(Some(json)) => match serde_json::from_str::<Visit>(&json) {
                    Ok(visit) => {
                        self.acc.add(&key, &visit);
                        self.visits_indexed += 1;
                    }
                    Err(e) => {
                        self.malformed += 1;
                        tracing::debug!(key = %key, error = %e, "Skipping malformed visit record");
                    }
                },
                // Expired between scan and fetch
                Ok(None) => {}
                Err(e) => {
                    self.fetch_failures += 1;
                    tracing::warn!(key = %key, error = %e, "Failed to fetch visit record");
                }
            }
        }
        Ok(())
    }
}

pub struct IndexBuilder {
    store: Arc<dyn RecordStore>,
    config: IndexBuilderConfig,
}

impl IndexBuilder {
    pub fn new(store: Arc<dyn RecordStore>, config: IndexBuilderConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IndexBuilderConfig {
        &self.config
    }

    /// Saved progress, if any; an unreadable record counts as none
    pub async fn load_progress(&self) -> EngineResult<Option<BuildProgress>> {
        let Some(json) = self.store.get(PROGRESS_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(progress) => Ok(Some(progress)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable build progress");
                Ok(None)
            }
        }
    }

    async fn save_progress(&self, progress: &mut BuildProgress) -> EngineResult<()> {
        progress.updated_at = Utc::now();
        let json = serde_json::to_string(progress)?;
        self.store.set(PROGRESS_KEY, &json, None).await?;
        Ok(())
    }

    /// Run (or continue) a build within the context's budget
    ///
    /// With `progress` of `None` the saved progress is resumed; a completed
    /// build starts a new one.
    pub async fn build(
        &self,
        ctx: &RunContext,
        progress: Option<BuildProgress>,
    ) -> EngineResult<BuildReport> {
        let mut progress = match progress {
            Some(progress) => progress,
            None => self.load_progress().await?.unwrap_or_default(),
        };
        if progress.is_complete() {
            progress = BuildProgress::new();
        }
        progress.invocations += 1;

        let mut stats = BuildStats::default();
        let mut pages_left = self.config.max_pages;

        tracing::info!(
            build_id = %progress.build_id,
            phase = ?progress.phase,
            invocation = progress.invocations,
            backend = self.store.backend_name(),
            "Index build starting"
        );

        if progress.phase == BuildPhase::MainScan {
            if let Some(reason) = self
                .scan_phase(ctx, &mut progress, &mut stats, &mut pages_left, false)
                .await?
            {
                return self.pause(ctx, progress, stats, reason).await;
            }
            progress.phase = BuildPhase::Verification;
            self.save_progress(&mut progress).await?;
            tracing::info!(
                keys_scanned = progress.keys_scanned,
                visits_indexed = progress.visits_indexed,
                "Main scan complete"
            );
        }

        if progress.phase == BuildPhase::Verification {
            if let Some(reason) = self
                .scan_phase(ctx, &mut progress, &mut stats, &mut pages_left, true)
                .await?
            {
                return self.pause(ctx, progress, stats, reason).await;
            }
            progress.verification_complete = true;
            progress.phase = BuildPhase::Finalize;
            self.save_progress(&mut progress).await?;
        }

        if progress.phase == BuildPhase::Finalize {
            if let Some(reason) = self.finalize(ctx, &mut progress, &mut stats).await? {
                return self.pause(ctx, progress, stats, reason).await;
            }
            progress.phase = BuildPhase::Complete;
            progress.completed_at = Some(Utc::now());
            self.save_progress(&mut progress).await?;

            match self.store.purge_expired().await {
                Ok(removed) => stats.purged_records = removed,
                Err(e) => tracing::warn!(error = %e, "Purging expired records failed"),
            }
        }

        stats.elapsed_ms = ctx.elapsed_ms();
        tracing::info!(
            build_id = %progress.build_id,
            entries = progress.entries_written,
            recovered = stats.recovered_visits,
            malformed = progress.malformed_records,
            invocations = progress.invocations,
            elapsed_ms = stats.elapsed_ms,
            "Index build complete"
        );

        Ok(BuildReport {
            complete: true,
            stop_reason: None,
            stats,
            progress,
        })
    }

    async fn pause(
        &self,
        ctx: &RunContext,
        mut progress: BuildProgress,
        mut stats: BuildStats,
        reason: StopReason,
    ) -> EngineResult<BuildReport> {
        self.save_progress(&mut progress).await?;
        stats.elapsed_ms = ctx.elapsed_ms();
        tracing::info!(
            build_id = %progress.build_id,
            phase = ?progress.phase,
            reason = ?reason,
            pages = stats.pages,
            elapsed_ms = stats.elapsed_ms,
            "Index build paused, will resume on next invocation"
        );
        Ok(BuildReport {
            complete: false,
            stop_reason: Some(reason),
            stats,
            progress,
        })
    }

    /// Scan every pattern of one phase; `Some` when the invocation must stop
    async fn scan_phase(
        &self,
        ctx: &RunContext,
        progress: &mut BuildProgress,
        stats: &mut BuildStats,
        pages_left: &mut Option<u32>,
        verification: bool,
    ) -> EngineResult<Option<StopReason>> {
        let (patterns, page_size) = if verification {
            (&self.config.high_risk_ranges, self.config.verification_page_size)
        } else {
            (&self.config.patterns, self.config.page_size)
        };

        let mut acc = Accumulator::default();
        let mut stopped = None;

        for pattern in patterns {
            let (completed, cursor) = if verification {
                (&progress.completed_ranges, &progress.verification_cursor)
            } else {
                (&progress.completed_patterns, &progress.cursor)
            };
            if completed.contains(pattern) {
                continue;
            }
            let start = cursor.clone();

            let mut handler = VisitPageHandler {
                store: self.store.as_ref(),
                acc: &mut acc,
                concurrency: self.config.concurrency,
                visits_indexed: 0,
                malformed: 0,
                fetch_failures: 0,
            };
            let run = PagedScan::new(self.store.as_ref(), pattern, page_size)
                .with_max_pages(*pages_left)
                .run(ctx, &start, &mut handler)
                .await?;

            *pages_left = pages_left.map(|left| left.saturating_sub(run.pages));
            stats.pages += run.pages;
            stats.fetch_failures += handler.fetch_failures;
            progress.fetch_failures += handler.fetch_failures;
            // Verification re-reads records the main scan already counted
            if verification {
                stats.verification_keys_scanned += run.keys;
                stats.verification_malformed += handler.malformed;
                progress.verification_keys_scanned += run.keys;
                progress.verification_malformed += handler.malformed;
            } else {
                stats.keys_scanned += run.keys;
                stats.visits_indexed += handler.visits_indexed;
                stats.malformed_records += handler.malformed;
                progress.keys_scanned += run.keys;
                progress.visits_indexed += handler.visits_indexed;
                progress.malformed_records += handler.malformed;
            }

            let (completed, cursor) = if verification {
                (&mut progress.completed_ranges, &mut progress.verification_cursor)
            } else {
                (&mut progress.completed_patterns, &mut progress.cursor)
            };
            match run.outcome {
                ScanOutcome::Complete => {
                    completed.push(pattern.clone());
                    *cursor = TERMINAL_CURSOR.to_string();
                }
                ScanOutcome::Paused(reason) => {
                    *cursor = run.cursor;
                    stopped = Some(reason);
                    break;
                }
            }
        }

        if !acc.is_empty() {
            self.write_stage(progress, acc, verification).await?;
        }
        Ok(stopped)
    }

    async fn write_stage(
        &self,
        progress: &mut BuildProgress,
        acc: Accumulator,
        verification: bool,
    ) -> EngineResult<()> {
        let key = stage_key(&progress.build_id, progress.staged_chunks);
        let chunk = acc.into_chunk(&progress.build_id, verification);
        let json = serde_json::to_string(&chunk)?;
        self.store
            .set(&key, &json, Some(self.config.stage_ttl))
            .await?;
        progress.staged_chunks += 1;
        tracing::debug!(
            key = %key,
            groups = chunk.groups.len(),
            verification,
            "Staged chunk written"
        );
        Ok(())
    }

    /// Merge staged chunks and write entries from the saved offset
    async fn finalize(
        &self,
        ctx: &RunContext,
        progress: &mut BuildProgress,
        stats: &mut BuildStats,
    ) -> EngineResult<Option<StopReason>> {
        let mut merged: GroupMap = BTreeMap::new();
        let mut main_keys: HashSet<String> = HashSet::new();
        let mut verification_keys: HashSet<String> = HashSet::new();
        let mut watermark: Option<DateTime<Utc>> = None;

        for n in 0..progress.staged_chunks {
            let key = stage_key(&progress.build_id, n);
            let chunk = match self.load_stage(&key).await? {
                Some(chunk) => chunk,
                None => {
                    tracing::warn!(
                        key = %key,
                        build_id = %progress.build_id,
                        "Staged chunk missing or unreadable, restarting build"
                    );
                    *progress = BuildProgress::new();
                    return Ok(Some(StopReason::StagingExpired));
                }
            };

            watermark = watermark.max(chunk.watermark);
            for group in chunk.groups {
                let target = merged.entry((group.signal, group.value)).or_default();
                for visit in group.visits {
                    if chunk.verification {
                        verification_keys.insert(visit.key.clone());
                    } else {
                        main_keys.insert(visit.key.clone());
                    }
                    target.insert(visit.key.clone(), visit);
                }
            }
        }

        stats.recovered_visits = verification_keys.difference(&main_keys).count() as u64;
        if stats.recovered_visits > 0 {
            tracing::info!(
                recovered = stats.recovered_visits,
                "Verification pass found visits missed by the main scan"
            );
        }

        let created_at = watermark.unwrap_or(progress.started_at);
        let remaining: Vec<((SignalKind, String), BTreeMap<String, VisitSummary>)> = merged
            .into_iter()
            .skip(progress.entries_written as usize)
            .collect();
        let batch_size = self.config.concurrency.max(1);

        for batch in remaining.chunks(batch_size) {
            if let Some(reason) = ctx.stop_reason() {
                return Ok(Some(reason));
            }

            let mut writes = Vec::with_capacity(batch.len());
            for ((signal, value), visits) in batch {
                let capacity = match signal {
                    SignalKind::Hour => self.config.hour_capacity,
                    _ => self.config.capacity,
                };
                let entry = IndexEntry::from_visits(
                    *signal,
                    value.clone(),
                    visits.values().cloned().collect(),
                    capacity,
                    created_at,
                );
                writes.push((*signal, index_key(*signal, value), serde_json::to_string(&entry)?));
            }

            let store = self.store.as_ref();
            let ttl = self.config.entry_ttl;
            let results: Vec<attrib_common::Result<()>> = stream::iter(writes.iter())
                .map(|(_, key, json)| async move { store.set(key, json, ttl).await })
                .buffer_unordered(batch_size)
                .collect()
                .await;

            if let Some(e) = results.into_iter().find_map(Result::err) {
                tracing::warn!(
                    error = %e,
                    offset = progress.entries_written,
                    "Entry write failed, pausing finalize"
                );
                return Ok(Some(StopReason::StoreUnavailable));
            }

            progress.entries_written += batch.len() as u64;
            stats.entries_written += batch.len() as u64;
            for (signal, _, _) in &writes {
                *stats.entries_by_signal.entry(*signal).or_default() += 1;
            }
        }

        Ok(None)
    }

    async fn load_stage(&self, key: &str) -> EngineResult<Option<StageChunk>> {
        let Some(json) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<StageChunk>(&json) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Unreadable staged chunk");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrib_common::store::MemoryRecordStore;
    use serde_json::json;

    async fn seed_visit(store: &MemoryRecordStore, key: &str, ts: &str, ip: &str, session: &str) {
        let visit = json!({ "timestamp": ts, "ip": ip, "session_token": session });
        store.set(key, &visit.to_string(), None).await.unwrap();
    }

    fn builder(store: Arc<MemoryRecordStore>, config: IndexBuilderConfig) -> IndexBuilder {
        IndexBuilder::new(store, config)
    }

    #[tokio::test]
    async fn test_build_groups_visits_by_signal() {
        let store = Arc::new(MemoryRecordStore::new());
        seed_visit(&store, "visit:1", "2024-06-15T10:00:00Z", "198.51.100.7", "s1").await;
        seed_visit(&store, "visit:2", "2024-06-15T11:00:00Z", "198.51.100.7", "s2").await;
        store.set("visit:bad", "not json", None).await.unwrap();

        let report = builder(store.clone(), IndexBuilderConfig::default())
            .build(&RunContext::unbounded(), None)
            .await
            .unwrap();
        assert!(report.complete);
        assert_eq!(report.progress.malformed_records, 1);

        let entry: IndexEntry =
            serde_json::from_str(&store.get("idx:ip:198.51.100.7").await.unwrap().unwrap())
                .unwrap();
        assert_eq!(entry.total_visits, 2);
        assert_eq!(entry.unique_sessions, 2);
        assert_eq!(entry.visits[0].key, "visit:2");
        assert_eq!(entry.created_at.to_rfc3339(), "2024-06-15T11:00:00+00:00");
        assert!(store.get("idx:session:s1").await.unwrap().is_some());
        assert!(store.get("idx:hour:2024061510").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_budget_pauses_before_scanning() {
        let store = Arc::new(MemoryRecordStore::new());
        seed_visit(&store, "visit:1", "2024-06-15T10:00:00Z", "198.51.100.7", "s1").await;

        let ctx = RunContext::new(Some(Duration::ZERO), 0);
        let report = builder(store.clone(), IndexBuilderConfig::default())
            .build(&ctx, None)
            .await
            .unwrap();

        assert!(!report.complete);
        assert_eq!(report.stop_reason, Some(StopReason::Budget));
        assert_eq!(report.progress.phase, BuildPhase::MainScan);
        assert!(store.get(PROGRESS_KEY).await.unwrap().is_some());
        assert!(store.get("idx:ip:198.51.100.7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_stage_restarts_build() {
        let store = Arc::new(MemoryRecordStore::new());
        let mut progress = BuildProgress::new();
        progress.phase = BuildPhase::Finalize;
        progress.staged_chunks = 1;
        let old_build = progress.build_id.clone();

        let report = builder(store.clone(), IndexBuilderConfig::default())
            .build(&RunContext::unbounded(), Some(progress))
            .await
            .unwrap();

        assert_eq!(report.stop_reason, Some(StopReason::StagingExpired));
        assert_ne!(report.progress.build_id, old_build);
        assert_eq!(report.progress.phase, BuildPhase::MainScan);
    }
}
