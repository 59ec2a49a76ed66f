//! Attribution passes over stored conversions
//!
//! One runner serves both the pending pass (conversions never attributed)
//! and the recovery passes (conversions whose earlier result was a miss or
//! a geo guess, retried with wider windows). Each pass keeps its own
//! checkpoint and processed markers, keyed by namespace, so passes never
//! interfere with each other and a re-run skips what is already done.

use crate::context::RunContext;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AttributionMethod, AttributionRecord, BatchReport, Conversion, MatchOptions, ScanCheckpoint,
};
use crate::services::matcher::IdentityResolver;
use crate::services::paged_scan::{PageHandler, PagedScan, ScanOutcome};
use crate::signals::{checkpoint_key, processed_marker_key};
use async_trait::async_trait;
use attrib_common::store::{RecordStore, TERMINAL_CURSOR};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Earlier results a recovery pass revisits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisitTarget {
    /// No match, or never attributed
    NoMatch,
    /// Matched by geo correlation only
    Geo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassKind {
    Pending,
    Recovery { revisit: Vec<RevisitTarget> },
}

/// Everything that distinguishes one pass from another
#[derive(Debug, Clone)]
pub struct PassDefinition {
    pub name: String,
    /// Checkpoint and marker namespace
    pub namespace: String,
    pub kind: PassKind,
    pub options: MatchOptions,
    pub conversion_pattern: String,
    pub page_size: usize,
    pub concurrency: usize,
    pub max_pages: Option<u32>,
    pub marker_ttl: Duration,
}

impl PassDefinition {
    fn is_eligible(&self, conversion: &Conversion) -> bool {
        match &self.kind {
            PassKind::Pending => conversion.attribution.is_none(),
            PassKind::Recovery { revisit } => match conversion.attribution.as_ref() {
                None => revisit.contains(&RevisitTarget::NoMatch),
                Some(record) => match record.method() {
                    None => revisit.contains(&RevisitTarget::NoMatch),
                    Some(AttributionMethod::GeoCorrelation) => {
                        revisit.contains(&RevisitTarget::Geo)
                    }
                    Some(_) => false,
                },
            },
        }
    }
}

/// When a fresh result replaces the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    Always,
    /// Only when strictly better than the stored result
    OnImprovement,
    /// Resolve without writing
    Never,
}

/// What happened to one conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConversionOutcome {
    Skipped,
    Malformed,
    Failed,
    Resolved { matched: bool, written: bool },
}

/// Resolves conversions and persists their attribution
pub struct Attributor {
    store: Arc<dyn RecordStore>,
    resolver: Arc<IdentityResolver>,
}

impl Attributor {
    pub fn new(store: Arc<dyn RecordStore>, resolver: Arc<IdentityResolver>) -> Self {
        Self { store, resolver }
    }

    pub async fn load_conversion(&self, key: &str) -> EngineResult<Conversion> {
        let json = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
        serde_json::from_str(&json).map_err(|e| EngineError::malformed(key, e))
    }

    /// Resolve one conversion and write the result back according to `policy`
    ///
    /// Returns the fresh record and whether it was written.
    pub async fn attribute(
        &self,
        ctx: &RunContext,
        key: &str,
        mut conversion: Conversion,
        options: &MatchOptions,
        pass: Option<&str>,
        policy: WritePolicy,
    ) -> EngineResult<(AttributionRecord, bool)> {
        let outcome = self.resolver.resolve(ctx, &conversion, options).await;
        let record = AttributionRecord::new(
            outcome,
            options,
            ctx.run_id().to_string(),
            pass.map(str::to_string),
        );

        let previous = conversion.attribution.take();
        let write = match (policy, previous.as_ref()) {
            (WritePolicy::Always, _) | (WritePolicy::OnImprovement, None) => true,
            (WritePolicy::OnImprovement, Some(previous)) => record.is_improvement_over(previous),
            (WritePolicy::Never, _) => false,
        };
        if !write {
            return Ok((record, false));
        }

        let record = record.superseding(previous);
        conversion.attribution = Some(record.clone());
        let json = serde_json::to_string(&conversion)?;
        self.store.set(key, &json, None).await?;

        tracing::debug!(
            key = %key,
            method = ?record.method(),
            confidence = record.confidence(),
            pass = ?pass,
            "Attribution stored"
        );
        Ok((record, true))
    }

    async fn load_checkpoint(&self, pass: &PassDefinition) -> EngineResult<ScanCheckpoint> {
        let key = checkpoint_key(&pass.namespace);
        let saved = match self.store.get(&key).await? {
            Some(json) => match serde_json::from_str::<ScanCheckpoint>(&json) {
                Ok(checkpoint) => Some(checkpoint),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding unreadable checkpoint");
                    None
                }
            },
            None => None,
        };

        Ok(match saved {
            Some(checkpoint)
                if !checkpoint.complete && checkpoint.pattern == pass.conversion_pattern =>
            {
                checkpoint
            }
            // A finished sweep starts over; markers skip what is already done
            _ => ScanCheckpoint::start(&pass.conversion_pattern),
        })
    }

    async fn save_checkpoint(
        &self,
        namespace: &str,
        checkpoint: &mut ScanCheckpoint,
    ) -> EngineResult<()> {
        checkpoint.updated_at = Utc::now();
        let json = serde_json::to_string(checkpoint)?;
        self.store.set(&checkpoint_key(namespace), &json, None).await?;
        Ok(())
    }

    async fn process(
        &self,
        ctx: &RunContext,
        pass: &PassDefinition,
        key: &str,
        json: &str,
    ) -> ConversionOutcome {
        let conversion: Conversion = match serde_json::from_str(json) {
            Ok(conversion) => conversion,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Skipping malformed conversion record");
                return ConversionOutcome::Malformed;
            }
        };

        let marker =
            processed_marker_key(&pass.namespace, conversion.identity(key), conversion.timestamp);
        match self.store.get(&marker).await {
            Ok(Some(_)) => return ConversionOutcome::Skipped,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Marker check failed");
                return ConversionOutcome::Failed;
            }
        }
        if !pass.is_eligible(&conversion) {
            return ConversionOutcome::Skipped;
        }

        let policy = match pass.kind {
            PassKind::Pending => WritePolicy::Always,
            PassKind::Recovery { .. } => WritePolicy::OnImprovement,
        };
        let (record, written) = match self
            .attribute(ctx, key, conversion, &pass.options, Some(&pass.name), policy)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to store attribution");
                return ConversionOutcome::Failed;
            }
        };

        if let Err(e) = self.store.set(&marker, "1", Some(pass.marker_ttl)).await {
            tracing::warn!(key = %key, error = %e, "Failed to write processed marker");
        }

        ConversionOutcome::Resolved {
            matched: record.method().is_some(),
            written,
        }
    }

    /// Run one invocation of a pass within the context's budget
    pub async fn run_pass(
        &self,
        ctx: &RunContext,
        pass: &PassDefinition,
    ) -> EngineResult<BatchReport> {
        let mut checkpoint = self.load_checkpoint(pass).await?;
        let start_cursor = checkpoint.cursor.clone();

        tracing::info!(
            pass = %pass.name,
            namespace = %pass.namespace,
            cursor = %start_cursor,
            run_id = %ctx.run_id(),
            "Attribution pass starting"
        );

        let mut report = BatchReport {
            pass: pass.name.clone(),
            ..Default::default()
        };

        let mut handler = ConversionPageHandler {
            attributor: self,
            pass,
            report: &mut report,
            checkpoint: &mut checkpoint,
            interrupted: false,
        };
        let run = PagedScan::new(self.store.as_ref(), &pass.conversion_pattern, pass.page_size)
            .with_max_pages(pass.max_pages)
            .run(ctx, &start_cursor, &mut handler)
            .await?;

        report.scanned = run.keys;
        match run.outcome {
            ScanOutcome::Complete => {
                checkpoint.complete = true;
                checkpoint.cursor = TERMINAL_CURSOR.to_string();
                report.complete = true;
            }
            ScanOutcome::Paused(reason) => {
                report.stop_reason = Some(reason);
            }
        }
        self.save_checkpoint(&pass.namespace, &mut checkpoint).await?;

        report.cursor = checkpoint.cursor.clone();
        report.geo_calls = ctx.geo_calls_made();
        report.elapsed_ms = ctx.elapsed_ms();

        tracing::info!(
            pass = %pass.name,
            complete = report.complete,
            processed = report.processed,
            matched = report.matched,
            improved = report.improved,
            skipped = report.skipped,
            failures = report.failures,
            geo_calls = report.geo_calls,
            elapsed_ms = report.elapsed_ms,
            "Attribution pass finished"
        );
        Ok(report)
    }
}

struct ConversionPageHandler<'a> {
    attributor: &'a Attributor,
    pass: &'a PassDefinition,
    report: &'a mut BatchReport,
    checkpoint: &'a mut ScanCheckpoint,
    /// Budget ran out mid-page; the page must be revisited
    interrupted: bool,
}

#[async_trait]
impl<'a> PageHandler for ConversionPageHandler<'a> {
    async fn handle_page(&mut self, ctx: &RunContext, keys: Vec<String>) -> EngineResult<()> {
        let store = self.attributor.store.as_ref();
        let fetched: Vec<(String, attrib_common::Result<Option<String>>)> = stream::iter(keys)
            .map(|key| async move {
                let value = store.get(&key).await;
                (key, value)
            })
            .buffered(self.pass.concurrency.max(1))
            .collect()
            .await;

        for (key, value) in fetched {
            if ctx.stop_reason().is_some() {
                self.interrupted = true;
                return Ok(());
            }
            let json = match value {
                Ok(Some(json)) => json,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to fetch conversion");
                    self.report.failures += 1;
                    continue;
                }
            };

            match self.attributor.process(ctx, self.pass, &key, &json).await {
                ConversionOutcome::Skipped => self.report.skipped += 1,
                ConversionOutcome::Malformed => self.report.malformed += 1,
                ConversionOutcome::Failed => self.report.failures += 1,
                ConversionOutcome::Resolved { matched, written } => {
                    self.report.processed += 1;
                    if matched {
                        self.report.matched += 1;
                    } else {
                        self.report.unmatched += 1;
                    }
                    if let PassKind::Recovery { .. } = self.pass.kind {
                        if written {
                            self.report.improved += 1;
                        } else {
                            self.report.unchanged += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn checkpoint(&mut self, next_cursor: &str) -> EngineResult<()> {
        if self.interrupted {
            return Ok(());
        }
        self.checkpoint.cursor = next_cursor.to_string();
        self.checkpoint.keys_processed = self.report.processed;
        self.attributor
            .save_checkpoint(&self.pass.namespace, self.checkpoint)
            .await
    }
}
