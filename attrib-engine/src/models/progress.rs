//! Resumable progress records and run reports
//!
//! Long scans run inside a bounded execution window. Anything needed to
//! continue after the window closes is persisted in these records, so a
//! later invocation resumes instead of starting over.

use crate::models::SignalKind;
use attrib_common::store::TERMINAL_CURSOR;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Why a run stopped before finishing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Wall-clock budget for this invocation used up
    Budget,
    /// Page limit for this invocation reached
    PageLimit,
    /// Shutdown requested
    Cancelled,
    /// Scan call failed after retries; resume later from the saved cursor
    StoreUnavailable,
    /// Staged data from earlier invocations expired; the build restarts
    StagingExpired,
}

/// Phase of an index build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    MainScan,
    Verification,
    Finalize,
    Complete,
}

/// Persisted state of an index build (`idx:progress`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildProgress {
    /// Identifies the staging chunks belonging to this build
    pub build_id: String,
    pub phase: BuildPhase,

    /// Main-scan cursor within the first pattern not yet completed
    pub cursor: String,
    #[serde(default)]
    pub completed_patterns: Vec<String>,

    /// Verification cursor within the first range not yet completed
    pub verification_cursor: String,
    #[serde(default)]
    pub completed_ranges: Vec<String>,
    #[serde(default)]
    pub verification_complete: bool,

    /// Staging chunks written so far (`idx:stage:{build_id}:{0..n}`)
    pub staged_chunks: u32,
    /// Finalized entries already written, in key order
    pub entries_written: u64,

    pub keys_scanned: u64,
    pub visits_indexed: u64,
    pub verification_keys_scanned: u64,
    pub malformed_records: u64,
    /// Malformed records seen again by the verification pass
    #[serde(default)]
    pub verification_malformed: u64,
    pub fetch_failures: u64,
    pub invocations: u32,

    #[serde(with = "crate::models::timestamp")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "crate::models::timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BuildProgress {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            build_id: Uuid::new_v4().simple().to_string(),
            phase: BuildPhase::MainScan,
            cursor: TERMINAL_CURSOR.to_string(),
            completed_patterns: Vec::new(),
            verification_cursor: TERMINAL_CURSOR.to_string(),
            completed_ranges: Vec::new(),
            verification_complete: false,
            staged_chunks: 0,
            entries_written: 0,
            keys_scanned: 0,
            visits_indexed: 0,
            verification_keys_scanned: 0,
            malformed_records: 0,
            verification_malformed: 0,
            fetch_failures: 0,
            invocations: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn main_scan_complete(&self) -> bool {
        self.phase > BuildPhase::MainScan
    }

    pub fn is_complete(&self) -> bool {
        self.phase == BuildPhase::Complete
    }
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one build invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildStats {
    pub pages: u32,
    pub keys_scanned: u64,
    pub visits_indexed: u64,
    pub verification_keys_scanned: u64,
    /// Visits found only by the verification pass
    pub recovered_visits: u64,
    pub malformed_records: u64,
    pub verification_malformed: u64,
    pub fetch_failures: u64,
    pub entries_written: u64,
    /// Expired records removed once the build completed
    pub purged_records: u64,
    pub entries_by_signal: BTreeMap<SignalKind, u64>,
    pub elapsed_ms: u64,
}

/// Result of one `build_indexes` invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub stats: BuildStats,
    pub progress: BuildProgress,
}

/// Persisted cursor of a resumable conversion pass (`attr:checkpoint:{namespace}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    pub pattern: String,
    pub cursor: String,
    pub complete: bool,
    pub keys_processed: u64,
    #[serde(with = "crate::models::timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl ScanCheckpoint {
    pub fn start(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            cursor: TERMINAL_CURSOR.to_string(),
            complete: false,
            keys_processed: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Result of one batch or recovery pass invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub pass: String,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub cursor: String,
    pub scanned: u64,
    /// Conversions resolved during this invocation
    pub processed: u64,
    pub matched: u64,
    pub unmatched: u64,
    /// Recovery only: records rewritten because the new result is better
    pub improved: u64,
    /// Recovery only: resolved but left as they were
    pub unchanged: u64,
    /// Already handled by this pass or not eligible for it
    pub skipped: u64,
    pub malformed: u64,
    pub failures: u64,
    pub geo_calls: u32,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_progress_starts_at_main_scan() {
        let progress = BuildProgress::new();
        assert_eq!(progress.phase, BuildPhase::MainScan);
        assert_eq!(progress.cursor, "0");
        assert!(!progress.main_scan_complete());
        assert!(!progress.is_complete());
        assert_eq!(progress.build_id.len(), 32);
    }

    #[test]
    fn test_progress_roundtrips_through_store_format() {
        let mut progress = BuildProgress::new();
        progress.phase = BuildPhase::Finalize;
        progress.entries_written = 120;
        let json = serde_json::to_string(&progress).unwrap();
        let restored: BuildProgress = serde_json::from_str(&json).unwrap();
        assert!(restored.main_scan_complete());
        assert_eq!(restored.entries_written, 120);
    }
}
