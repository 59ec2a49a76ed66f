//! Attribution results persisted onto conversions

use crate::models::{SignalKind, VisitSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a conversion was linked to its visits, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMethod {
    SessionToken,
    PrimaryIp,
    CheckoutIp,
    PageviewIp,
    DeviceFingerprint,
    ScreenHash,
    WebglSignature,
    GeoCorrelation,
}

impl AttributionMethod {
    /// 0 is the strongest tier
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn is_deterministic(self) -> bool {
        self != AttributionMethod::GeoCorrelation
    }

    /// Index the tier probes, if it is an exact-match tier
    pub fn signal_kind(self) -> Option<SignalKind> {
        match self {
            AttributionMethod::SessionToken => Some(SignalKind::Session),
            AttributionMethod::PrimaryIp
            | AttributionMethod::CheckoutIp
            | AttributionMethod::PageviewIp => Some(SignalKind::Ip),
            AttributionMethod::DeviceFingerprint => Some(SignalKind::Fingerprint),
            AttributionMethod::ScreenHash => Some(SignalKind::Screen),
            AttributionMethod::WebglSignature => Some(SignalKind::Webgl),
            AttributionMethod::GeoCorrelation => None,
        }
    }

    /// Journey confidence contributed by being the winning tier
    pub fn base_confidence(self) -> u32 {
        match self {
            AttributionMethod::SessionToken => 50,
            AttributionMethod::PrimaryIp => 40,
            AttributionMethod::CheckoutIp => 38,
            AttributionMethod::PageviewIp => 35,
            AttributionMethod::DeviceFingerprint => 32,
            AttributionMethod::ScreenHash => 28,
            AttributionMethod::WebglSignature => 25,
            AttributionMethod::GeoCorrelation => 15,
        }
    }
}

impl fmt::Display for AttributionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AttributionMethod::SessionToken => "session_token",
            AttributionMethod::PrimaryIp => "primary_ip",
            AttributionMethod::CheckoutIp => "checkout_ip",
            AttributionMethod::PageviewIp => "pageview_ip",
            AttributionMethod::DeviceFingerprint => "device_fingerprint",
            AttributionMethod::ScreenHash => "screen_hash",
            AttributionMethod::WebglSignature => "webgl_signature",
            AttributionMethod::GeoCorrelation => "geo_correlation",
        };
        f.write_str(label)
    }
}

/// Which visit a matched tier credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModel {
    FirstTouch,
    #[default]
    LastTouch,
}

impl FromStr for AttributionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first_touch" | "first" => Ok(AttributionModel::FirstTouch),
            "last_touch" | "last" => Ok(AttributionModel::LastTouch),
            other => Err(format!("unknown attribution model: {other}")),
        }
    }
}

/// Parameters of one resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOptions {
    pub model: AttributionModel,
    pub lookback_days: u32,
    /// Geo-correlation windows in minutes, tried in ascending order
    pub geo_windows_minutes: Vec<u32>,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            model: AttributionModel::LastTouch,
            lookback_days: 14,
            geo_windows_minutes: vec![1440],
        }
    }
}

impl MatchOptions {
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.lookback_days))
    }

    /// Widest geo window, bounded by the lookback
    pub fn max_geo_window(&self) -> chrono::Duration {
        let widest = self.geo_windows_minutes.iter().copied().max().unwrap_or(0);
        chrono::Duration::minutes(i64::from(widest)).min(self.lookback())
    }
}

/// Qualitative band of a geo-correlation score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    Low,
    Medium,
    High,
}

impl ConfidenceBand {
    pub fn from_score(score: u32) -> Option<Self> {
        match score {
            80.. => Some(ConfidenceBand::High),
            60..=79 => Some(ConfidenceBand::Medium),
            40..=59 => Some(ConfidenceBand::Low),
            _ => None,
        }
    }
}

/// How closely two ISP names agree after normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IspAgreement {
    Exact,
    Similar,
    Different,
    Unknown,
}

/// Finest geographic level at which two locations agree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoGranularity {
    None,
    Country,
    Region,
    City,
}

/// Why a geo-correlated visit was accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoEvidence {
    pub score: u32,
    pub band: ConfidenceBand,
    pub isp: IspAgreement,
    pub granularity: GeoGranularity,
    /// Smallest configured window containing the visit
    pub window_minutes: u32,
    pub gap_seconds: i64,
    pub conversion_ip: String,
}

/// One visit in a conversion's journey
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Touchpoint {
    /// 1-based position in chronological order
    pub sequence: u32,
    pub visit: VisitSummary,
    /// Tiers whose index entries contained this visit
    pub matched_via: Vec<AttributionMethod>,
}

/// Aggregates over a journey
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JourneySummary {
    pub touchpoints: u32,
    pub distinct_sessions: u32,
    pub distinct_sources: u32,
    pub distinct_campaigns: u32,
    pub distinct_landing_pages: u32,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub first_touch_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub last_touch_at: Option<DateTime<Utc>>,
    /// First to last touchpoint
    pub duration_seconds: i64,
    /// First touchpoint to conversion
    #[serde(default)]
    pub time_to_conversion_seconds: Option<i64>,
    /// 0..=100
    pub confidence: u32,
}

/// Chronological touchpoints preceding a conversion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub touchpoints: Vec<Touchpoint>,
    pub summary: JourneySummary,
}

/// A successful resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedAttribution {
    pub method: AttributionMethod,
    /// Journey confidence, 0..=100
    pub confidence: u32,
    /// Visit credited under the requested model
    pub visit: VisitSummary,
    /// Index key the winning tier matched on
    pub matched_key: String,
    /// Every tier that found eligible visits, in priority order
    pub matched_tiers: Vec<AttributionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoEvidence>,
    pub journey: Journey,
}

/// Outcome of resolving one conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttributionOutcome {
    Matched(MatchedAttribution),
    NoMatch {
        /// Tiers that had a signal to probe
        tiers_probed: Vec<AttributionMethod>,
    },
}

/// Attribution stored on a conversion record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub outcome: AttributionOutcome,
    pub model: AttributionModel,
    pub lookback_days: u32,
    pub run_id: String,
    #[serde(with = "crate::models::timestamp")]
    pub attributed_at: DateTime<Utc>,
    /// Batch or recovery pass that wrote this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Record this one replaced, without its own history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<AttributionRecord>>,
}

impl AttributionRecord {
    pub fn new(
        outcome: AttributionOutcome,
        options: &MatchOptions,
        run_id: String,
        pass: Option<String>,
    ) -> Self {
        Self {
            outcome,
            model: options.model,
            lookback_days: options.lookback_days,
            run_id,
            attributed_at: Utc::now(),
            pass,
            previous: None,
        }
    }

    pub fn matched(&self) -> Option<&MatchedAttribution> {
        match &self.outcome {
            AttributionOutcome::Matched(matched) => Some(matched),
            AttributionOutcome::NoMatch { .. } => None,
        }
    }

    pub fn method(&self) -> Option<AttributionMethod> {
        self.matched().map(|m| m.method)
    }

    pub fn confidence(&self) -> u32 {
        self.matched().map_or(0, |m| m.confidence)
    }

    /// A stronger tier, or the same tier with higher confidence; any match beats none
    pub fn is_improvement_over(&self, other: &AttributionRecord) -> bool {
        match (self.method(), other.method()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(mine), Some(theirs)) => {
                mine.rank() < theirs.rank()
                    || (mine.rank() == theirs.rank() && self.confidence() > other.confidence())
            }
        }
    }

    /// Attach `previous` as the audit snapshot, dropping its own history
    pub fn superseding(mut self, previous: Option<AttributionRecord>) -> Self {
        self.previous = previous.map(|mut prev| {
            prev.previous = None;
            Box::new(prev)
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(method: Option<AttributionMethod>, confidence: u32) -> AttributionRecord {
        let outcome = match method {
            Some(method) => AttributionOutcome::Matched(MatchedAttribution {
                method,
                confidence,
                visit: VisitSummary {
                    key: "visit:1".into(),
                    timestamp: Utc::now(),
                    ips: vec![],
                    session_token: None,
                    landing_page: None,
                    source: None,
                    utm_campaign: None,
                    utm_medium: None,
                    utm_content: None,
                    device_fingerprint: None,
                    geo: None,
                },
                matched_key: "idx:ip:198.51.100.7".into(),
                matched_tiers: vec![method],
                geo: None,
                journey: Journey::default(),
            }),
            None => AttributionOutcome::NoMatch {
                tiers_probed: vec![AttributionMethod::PrimaryIp],
            },
        };
        AttributionRecord {
            outcome,
            model: AttributionModel::LastTouch,
            lookback_days: 30,
            run_id: "run".into(),
            attributed_at: Utc::now(),
            pass: None,
            previous: None,
        }
    }

    #[test]
    fn test_improvement_ordering() {
        let none = record(None, 0);
        let geo = record(Some(AttributionMethod::GeoCorrelation), 60);
        let geo_better = record(Some(AttributionMethod::GeoCorrelation), 70);
        let ip = record(Some(AttributionMethod::PrimaryIp), 40);

        assert!(geo.is_improvement_over(&none));
        assert!(!none.is_improvement_over(&geo));
        assert!(geo_better.is_improvement_over(&geo));
        assert!(!geo.is_improvement_over(&geo));
        assert!(ip.is_improvement_over(&geo_better));
        assert!(!geo_better.is_improvement_over(&ip));
    }

    #[test]
    fn test_superseding_keeps_one_level_of_history() {
        let oldest = record(None, 0);
        let middle = record(Some(AttributionMethod::GeoCorrelation), 50).superseding(Some(oldest));
        let newest = record(Some(AttributionMethod::PrimaryIp), 60).superseding(Some(middle));

        let previous = newest.previous.as_ref().unwrap();
        assert_eq!(previous.method(), Some(AttributionMethod::GeoCorrelation));
        assert!(previous.previous.is_none());
    }

    #[test]
    fn test_outcome_is_tagged_by_status() {
        let json = serde_json::to_value(record(None, 0)).unwrap();
        assert_eq!(json["outcome"]["status"], "no_match");
        let json = serde_json::to_value(record(Some(AttributionMethod::SessionToken), 80)).unwrap();
        assert_eq!(json["outcome"]["status"], "matched");
        assert_eq!(json["outcome"]["method"], "session_token");
    }

    #[test]
    fn test_confidence_bands() {
        assert_eq!(ConfidenceBand::from_score(100), Some(ConfidenceBand::High));
        assert_eq!(ConfidenceBand::from_score(60), Some(ConfidenceBand::Medium));
        assert_eq!(ConfidenceBand::from_score(40), Some(ConfidenceBand::Low));
        assert_eq!(ConfidenceBand::from_score(39), None);
    }

    #[test]
    fn test_model_parsing() {
        assert_eq!(
            "first-touch".parse::<AttributionModel>().unwrap(),
            AttributionModel::FirstTouch
        );
        assert_eq!("LAST_TOUCH".parse::<AttributionModel>().unwrap(), AttributionModel::LastTouch);
    }
}
