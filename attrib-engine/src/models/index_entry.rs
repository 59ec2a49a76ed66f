//! Precomputed index entries

use crate::models::VisitSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Visit attribute an index is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Ip,
    Session,
    Fingerprint,
    Screen,
    Webgl,
    Page,
    Source,
    /// Hour bucket (`YYYYMMDDHH`), the candidate pool for geo correlation
    Hour,
}

impl SignalKind {
    pub const ALL: [SignalKind; 8] = [
        SignalKind::Ip,
        SignalKind::Session,
        SignalKind::Fingerprint,
        SignalKind::Screen,
        SignalKind::Webgl,
        SignalKind::Page,
        SignalKind::Source,
        SignalKind::Hour,
    ];

    /// Key segment after `idx:`
    pub fn key_segment(self) -> &'static str {
        match self {
            SignalKind::Ip => "ip",
            SignalKind::Session => "session",
            SignalKind::Fingerprint => "fp",
            SignalKind::Screen => "screen",
            SignalKind::Webgl => "webgl",
            SignalKind::Page => "page",
            SignalKind::Source => "source",
            SignalKind::Hour => "hour",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_segment())
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(SignalKind::Ip),
            "session" | "session_token" => Ok(SignalKind::Session),
            "fp" | "fingerprint" | "device_fingerprint" => Ok(SignalKind::Fingerprint),
            "screen" | "screen_hash" => Ok(SignalKind::Screen),
            "webgl" | "webgl_hash" => Ok(SignalKind::Webgl),
            "page" | "landing_page" => Ok(SignalKind::Page),
            "source" => Ok(SignalKind::Source),
            "hour" => Ok(SignalKind::Hour),
            other => Err(format!("unknown signal kind: {other}")),
        }
    }
}

/// All recent visits sharing one signal value
///
/// Holds at most the configured capacity of visits, most recent first.
/// `total_visits` and `unique_sessions` count everything seen before the cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub signal: SignalKind,
    /// Normalized signal value (unencoded)
    pub value: String,
    pub visits: Vec<VisitSummary>,
    pub total_visits: u64,
    pub unique_sessions: u64,
    /// Newest visit timestamp in the build that produced this entry
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl IndexEntry {
    /// Build an entry from every visit seen for one value, applying the cap
    pub fn from_visits(
        signal: SignalKind,
        value: String,
        mut visits: Vec<VisitSummary>,
        capacity: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        let total_visits = visits.len() as u64;
        let unique_sessions = visits
            .iter()
            .filter_map(|v| v.session_token.as_deref())
            .collect::<BTreeSet<_>>()
            .len() as u64;

        visits.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.key.cmp(&b.key))
        });
        visits.truncate(capacity);

        Self {
            signal,
            value,
            visits,
            total_visits,
            unique_sessions,
            created_at,
        }
    }

    /// Visits strictly before `before` and no older than `not_before`
    pub fn visits_between(
        &self,
        not_before: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> impl Iterator<Item = &VisitSummary> + '_ {
        self.visits
            .iter()
            .filter(move |v| v.timestamp < before && v.timestamp >= not_before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn summary(key: &str, minutes: i64, session: Option<&str>) -> VisitSummary {
        VisitSummary {
            key: key.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
                + Duration::minutes(minutes),
            ips: vec![],
            session_token: session.map(str::to_string),
            landing_page: None,
            source: None,
            utm_campaign: None,
            utm_medium: None,
            utm_content: None,
            device_fingerprint: None,
            geo: None,
        }
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let visits = (0..10)
            .map(|i| summary(&format!("visit:{i}"), i, Some(if i % 2 == 0 { "a" } else { "b" })))
            .collect();
        let entry = IndexEntry::from_visits(
            SignalKind::Ip,
            "198.51.100.7".into(),
            visits,
            3,
            Utc::now(),
        );

        let keys: Vec<_> = entry.visits.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["visit:9", "visit:8", "visit:7"]);
        assert_eq!(entry.total_visits, 10);
        assert_eq!(entry.unique_sessions, 2);
    }

    #[test]
    fn test_equal_timestamps_order_by_key() {
        let visits = vec![summary("visit:b", 0, None), summary("visit:a", 0, None)];
        let entry =
            IndexEntry::from_visits(SignalKind::Hour, "2024061512".into(), visits, 5, Utc::now());
        assert_eq!(entry.visits[0].key, "visit:a");
    }

    #[test]
    fn test_signal_kind_parsing() {
        assert_eq!("FP".parse::<SignalKind>().unwrap(), SignalKind::Fingerprint);
        assert_eq!("session_token".parse::<SignalKind>().unwrap(), SignalKind::Session);
        assert!("zip".parse::<SignalKind>().is_err());
    }
}
