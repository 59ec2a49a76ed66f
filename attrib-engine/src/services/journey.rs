//! Journey assembly
//!
//! Merges the visits of every matched index entry into one chronological
//! journey ending at the conversion, and derives the journey confidence.

use crate::models::{AttributionMethod, Journey, JourneySummary, Touchpoint, VisitSummary};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Extra tiers beyond the winner add this much, up to `MAX_CORROBORATION_BONUS`
const CORROBORATION_BONUS: u32 = 10;
const MAX_CORROBORATION_BONUS: u32 = 20;
const TOUCHPOINT_BONUS: u32 = 2;
const MAX_TOUCHPOINT_BONUS: u32 = 10;

/// Visits one tier contributed
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedSignal {
    pub method: AttributionMethod,
    pub visits: Vec<VisitSummary>,
}

/// Same session, same instant, same address: the same touch seen twice
type TouchKey = (String, i64, String);

fn touch_key(visit: &VisitSummary) -> TouchKey {
    (
        visit.session_token.clone().unwrap_or_default(),
        visit.timestamp.timestamp_millis(),
        visit.primary_ip().unwrap_or_default().to_string(),
    )
}

/// Build the journey preceding `conversion_ts`
///
/// Visits at or after the conversion are dropped. Duplicates are merged,
/// keeping every tier that saw them.
pub fn assemble(matched: &[MatchedSignal], conversion_ts: DateTime<Utc>) -> Journey {
    let mut touches: BTreeMap<TouchKey, (VisitSummary, BTreeSet<AttributionMethod>)> =
        BTreeMap::new();

    for signal in matched {
        for visit in signal.visits.iter().filter(|v| v.timestamp < conversion_ts) {
            touches
                .entry(touch_key(visit))
                .or_insert_with(|| (visit.clone(), BTreeSet::new()))
                .1
                .insert(signal.method);
        }
    }

    let mut ordered: Vec<(VisitSummary, BTreeSet<AttributionMethod>)> =
        touches.into_values().collect();
    ordered.sort_by(|(a, _), (b, _)| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));

    let touchpoints: Vec<Touchpoint> = ordered
        .into_iter()
        .enumerate()
        .map(|(i, (visit, methods))| Touchpoint {
            sequence: i as u32 + 1,
            visit,
            matched_via: methods.into_iter().collect(),
        })
        .collect();

    let methods: BTreeSet<AttributionMethod> = matched
        .iter()
        .filter(|m| m.visits.iter().any(|v| v.timestamp < conversion_ts))
        .map(|m| m.method)
        .collect();

    let summary = summarize(&touchpoints, &methods, conversion_ts);
    Journey {
        touchpoints,
        summary,
    }
}

fn summarize(
    touchpoints: &[Touchpoint],
    methods: &BTreeSet<AttributionMethod>,
    conversion_ts: DateTime<Utc>,
) -> JourneySummary {
    let distinct = |f: fn(&VisitSummary) -> Option<&String>| {
        touchpoints
            .iter()
            .filter_map(|t| f(&t.visit))
            .collect::<BTreeSet<_>>()
            .len() as u32
    };

    let first = touchpoints.first().map(|t| t.visit.timestamp);
    let last = touchpoints.last().map(|t| t.visit.timestamp);

    JourneySummary {
        touchpoints: touchpoints.len() as u32,
        distinct_sessions: distinct(|v| v.session_token.as_ref()),
        distinct_sources: distinct(|v| v.source.as_ref()),
        distinct_campaigns: distinct(|v| v.utm_campaign.as_ref()),
        distinct_landing_pages: distinct(|v| v.landing_page.as_ref()),
        first_touch_at: first,
        last_touch_at: last,
        duration_seconds: match (first, last) {
            (Some(first), Some(last)) => (last - first).num_seconds(),
            _ => 0,
        },
        time_to_conversion_seconds: first.map(|first| (conversion_ts - first).num_seconds()),
        confidence: confidence(methods, touchpoints.len(), last, conversion_ts),
    }
}

/// Journey confidence on a 0..=100 scale
///
/// Starts from the strongest matched tier, then adds for corroborating
/// tiers, for journey length, and for how close the last touch is to the
/// conversion.
pub fn confidence(
    methods: &BTreeSet<AttributionMethod>,
    touchpoints: usize,
    last_touch: Option<DateTime<Utc>>,
    conversion_ts: DateTime<Utc>,
) -> u32 {
    let (Some(strongest), Some(last_touch)) = (methods.iter().next(), last_touch) else {
        return 0;
    };

    let corroboration =
        (CORROBORATION_BONUS * (methods.len() as u32 - 1)).min(MAX_CORROBORATION_BONUS);
    let length =
        (TOUCHPOINT_BONUS * (touchpoints.saturating_sub(1) as u32)).min(MAX_TOUCHPOINT_BONUS);

    let gap = conversion_ts - last_touch;
    let proximity = if gap <= Duration::hours(1) {
        20
    } else if gap <= Duration::hours(24) {
        12
    } else if gap <= Duration::days(7) {
        5
    } else {
        0
    };

    (strongest.base_confidence() + corroboration + length + proximity).min(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conversion_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 14, 0, 0).unwrap()
    }

    fn visit(key: &str, minutes_before: i64, session: &str, source: &str) -> VisitSummary {
        VisitSummary {
            key: key.to_string(),
            timestamp: conversion_time() - Duration::minutes(minutes_before),
            ips: vec!["198.51.100.7".into()],
            session_token: Some(session.to_string()),
            landing_page: None,
            source: Some(source.to_string()),
            utm_campaign: None,
            utm_medium: None,
            utm_content: None,
            device_fingerprint: None,
            geo: None,
        }
    }

    #[test]
    fn test_merges_duplicates_and_orders_chronologically() {
        let matched = vec![
            MatchedSignal {
                method: AttributionMethod::SessionToken,
                visits: vec![visit("visit:2", 30, "s1", "google")],
            },
            MatchedSignal {
                method: AttributionMethod::PrimaryIp,
                visits: vec![
                    visit("visit:2", 30, "s1", "google"),
                    visit("visit:1", 600, "s0", "facebook"),
                ],
            },
        ];

        let journey = assemble(&matched, conversion_time());
        assert_eq!(journey.touchpoints.len(), 2);
        assert_eq!(journey.touchpoints[0].visit.key, "visit:1");
        assert_eq!(journey.touchpoints[0].sequence, 1);
        assert_eq!(
            journey.touchpoints[1].matched_via,
            vec![AttributionMethod::SessionToken, AttributionMethod::PrimaryIp]
        );
        assert_eq!(journey.summary.distinct_sessions, 2);
        assert_eq!(journey.summary.distinct_sources, 2);
        assert_eq!(journey.summary.duration_seconds, 570 * 60);
        assert_eq!(journey.summary.time_to_conversion_seconds, Some(600 * 60));
        // 50 session + 10 corroboration + 2 length + 20 proximity
        assert_eq!(journey.summary.confidence, 82);
    }

    #[test]
    fn test_drops_visits_at_or_after_conversion() {
        let matched = vec![MatchedSignal {
            method: AttributionMethod::PrimaryIp,
            visits: vec![visit("visit:late", 0, "s", "x"), visit("visit:later", -5, "s", "x")],
        }];
        let journey = assemble(&matched, conversion_time());
        assert!(journey.touchpoints.is_empty());
        assert_eq!(journey.summary.confidence, 0);
    }

    #[test]
    fn test_confidence_is_capped() {
        let methods: BTreeSet<_> = [
            AttributionMethod::SessionToken,
            AttributionMethod::PrimaryIp,
            AttributionMethod::DeviceFingerprint,
            AttributionMethod::ScreenHash,
        ]
        .into_iter()
        .collect();
        let now = conversion_time();
        assert_eq!(confidence(&methods, 20, Some(now - Duration::minutes(5)), now), 100);
    }
}
