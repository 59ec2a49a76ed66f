//! Identity resolution
//!
//! A conversion is matched through an ordered list of tiers. Exact-signal
//! tiers (session token, the IP families, device fingerprints) are all
//! probed concurrently; the strongest tier with an eligible visit wins and
//! every other matching tier contributes visits to the journey. Geo
//! correlation runs only when no exact tier matched.

use crate::context::RunContext;
use crate::models::{
    AttributionMethod, AttributionModel, AttributionOutcome, Conversion, ConversionSignals,
    GeoEvidence, MatchOptions, MatchedAttribution, SignalKind, VisitSummary,
};
use crate::services::geo_correlator::GeoCorrelator;
use crate::services::index_reader::IndexReader;
use crate::services::journey::{assemble, MatchedSignal};
use crate::signals::{hour_bucket, index_key};
use async_trait::async_trait;
use attrib_common::time::floor_to_hour;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;

const HOUR_FETCH_CONCURRENCY: usize = 8;

/// Everything a tier needs to probe one conversion
pub struct ProbeInput<'a> {
    pub ctx: &'a RunContext,
    pub conversion_ts: DateTime<Utc>,
    pub signals: &'a ConversionSignals,
    pub options: &'a MatchOptions,
}

impl ProbeInput<'_> {
    fn not_before(&self) -> DateTime<Utc> {
        self.conversion_ts - self.options.lookback()
    }
}

/// A tier's successful probe
#[derive(Debug, Clone, PartialEq)]
pub struct TierMatch {
    pub method: AttributionMethod,
    /// Index key holding the selected visit
    pub matched_key: String,
    pub selected: VisitSummary,
    /// Eligible visits this tier found, for the journey
    pub visits: Vec<VisitSummary>,
    pub geo: Option<GeoEvidence>,
}

#[async_trait]
pub trait MatchTier: Send + Sync {
    fn method(&self) -> AttributionMethod;

    /// Values this tier would probe; a tier with none is skipped
    fn values(&self, signals: &ConversionSignals) -> Vec<String>;

    async fn probe(&self, input: &ProbeInput<'_>) -> Option<TierMatch>;
}

/// Credited visit under `model`; equal timestamps fall back to key order
pub fn select_visit<'a, I>(visits: I, model: AttributionModel) -> Option<&'a VisitSummary>
where
    I: IntoIterator<Item = &'a VisitSummary>,
{
    let visits = visits.into_iter();
    match model {
        AttributionModel::FirstTouch => visits.min_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.key.cmp(&b.key))
        }),
        AttributionModel::LastTouch => visits.max_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| b.key.cmp(&a.key))
        }),
    }
}

/// Exact lookup of conversion signal values in one index
pub struct SignalTier {
    method: AttributionMethod,
    kind: SignalKind,
    extract: fn(&ConversionSignals) -> Vec<String>,
    reader: IndexReader,
}

impl SignalTier {
    pub fn new(
        method: AttributionMethod,
        kind: SignalKind,
        extract: fn(&ConversionSignals) -> Vec<String>,
        reader: IndexReader,
    ) -> Self {
        Self {
            method,
            kind,
            extract,
            reader,
        }
    }

    /// Session, IP, and device tiers in priority order
    pub fn standard_tiers(reader: &IndexReader) -> Vec<SignalTier> {
        vec![
            SignalTier::new(
                AttributionMethod::SessionToken,
                SignalKind::Session,
                |s| s.session_token.iter().cloned().collect(),
                reader.clone(),
            ),
            SignalTier::new(
                AttributionMethod::PrimaryIp,
                SignalKind::Ip,
                |s| s.primary_ips.clone(),
                reader.clone(),
            ),
            SignalTier::new(
                AttributionMethod::CheckoutIp,
                SignalKind::Ip,
                |s| s.checkout_ips.clone(),
                reader.clone(),
            ),
            SignalTier::new(
                AttributionMethod::PageviewIp,
                SignalKind::Ip,
                |s| s.pageview_ips.clone(),
                reader.clone(),
            ),
            SignalTier::new(
                AttributionMethod::DeviceFingerprint,
                SignalKind::Fingerprint,
                |s| s.device_fingerprint.iter().cloned().collect(),
                reader.clone(),
            ),
            SignalTier::new(
                AttributionMethod::ScreenHash,
                SignalKind::Screen,
                |s| s.screen_hash.iter().cloned().collect(),
                reader.clone(),
            ),
            SignalTier::new(
                AttributionMethod::WebglSignature,
                SignalKind::Webgl,
                |s| s.webgl_hash.iter().cloned().collect(),
                reader.clone(),
            ),
        ]
    }
}

#[async_trait]
impl MatchTier for SignalTier {
    fn method(&self) -> AttributionMethod {
        self.method
    }

    fn values(&self, signals: &ConversionSignals) -> Vec<String> {
        (self.extract)(signals)
    }

    async fn probe(&self, input: &ProbeInput<'_>) -> Option<TierMatch> {
        let not_before = input.not_before();
        // visit key -> (visit, index key it was first found under)
        let mut eligible: BTreeMap<String, (VisitSummary, String)> = BTreeMap::new();

        for value in self.values(input.signals) {
            let key = index_key(self.kind, &value);
            let Some(entry) = self.reader.load_lenient(&key).await else {
                continue;
            };
            for visit in entry.visits_between(not_before, input.conversion_ts) {
                eligible
                    .entry(visit.key.clone())
                    .or_insert_with(|| (visit.clone(), key.clone()));
            }
        }

        let selected =
            select_visit(eligible.values().map(|(visit, _)| visit), input.options.model)?.clone();
        let matched_key = eligible
            .get(&selected.key)
            .map(|(_, key)| key.clone())
            .unwrap_or_default();

        tracing::debug!(
            method = %self.method,
            matched_key = %matched_key,
            visit = %selected.key,
            eligible = eligible.len(),
            "Tier matched"
        );

        Some(TierMatch {
            method: self.method,
            matched_key,
            selected,
            visits: eligible.into_values().map(|(visit, _)| visit).collect(),
            geo: None,
        })
    }
}

/// Fallback tier: location agreement within a short window
pub struct GeoTier {
    correlator: Arc<GeoCorrelator>,
    reader: IndexReader,
}

impl GeoTier {
    pub fn new(correlator: Arc<GeoCorrelator>, reader: IndexReader) -> Self {
        Self { correlator, reader }
    }

    /// Visits from every hour bucket overlapping `[from, to]`
    async fn candidates(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<VisitSummary> {
        let mut hour_keys = Vec::new();
        let mut hour = floor_to_hour(from);
        while hour <= to {
            hour_keys.push(index_key(SignalKind::Hour, &hour_bucket(hour)));
            hour += Duration::hours(1);
        }

        let reader = &self.reader;
        let entries: Vec<_> = stream::iter(hour_keys)
            .map(|key| async move { reader.load_lenient(&key).await })
            .buffered(HOUR_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut by_key: BTreeMap<String, VisitSummary> = BTreeMap::new();
        for entry in entries.into_iter().flatten() {
            for visit in entry.visits {
                by_key.entry(visit.key.clone()).or_insert(visit);
            }
        }
        by_key.into_values().collect()
    }
}

#[async_trait]
impl MatchTier for GeoTier {
    fn method(&self) -> AttributionMethod {
        AttributionMethod::GeoCorrelation
    }

    fn values(&self, signals: &ConversionSignals) -> Vec<String> {
        signals.all_ips()
    }

    async fn probe(&self, input: &ProbeInput<'_>) -> Option<TierMatch> {
        let ips = self.values(input.signals);
        let window = input.options.max_geo_window();
        if ips.is_empty() || window <= Duration::zero() {
            return None;
        }

        let lookback_minutes =
            u32::try_from(input.options.lookback().num_minutes()).unwrap_or(u32::MAX);
        let windows: Vec<u32> = input
            .options
            .geo_windows_minutes
            .iter()
            .map(|w| (*w).min(lookback_minutes))
            .collect();

        let candidates = self
            .candidates(input.conversion_ts - window, input.conversion_ts)
            .await;
        let found = self
            .correlator
            .correlate(input.ctx, input.conversion_ts, &ips, candidates, &windows)
            .await?;

        // The correlated device's other recent visits complete the journey
        let mut visits = vec![found.visit.clone()];
        if let Some(ip) = found.visit.primary_ip() {
            if let Some(entry) = self.reader.load_lenient(&index_key(SignalKind::Ip, ip)).await {
                visits.extend(
                    entry
                        .visits_between(input.not_before(), input.conversion_ts)
                        .filter(|v| v.key != found.visit.key)
                        .cloned(),
                );
            }
        }

        Some(TierMatch {
            method: AttributionMethod::GeoCorrelation,
            matched_key: index_key(SignalKind::Hour, &hour_bucket(found.visit.timestamp)),
            selected: found.visit,
            visits,
            geo: Some(found.evidence),
        })
    }
}

/// Runs the tiers for one conversion
pub struct IdentityResolver {
    tiers: Vec<Arc<dyn MatchTier>>,
}

impl IdentityResolver {
    pub fn new(mut tiers: Vec<Arc<dyn MatchTier>>) -> Self {
        tiers.sort_by_key(|t| t.method().rank());
        Self { tiers }
    }

    pub async fn resolve(
        &self,
        ctx: &RunContext,
        conversion: &Conversion,
        options: &MatchOptions,
    ) -> AttributionOutcome {
        let signals = ConversionSignals::from_conversion(conversion);
        if !signals.has_enhanced_signals() {
            tracing::debug!("Conversion predates enhanced signals, skipping tiers without a value");
        }

        let input = ProbeInput {
            ctx,
            conversion_ts: conversion.timestamp,
            signals: &signals,
            options,
        };

        let applicable: Vec<&Arc<dyn MatchTier>> = self
            .tiers
            .iter()
            .filter(|t| !t.values(&signals).is_empty())
            .collect();
        let (exact, fallback): (Vec<_>, Vec<_>) = applicable
            .into_iter()
            .partition(|t| t.method().is_deterministic());

        let mut tiers_probed: Vec<AttributionMethod> = exact.iter().map(|t| t.method()).collect();
        let mut matches: Vec<TierMatch> = join_all(exact.iter().map(|t| t.probe(&input)))
            .await
            .into_iter()
            .flatten()
            .collect();

        if matches.is_empty() {
            for tier in fallback {
                tiers_probed.push(tier.method());
                if let Some(found) = tier.probe(&input).await {
                    matches.push(found);
                    break;
                }
            }
        }

        let Some(winner) = matches.first().cloned() else {
            return AttributionOutcome::NoMatch { tiers_probed };
        };

        let matched_signals: Vec<MatchedSignal> = matches
            .iter()
            .map(|m| MatchedSignal {
                method: m.method,
                visits: m.visits.clone(),
            })
            .collect();
        let journey = assemble(&matched_signals, conversion.timestamp);

        AttributionOutcome::Matched(MatchedAttribution {
            method: winner.method,
            confidence: journey.summary.confidence,
            visit: winner.selected,
            matched_key: winner.matched_key,
            matched_tiers: matches.iter().map(|m| m.method).collect(),
            geo: winner.geo,
            journey,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn visit(key: &str, hour: u32) -> VisitSummary {
        VisitSummary {
            key: key.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 15, hour, 0, 0).unwrap(),
            ips: vec![],
            session_token: None,
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
    fn test_select_visit_by_model() {
        let visits = vec![visit("visit:b", 9), visit("visit:a", 11), visit("visit:c", 9)];
        assert_eq!(
            select_visit(&visits, AttributionModel::FirstTouch).unwrap().key,
            "visit:b"
        );
        assert_eq!(
            select_visit(&visits, AttributionModel::LastTouch).unwrap().key,
            "visit:a"
        );
    }

    #[test]
    fn test_select_visit_ties_break_on_key() {
        let visits = vec![visit("visit:z", 9), visit("visit:y", 9)];
        assert_eq!(select_visit(&visits, AttributionModel::FirstTouch).unwrap().key, "visit:y");
        assert_eq!(select_visit(&visits, AttributionModel::LastTouch).unwrap().key, "visit:y");
    }
}
