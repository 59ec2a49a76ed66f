//! Probabilistic geo correlation
//!
//! Fallback when no exact signal links a conversion to a visit. Visits from
//! the hour buckets shortly before the conversion are scored against the
//! conversion's location:
//!
//! | Agreement                  | Points |
//! |----------------------------|--------|
//! | ISP identical (normalized) | 60     |
//! | ISP similar                | 40     |
//! | Same city                  | 40     |
//! | Same region (no city)      | 25     |
//! | Same country only          | 10     |
//!
//! ISP and location points add up to at most 100. A known country mismatch
//! scores 0 whatever the ISP says.
//!
//! Candidates are tried closest in time first; the first one reaching the
//! acceptance score wins.

use crate::context::RunContext;
use crate::models::{
    ConfidenceBand, GeoEvidence, GeoGranularity, GeoInfo, GeoLookup, IspAgreement, VisitSummary,
};
use crate::services::geo_cache::GeoLookupCache;
use crate::services::isp::compare_isps;
use chrono::{DateTime, Utc};
use std::sync::Arc;

const ISP_EXACT_POINTS: u32 = 60;
const ISP_SIMILAR_POINTS: u32 = 40;
const CITY_POINTS: u32 = 40;
const REGION_POINTS: u32 = 25;
const COUNTRY_POINTS: u32 = 10;

/// Lowest score any configuration may accept
pub const MIN_ACCEPTANCE_SCORE: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoScore {
    pub score: u32,
    pub isp: IspAgreement,
    pub granularity: GeoGranularity,
}

fn same_place(a: &Option<String>, b: &Option<String>) -> Option<bool> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.trim().eq_ignore_ascii_case(b.trim())),
        _ => None,
    }
}

/// Score how well a visit's location agrees with the conversion's
pub fn score_locations(conversion: &GeoInfo, visit: &GeoInfo) -> GeoScore {
    let country = same_place(&conversion.country, &visit.country);
    let region = same_place(&conversion.region, &visit.region);
    let city = same_place(&conversion.city, &visit.city);

    // A known mismatch at a coarser level vetoes agreement at a finer one
    let country_ok = country != Some(false);
    let granularity = if city == Some(true) && region != Some(false) && country_ok {
        GeoGranularity::City
    } else if region == Some(true) && country_ok {
        GeoGranularity::Region
    } else if country == Some(true) {
        GeoGranularity::Country
    } else {
        GeoGranularity::None
    };

    let isp = compare_isps(conversion.isp.as_deref(), visit.isp.as_deref());

    if !country_ok {
        return GeoScore {
            score: 0,
            isp,
            granularity,
        };
    }

    let geo_points = match granularity {
        GeoGranularity::City => CITY_POINTS,
        GeoGranularity::Region => REGION_POINTS,
        GeoGranularity::Country => COUNTRY_POINTS,
        GeoGranularity::None => 0,
    };
    let isp_points = match isp {
        IspAgreement::Exact => ISP_EXACT_POINTS,
        IspAgreement::Similar => ISP_SIMILAR_POINTS,
        IspAgreement::Different | IspAgreement::Unknown => 0,
    };

    GeoScore {
        score: (geo_points + isp_points).min(100),
        isp,
        granularity,
    }
}

/// An accepted geo-correlated visit
#[derive(Debug, Clone, PartialEq)]
pub struct GeoMatch {
    pub visit: VisitSummary,
    pub evidence: GeoEvidence,
}

pub struct GeoCorrelator {
    cache: Arc<GeoLookupCache>,
    acceptance_score: u32,
    max_conversion_ips: usize,
    max_candidates: usize,
}

impl GeoCorrelator {
    pub fn new(
        cache: Arc<GeoLookupCache>,
        acceptance_score: u32,
        max_conversion_ips: usize,
        max_candidates: usize,
    ) -> Self {
        Self {
            cache,
            acceptance_score: acceptance_score.max(MIN_ACCEPTANCE_SCORE),
            max_conversion_ips: max_conversion_ips.max(1),
            max_candidates: max_candidates.max(1),
        }
    }

    /// Find the closest visit whose location agrees with the conversion
    ///
    /// `windows_minutes` are tried smallest first; a visit is reported under
    /// the smallest window that contains it.
    pub async fn correlate(
        &self,
        ctx: &RunContext,
        conversion_ts: DateTime<Utc>,
        conversion_ips: &[String],
        candidates: Vec<VisitSummary>,
        windows_minutes: &[u32],
    ) -> Option<GeoMatch> {
        let mut windows: Vec<u32> = windows_minutes.iter().copied().filter(|w| *w > 0).collect();
        windows.sort_unstable();
        windows.dedup();
        let widest = i64::from(*windows.last()?) * 60;

        let mut conversion_geos: Vec<(&str, GeoInfo)> = Vec::new();
        for ip in conversion_ips.iter().take(self.max_conversion_ips) {
            if let GeoLookup::Found(info) = self.cache.lookup(ctx, ip).await {
                conversion_geos.push((ip.as_str(), info));
            }
        }
        if conversion_geos.is_empty() {
            tracing::debug!(ips = conversion_ips.len(), "No conversion IP could be geolocated");
            return None;
        }

        let mut in_window: Vec<(i64, VisitSummary)> = candidates
            .into_iter()
            .filter(|v| v.timestamp < conversion_ts)
            .map(|v| ((conversion_ts - v.timestamp).num_seconds(), v))
            .filter(|(gap, _)| *gap <= widest)
            .collect();
        in_window.sort_by(|(ga, a), (gb, b)| ga.cmp(gb).then_with(|| a.key.cmp(&b.key)));

        for (gap, visit) in in_window.into_iter().take(self.max_candidates) {
            if ctx.stop_reason().is_some() {
                return None;
            }

            let visit_geo = match visit.geo.as_ref().filter(|g| g.is_usable()) {
                Some(geo) => GeoInfo::from(geo),
                None => {
                    let Some(ip) = visit.primary_ip() else {
                        continue;
                    };
                    match self.cache.lookup(ctx, ip).await {
                        GeoLookup::Found(info) => info,
                        GeoLookup::Failed => continue,
                    }
                }
            };

            let best = conversion_geos
                .iter()
                .map(|(ip, geo)| (*ip, score_locations(geo, &visit_geo)))
                .max_by_key(|(_, s)| s.score);
            let Some((conversion_ip, score)) = best else {
                continue;
            };
            if score.score < self.acceptance_score {
                continue;
            }
            let Some(band) = ConfidenceBand::from_score(score.score) else {
                continue;
            };

            // `gap <= widest`, so some window always contains it
            let Some(window_minutes) = windows.iter().copied().find(|w| gap <= i64::from(*w) * 60)
            else {
                continue;
            };

            tracing::debug!(
                visit = %visit.key,
                score = score.score,
                gap_seconds = gap,
                window_minutes,
                "Geo correlation accepted"
            );

            return Some(GeoMatch {
                evidence: GeoEvidence {
                    score: score.score,
                    band,
                    isp: score.isp,
                    granularity: score.granularity,
                    window_minutes,
                    gap_seconds: gap,
                    conversion_ip: conversion_ip.to_string(),
                },
                visit,
            });
        }

        None
    }
}
