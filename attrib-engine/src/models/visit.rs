//! Visit records and their index summaries

use crate::signals::{normalize_ips, normalize_landing_page, normalize_token};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse geography some ingestion paths attach to a visit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitGeo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
}

impl VisitGeo {
    /// Enough detail to score against a conversion without a lookup
    pub fn is_usable(&self) -> bool {
        self.isp.is_some()
            && (self.city.is_some() || self.region.is_some() || self.country.is_some())
    }
}

/// A raw visit (or page view) record as written by the tracking pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    #[serde(with = "crate::models::timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Client IP; may hold several addresses separated by commas
    #[serde(default, alias = "ipAddress")]
    pub ip: Option<String>,

    #[serde(default, alias = "landingPage")]
    pub landing_page: Option<String>,

    /// Traffic source (utm_source or referrer classification)
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default, alias = "utmCampaign")]
    pub utm_campaign: Option<String>,

    #[serde(default, alias = "utmMedium")]
    pub utm_medium: Option<String>,

    #[serde(default, alias = "utmContent")]
    pub utm_content: Option<String>,

    #[serde(default, alias = "sessionToken")]
    pub session_token: Option<String>,

    #[serde(default, alias = "deviceFingerprint")]
    pub device_fingerprint: Option<String>,

    #[serde(default, alias = "screenHash")]
    pub screen_hash: Option<String>,

    #[serde(default, alias = "webglHash")]
    pub webgl_hash: Option<String>,

    #[serde(default)]
    pub geo: Option<VisitGeo>,
}

/// Compact copy of a visit stored inside index entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitSummary {
    /// Store key of the originating visit record
    pub key: String,

    #[serde(with = "crate::models::timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Normalized client IPs, in the order they were recorded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<VisitGeo>,
}

impl VisitSummary {
    pub fn from_visit(key: &str, visit: &Visit) -> Self {
        Self {
            key: key.to_string(),
            timestamp: visit.timestamp,
            ips: visit
                .ip
                .as_deref()
                .map(|raw| normalize_ips([raw]))
                .unwrap_or_default(),
            session_token: visit.session_token.as_deref().and_then(normalize_token),
            landing_page: visit
                .landing_page
                .as_deref()
                .and_then(normalize_landing_page),
            source: visit.source.as_deref().and_then(normalize_token),
            utm_campaign: visit.utm_campaign.as_deref().and_then(normalize_token),
            utm_medium: visit.utm_medium.as_deref().and_then(normalize_token),
            utm_content: visit.utm_content.as_deref().and_then(normalize_token),
            device_fingerprint: visit.device_fingerprint.as_deref().and_then(normalize_token),
            geo: visit.geo.clone(),
        }
    }

    /// First recorded IP, used as the visit's identity in journeys
    pub fn primary_ip(&self) -> Option<&str> {
        self.ips.first().map(String::as_str)
    }
}
