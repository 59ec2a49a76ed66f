//! Geolocation results and their cached form

use crate::models::VisitGeo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Location and network owner of an IP address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl GeoInfo {
    pub fn has_location(&self) -> bool {
        self.city.is_some() || self.region.is_some() || self.country.is_some()
    }
}

impl From<&VisitGeo> for GeoInfo {
    fn from(geo: &VisitGeo) -> Self {
        Self {
            city: geo.city.clone(),
            region: geo.region.clone(),
            country: geo.country.clone(),
            isp: geo.isp.clone(),
            timezone: None,
        }
    }
}

/// Result of a cache-aware lookup
///
/// `Failed` is a real answer, distinct from "not looked up yet": it is what
/// a cached failure sentinel reads back as, and it disqualifies the IP from
/// geo correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoLookup {
    Found(GeoInfo),
    Failed,
}

impl GeoLookup {
    pub fn info(&self) -> Option<&GeoInfo> {
        match self {
            GeoLookup::Found(info) => Some(info),
            GeoLookup::Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoCacheStatus {
    Found,
    Failed,
}

/// Persisted cache entry (`geo:{encoded_ip}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoCacheEntry {
    pub status: GeoCacheStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<GeoInfo>,
    #[serde(with = "crate::models::timestamp")]
    pub looked_up_at: DateTime<Utc>,
}

impl GeoCacheEntry {
    pub fn found(info: GeoInfo) -> Self {
        Self {
            status: GeoCacheStatus::Found,
            info: Some(info),
            looked_up_at: Utc::now(),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: GeoCacheStatus::Failed,
            info: None,
            looked_up_at: Utc::now(),
        }
    }

    pub fn into_lookup(self) -> GeoLookup {
        match (self.status, self.info) {
            (GeoCacheStatus::Found, Some(info)) => GeoLookup::Found(info),
            _ => GeoLookup::Failed,
        }
    }
}
