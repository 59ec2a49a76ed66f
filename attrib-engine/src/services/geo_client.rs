//! Geolocation API client
//!
//! Looks up city, region, country and network owner for an IP address.
//! Requests are rate limited with a token bucket and bounded by a short
//! timeout; callers treat every error as "location unknown".

use crate::models::GeoInfo;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://ipinfo.io";
const USER_AGENT: &str = concat!("attrib-engine/", env!("CARGO_PKG_VERSION"));

/// Geolocation errors
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("No geolocation API token configured")]
    MissingToken,

    #[error("Geolocation request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("API error {0}")]
    Status(u16),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Source of IP geolocation
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn geolocate(&self, ip: &str) -> Result<GeoInfo, GeoError>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// ipinfo-style response; `org` carries "AS7922 Comcast Cable Communications, LLC"
#[derive(Debug, Deserialize)]
struct GeoApiResponse {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    bogon: bool,
}

impl GeoApiResponse {
    fn into_info(self) -> Option<GeoInfo> {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let info = GeoInfo {
            city: clean(self.city),
            region: clean(self.region),
            country: clean(self.country),
            isp: clean(self.isp).or_else(|| clean(self.org)),
            timezone: clean(self.timezone),
        };
        (!self.bogon && info.has_location()).then_some(info)
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct GeoClientSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub requests_per_minute: u32,
}

impl Default for GeoClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout: Duration::from_secs(3),
            requests_per_minute: 600,
        }
    }
}

/// HTTP geolocation provider
pub struct HttpGeoProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl HttpGeoProvider {
    pub fn new(settings: GeoClientSettings) -> Result<Self, GeoError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .build()
            .map_err(|e| GeoError::Network(e.to_string()))?;

        let per_minute = NonZeroU32::new(settings.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_minute(per_minute));

        if settings.token.is_none() {
            tracing::warn!("Geolocation token not configured; geo correlation finds no matches");
        }

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token: settings.token,
            rate_limiter,
        })
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn geolocate(&self, ip: &str) -> Result<GeoInfo, GeoError> {
        let token = self.token.as_deref().ok_or(GeoError::MissingToken)?;

        self.rate_limiter.until_ready().await;

        let url = format!("{}/{}/json", self.base_url, ip);
        tracing::debug!(ip = %ip, "Querying geolocation API");

        let response = self
            .client
            .get(&url)
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GeoError::Timeout
                } else {
                    GeoError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(GeoError::RateLimited);
        }
        if !status.is_success() {
            return Err(GeoError::Status(status.as_u16()));
        }

        let body: GeoApiResponse = response
            .json()
            .await
            .map_err(|e| GeoError::Parse(e.to_string()))?;

        body.into_info()
            .ok_or_else(|| GeoError::Parse(format!("no location for {}", ip)))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
