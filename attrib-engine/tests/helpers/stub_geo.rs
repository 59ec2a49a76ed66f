//! In-process geolocation providers

use async_trait::async_trait;
use attrib_engine::models::GeoInfo;
use attrib_engine::services::{GeoError, GeoProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Answers from a fixed table; unknown addresses fail with 404
#[derive(Default)]
pub struct StubGeoProvider {
    answers: HashMap<String, GeoInfo>,
    calls: AtomicUsize,
}

impl StubGeoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: &str, city: &str, region: &str, country: &str, isp: &str) -> Self {
        self.answers.insert(
            ip.to_string(),
            GeoInfo {
                city: Some(city.to_string()),
                region: Some(region.to_string()),
                country: Some(country.to_string()),
                isp: Some(isp.to_string()),
                timezone: None,
            },
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoProvider for StubGeoProvider {
    async fn geolocate(&self, ip: &str) -> Result<GeoInfo, GeoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers.get(ip).cloned().ok_or(GeoError::Status(404))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Every call times out
#[derive(Default)]
pub struct UnavailableGeoProvider {
    calls: AtomicUsize,
}

impl UnavailableGeoProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoProvider for UnavailableGeoProvider {
    async fn geolocate(&self, _ip: &str) -> Result<GeoInfo, GeoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GeoError::Timeout)
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}
