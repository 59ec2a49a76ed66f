//! Engine configuration
//!
//! Loaded from the `attrib.toml` bootstrap file (see
//! [`attrib_common::config::resolve_config_path`]) with environment
//! overrides for secrets. Every field has a compiled default so an empty or
//! missing file yields a working configuration apart from the store URL,
//! which is resolved separately and is mandatory.

use crate::error::{EngineError, EngineResult};
use crate::models::{AttributionModel, MatchOptions};
use crate::services::attribution_pass::{PassDefinition, PassKind, RevisitTarget};
use crate::services::geo_client::GeoClientSettings;
use crate::services::index_builder::IndexBuilderConfig;
use attrib_common::config::{
    load_toml_config, resolve_config_path, resolve_setting, LoggingConfig, StoreConfig,
    GEO_TOKEN_ENV_VAR,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const DAY_SECS: u64 = 24 * 3600;

/// Marker namespace of the pending pass
pub const PENDING_NAMESPACE: &str = "pending";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Recovery passes; the built-in presets apply when empty
    #[serde(default)]
    pub recovery: Vec<RecoveryPassConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
    /// Provider calls allowed per invocation
    pub call_budget: u32,
    pub cache_ttl_secs: u64,
    /// Expiry of the failure sentinel
    pub failure_ttl_secs: u64,
    pub requests_per_minute: u32,
}

impl Default for GeoConfig {
    fn default() -> Self {
        let client = GeoClientSettings::default();
        Self {
            base_url: client.base_url,
            token: None,
            timeout_ms: client.timeout.as_millis() as u64,
            call_budget: 10,
            cache_ttl_secs: DAY_SECS,
            failure_ttl_secs: 3600,
            requests_per_minute: client.requests_per_minute,
        }
    }
}

impl GeoConfig {
    pub fn client_settings(&self) -> GeoClientSettings {
        GeoClientSettings {
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            requests_per_minute: self.requests_per_minute,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub patterns: Vec<String>,
    pub high_risk_ranges: Vec<String>,
    pub page_size: usize,
    pub verification_page_size: usize,
    pub capacity: usize,
    pub hour_capacity: usize,
    /// 0 keeps entries until the next rebuild replaces them
    pub entry_ttl_secs: u64,
    pub stage_ttl_secs: u64,
    pub budget_secs: u64,
    pub max_pages: Option<u32>,
    pub concurrency: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let builder = IndexBuilderConfig::default();
        Self {
            patterns: builder.patterns,
            high_risk_ranges: builder.high_risk_ranges,
            page_size: builder.page_size,
            verification_page_size: builder.verification_page_size,
            capacity: builder.capacity,
            hour_capacity: builder.hour_capacity,
            entry_ttl_secs: builder.entry_ttl.map(|ttl| ttl.as_secs()).unwrap_or(0),
            stage_ttl_secs: builder.stage_ttl.as_secs(),
            budget_secs: 240,
            max_pages: builder.max_pages,
            concurrency: builder.concurrency,
        }
    }
}

impl IndexConfig {
    pub fn builder_config(&self) -> IndexBuilderConfig {
        IndexBuilderConfig {
            patterns: self.patterns.clone(),
            high_risk_ranges: self.high_risk_ranges.clone(),
            page_size: self.page_size.max(1),
            verification_page_size: self.verification_page_size.max(1),
            capacity: self.capacity.max(1),
            hour_capacity: self.hour_capacity.max(1),
            concurrency: self.concurrency.max(1),
            entry_ttl: (self.entry_ttl_secs > 0).then(|| Duration::from_secs(self.entry_ttl_secs)),
            stage_ttl: Duration::from_secs(self.stage_ttl_secs.max(3600)),
            max_pages: self.max_pages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub model: AttributionModel,
    pub lookback_days: u32,
    pub geo_window_minutes: Vec<u32>,
    /// Minimum geo score accepted (never below 40)
    pub geo_acceptance_score: u32,
    /// Conversion addresses geolocated per resolution
    pub max_geo_ips: usize,
    /// Candidate visits examined per resolution
    pub max_geo_candidates: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        let options = MatchOptions::default();
        Self {
            model: options.model,
            lookback_days: options.lookback_days,
            geo_window_minutes: options.geo_windows_minutes,
            geo_acceptance_score: 40,
            max_geo_ips: 3,
            max_geo_candidates: 200,
        }
    }
}

impl MatchingConfig {
    pub fn options(&self) -> MatchOptions {
        MatchOptions {
            model: self.model,
            lookback_days: self.lookback_days,
            geo_windows_minutes: self.geo_window_minutes.clone(),
        }
    }
}

/// Settings shared by the pending and recovery passes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub conversion_pattern: String,
    pub page_size: usize,
    pub concurrency: usize,
    pub budget_secs: u64,
    pub max_pages: Option<u32>,
    pub marker_ttl_days: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            conversion_pattern: "conversion:*".to_string(),
            page_size: 100,
            concurrency: 10,
            budget_secs: 240,
            max_pages: None,
            marker_ttl_days: 30,
        }
    }
}

/// One `[[recovery]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPassConfig {
    pub name: String,
    /// Defaults to `recovery-{name}`
    #[serde(default)]
    pub namespace: Option<String>,
    pub geo_window_minutes: Vec<u32>,
    #[serde(default = "default_revisit")]
    pub revisit: Vec<RevisitTarget>,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub model: Option<AttributionModel>,
}

fn default_revisit() -> Vec<RevisitTarget> {
    vec![RevisitTarget::NoMatch, RevisitTarget::Geo]
}

impl RecoveryPassConfig {
    fn preset(name: &str, windows: &[u32], revisit: Vec<RevisitTarget>) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
            geo_window_minutes: windows.to_vec(),
            revisit,
            lookback_days: None,
            model: None,
        }
    }

    /// Presets used when no `[[recovery]]` table is configured
    pub fn presets() -> Vec<Self> {
        vec![
            Self::preset("geo-24h", &[1440], vec![RevisitTarget::NoMatch]),
            Self::preset("deep-dive-90", &[90], default_revisit()),
            Self::preset("staged", &[15, 45, 120], default_revisit()),
        ]
    }

    pub fn namespace(&self) -> String {
        self.namespace
            .clone()
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| format!("recovery-{}", self.name))
    }
}

impl EngineConfig {
    /// Load the TOML file and apply environment overrides
    ///
    /// The store URL is not resolved here; see
    /// [`attrib_common::config::resolve_database_url`].
    pub fn load(cli_path: Option<&Path>) -> attrib_common::Result<Self> {
        let path = resolve_config_path(cli_path);
        let mut config: EngineConfig = load_toml_config(path.as_deref())?;

        config.geo.token = resolve_setting(
            "geo.token",
            None,
            GEO_TOKEN_ENV_VAR,
            config.geo.token.as_deref(),
        )
        .map(|(token, source)| {
            info!("Geolocation token loaded from {}", source.as_str());
            token
        });

        Ok(config)
    }

    pub fn recovery_passes(&self) -> Vec<RecoveryPassConfig> {
        if self.recovery.is_empty() {
            RecoveryPassConfig::presets()
        } else {
            self.recovery.clone()
        }
    }

    fn pass(
        &self,
        name: String,
        namespace: String,
        kind: PassKind,
        options: MatchOptions,
    ) -> PassDefinition {
        PassDefinition {
            name,
            namespace,
            kind,
            options,
            conversion_pattern: self.batch.conversion_pattern.clone(),
            page_size: self.batch.page_size.max(1),
            concurrency: self.batch.concurrency.max(1),
            max_pages: self.batch.max_pages,
            marker_ttl: Duration::from_secs(self.batch.marker_ttl_days.max(1) * DAY_SECS),
        }
    }

    pub fn pending_pass(&self, options: MatchOptions) -> PassDefinition {
        self.pass(
            PENDING_NAMESPACE.to_string(),
            PENDING_NAMESPACE.to_string(),
            PassKind::Pending,
            options,
        )
    }

    pub fn recovery_pass(&self, name: &str) -> EngineResult<PassDefinition> {
        let pass = self
            .recovery_passes()
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| EngineError::UnknownPass(name.to_string()))?;

        if pass.geo_window_minutes.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "recovery pass {} has no geo windows",
                pass.name
            )));
        }

        let mut windows = pass.geo_window_minutes.clone();
        windows.sort_unstable();
        windows.dedup();

        let options = MatchOptions {
            model: pass.model.unwrap_or(self.matching.model),
            lookback_days: pass.lookback_days.unwrap_or(self.matching.lookback_days),
            geo_windows_minutes: windows,
        };
        let namespace = pass.namespace();
        Ok(self.pass(
            pass.name,
            namespace,
            PassKind::Recovery {
                revisit: pass.revisit,
            },
            options,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("attrib.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    #[serial]
    fn test_empty_file_yields_defaults_and_presets() {
        std::env::remove_var(GEO_TOKEN_ENV_VAR);
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, "");

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.index.capacity, 50);
        assert_eq!(config.matching.lookback_days, 14);
        assert_eq!(config.matching.geo_window_minutes, vec![1440]);
        assert_eq!(config.geo.call_budget, 10);
        assert_eq!(config.geo.cache_ttl_secs, 86_400);
        assert!(config.geo.token.is_none());

        let names: Vec<String> = config.recovery_passes().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["geo-24h", "deep-dive-90", "staged"]);

        let staged = config.recovery_pass("staged").unwrap();
        assert_eq!(staged.options.geo_windows_minutes, vec![15, 45, 120]);
        assert_eq!(staged.namespace, "recovery-staged");
    }

    #[test]
    #[serial]
    fn test_configured_passes_replace_presets() {
        std::env::remove_var(GEO_TOKEN_ENV_VAR);
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[matching]
model = "first_touch"
lookback_days = 21

[[recovery]]
name = "wide"
namespace = "wide-v2"
geo_window_minutes = [120, 30, 120]
revisit = ["geo"]
"#,
        );

        let config = EngineConfig::load(Some(&path)).unwrap();
        let pass = config.recovery_pass("wide").unwrap();
        assert_eq!(pass.namespace, "wide-v2");
        assert_eq!(pass.options.geo_windows_minutes, vec![30, 120]);
        assert_eq!(pass.options.model, AttributionModel::FirstTouch);
        assert_eq!(pass.options.lookback_days, 21);
        assert_eq!(
            pass.kind,
            PassKind::Recovery {
                revisit: vec![RevisitTarget::Geo]
            }
        );

        assert!(matches!(
            config.recovery_pass("staged"),
            Err(EngineError::UnknownPass(_))
        ));
    }

    #[test]
    #[serial]
    fn test_geo_token_from_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, "[geo]\ntoken = \"from-file\"\n");

        std::env::set_var(GEO_TOKEN_ENV_VAR, "from-env");
        let config = EngineConfig::load(Some(&path));
        std::env::remove_var(GEO_TOKEN_ENV_VAR);

        assert_eq!(config.unwrap().geo.token.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_zero_entry_ttl_means_no_expiry() {
        let index = IndexConfig {
            entry_ttl_secs: 0,
            ..Default::default()
        };
        assert!(index.builder_config().entry_ttl.is_none());
    }
}
