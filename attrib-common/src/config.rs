//! Bootstrap configuration loading and layered setting resolution
//!
//! Settings resolve in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV_VAR: &str = "ATTRIB_CONFIG";

/// Environment variable overriding `store.database_url`
pub const DATABASE_URL_ENV_VAR: &str = "ATTRIB_DATABASE_URL";

/// Environment variable overriding `geo.token`
pub const GEO_TOKEN_ENV_VAR: &str = "ATTRIB_GEO_TOKEN";

const CONFIG_FILE_NAME: &str = "attrib.toml";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or full filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Record store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sqlx connection URL, e.g. `sqlite:/var/lib/attrib/records.db?mode=rwc`
    #[serde(default)]
    pub database_url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Total time to keep retrying a locked database before giving up
    #[serde(default = "default_max_lock_wait_ms")]
    pub max_lock_wait_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
            max_lock_wait_ms: default_max_lock_wait_ms(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_lock_wait_ms() -> u64 {
    5000
}

/// Where a resolved setting came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingSource {
    CommandLine,
    Environment,
    TomlFile,
}

impl SettingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingSource::CommandLine => "command line",
            SettingSource::Environment => "environment",
            SettingSource::TomlFile => "TOML config",
        }
    }
}

/// Resolve a single string setting across CLI → ENV → TOML
///
/// Blank values are treated as absent. Warns when more than one source
/// provides a value, since the lower-priority ones are silently shadowed.
pub fn resolve_setting(
    name: &str,
    cli_value: Option<&str>,
    env_var_name: &str,
    toml_value: Option<&str>,
) -> Option<(String, SettingSource)> {
    let env_value = std::env::var(env_var_name).ok();

    let candidates = [
        (cli_value, SettingSource::CommandLine),
        (env_value.as_deref(), SettingSource::Environment),
        (toml_value, SettingSource::TomlFile),
    ];

    let present: Vec<(&str, SettingSource)> = candidates
        .iter()
        .filter_map(|(value, source)| {
            value
                .filter(|v| !v.trim().is_empty())
                .map(|v| (v, *source))
        })
        .collect();

    if present.len() > 1 {
        let sources: Vec<&str> = present.iter().map(|(_, s)| s.as_str()).collect();
        warn!(
            setting = name,
            "Setting found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            present[0].1.as_str()
        );
    }

    present
        .first()
        .map(|(value, source)| (value.trim().to_string(), *source))
}

/// Resolve the record store URL; absence is a fatal configuration error
pub fn resolve_database_url(cli_value: Option<&str>, store: &StoreConfig) -> Result<String> {
    match resolve_setting(
        "store.database_url",
        cli_value,
        DATABASE_URL_ENV_VAR,
        store.database_url.as_deref(),
    ) {
        Some((url, source)) => {
            info!("Record store URL loaded from {}", source.as_str());
            Ok(url)
        }
        None => Err(Error::Config(format!(
            "Record store not configured. Provide one of:\n\
             1. Command line: --database-url sqlite:/path/to/records.db\n\
             2. Environment: {}=sqlite:/path/to/records.db\n\
             3. TOML config: [store] database_url = \"sqlite:/path/to/records.db\"",
            DATABASE_URL_ENV_VAR
        ))),
    }
}

/// Locate the TOML config file
///
/// Priority: explicit path → `ATTRIB_CONFIG` → user config dir → /etc.
/// Returns `None` when no file exists; callers fall back to defaults.
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("attrib").join(CONFIG_FILE_NAME));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/attrib").join(CONFIG_FILE_NAME);
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Load and parse a TOML config file, or defaults when there is none
///
/// A missing file is not an error (defaults + warning). A file that exists
/// but cannot be read or parsed is, because silently ignoring it would run
/// with settings the operator did not intend.
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No config file found, using built-in defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!(path = %path.display(), "Config file does not exist, using built-in defaults");
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;

    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!(path = %path.display(), "Loaded config file");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[derive(Debug, Default, Deserialize)]
    struct Sample {
        #[serde(default)]
        store: StoreConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    #[serial]
    fn test_cli_beats_env_and_toml() {
        std::env::set_var("ATTRIB_TEST_SETTING", "from-env");
        let resolved = resolve_setting(
            "test",
            Some("from-cli"),
            "ATTRIB_TEST_SETTING",
            Some("from-toml"),
        );
        std::env::remove_var("ATTRIB_TEST_SETTING");

        assert_eq!(
            resolved,
            Some(("from-cli".to_string(), SettingSource::CommandLine))
        );
    }

    #[test]
    #[serial]
    fn test_env_beats_toml() {
        std::env::set_var("ATTRIB_TEST_SETTING", "from-env");
        let resolved = resolve_setting("test", None, "ATTRIB_TEST_SETTING", Some("from-toml"));
        std::env::remove_var("ATTRIB_TEST_SETTING");

        assert_eq!(
            resolved,
            Some(("from-env".to_string(), SettingSource::Environment))
        );
    }

    #[test]
    #[serial]
    fn test_blank_values_are_ignored() {
        std::env::remove_var("ATTRIB_TEST_SETTING");
        let resolved = resolve_setting("test", Some("   "), "ATTRIB_TEST_SETTING", Some("toml"));
        assert_eq!(resolved, Some(("toml".to_string(), SettingSource::TomlFile)));
    }

    #[test]
    #[serial]
    fn test_missing_database_url_is_fatal() {
        std::env::remove_var(DATABASE_URL_ENV_VAR);
        let result = resolve_database_url(None, &StoreConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let sample: Sample = load_toml_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(sample.logging.level, "info");
        assert_eq!(sample.store.max_connections, 5);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[store\ndatabase_url = ").unwrap();

        let result: Result<Sample> = load_toml_config(Some(&path));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("attrib.toml");
        std::fs::write(&path, "[store]\ndatabase_url = \"sqlite::memory:\"\n").unwrap();

        let sample: Sample = load_toml_config(Some(&path)).unwrap();
        assert_eq!(sample.store.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(sample.store.max_lock_wait_ms, 5000);
        assert_eq!(sample.logging.level, "info");
    }
}
