//! Configuration file loading, environment overrides, and validation.

use crate::error::ConfigError;
use crate::resolve::parse_size_limit;
use crate::types::{BuildConfig, FingerprintMode};
use std::path::{Path, PathBuf};

/// File name looked up in the project directory.
pub const CONFIG_FILE_NAME: &str = "kiln.toml";

/// Environment variable naming the metrics report path.
pub const ENV_METRICS_PATH: &str = "KILN_METRICS_PATH";
/// Environment variable selecting the fingerprint mode.
pub const ENV_FINGERPRINT_MODE: &str = "KILN_FINGERPRINT_MODE";
/// Environment variable overriding `cache.limit_size`.
pub const ENV_CACHE_LIMIT_SIZE: &str = "KILN_CACHE_LIMIT_SIZE";

/// Loads and validates `kiln.toml` from a project directory.
///
/// Environment overrides from the current process are applied after parsing.
pub fn load_config(project_dir: &Path) -> Result<BuildConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE_NAME);
    let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::IoError {
        path: config_path.clone(),
        source,
    })?;
    let mut config = load_config_from_str(&content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Parses and validates a configuration from a string.
///
/// Does not consult the environment.
pub fn load_config_from_str(content: &str) -> Result<BuildConfig, ConfigError> {
    let config: BuildConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Applies `KILN_*` environment overrides using the given lookup function.
///
/// Taking the lookup as a closure keeps tests independent of process state.
pub fn apply_env_overrides(
    config: &mut BuildConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(path) = lookup(ENV_METRICS_PATH).filter(|v| !v.is_empty()) {
        config.build.metrics_path = Some(PathBuf::from(path));
    }
    if let Some(mode) = lookup(ENV_FINGERPRINT_MODE).filter(|v| !v.is_empty()) {
        config.build.fingerprint = FingerprintMode::from_name(&mode).ok_or_else(|| {
            ConfigError::ValidationError(format!("unknown {ENV_FINGERPRINT_MODE}: '{mode}'"))
        })?;
    }
    if let Some(limit) = lookup(ENV_CACHE_LIMIT_SIZE).filter(|v| !v.is_empty()) {
        if parse_size_limit(&limit).is_none() {
            return Err(ConfigError::InvalidSizeLimit {
                setting: ENV_CACHE_LIMIT_SIZE.to_string(),
                value: limit,
            });
        }
        config.cache.limit_size = Some(limit);
    }
    Ok(())
}

/// Validates value ranges and syntaxes that serde cannot express.
fn validate_config(config: &BuildConfig) -> Result<(), ConfigError> {
    if config.build.jobs == Some(0) {
        return Err(ConfigError::ValidationError(
            "build.jobs must be at least 1".to_string(),
        ));
    }
    if config.build.root.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "build.root must not be empty".to_string(),
        ));
    }
    if let Some(limit) = &config.cache.limit_size {
        if parse_size_limit(limit).is_none() {
            return Err(ConfigError::InvalidSizeLimit {
                setting: "cache.limit_size".to_string(),
                value: limit.clone(),
            });
        }
    }
    if let Some(percent) = config.cache.limit_percent {
        if percent > 100 {
            return Err(ConfigError::ValidationError(format!(
                "cache.limit_percent must be between 0 and 100, got {percent}"
            )));
        }
    }
    Ok(())
}
