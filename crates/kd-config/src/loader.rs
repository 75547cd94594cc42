//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError, PrincipalConfig};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "keydelegate.toml",
    "config.toml",
    "./config/keydelegate.toml",
    "/etc/keydelegate/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config, |key| env::var(key).ok())?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured path does not exist, searching defaults");
        }

        if let Ok(path) = env::var("KEYDELEGATE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides<F>(&self, config: &mut AppConfig, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // HTTP
        if let Some(port) = var("KEYDELEGATE_HTTP_PORT").and_then(|v| v.parse().ok()) {
            config.http.port = port;
        }
        if let Some(val) = var("KEYDELEGATE_HTTP_HOST") {
            config.http.host = val;
        }

        // Renewal
        if let Some(val) = var("KEYDELEGATE_RENEWAL_ENABLED") {
            config.renewal.enabled = val.parse().unwrap_or(true);
        }
        if let Some(interval) = var("KEYDELEGATE_RENEWAL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            config.renewal.interval_secs = interval;
        }

        // Capability
        if let Some(val) = var("KEYDELEGATE_CAPABILITY_PROVIDER") {
            config.capability.provider = val;
        }
        if let Some(val) = var("KEYDELEGATE_DEFAULT_REALM") {
            config.capability.default_realm = val;
        }
        if let Some(lifetime) = var("KEYDELEGATE_TICKET_LIFETIME_SECS").and_then(|v| v.parse().ok()) {
            config.capability.ticket_lifetime_secs = lifetime;
        }
        if let Some(window) = var("KEYDELEGATE_RENEW_WINDOW").and_then(|v| v.parse().ok()) {
            config.capability.renew_window = window;
        }

        // Principals: "identity=keytab,identity2=keytab2"
        if let Some(val) = var("KEYDELEGATE_PRINCIPALS") {
            for pair in val.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (identity, keytab) = pair.split_once('=').ok_or_else(|| {
                    ConfigError::ValidationError(format!(
                        "KEYDELEGATE_PRINCIPALS entry '{}' is not identity=keytab",
                        pair
                    ))
                })?;
                config
                    .principals
                    .push(PrincipalConfig::new(identity.trim(), keytab.trim()));
            }
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
