//! KeyDelegate Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! The `[[principals]]` table lists the identities the agent enables, each
//! bound to the keytab that authenticates it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub renewal: RenewalConfig,
    pub capability: CapabilityConfig,

    /// Identities to enable, in configuration order
    pub principals: Vec<PrincipalConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            renewal: RenewalConfig::default(),
            capability: CapabilityConfig::default(),
            principals: Vec::new(),
        }
    }
}

/// HTTP status server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Ticket renewal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

/// Security capability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Capability provider name ("keytab")
    pub provider: String,
    /// Realm appended to identities that do not carry one
    pub default_realm: String,
    pub ticket_lifetime_secs: u64,
    /// Fraction of the ticket lifetime after which renewal re-authenticates
    pub renew_window: f64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            provider: "keytab".to_string(),
            default_realm: String::new(),
            ticket_lifetime_secs: 36000, // 10 hours
            renew_window: 0.8,
        }
    }
}

/// One configured identity and the keytab that authenticates it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrincipalConfig {
    pub identity: String,
    /// Keytab path; `${NAME}` references are expanded from the environment
    pub keytab: String,
    /// Settings handed to the capability before login and renewal
    pub context: BTreeMap<String, String>,
}

impl PrincipalConfig {
    pub fn new(identity: impl Into<String>, keytab: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            keytab: keytab.into(),
            context: BTreeMap::new(),
        }
    }

    /// Keytab path with environment references expanded.
    pub fn resolved_keytab(&self) -> Result<PathBuf, ConfigError> {
        expand_env(&self.keytab, |name| std::env::var(name).ok()).map(PathBuf::from)
    }
}

/// Expand `${NAME}` references in `input` using `lookup`.
pub fn expand_env<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            ConfigError::ValidationError(format!("Unterminated variable reference in '{}'", input))
        })?;
        let name = &after[..end];
        if name.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Empty variable reference in '{}'",
                input
            )));
        }
        let value = lookup(name).ok_or_else(|| {
            ConfigError::ValidationError(format!("Environment variable {} is not defined", name))
        })?;
        output.push_str(&value);
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Check the configuration for values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renewal.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "renewal.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.renewal.enabled && self.renewal.interval_secs >= self.capability.ticket_lifetime_secs {
            return Err(ConfigError::ValidationError(format!(
                "renewal.interval_secs ({}) must be shorter than capability.ticket_lifetime_secs ({})",
                self.renewal.interval_secs, self.capability.ticket_lifetime_secs
            )));
        }
        if !(self.capability.renew_window > 0.0 && self.capability.renew_window <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "capability.renew_window must be in (0, 1], got {}",
                self.capability.renew_window
            )));
        }

        let mut seen = HashSet::new();
        for (index, principal) in self.principals.iter().enumerate() {
            let identity = principal.identity.trim();
            if identity.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "principals[{}].identity must not be blank",
                    index
                )));
            }
            if principal.keytab.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "principals[{}].keytab must not be blank for {}",
                    index, identity
                )));
            }
            if !seen.insert(identity.to_string()) {
                return Err(ConfigError::ValidationError(format!(
                    "identity {} is configured more than once",
                    identity
                )));
            }
        }

        Ok(())
    }

    /// Check that every principal's keytab resolves to an existing file.
    pub fn validate_keytabs(&self) -> Result<(), ConfigError> {
        for principal in &self.principals {
            let keytab = principal.resolved_keytab()?;
            if !keytab.is_file() {
                return Err(ConfigError::ValidationError(format!(
                    "keytab {} for {} does not exist or is not a file",
                    keytab.display(),
                    principal.identity.trim()
                )));
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# KeyDelegate Configuration
# Environment variables override these settings

[http]
port = 8080
host = "0.0.0.0"

[renewal]
enabled = true
interval_secs = 60

[capability]
provider = "keytab"
default_realm = "EXAMPLE.COM"
ticket_lifetime_secs = 36000
renew_window = 0.8

[[principals]]
identity = "etl/ingest.example.com@EXAMPLE.COM"
keytab = "${KEYTAB_DIR}/etl.keytab"

[[principals]]
identity = "reporting"
keytab = "/etc/security/keytabs/reporting.keytab"

[principals.context]
default_realm = "REPORTS.EXAMPLE.COM"
"#
        .to_string()
    }
}
