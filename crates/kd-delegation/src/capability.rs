//! Pluggable security capability
//!
//! Everything the core needs from an external security library:
//! - a provider that loads a fresh capability instance into a boundary
//! - a login entry point taking a principal and a keytab
//! - a run-as entry point on the resulting session
//! - a check-and-renew entry point on the same session
//!
//! Namespace creation is owned by [`crate::boundary`]. Any library exposing
//! this shape can back the registry.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::boundary::BoundaryId;

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Capability not available: {0}")]
    NotAvailable(String),
    #[error("Login rejected: {0}")]
    LoginRejected(String),
    #[error("Renewal rejected: {0}")]
    RenewalRejected(String),
    #[error("Ticket for {0} has expired")]
    Expired(String),
    #[error("Malformed keytab: {0}")]
    MalformedKeytab(String),
    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability-specific settings applied before login and renewal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthContext {
    settings: BTreeMap<String, String>,
}

impl AuthContext {
    pub const DEFAULT_REALM: &'static str = "default_realm";
    pub const KDC: &'static str = "kdc";
    pub const TICKET_LIFETIME_SECS: &'static str = "ticket_lifetime_secs";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Overlay `other` on top of this context; keys in `other` win.
    pub fn merge(&mut self, other: &AuthContext) {
        for (key, value) in &other.settings {
            self.settings.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.settings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<BTreeMap<String, String>> for AuthContext {
    fn from(settings: BTreeMap<String, String>) -> Self {
        Self { settings }
    }
}

/// Loads capability instances, one per isolation boundary.
pub trait CapabilityProvider: Send + Sync {
    /// Provider name
    fn name(&self) -> &str;

    /// Load a fresh capability instance for `boundary`. Instances must not
    /// share mutable state with instances loaded for other boundaries.
    fn load(&self, boundary: BoundaryId) -> Result<Arc<dyn SecurityCapability>, CapabilityError>;
}

/// One identity's instance of the external security library.
pub trait SecurityCapability: Send + Sync {
    /// Apply settings that hold for every later call on this instance.
    fn configure(&self, context: &AuthContext) -> Result<(), CapabilityError>;

    /// Log `principal` in from `keytab`, returning the authenticated session.
    fn login_from_keytab(&self, principal: &str, keytab: &Path) -> Result<Arc<dyn Session>, CapabilityError>;
}

/// An authenticated session produced by [`SecurityCapability::login_from_keytab`].
pub trait Session: Send + Sync {
    fn principal(&self) -> &str;

    /// Run `action` as this session's subject.
    fn run_as(&self, action: &mut dyn FnMut()) -> Result<(), CapabilityError>;

    /// Re-authenticate if the ticket is close to expiry. `Ok(None)` means the
    /// session was refreshed in place (or needed nothing); `Ok(Some(_))` hands
    /// back a replacement session.
    fn check_and_relogin(&self) -> Result<Option<Arc<dyn Session>>, CapabilityError>;

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}
