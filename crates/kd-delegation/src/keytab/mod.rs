//! Keytab-backed capability
//!
//! The built-in [`CapabilityProvider`]. Login succeeds when the keytab file is
//! a readable MIT keytab holding an entry for the principal; the resulting
//! ticket lives for `ticket_lifetime` and is re-obtained from the keytab once
//! `renew_window` of that lifetime has elapsed.
//!
//! While work runs through [`Session::run_as`], [`current_subject`] returns the
//! session's principal on that thread.

mod format;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::boundary::BoundaryId;
use crate::capability::{AuthContext, CapabilityError, CapabilityProvider, SecurityCapability, Session};
use crate::principal::Principal;

pub use format::{parse_keytab, write_keytab, KeytabEntry};

thread_local! {
    static CURRENT_SUBJECT: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Principal of the session whose run-as is executing on this thread.
pub fn current_subject() -> Option<String> {
    CURRENT_SUBJECT.with(|subject| subject.borrow().clone())
}

struct SubjectGuard {
    previous: Option<String>,
}

impl SubjectGuard {
    fn enter(principal: &str) -> Self {
        let previous = CURRENT_SUBJECT.with(|subject| subject.replace(Some(principal.to_string())));
        Self { previous }
    }
}

impl Drop for SubjectGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_SUBJECT.with(|subject| *subject.borrow_mut() = previous);
    }
}

/// Settings every keytab capability instance starts with.
#[derive(Debug, Clone)]
pub struct KeytabSettings {
    pub default_realm: Option<String>,
    pub kdc: Option<String>,
    pub ticket_lifetime: Duration,
    /// Fraction of `ticket_lifetime` after which renewal re-reads the keytab
    pub renew_window: f64,
}

impl Default for KeytabSettings {
    fn default() -> Self {
        Self {
            default_realm: None,
            kdc: None,
            ticket_lifetime: Duration::from_secs(10 * 60 * 60),
            renew_window: 0.8,
        }
    }
}

impl KeytabSettings {
    fn apply(&mut self, context: &AuthContext) -> Result<(), CapabilityError> {
        if let Some(realm) = context.get(AuthContext::DEFAULT_REALM) {
            self.default_realm = Some(realm.to_string()).filter(|r| !r.is_empty());
        }
        if let Some(kdc) = context.get(AuthContext::KDC) {
            self.kdc = Some(kdc.to_string()).filter(|k| !k.is_empty());
        }
        if let Some(lifetime) = context.get(AuthContext::TICKET_LIFETIME_SECS) {
            let secs = lifetime.parse::<u64>().map_err(|e| CapabilityError::InvalidSetting {
                key: AuthContext::TICKET_LIFETIME_SECS.to_string(),
                reason: e.to_string(),
            })?;
            self.ticket_lifetime = Duration::from_secs(secs);
        }
        Ok(())
    }
}

pub struct KeytabCapabilityProvider {
    settings: KeytabSettings,
}

impl KeytabCapabilityProvider {
    pub fn new(settings: KeytabSettings) -> Self {
        Self { settings }
    }
}

impl Default for KeytabCapabilityProvider {
    fn default() -> Self {
        Self::new(KeytabSettings::default())
    }
}

impl CapabilityProvider for KeytabCapabilityProvider {
    fn name(&self) -> &str {
        "keytab"
    }

    fn load(&self, boundary: BoundaryId) -> Result<Arc<dyn SecurityCapability>, CapabilityError> {
        Ok(Arc::new(KeytabCapability {
            boundary,
            settings: RwLock::new(self.settings.clone()),
        }))
    }
}

/// One boundary's keytab capability instance.
pub struct KeytabCapability {
    boundary: BoundaryId,
    settings: RwLock<KeytabSettings>,
}

impl KeytabCapability {
    pub fn settings(&self) -> KeytabSettings {
        self.settings.read().clone()
    }
}

impl SecurityCapability for KeytabCapability {
    fn configure(&self, context: &AuthContext) -> Result<(), CapabilityError> {
        // Apply to a copy so a bad setting leaves the instance untouched.
        let mut settings = self.settings.read().clone();
        settings.apply(context)?;
        *self.settings.write() = settings;
        Ok(())
    }

    fn login_from_keytab(&self, principal: &str, keytab: &Path) -> Result<Arc<dyn Session>, CapabilityError> {
        let settings = self.settings();
        let parsed = Principal::parse(principal.trim())
            .map_err(|e| CapabilityError::LoginRejected(e.to_string()))?;
        let qualified = parsed
            .qualified(settings.default_realm.as_deref())
            .ok_or_else(|| {
                CapabilityError::LoginRejected(format!(
                    "{} has no realm and no default_realm is configured",
                    parsed
                ))
            })?;

        verify_keytab(&qualified, keytab).map_err(|e| match e {
            CapabilityError::Io(io) => {
                CapabilityError::LoginRejected(format!("unable to read keytab {}: {}", keytab.display(), io))
            }
            other => other,
        })?;

        let session = KeytabSession::new(qualified, keytab.to_path_buf(), &settings);
        info!(
            principal = %session.principal,
            boundary = %self.boundary,
            kdc = settings.kdc.as_deref().unwrap_or("default"),
            expires_at = %session.ticket.read().expires_at,
            "Obtained ticket from keytab"
        );
        Ok(Arc::new(session))
    }
}

fn verify_keytab(principal: &str, keytab: &Path) -> Result<(), CapabilityError> {
    let bytes = std::fs::read(keytab)?;
    let entries = parse_keytab(&bytes)?;
    if entries.iter().any(|entry| entry.principal == principal) {
        Ok(())
    } else {
        Err(CapabilityError::LoginRejected(format!(
            "keytab {} has no entry for {}",
            keytab.display(),
            principal
        )))
    }
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Ticket {
    fn issue(lifetime: Duration) -> Self {
        let issued_at = Utc::now();
        Self {
            issued_at,
            expires_at: offset(issued_at, lifetime),
        }
    }
}

/// `at + duration`, saturating at the latest representable instant.
fn offset(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct KeytabSession {
    principal: String,
    keytab: PathBuf,
    lifetime: Duration,
    renew_window: f64,
    ticket: RwLock<Ticket>,
}

impl KeytabSession {
    fn new(principal: String, keytab: PathBuf, settings: &KeytabSettings) -> Self {
        Self {
            principal,
            keytab,
            lifetime: settings.ticket_lifetime,
            renew_window: settings.renew_window,
            ticket: RwLock::new(Ticket::issue(settings.ticket_lifetime)),
        }
    }

    pub fn keytab(&self) -> &Path {
        &self.keytab
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.ticket.read().issued_at
    }

    fn refresh_due(&self, ticket: &Ticket, now: DateTime<Utc>) -> bool {
        let fraction = if self.renew_window.is_finite() {
            self.renew_window.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let window = Duration::try_from_secs_f64(self.lifetime.as_secs_f64() * fraction).unwrap_or(self.lifetime);
        now >= offset(ticket.issued_at, window)
    }
}

impl Session for KeytabSession {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn run_as(&self, action: &mut dyn FnMut()) -> Result<(), CapabilityError> {
        if Utc::now() >= self.ticket.read().expires_at {
            return Err(CapabilityError::Expired(self.principal.clone()));
        }
        let _subject = SubjectGuard::enter(&self.principal);
        action();
        Ok(())
    }

    fn check_and_relogin(&self) -> Result<Option<Arc<dyn Session>>, CapabilityError> {
        let current = *self.ticket.read();
        if !self.refresh_due(&current, Utc::now()) {
            debug!(principal = %self.principal, expires_at = %current.expires_at, "Ticket still fresh");
            return Ok(None);
        }

        verify_keytab(&self.principal, &self.keytab).map_err(|e| {
            CapabilityError::RenewalRejected(format!("relogin from {} failed: {}", self.keytab.display(), e))
        })?;

        let renewed = Ticket::issue(self.lifetime);
        *self.ticket.write() = renewed;
        info!(principal = %self.principal, expires_at = %renewed.expires_at, "Re-obtained ticket from keytab");
        Ok(None)
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.ticket.read().expires_at)
    }
}
