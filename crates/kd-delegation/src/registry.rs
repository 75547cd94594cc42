//! Credential Registry
//!
//! Maps each enabled identity to its isolated authorization entry. Lookups are
//! lock-free per identity. Lifecycle transitions for one identity (enable,
//! disable and every renewal tick) run under that identity's lifecycle lock,
//! so they never interleave, while other identities proceed independently.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::authorization::{request_authorization, AuthorizationHandle};
use crate::boundary::{BoundaryId, IsolationBoundary};
use crate::capability::{AuthContext, CapabilityProvider};
use crate::credential::KeytabCredential;
use crate::error::{DelegationError, Result};
use crate::principal::Principal;
use crate::renewal::{self, RenewalConfig, RenewalTask};

/// Lifecycle state of an enabled identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Active,
    Renewing,
}

/// One enabled identity. Owned by the registry; the boundary never leaves it.
pub(crate) struct RegistryEntry {
    identity: String,
    principal: Principal,
    credential: KeytabCredential,
    context: Option<AuthContext>,
    boundary: IsolationBoundary,
    handle: RwLock<AuthorizationHandle>,
    state: RwLock<EntryState>,
    enabled_at: DateTime<Utc>,
    last_renewal: RwLock<Option<DateTime<Utc>>>,
    renewal_failures: AtomicU32,
    renewal: Mutex<Option<RenewalTask>>,
}

impl RegistryEntry {
    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn boundary(&self) -> &IsolationBoundary {
        &self.boundary
    }

    pub(crate) fn context(&self) -> Option<&AuthContext> {
        self.context.as_ref()
    }

    pub(crate) fn handle(&self) -> AuthorizationHandle {
        self.handle.read().clone()
    }

    pub(crate) fn set_state(&self, state: EntryState) {
        *self.state.write() = state;
    }

    pub(crate) fn record_renewal(&self, handle: AuthorizationHandle) {
        *self.handle.write() = handle;
        *self.last_renewal.write() = Some(Utc::now());
        self.renewal_failures.store(0, Ordering::SeqCst);
    }

    /// Returns the number of consecutive failures including this one.
    pub(crate) fn record_renewal_failure(&self) -> u32 {
        self.renewal_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn snapshot(&self) -> EntrySnapshot {
        let handle = self.handle();
        EntrySnapshot {
            identity: self.identity.clone(),
            principal: self.principal.clone(),
            keytab: self.credential.to_string(),
            boundary: self.boundary.id(),
            state: *self.state.read(),
            expires_at: handle.expires_at(),
            enabled_at: self.enabled_at,
            last_renewal: *self.last_renewal.read(),
            renewal_failures: self.renewal_failures.load(Ordering::SeqCst),
            handle,
        }
    }
}

/// Point-in-time view of an enabled identity.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub identity: String,
    pub principal: Principal,
    pub keytab: String,
    pub boundary: BoundaryId,
    pub state: EntryState,
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled_at: DateTime<Utc>,
    pub last_renewal: Option<DateTime<Utc>>,
    pub renewal_failures: u32,
    #[serde(skip_serializing)]
    pub handle: AuthorizationHandle,
}

/// Registry of per-identity isolated credentials.
pub struct CredentialRegistry {
    root: IsolationBoundary,
    renewal: RenewalConfig,
    entries: DashMap<String, Arc<RegistryEntry>>,
    lifecycle: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CredentialRegistry {
    /// Create a registry whose identities load their capability through
    /// `provider`, each starting from `defaults`.
    pub fn new(provider: Arc<dyn CapabilityProvider>, defaults: AuthContext, renewal: RenewalConfig) -> Self {
        Self {
            root: IsolationBoundary::root(provider, defaults),
            renewal,
            entries: DashMap::new(),
            lifecycle: DashMap::new(),
        }
    }

    pub fn renewal_config(&self) -> &RenewalConfig {
        &self.renewal
    }

    /// Log `identity` in inside a fresh boundary and register it.
    ///
    /// Fails with [`DelegationError::AlreadyConfigured`] if the identity is
    /// already enabled. On any failure the new boundary is disposed and the
    /// registry is left as it was.
    pub async fn enable(
        &self,
        identity: &str,
        credential: KeytabCredential,
        context: Option<AuthContext>,
    ) -> Result<()> {
        self.renewal.validate()?;
        let identity = normalize(identity)?;
        let principal = Principal::parse(&identity)?;

        let lock = self.lifecycle_lock(&identity);
        let _guard = lock.lock().await;

        if self.entries.contains_key(&identity) {
            return Err(DelegationError::AlreadyConfigured(identity));
        }

        let boundary = IsolationBoundary::create(&self.root, identity.clone());
        let login_identity = identity.clone();
        let (boundary, credential, context, result) = tokio::task::spawn_blocking(move || {
            let result = request_authorization(&boundary, &login_identity, &credential, context.as_ref());
            (boundary, credential, context, result)
        })
        .await?;

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                boundary.dispose();
                warn!(identity = %identity, error = %e, "Enable failed, boundary discarded");
                return Err(e);
            }
        };

        let entry = Arc::new(RegistryEntry {
            identity: identity.clone(),
            principal,
            credential,
            context,
            boundary,
            handle: RwLock::new(handle),
            state: RwLock::new(EntryState::Active),
            enabled_at: Utc::now(),
            last_renewal: RwLock::new(None),
            renewal_failures: AtomicU32::new(0),
            renewal: Mutex::new(None),
        });

        if self.renewal.enabled {
            let task = RenewalTask::spawn(Arc::downgrade(&entry), Arc::clone(&lock), self.renewal.interval);
            *entry.renewal.lock() = Some(task);
        }

        info!(
            identity = %identity,
            boundary = %entry.boundary.id(),
            keytab = %entry.credential,
            renewal = self.renewal.enabled,
            "Identity enabled"
        );
        self.entries.insert(identity, entry);
        self.publish_gauge();
        Ok(())
    }

    /// Remove `identity`, stop its renewal task and dispose its boundary.
    ///
    /// Does not return until the renewal task has terminated. Fails with
    /// [`DelegationError::NotFound`] if the identity is not enabled.
    pub async fn disable(&self, identity: &str) -> Result<()> {
        let identity = normalize(identity)?;

        let lock = self.lifecycle_lock(&identity);
        let _guard = lock.lock().await;

        let (_, entry) = self
            .entries
            .remove(&identity)
            .ok_or_else(|| DelegationError::NotFound(identity.clone()))?;
        self.publish_gauge();

        let task = entry.renewal.lock().take();
        if let Some(task) = task {
            task.stop().await;
            debug!(identity = %identity, "Renewal task stopped");
        }

        entry.boundary.dispose();
        info!(identity = %identity, boundary = %entry.boundary.id(), "Identity disabled");
        Ok(())
    }

    /// Run one renewal for `identity` now, under the same exclusivity as the
    /// scheduled ticks. Returns the handle in use afterwards.
    pub async fn renew_now(&self, identity: &str) -> Result<AuthorizationHandle> {
        let identity = normalize(identity)?;

        let lock = self.lifecycle_lock(&identity);
        let _guard = lock.lock().await;

        let entry = self
            .entry(&identity)
            .ok_or_else(|| DelegationError::NotFound(identity.clone()))?;
        renewal::renew_once(entry).await
    }

    pub fn lookup(&self, identity: &str) -> Option<EntrySnapshot> {
        self.entry(identity.trim()).map(|entry| entry.snapshot())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity.trim())
    }

    /// Snapshots of every enabled identity, ordered by identity.
    pub fn identities(&self) -> Vec<EntrySnapshot> {
        let mut snapshots: Vec<_> = self.entries.iter().map(|entry| entry.snapshot()).collect();
        snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, identity: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    // Locks are never removed: a waiter may already hold a clone.
    fn lifecycle_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.lifecycle
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        )
    }

    fn publish_gauge(&self) {
        metrics::gauge!("delegation.active_identities").set(self.entries.len() as f64);
    }
}

fn normalize(identity: &str) -> Result<String> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(DelegationError::InvalidArgument("identity can not be blank".to_string()));
    }
    Ok(identity.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityError, SecurityCapability, Session};
    use std::path::Path;
    use std::time::Duration;

    struct EchoSession(String);

    impl Session for EchoSession {
        fn principal(&self) -> &str {
            &self.0
        }

        fn run_as(&self, action: &mut dyn FnMut()) -> std::result::Result<(), CapabilityError> {
            action();
            Ok(())
        }

        fn check_and_relogin(&self) -> std::result::Result<Option<Arc<dyn Session>>, CapabilityError> {
            Ok(None)
        }
    }

    struct EchoCapability;

    impl SecurityCapability for EchoCapability {
        fn configure(&self, _: &AuthContext) -> std::result::Result<(), CapabilityError> {
            Ok(())
        }

        fn login_from_keytab(&self, principal: &str, keytab: &Path) -> std::result::Result<Arc<dyn Session>, CapabilityError> {
            if keytab.ends_with("missing.keytab") {
                return Err(CapabilityError::LoginRejected("keytab not found".to_string()));
            }
            Ok(Arc::new(EchoSession(principal.to_string())))
        }
    }

    struct EchoProvider;

    impl CapabilityProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn load(&self, _: BoundaryId) -> std::result::Result<Arc<dyn SecurityCapability>, CapabilityError> {
            Ok(Arc::new(EchoCapability))
        }
    }

    fn registry() -> CredentialRegistry {
        CredentialRegistry::new(
            Arc::new(EchoProvider),
            AuthContext::new(),
            RenewalConfig {
                enabled: false,
                interval: Duration::from_secs(60),
            },
        )
    }

    fn keytab(path: &str) -> KeytabCredential {
        KeytabCredential::new(path).unwrap()
    }

    #[tokio::test]
    async fn test_enable_registers_trimmed_identity() {
        let registry = registry();
        registry.enable("  etl/host@CORP ", keytab("/k/etl.keytab"), None).await.unwrap();

        let snapshot = registry.lookup("etl/host@CORP").unwrap();
        assert_eq!(snapshot.identity, "etl/host@CORP");
        assert_eq!(snapshot.principal.shortname(), "etl");
        assert_eq!(snapshot.state, EntryState::Active);
        assert_eq!(snapshot.keytab, "/k/etl.keytab");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_login_leaves_no_entry() {
        let registry = registry();
        let result = registry.enable("etl@CORP", keytab("/k/missing.keytab"), None).await;

        assert!(matches!(result, Err(DelegationError::Authentication { .. })));
        assert!(registry.lookup("etl@CORP").is_none());
        assert!(registry.is_empty());

        // A fresh attempt is not blocked by the failed one.
        registry.enable("etl@CORP", keytab("/k/etl.keytab"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_renewal_interval_rejected() {
        let registry = CredentialRegistry::new(
            Arc::new(EchoProvider),
            AuthContext::new(),
            RenewalConfig {
                enabled: true,
                interval: Duration::ZERO,
            },
        );
        assert!(matches!(
            registry.enable("etl@CORP", keytab("/k/etl.keytab"), None).await,
            Err(DelegationError::InvalidArgument(_))
        ));
        assert!(registry.is_empty());

        // Without renewal the interval is never used.
        let registry = CredentialRegistry::new(
            Arc::new(EchoProvider),
            AuthContext::new(),
            RenewalConfig {
                enabled: false,
                interval: Duration::ZERO,
            },
        );
        registry.enable("etl@CORP", keytab("/k/etl.keytab"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_identity_rejected_before_login() {
        let registry = registry();
        assert!(matches!(
            registry.enable("  ", keytab("/k/a.keytab"), None).await,
            Err(DelegationError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.enable("@CORP", keytab("/k/a.keytab"), None).await,
            Err(DelegationError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_disable_absent_identity_is_not_found() {
        let registry = registry();
        assert!(matches!(registry.disable("nobody@CORP").await, Err(DelegationError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_disable_disposes_boundary() {
        let registry = registry();
        registry.enable("etl@CORP", keytab("/k/etl.keytab"), None).await.unwrap();
        let entry = registry.entry("etl@CORP").unwrap();

        registry.disable("etl@CORP").await.unwrap();
        assert!(entry.boundary().is_disposed());
        assert!(!registry.contains("etl@CORP"));
    }

    #[tokio::test]
    async fn test_identities_are_sorted() {
        let registry = registry();
        for identity in ["zeta@R", "alpha@R", "mid@R"] {
            registry.enable(identity, keytab("/k/x.keytab"), None).await.unwrap();
        }
        let names: Vec<_> = registry.identities().into_iter().map(|s| s.identity).collect();
        assert_eq!(names, vec!["alpha@R", "mid@R", "zeta@R"]);
    }

    #[tokio::test]
    async fn test_each_identity_gets_its_own_boundary() {
        let registry = registry();
        registry.enable("a@R", keytab("/k/a.keytab"), None).await.unwrap();
        registry.enable("b@R", keytab("/k/b.keytab"), None).await.unwrap();

        let a = registry.lookup("a@R").unwrap();
        let b = registry.lookup("b@R").unwrap();
        assert_ne!(a.boundary, b.boundary);
        assert_eq!(a.handle.boundary(), a.boundary);
    }

    #[tokio::test]
    async fn test_renew_now_requires_entry() {
        let registry = registry();
        assert!(matches!(registry.renew_now("etl@R").await, Err(DelegationError::NotFound(_))));

        registry.enable("etl@R", keytab("/k/etl.keytab"), None).await.unwrap();
        let handle = registry.renew_now("etl@R").await.unwrap();
        assert!(handle.same_session(&registry.lookup("etl@R").unwrap().handle));
        assert!(registry.lookup("etl@R").unwrap().last_renewal.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_serializes_without_handle() {
        let registry = registry();
        registry.enable("etl@R", keytab("/k/etl.keytab"), None).await.unwrap();

        let json = serde_json::to_value(registry.lookup("etl@R").unwrap()).unwrap();
        assert_eq!(json["identity"], "etl@R");
        assert_eq!(json["state"], "active");
        assert!(json.get("handle").is_none());
    }
}
