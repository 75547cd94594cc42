//! Delegation Service Tests
//!
//! Tests for:
//! - Enable/disable lifecycle and duplicate detection
//! - Delegated actions and execution context restoration
//! - Isolation between concurrently running identities
//! - Background renewal, renewal failures and renewal shutdown
//! - Batch enable through the host-facing service

use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kd_delegation::{
    active_boundary, AuthContext, BoundaryId, CapabilityError, CapabilityProvider, DelegationError,
    IdentityBinding, KerberosDelegationService, KeytabCredential, RenewalConfig, SecurityCapability, ServiceOptions,
    Session,
};

thread_local! {
    /// Realm the mock library exposes to code running under run-as.
    static OBSERVED_REALM: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn observed_realm() -> Option<String> {
    OBSERVED_REALM.with(|realm| realm.borrow().clone())
}

/// State shared by every instance the mock provider loads.
#[derive(Default)]
struct MockState {
    loads: AtomicU32,
    renewals: AtomicU32,
    fail_renewal: AtomicBool,
}

struct MockProvider {
    state: Arc<MockState>,
}

impl CapabilityProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn load(&self, _boundary: BoundaryId) -> Result<Arc<dyn SecurityCapability>, CapabilityError> {
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockCapability {
            state: Arc::clone(&self.state),
            realm: Arc::new(parking_lot::Mutex::new(None)),
        }))
    }
}

/// Mimics a library that keeps its realm in process-global state.
struct MockCapability {
    state: Arc<MockState>,
    realm: Arc<parking_lot::Mutex<Option<String>>>,
}

impl SecurityCapability for MockCapability {
    fn configure(&self, context: &AuthContext) -> Result<(), CapabilityError> {
        if let Some(realm) = context.get(AuthContext::DEFAULT_REALM) {
            *self.realm.lock() = Some(realm.to_string());
        }
        Ok(())
    }

    fn login_from_keytab(&self, principal: &str, _keytab: &Path) -> Result<Arc<dyn Session>, CapabilityError> {
        if principal.starts_with("bad") {
            return Err(CapabilityError::LoginRejected(format!("no such principal {}", principal)));
        }
        Ok(Arc::new(MockSession {
            principal: principal.to_string(),
            state: Arc::clone(&self.state),
            realm: Arc::clone(&self.realm),
        }))
    }
}

struct MockSession {
    principal: String,
    state: Arc<MockState>,
    realm: Arc<parking_lot::Mutex<Option<String>>>,
}

impl Session for MockSession {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn run_as(&self, action: &mut dyn FnMut()) -> Result<(), CapabilityError> {
        let realm = self.realm.lock().clone();
        let previous = OBSERVED_REALM.with(|observed| observed.replace(realm));
        action();
        OBSERVED_REALM.with(|observed| *observed.borrow_mut() = previous);
        Ok(())
    }

    fn check_and_relogin(&self) -> Result<Option<Arc<dyn Session>>, CapabilityError> {
        if self.state.fail_renewal.load(Ordering::SeqCst) {
            return Err(CapabilityError::RenewalRejected("KDC unreachable".to_string()));
        }
        self.state.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

fn service_with(renewal: RenewalConfig) -> (Arc<KerberosDelegationService>, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let service = KerberosDelegationService::new(
        Arc::new(MockProvider { state: Arc::clone(&state) }),
        ServiceOptions {
            defaults: AuthContext::new().with(AuthContext::DEFAULT_REALM, "ROOT.REALM"),
            renewal,
        },
    );
    (Arc::new(service), state)
}

fn service() -> (Arc<KerberosDelegationService>, Arc<MockState>) {
    service_with(RenewalConfig {
        enabled: false,
        interval: Duration::from_secs(60),
    })
}

fn fast_renewal() -> RenewalConfig {
    RenewalConfig {
        enabled: true,
        interval: Duration::from_millis(20),
    }
}

fn realm_context(realm: &str) -> AuthContext {
    AuthContext::new().with(AuthContext::DEFAULT_REALM, realm)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_duplicate_enable_keeps_original_entry() {
    let (service, state) = service();
    let registry = service.registry();

    registry
        .enable("etl@CORP", KeytabCredential::new("/k/etl.keytab").unwrap(), None)
        .await
        .unwrap();
    let original = registry.lookup("etl@CORP").unwrap();

    let second = registry
        .enable("etl@CORP", KeytabCredential::new("/k/other.keytab").unwrap(), None)
        .await;
    assert!(matches!(second, Err(DelegationError::AlreadyConfigured(_))));

    let current = registry.lookup("etl@CORP").unwrap();
    assert!(current.handle.same_session(&original.handle));
    assert_eq!(current.boundary, original.boundary);
    assert_eq!(current.keytab, "/k/etl.keytab");
    // The rejected enable never created a boundary of its own.
    assert_eq!(state.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_identity_never_runs_work() {
    let (service, _) = service();
    let mut invoked = false;

    let result: Result<(), DelegationError> = service.perform_action_as("ghost@CORP", |_| {
        invoked = true;
        Ok(())
    });

    assert!(matches!(result, Err(DelegationError::UnknownIdentity(_))));
    assert!(!invoked);
}

#[tokio::test]
async fn test_action_without_identity_is_unsupported() {
    let (service, _) = service();
    service
        .on_enable(vec![IdentityBinding::new("etl@CORP", "/k/etl.keytab")])
        .await
        .unwrap();

    let result: Result<(), DelegationError> = service.perform_action(|_| Ok(()));
    assert!(matches!(result, Err(DelegationError::UnsupportedWithoutIdentity(_))));
}

#[tokio::test]
async fn test_action_sees_identity_realm() {
    let (service, _) = service();
    service
        .on_enable(vec![
            IdentityBinding::new("alice", "/k/alice.keytab").with_context(realm_context("A.REALM")),
            IdentityBinding::new("bob", "/k/bob.keytab"),
        ])
        .await
        .unwrap();

    let alice = service
        .perform_action_as("alice", |_| Ok::<_, DelegationError>(observed_realm()))
        .unwrap();
    let bob = service
        .perform_action_as("bob", |_| Ok::<_, DelegationError>(observed_realm()))
        .unwrap();

    assert_eq!(alice.as_deref(), Some("A.REALM"));
    // bob only has the defaults snapshot; alice's setting never reached it.
    assert_eq!(bob.as_deref(), Some("ROOT.REALM"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identities_stay_isolated() {
    let (service, _) = service();
    service
        .on_enable(vec![
            IdentityBinding::new("alice", "/k/alice.keytab").with_context(realm_context("A.REALM")),
            IdentityBinding::new("bob", "/k/bob.keytab").with_context(realm_context("B.REALM")),
        ])
        .await
        .unwrap();

    let mut workers = Vec::new();
    for i in 0..8 {
        let service = Arc::clone(&service);
        let (identity, realm) = if i % 2 == 0 { ("alice", "A.REALM") } else { ("bob", "B.REALM") };
        let boundary = service.lookup(identity).unwrap().boundary;

        workers.push(tokio::task::spawn_blocking(move || {
            for _ in 0..50 {
                let (seen_realm, seen_boundary) = service
                    .perform_action_as(identity, |ctx| {
                        assert_eq!(ctx.identity, identity);
                        std::thread::sleep(Duration::from_micros(50));
                        Ok::<_, DelegationError>((observed_realm(), active_boundary()))
                    })
                    .unwrap();
                assert_eq!(seen_realm.as_deref(), Some(realm));
                assert_eq!(seen_boundary, Some(boundary));
                assert_eq!(active_boundary(), None);
            }
        }));
    }

    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test]
async fn test_context_restored_after_error() {
    let (service, _) = service();
    service
        .on_enable(vec![IdentityBinding::new("etl@CORP", "/k/etl.keytab")])
        .await
        .unwrap();

    let result: Result<(), DelegationError> = service.perform_action_as("etl@CORP", |_| {
        Err(DelegationError::InvalidArgument("work failed".to_string()))
    });

    assert!(matches!(result, Err(DelegationError::InvalidArgument(msg)) if msg == "work failed"));
    assert_eq!(active_boundary(), None);
    assert_eq!(observed_realm(), None);
}

#[tokio::test]
async fn test_context_restored_after_panic() {
    let (service, _) = service();
    service
        .on_enable(vec![IdentityBinding::new("etl@CORP", "/k/etl.keytab")])
        .await
        .unwrap();

    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _: Result<(), DelegationError> = service.perform_action_as("etl@CORP", |_| panic!("work panicked"));
    }));

    assert!(panicked.is_err());
    assert_eq!(active_boundary(), None);

    // The entry is still usable afterwards.
    let ok: Result<u8, DelegationError> = service.perform_action_as("etl@CORP", |_| Ok(7));
    assert_eq!(ok.unwrap(), 7);
}

#[tokio::test]
async fn test_nested_actions_restore_outer_boundary() {
    let (service, _) = service();
    service
        .on_enable(vec![
            IdentityBinding::new("outer@CORP", "/k/outer.keytab"),
            IdentityBinding::new("inner@CORP", "/k/inner.keytab"),
        ])
        .await
        .unwrap();
    let outer = service.lookup("outer@CORP").unwrap().boundary;
    let inner = service.lookup("inner@CORP").unwrap().boundary;

    service
        .perform_action_as("outer@CORP", |_| {
            assert_eq!(active_boundary(), Some(outer));
            let seen = service.perform_action_as("inner@CORP", |_| Ok::<_, DelegationError>(active_boundary()))?;
            assert_eq!(seen, Some(inner));
            assert_eq!(active_boundary(), Some(outer));
            Ok::<_, DelegationError>(())
        })
        .unwrap();

    assert_eq!(active_boundary(), None);
}

#[tokio::test]
async fn test_disable_removes_identity_and_allows_reenable() {
    let (service, _) = service();
    let registry = service.registry();
    registry
        .enable("etl@CORP", KeytabCredential::new("/k/etl.keytab").unwrap(), None)
        .await
        .unwrap();
    let first = registry.lookup("etl@CORP").unwrap().boundary;

    registry.disable("etl@CORP").await.unwrap();
    let result: Result<(), DelegationError> = service.perform_action_as("etl@CORP", |_| Ok(()));
    assert!(matches!(result, Err(DelegationError::UnknownIdentity(_))));
    assert!(matches!(registry.disable("etl@CORP").await, Err(DelegationError::NotFound(_))));

    registry
        .enable("etl@CORP", KeytabCredential::new("/k/etl.keytab").unwrap(), None)
        .await
        .unwrap();
    assert_ne!(registry.lookup("etl@CORP").unwrap().boundary, first);
}

#[tokio::test]
async fn test_renewal_runs_in_background() {
    let (service, state) = service_with(fast_renewal());
    service
        .on_enable(vec![IdentityBinding::new("etl@CORP", "/k/etl.keytab")])
        .await
        .unwrap();

    assert!(wait_until(|| state.renewals.load(Ordering::SeqCst) >= 2).await);
    let snapshot = service.lookup("etl@CORP").unwrap();
    assert!(snapshot.last_renewal.is_some());
    assert_eq!(snapshot.renewal_failures, 0);

    service.on_disable().await;
}

#[tokio::test]
async fn test_disable_stops_renewal() {
    let (service, state) = service_with(fast_renewal());
    service
        .on_enable(vec![IdentityBinding::new("etl@CORP", "/k/etl.keytab")])
        .await
        .unwrap();
    assert!(wait_until(|| state.renewals.load(Ordering::SeqCst) >= 1).await);

    service.registry().disable("etl@CORP").await.unwrap();
    let after_disable = state.renewals.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(state.renewals.load(Ordering::SeqCst), after_disable);
}

#[tokio::test]
async fn test_failed_renewal_keeps_previous_handle() {
    let (service, state) = service_with(fast_renewal());
    state.fail_renewal.store(true, Ordering::SeqCst);
    service
        .on_enable(vec![IdentityBinding::new("etl@CORP", "/k/etl.keytab")])
        .await
        .unwrap();
    let original = service.lookup("etl@CORP").unwrap().handle;

    assert!(wait_until(|| service.lookup("etl@CORP").map_or(false, |s| s.renewal_failures >= 2)).await);
    let snapshot = service.lookup("etl@CORP").unwrap();
    assert!(snapshot.handle.same_session(&original));
    assert!(snapshot.last_renewal.is_none());

    // Actions keep working on the previous handle.
    let ok: Result<(), DelegationError> = service.perform_action_as("etl@CORP", |_| Ok(()));
    assert!(ok.is_ok());

    // Recovery resets the failure count.
    state.fail_renewal.store(false, Ordering::SeqCst);
    assert!(wait_until(|| service.lookup("etl@CORP").map_or(false, |s| s.renewal_failures == 0)).await);

    service.on_disable().await;
}

#[tokio::test]
async fn test_manual_renewal_reports_failure() {
    let (service, state) = service();
    service
        .on_enable(vec![IdentityBinding::new("etl@CORP", "/k/etl.keytab")])
        .await
        .unwrap();

    state.fail_renewal.store(true, Ordering::SeqCst);
    let result = service.renew_now("etl@CORP").await;
    assert!(matches!(result, Err(DelegationError::Renewal { .. })));
    assert_eq!(service.lookup("etl@CORP").unwrap().renewal_failures, 1);

    state.fail_renewal.store(false, Ordering::SeqCst);
    service.renew_now("etl@CORP").await.unwrap();
    assert_eq!(state.renewals.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch_enable_isolates_failures() {
    let (service, _) = service();
    let summary = service
        .on_enable(vec![
            IdentityBinding::new("alice@CORP", "/k/alice.keytab"),
            IdentityBinding::new("bad@CORP", "/k/bad.keytab"),
            IdentityBinding::new("bob@CORP", "/k/bob.keytab"),
        ])
        .await
        .unwrap();

    assert_eq!(summary.enabled, vec!["alice@CORP", "bob@CORP"]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].identity, "bad@CORP");
    assert!(!summary.is_complete());
    assert!(service.lookup("bad@CORP").is_none());

    let disabled = service.on_disable().await;
    assert_eq!(disabled.disabled, vec!["alice@CORP", "bob@CORP"]);
    assert!(service.identities().is_empty());
}

#[tokio::test]
async fn test_batch_with_blank_identity_enables_nothing() {
    let (service, state) = service();
    let result = service
        .on_enable(vec![
            IdentityBinding::new("alice@CORP", "/k/alice.keytab"),
            IdentityBinding::new("   ", "/k/blank.keytab"),
        ])
        .await;

    assert!(matches!(result, Err(DelegationError::InvalidArgument(_))));
    assert!(service.identities().is_empty());
    assert_eq!(state.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disable_skips_identities_already_removed() {
    let (service, _) = service();
    service
        .on_enable(vec![
            IdentityBinding::new("alice@CORP", "/k/alice.keytab"),
            IdentityBinding::new("bob@CORP", "/k/bob.keytab"),
        ])
        .await
        .unwrap();
    service.registry().disable("alice@CORP").await.unwrap();

    let summary = service.on_disable().await;
    assert_eq!(summary.disabled, vec!["bob@CORP"]);
    assert!(summary.failed.is_empty());
}
