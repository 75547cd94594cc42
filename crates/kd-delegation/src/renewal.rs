//! Ticket Renewal Scheduler
//!
//! One background task per enabled identity. Every tick takes the identity's
//! lifecycle lock and asks the capability to check and renew the ticket. A
//! failed renewal keeps the previous handle in service.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::authorization::{request_authorization_renewal, AuthorizationHandle};
use crate::error::{DelegationError, Result};
use crate::registry::{EntryState, RegistryEntry};

#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// Start a renewal task for each enabled identity
    pub enabled: bool,
    /// Time between renewal checks; shorter than the ticket lifetime
    pub interval: Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
        }
    }
}

impl RenewalConfig {
    /// A zero interval cannot drive a ticker.
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.interval.is_zero() {
            return Err(DelegationError::InvalidArgument(
                "renewal interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Running renewal task for one identity.
pub(crate) struct RenewalTask {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RenewalTask {
    /// Spawn the task. It holds only a weak reference to the entry and exits
    /// once the entry is gone or shutdown is signalled.
    pub(crate) fn spawn(
        entry: Weak<RegistryEntry>,
        lifecycle: Arc<tokio::sync::Mutex<()>>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                // Disable holds the lock while it waits for this task, so
                // shutdown must win over lock acquisition.
                let _guard = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    guard = lifecycle.lock() => guard,
                };

                let Some(current) = entry.upgrade() else {
                    break;
                };
                // Failures are logged and counted inside renew_once.
                let _ = renew_once(current).await;
            }
        });

        Self { shutdown_tx, join }
    }

    /// Signal shutdown and wait for the task to finish.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            if e.is_panic() {
                warn!(error = %e, "Renewal task panicked");
            }
        }
    }
}

/// Renew `entry` once. The caller holds the identity's lifecycle lock.
///
/// On success the entry's handle is replaced by the renewed one. On failure
/// the previous handle stays in place and the error is returned.
pub(crate) async fn renew_once(entry: Arc<RegistryEntry>) -> Result<AuthorizationHandle> {
    entry.set_state(EntryState::Renewing);

    let previous = entry.handle();
    let worker = Arc::clone(&entry);
    let result = tokio::task::spawn_blocking(move || {
        request_authorization_renewal(worker.boundary(), &previous, worker.context())
    })
    .await
    .map_err(DelegationError::from)
    .and_then(|renewed| renewed);

    entry.set_state(EntryState::Active);

    match result {
        Ok(handle) => {
            metrics::counter!("delegation.renewals_total").increment(1);
            debug!(
                identity = %entry.identity(),
                expires_at = ?handle.expires_at(),
                "Ticket renewal check complete"
            );
            entry.record_renewal(handle.clone());
            Ok(handle)
        }
        Err(e) => {
            metrics::counter!("delegation.renewal_failures_total").increment(1);
            let failures = entry.record_renewal_failure();
            warn!(
                identity = %entry.identity(),
                consecutive_failures = failures,
                error = %e,
                "Ticket renewal failed, keeping previous authorization"
            );
            Err(e)
        }
    }
}
