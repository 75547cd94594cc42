//! Delegated Action Executor
//!
//! Runs caller-supplied work as an enabled identity. The calling thread is
//! switched into the identity's boundary for the duration of the work and
//! switched back on every exit path, panics included.

use std::sync::Arc;

use tracing::{debug, debug_span};

use crate::boundary::BoundaryId;
use crate::capability::CapabilityError;
use crate::error::DelegationError;
use crate::registry::{CredentialRegistry, RegistryEntry};

/// What the work is running as.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub identity: String,
    pub principal: String,
    pub boundary: BoundaryId,
}

pub struct DelegatedActionExecutor {
    registry: Arc<CredentialRegistry>,
}

impl DelegatedActionExecutor {
    pub fn new(registry: Arc<CredentialRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CredentialRegistry> {
        &self.registry
    }

    /// Always fails: there is no ambient identity to run as.
    pub fn perform_action<R, E, F>(&self, _work: F) -> Result<R, E>
    where
        F: FnOnce(&ActionContext) -> Result<R, E>,
        E: From<DelegationError>,
    {
        Err(DelegationError::UnsupportedWithoutIdentity("DelegatedActionExecutor").into())
    }

    /// Run `work` as `identity` and return its result unchanged.
    ///
    /// `work` is never invoked when the identity is not enabled. It may block;
    /// no timeout is applied.
    pub fn perform_action_as<R, E, F>(&self, identity: &str, work: F) -> Result<R, E>
    where
        F: FnOnce(&ActionContext) -> Result<R, E>,
        E: From<DelegationError>,
    {
        let identity = identity.trim();
        let entry = self
            .registry
            .entry(identity)
            .ok_or_else(|| DelegationError::UnknownIdentity(identity.to_string()))?;

        metrics::counter!("delegation.actions_total").increment(1);
        let result = run_in_boundary(&entry, work);
        if result.is_err() {
            metrics::counter!("delegation.action_failures_total").increment(1);
        }
        result
    }
}

fn run_in_boundary<R, E, F>(entry: &RegistryEntry, work: F) -> Result<R, E>
where
    F: FnOnce(&ActionContext) -> Result<R, E>,
    E: From<DelegationError>,
{
    let scope = entry.boundary().enter()?;
    let handle = entry.handle();
    let session = handle.session_in(&scope)?;

    let context = ActionContext {
        identity: entry.identity().to_string(),
        principal: handle.principal().to_string(),
        boundary: scope.boundary(),
    };
    let span = debug_span!("delegated_action", identity = %context.identity, boundary = %context.boundary);
    let _entered = span.enter();
    debug!("Running delegated action");

    let mut work = Some(work);
    let mut outcome = None;
    session
        .run_as(&mut || {
            if let Some(work) = work.take() {
                outcome = Some(work(&context));
            }
        })
        .map_err(|e| match e {
            CapabilityError::Expired(_) => DelegationError::Authentication {
                identity: context.identity.clone(),
                reason: e.to_string(),
            },
            other => DelegationError::Capability(other),
        })?;

    match outcome {
        Some(result) => result,
        None => Err(DelegationError::Capability(CapabilityError::NotAvailable(
            "run-as returned without running the action".to_string(),
        ))
        .into()),
    }
}
