//! Isolation boundaries
//!
//! A boundary is the namespace one identity's capability instance lives in.
//! Each boundary loads its own instance through the provider, so settings the
//! capability keeps "globally" (realm, KDC, ticket lifetime) are global only
//! within that boundary.
//!
//! Lifecycle: `Created -> Loaded -> Disposed`, or `Created -> Failed` when the
//! capability cannot be loaded. A failed boundary is never retried; callers
//! dispose it and create a fresh one.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{AuthContext, CapabilityProvider, SecurityCapability};
use crate::error::{DelegationError, Result};
use crate::scope::BoundaryScope;

/// Opaque identifier of an isolation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BoundaryId(Uuid);

impl BoundaryId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BoundaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

enum BoundaryState {
    Created,
    Loaded(Arc<dyn SecurityCapability>),
    Failed(String),
    Disposed,
}

pub struct IsolationBoundary {
    id: BoundaryId,
    parent: Option<BoundaryId>,
    label: String,
    provider: Arc<dyn CapabilityProvider>,
    defaults: AuthContext,
    state: Mutex<BoundaryState>,
}

impl IsolationBoundary {
    /// The host's own boundary. Children inherit its provider and defaults.
    pub fn root(provider: Arc<dyn CapabilityProvider>, defaults: AuthContext) -> Self {
        Self {
            id: BoundaryId::new(),
            parent: None,
            label: "root".to_string(),
            provider,
            defaults,
            state: Mutex::new(BoundaryState::Created),
        }
    }

    /// Create a child of `parent`. The child takes a snapshot of the parent's
    /// defaults; nothing applied inside the child flows back.
    pub fn create(parent: &IsolationBoundary, label: impl Into<String>) -> Self {
        let boundary = Self {
            id: BoundaryId::new(),
            parent: Some(parent.id),
            label: label.into(),
            provider: Arc::clone(&parent.provider),
            defaults: parent.defaults.clone(),
            state: Mutex::new(BoundaryState::Created),
        };
        debug!(boundary = %boundary.id, parent = %parent.id, label = %boundary.label, "Created isolation boundary");
        boundary
    }

    pub fn id(&self) -> BoundaryId {
        self.id
    }

    pub fn parent(&self) -> Option<BoundaryId> {
        self.parent
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn defaults(&self) -> &AuthContext {
        &self.defaults
    }

    /// Load the capability into this boundary. Idempotent: later calls return
    /// the instance loaded by the first.
    pub fn load_capability(&self) -> Result<Arc<dyn SecurityCapability>> {
        let mut state = self.state.lock();
        match &*state {
            BoundaryState::Loaded(capability) => Ok(Arc::clone(capability)),
            BoundaryState::Failed(reason) => Err(DelegationError::CapabilityLoad {
                boundary: self.id,
                reason: format!("boundary is unusable after a failed load: {}", reason),
            }),
            BoundaryState::Disposed => Err(DelegationError::BoundaryUnusable(self.id)),
            BoundaryState::Created => {
                let loaded = self
                    .provider
                    .load(self.id)
                    .and_then(|capability| capability.configure(&self.defaults).map(|_| capability));
                match loaded {
                    Ok(capability) => {
                        info!(
                            boundary = %self.id,
                            label = %self.label,
                            provider = self.provider.name(),
                            "Loaded capability into boundary"
                        );
                        *state = BoundaryState::Loaded(Arc::clone(&capability));
                        Ok(capability)
                    }
                    Err(e) => {
                        warn!(boundary = %self.id, label = %self.label, error = %e, "Capability load failed");
                        let reason = e.to_string();
                        *state = BoundaryState::Failed(reason.clone());
                        Err(DelegationError::CapabilityLoad {
                            boundary: self.id,
                            reason,
                        })
                    }
                }
            }
        }
    }

    /// Release the capability instance. The boundary is unusable afterwards.
    pub fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), BoundaryState::Disposed);
        if !matches!(previous, BoundaryState::Disposed) {
            info!(boundary = %self.id, label = %self.label, "Disposed isolation boundary");
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(*self.state.lock(), BoundaryState::Created | BoundaryState::Loaded(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.state.lock(), BoundaryState::Disposed)
    }

    /// Switch the calling thread into this boundary until the scope drops.
    pub(crate) fn enter(&self) -> Result<BoundaryScope> {
        if !self.is_usable() {
            return Err(DelegationError::BoundaryUnusable(self.id));
        }
        Ok(BoundaryScope::enter(self.id))
    }
}

impl fmt::Debug for IsolationBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationBoundary")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("label", &self.label)
            .field("usable", &self.is_usable())
            .finish()
    }
}
