//! Authorization requests against an identity's capability instance
//!
//! Both requests execute inside the target boundary: the calling thread is
//! switched into it for the duration of the call and switched back on return.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::boundary::{BoundaryId, IsolationBoundary};
use crate::capability::{AuthContext, CapabilityError, Session};
use crate::credential::KeytabCredential;
use crate::error::{DelegationError, Result};
use crate::scope::BoundaryScope;

/// Result of a successful login for one identity, bound to the boundary that
/// produced it. The session can only be reached through a [`BoundaryScope`]
/// of that same boundary.
#[derive(Clone)]
pub struct AuthorizationHandle {
    identity: String,
    boundary: BoundaryId,
    session: Arc<dyn Session>,
}

impl AuthorizationHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn boundary(&self) -> BoundaryId {
        self.boundary
    }

    pub fn principal(&self) -> &str {
        self.session.principal()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.session.expires_at()
    }

    /// Whether both handles wrap the same authenticated session.
    pub fn same_session(&self, other: &AuthorizationHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }

    pub(crate) fn session_in(&self, scope: &BoundaryScope) -> Result<&Arc<dyn Session>> {
        if scope.boundary() != self.boundary {
            return Err(DelegationError::BoundaryMismatch {
                handle: self.boundary,
                active: scope.boundary(),
            });
        }
        Ok(&self.session)
    }
}

impl fmt::Debug for AuthorizationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationHandle")
            .field("identity", &self.identity)
            .field("boundary", &self.boundary)
            .field("principal", &self.session.principal())
            .finish()
    }
}

/// Log `identity` in with `credential` inside `boundary`, applying `context`
/// to the boundary's capability instance first.
pub fn request_authorization(
    boundary: &IsolationBoundary,
    identity: &str,
    credential: &KeytabCredential,
    context: Option<&AuthContext>,
) -> Result<AuthorizationHandle> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(DelegationError::InvalidArgument("identity can not be blank".to_string()));
    }

    let _scope = boundary.enter()?;
    let capability = boundary.load_capability()?;
    debug!(identity = %identity, boundary = %boundary.id(), keytab = %credential.path().display(), "Requesting authorization");

    let rejected = |e: CapabilityError| DelegationError::Authentication {
        identity: identity.to_string(),
        reason: e.to_string(),
    };

    if let Some(context) = context {
        capability.configure(context).map_err(rejected)?;
    }
    let session = capability
        .login_from_keytab(identity, credential.path())
        .map_err(rejected)?;

    info!(identity = %identity, principal = %session.principal(), boundary = %boundary.id(), "Authorization granted");
    Ok(AuthorizationHandle {
        identity: identity.to_string(),
        boundary: boundary.id(),
        session,
    })
}

/// Refresh `previous` inside the boundary that produced it. Returns the same
/// handle when the session renewed in place, or a handle for the replacement
/// session the capability handed back.
pub fn request_authorization_renewal(
    boundary: &IsolationBoundary,
    previous: &AuthorizationHandle,
    context: Option<&AuthContext>,
) -> Result<AuthorizationHandle> {
    let scope = boundary.enter()?;
    let session = previous.session_in(&scope)?;

    let rejected = |e: CapabilityError| DelegationError::Renewal {
        identity: previous.identity.clone(),
        reason: e.to_string(),
    };

    if let Some(context) = context {
        boundary.load_capability()?.configure(context).map_err(rejected)?;
    }

    match session.check_and_relogin().map_err(rejected)? {
        None => Ok(previous.clone()),
        Some(replacement) => {
            info!(identity = %previous.identity, boundary = %previous.boundary, "Renewal produced a replacement session");
            Ok(AuthorizationHandle {
                identity: previous.identity.clone(),
                boundary: previous.boundary,
                session: replacement,
            })
        }
    }
}
