//! KeyDelegate Kerberos Delegation
//!
//! Per-identity isolated Kerberos credentials and delegated run-as execution:
//! - Principal parsing (`shortname[/instance][@REALM]`, escape aware)
//! - Isolation boundaries, one capability instance per identity
//! - Credential registry with per-identity lifecycle exclusivity
//! - Delegated actions that run caller work as an enabled identity
//! - Background ticket renewal
//!
//! The external security library is reached only through the traits in
//! [`capability`]. [`keytab::KeytabCapabilityProvider`] is the built-in
//! implementation backed by MIT keytab files.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kd_delegation::{IdentityBinding, KerberosDelegationService, KeytabCapabilityProvider, ServiceOptions};
//!
//! # async fn run() -> Result<(), kd_delegation::DelegationError> {
//! let service = KerberosDelegationService::new(
//!     Arc::new(KeytabCapabilityProvider::default()),
//!     ServiceOptions::default(),
//! );
//! service
//!     .on_enable(vec![IdentityBinding::new("etl@EXAMPLE.COM", "/etc/security/etl.keytab")])
//!     .await?;
//!
//! let principal = service.perform_action_as("etl@EXAMPLE.COM", |ctx| {
//!     Ok::<_, kd_delegation::DelegationError>(ctx.principal.clone())
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod authorization;
pub mod boundary;
pub mod capability;
pub mod credential;
pub mod error;
pub mod executor;
pub mod keytab;
pub mod principal;
pub mod registry;
pub mod renewal;
pub mod scope;
pub mod service;

pub use authorization::{request_authorization, request_authorization_renewal, AuthorizationHandle};
pub use boundary::{BoundaryId, IsolationBoundary};
pub use capability::{AuthContext, CapabilityError, CapabilityProvider, SecurityCapability, Session};
pub use credential::KeytabCredential;
pub use error::{DelegationError, Result};
pub use executor::{ActionContext, DelegatedActionExecutor};
pub use keytab::{KeytabCapabilityProvider, KeytabSettings};
pub use principal::{parse_instance, parse_realm, parse_shortname, Principal};
pub use registry::{CredentialRegistry, EntrySnapshot, EntryState};
pub use renewal::RenewalConfig;
pub use scope::{active_boundary, BoundaryScope};
pub use service::{
    DisableSummary, EnableSummary, IdentityBinding, IdentityFailure, KerberosDelegationService, ServiceOptions,
};
