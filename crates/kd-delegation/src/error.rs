//! Error types for delegated authorization and execution

use thiserror::Error;

use crate::boundary::BoundaryId;
use crate::capability::CapabilityError;

#[derive(Error, Debug)]
pub enum DelegationError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Identity {0} is already configured")]
    AlreadyConfigured(String),

    #[error("Identity {0} not found")]
    NotFound(String),

    #[error("Kerberos credentials for {0} have not been defined")]
    UnknownIdentity(String),

    #[error("Unable to load capability in boundary {boundary}: {reason}")]
    CapabilityLoad { boundary: BoundaryId, reason: String },

    #[error("Unable to obtain Kerberos ticket for {identity}: {reason}")]
    Authentication { identity: String, reason: String },

    #[error("Unable to renew Kerberos ticket for {identity}: {reason}")]
    Renewal { identity: String, reason: String },

    #[error("{0} requires an identity to perform an action, but none was supplied")]
    UnsupportedWithoutIdentity(&'static str),

    #[error("Authorization handle from boundary {handle} used inside boundary {active}")]
    BoundaryMismatch { handle: BoundaryId, active: BoundaryId },

    #[error("Boundary {0} is not usable")]
    BoundaryUnusable(BoundaryId),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for DelegationError {
    fn from(e: tokio::task::JoinError) -> Self {
        DelegationError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DelegationError>;
