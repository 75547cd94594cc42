//! Host-facing service
//!
//! Maps the host's lifecycle triggers onto the registry: `on_enable` enables
//! every configured identity, `on_disable` disables every identity the last
//! `on_enable` brought up. One identity failing never blocks the others.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::authorization::AuthorizationHandle;
use crate::capability::{AuthContext, CapabilityProvider};
use crate::credential::KeytabCredential;
use crate::error::{DelegationError, Result};
use crate::executor::{ActionContext, DelegatedActionExecutor};
use crate::principal::Principal;
use crate::registry::{CredentialRegistry, EntrySnapshot};
use crate::renewal::RenewalConfig;

/// One configured identity and the keytab it logs in with.
#[derive(Debug, Clone)]
pub struct IdentityBinding {
    pub identity: String,
    pub keytab: PathBuf,
    pub context: Option<AuthContext>,
}

impl IdentityBinding {
    pub fn new(identity: impl Into<String>, keytab: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            keytab: keytab.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: AuthContext) -> Self {
        self.context = Some(context).filter(|c| !c.is_empty());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Settings every identity's capability instance starts with
    pub defaults: AuthContext,
    pub renewal: RenewalConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityFailure {
    pub identity: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnableSummary {
    pub enabled: Vec<String>,
    pub failed: Vec<IdentityFailure>,
}

impl EnableSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DisableSummary {
    pub disabled: Vec<String>,
    pub failed: Vec<IdentityFailure>,
}

pub struct KerberosDelegationService {
    registry: Arc<CredentialRegistry>,
    executor: DelegatedActionExecutor,
    enabled: Mutex<Vec<String>>,
}

impl KerberosDelegationService {
    pub fn new(provider: Arc<dyn CapabilityProvider>, options: ServiceOptions) -> Self {
        let registry = Arc::new(CredentialRegistry::new(provider, options.defaults, options.renewal));
        Self {
            executor: DelegatedActionExecutor::new(Arc::clone(&registry)),
            registry,
            enabled: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CredentialRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &DelegatedActionExecutor {
        &self.executor
    }

    /// Enable every binding.
    ///
    /// The whole batch is validated first; a blank or unparseable identity, a
    /// blank keytab path or a duplicate identity fails the call before any
    /// identity is enabled. After that each identity succeeds or fails on its
    /// own and the outcome is reported in the summary.
    pub async fn on_enable(&self, bindings: Vec<IdentityBinding>) -> Result<EnableSummary> {
        let validated = validate(bindings)?;
        info!(identities = validated.len(), "Enabling Kerberos identities");

        let mut summary = EnableSummary::default();
        for (identity, credential, context) in validated {
            match self.registry.enable(&identity, credential, context).await {
                Ok(()) => {
                    self.enabled.lock().push(identity.clone());
                    summary.enabled.push(identity);
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Failed to enable identity");
                    summary.failed.push(IdentityFailure {
                        identity,
                        error: e.to_string(),
                    });
                }
            }
        }

        if summary.enabled.is_empty() && !summary.failed.is_empty() {
            error!(failed = summary.failed.len(), "No Kerberos identity could be enabled");
        } else {
            info!(enabled = summary.enabled.len(), failed = summary.failed.len(), "Kerberos identities enabled");
        }
        Ok(summary)
    }

    /// Disable every identity enabled through [`Self::on_enable`].
    pub async fn on_disable(&self) -> DisableSummary {
        let identities = std::mem::take(&mut *self.enabled.lock());
        let mut summary = DisableSummary::default();

        for identity in identities {
            match self.registry.disable(&identity).await {
                Ok(()) => summary.disabled.push(identity),
                // Already disabled directly through the registry.
                Err(DelegationError::NotFound(_)) => {}
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Failed to disable identity");
                    summary.failed.push(IdentityFailure {
                        identity,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(disabled = summary.disabled.len(), failed = summary.failed.len(), "Kerberos identities disabled");
        summary
    }

    pub fn perform_action<R, E, F>(&self, work: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&ActionContext) -> std::result::Result<R, E>,
        E: From<DelegationError>,
    {
        self.executor.perform_action(work)
    }

    pub fn perform_action_as<R, E, F>(&self, identity: &str, work: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&ActionContext) -> std::result::Result<R, E>,
        E: From<DelegationError>,
    {
        self.executor.perform_action_as(identity, work)
    }

    pub async fn renew_now(&self, identity: &str) -> Result<AuthorizationHandle> {
        self.registry.renew_now(identity).await
    }

    pub fn lookup(&self, identity: &str) -> Option<EntrySnapshot> {
        self.registry.lookup(identity)
    }

    pub fn identities(&self) -> Vec<EntrySnapshot> {
        self.registry.identities()
    }
}

type Validated = (String, KeytabCredential, Option<AuthContext>);

fn validate(bindings: Vec<IdentityBinding>) -> Result<Vec<Validated>> {
    let mut seen = HashSet::new();
    bindings
        .into_iter()
        .map(|binding| {
            let identity = binding.identity.trim().to_string();
            if identity.is_empty() {
                return Err(DelegationError::InvalidArgument("identity can not be blank".to_string()));
            }
            Principal::parse(&identity)?;
            if !seen.insert(identity.clone()) {
                return Err(DelegationError::InvalidArgument(format!(
                    "identity {} is configured more than once",
                    identity
                )));
            }
            let credential = KeytabCredential::new(binding.keytab).map_err(|_| {
                DelegationError::InvalidArgument(format!("keytab for {} can not be blank", identity))
            })?;
            Ok((identity, credential, binding.context))
        })
        .collect()
}
