use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{DelegationError, Result};

/// Reference to the key material an identity logs in with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeytabCredential {
    path: PathBuf,
}

impl KeytabCredential {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() || path.to_string_lossy().trim().is_empty() {
            return Err(DelegationError::InvalidArgument("keytab path can not be blank".to_string()));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for KeytabCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
