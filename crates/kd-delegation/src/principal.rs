//! Kerberos principal parsing
//!
//! A principal has the textual form `shortname[/instance][@REALM]`. A delimiter
//! preceded by `\` is escaped and never splits the principal:
//! - the realm follows the **last** unescaped `@`
//! - the instance follows the **first** unescaped `/` once the realm is removed

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{DelegationError, Result};

const REALM_DELIMITER: char = '@';
const INSTANCE_DELIMITER: char = '/';
const ESCAPE: char = '\\';

/// A parsed Kerberos principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Principal {
    raw: String,
    realm: Option<String>,
    shortname: String,
    instance: Option<String>,
}

impl Principal {
    pub fn parse(principal: &str) -> Result<Self> {
        let parts = split(principal)?;
        Ok(Self {
            raw: principal.to_string(),
            realm: parts.realm.map(str::to_string),
            shortname: parts.shortname.to_string(),
            instance: parts.instance.map(str::to_string),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// The principal qualified with `default_realm` when it carries no realm.
    pub fn qualified(&self, default_realm: Option<&str>) -> Option<String> {
        match (&self.realm, default_realm) {
            (Some(_), _) => Some(self.raw.clone()),
            (None, Some(realm)) if !realm.is_empty() => Some(format!("{}@{}", self.raw, realm)),
            _ => None,
        }
    }
}

impl FromStr for Principal {
    type Err = DelegationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Determine the realm of `principal`: the content after the last unescaped `@`.
pub fn parse_realm(principal: &str) -> Result<Option<String>> {
    ensure_not_blank(principal)?;
    Ok(find_realm(principal).map(|(_, realm)| realm.to_string()))
}

/// Determine the shortname of `principal`: the realm-free content before the
/// first unescaped `/`.
pub fn parse_shortname(principal: &str) -> Result<String> {
    Ok(split(principal)?.shortname.to_string())
}

/// Determine the instance of `principal`: the content between the shortname's
/// `/` and the realm.
pub fn parse_instance(principal: &str) -> Result<Option<String>> {
    Ok(split(principal)?.instance.map(str::to_string))
}

struct Parts<'a> {
    realm: Option<&'a str>,
    shortname: &'a str,
    instance: Option<&'a str>,
}

fn ensure_not_blank(principal: &str) -> Result<()> {
    if principal.trim().is_empty() {
        return Err(DelegationError::InvalidArgument(
            "principal can not be blank".to_string(),
        ));
    }
    Ok(())
}

fn split(principal: &str) -> Result<Parts<'_>> {
    ensure_not_blank(principal)?;

    let (without_realm, realm) = match find_realm(principal) {
        Some((at, realm)) => (&principal[..at], Some(realm)),
        None => (principal, None),
    };

    let (shortname, instance) = match find_unescaped(without_realm, INSTANCE_DELIMITER, false) {
        Some(slash) => {
            let instance = &without_realm[slash + INSTANCE_DELIMITER.len_utf8()..];
            (&without_realm[..slash], Some(instance).filter(|i| !i.is_empty()))
        }
        None => (without_realm, None),
    };
    if shortname.is_empty() {
        return Err(DelegationError::InvalidArgument(format!(
            "principal {} has no shortname",
            principal
        )));
    }

    Ok(Parts {
        realm,
        shortname,
        instance,
    })
}

/// Byte offset of the realm delimiter and the non-empty realm after it.
fn find_realm(principal: &str) -> Option<(usize, &str)> {
    let at = find_unescaped(principal, REALM_DELIMITER, true)?;
    let realm = &principal[at + REALM_DELIMITER.len_utf8()..];
    if realm.is_empty() {
        None
    } else {
        Some((at, realm))
    }
}

/// Byte offset of the first (or last) `delimiter` not preceded by an escape.
fn find_unescaped(s: &str, delimiter: char, last: bool) -> Option<usize> {
    let mut previous = None;
    let mut found = None;

    for (i, c) in s.char_indices() {
        if c == delimiter && previous != Some(ESCAPE) {
            found = Some(i);
            if !last {
                break;
            }
        }
        previous = Some(c);
    }

    found
}
