//! KL-012: Identity resolution — user/group specs to numeric ids.
//!
//! Names are looked up in the local passwd/group databases. The two
//! halves resolve independently, so a numeric uid can pair with a named group.
//!
//! Only the files are read, not NSS: users and groups served from LDAP,
//! sssd or NIS are not found by name. Use numeric `uid`/`gid` for those.

use crate::core::error::{Error, Result};
use crate::core::types::UserIdentifierSpec;
use std::path::{Path, PathBuf};

/// Resolved owner. `None` means that half was left unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Name lookups against passwd(5)/group(5) formatted files.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    pub passwd: PathBuf,
    pub group: PathBuf,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self {
            passwd: PathBuf::from("/etc/passwd"),
            group: PathBuf::from("/etc/group"),
        }
    }
}

impl IdentityResolver {
    pub fn new(passwd: impl Into<PathBuf>, group: impl Into<PathBuf>) -> Self {
        Self {
            passwd: passwd.into(),
            group: group.into(),
        }
    }

    /// Resolve a spec. A non-empty name takes precedence over the numeric id.
    pub fn resolve(&self, spec: &UserIdentifierSpec) -> Result<Identity> {
        let uid = if spec.user.is_empty() {
            spec.uid
        } else {
            let uid = self.lookup_user(&spec.user)?;
            tracing::debug!(user = %spec.user, uid, "resolved user");
            Some(uid)
        };
        let gid = if spec.group.is_empty() {
            spec.gid
        } else {
            let gid = self.lookup_group(&spec.group)?;
            tracing::debug!(group = %spec.group, gid, "resolved group");
            Some(gid)
        };
        Ok(Identity { uid, gid })
    }

    pub fn lookup_user(&self, name: &str) -> Result<u32> {
        lookup_id(&self.passwd, name, "user")
    }

    pub fn lookup_group(&self, name: &str) -> Result<u32> {
        lookup_id(&self.group, name, "group")
    }
}

/// Find `name` in a colon-separated database and parse its third field.
fn lookup_id(db: &Path, name: &str, what: &str) -> Result<u32> {
    let content = std::fs::read_to_string(db).map_err(|e| {
        Error::Lookup(format!(
            "unable to lookup {} {}: cannot read {}: {}",
            what,
            name,
            db.display(),
            e
        ))
    })?;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        if fields.next() != Some(name) {
            continue;
        }
        let raw = fields.nth(1).unwrap_or_default();
        return raw.parse::<u32>().map_err(|_| {
            Error::Lookup(format!(
                "unable to convert {} id '{}' of {} to an integer",
                what, raw, name
            ))
        });
    }

    Err(Error::Lookup(format!("unknown {} {}", what, name)))
}
