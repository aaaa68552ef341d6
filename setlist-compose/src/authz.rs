//! Authorization gate
//!
//! Capabilities are compared by set membership only. The local gate runs
//! before any optimistic change is applied; the store re-validates every
//! write against the same role model and has the final say.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use setlist_common::models::Capability;
use setlist_common::{Error, Result, TenantId};

use crate::identity::IdentityProvider;

/// Resolved capabilities of the acting user in the active tenant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(HashSet<Capability>);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self(Capability::ALL.into_iter().collect())
    }

    /// Parse capability tags, skipping unknown ones with a warning
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HashSet::new();
        for tag in tags {
            match tag.as_ref().parse::<Capability>() {
                Ok(cap) => {
                    set.insert(cap);
                }
                Err(_) => warn!("Ignoring unknown capability tag {:?}", tag.as_ref()),
            }
        }
        Self(set)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Gate check
    pub fn authorize(&self, required: Capability) -> Result<()> {
        if self.contains(required) {
            Ok(())
        } else {
            Err(Error::Authorization {
                capability: required,
            })
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Team roles and the capabilities they grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Plans services: everything
    Leader,
    /// Arranges and annotates, cannot add or remove songs
    Musician,
    /// Read only
    Viewer,
}

impl Role {
    pub fn capabilities(self) -> CapabilitySet {
        match self {
            Role::Leader => CapabilitySet::all(),
            Role::Musician => [
                Capability::ServiceView,
                Capability::ServiceArrange,
                Capability::EntryAnnotate,
            ]
            .into_iter()
            .collect(),
            Role::Viewer => [Capability::ServiceView].into_iter().collect(),
        }
    }

    /// Capability tags as the identity collaborator hands them out
    pub fn tags(self) -> HashSet<String> {
        self.capabilities().iter().map(|c| c.as_str().to_string()).collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Musician => write!(f, "musician"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "leader" => Ok(Role::Leader),
            "musician" => Ok(Role::Musician),
            "viewer" => Ok(Role::Viewer),
            other => Err(Error::Validation(format!("unknown role {:?}", other))),
        }
    }
}

/// Ask the identity collaborator for the user's capabilities in `tenant`
pub async fn resolve_capabilities(
    identity: &dyn IdentityProvider,
    tenant: TenantId,
) -> Result<CapabilitySet> {
    let tags = identity.permissions_for(tenant).await?;
    Ok(CapabilitySet::from_tags(tags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tags_ignored() {
        let set = CapabilitySet::from_tags(["service-edit", "fly-plane", "service-view"]);
        assert!(set.contains(Capability::ServiceEdit));
        assert!(set.contains(Capability::ServiceView));
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn test_authorize_reports_missing_capability() {
        let set = Role::Musician.capabilities();
        assert!(set.authorize(Capability::ServiceArrange).is_ok());
        match set.authorize(Capability::ServiceEdit) {
            Err(Error::Authorization { capability }) => {
                assert_eq!(capability, Capability::ServiceEdit)
            }
            other => panic!("expected authorization error, got {:?}", other),
        }
    }

    #[test]
    fn test_role_capabilities() {
        assert_eq!(Role::Leader.capabilities(), CapabilitySet::all());
        assert!(!Role::Viewer.capabilities().contains(Capability::ServiceArrange));
        assert!(!Role::Musician.capabilities().contains(Capability::ServiceComplete));
        assert_eq!(
            CapabilitySet::from_tags(Role::Musician.tags()),
            Role::Musician.capabilities()
        );
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("viewer".parse::<Role>().unwrap(), Role::Viewer);
        assert!("admin".parse::<Role>().is_err());
    }
}
