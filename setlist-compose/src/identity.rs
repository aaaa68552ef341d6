//! Identity collaborator
//!
//! Authentication is handled elsewhere; the composer only needs to know who
//! is acting and which capability tags they hold in a tenant.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use setlist_common::{Result, TenantId, UserId};

use crate::authz::Role;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Acting user
    async fn current_user(&self) -> Result<UserId>;

    /// Capability tags of the acting user within `tenant`
    ///
    /// Unknown tags are tolerated by the caller.
    async fn permissions_for(&self, tenant: TenantId) -> Result<HashSet<String>>;
}

/// Fixed user with fixed per-tenant tags
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    user: UserId,
    tags: HashMap<TenantId, HashSet<String>>,
}

impl StaticIdentity {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            tags: HashMap::new(),
        }
    }

    /// Grant the tags of `role` in `tenant`
    pub fn with_role(mut self, tenant: TenantId, role: Role) -> Self {
        self.tags.insert(tenant, role.tags());
        self
    }

    /// Grant raw tags in `tenant`
    pub fn with_tags<I, S>(mut self, tenant: TenantId, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(tenant, tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn user(&self) -> UserId {
        self.user
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<UserId> {
        Ok(self.user)
    }

    async fn permissions_for(&self, tenant: TenantId) -> Result<HashSet<String>> {
        Ok(self.tags.get(&tenant).cloned().unwrap_or_default())
    }
}
