//! Identity resolution from verified claims

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::claims::JwtClaims;
use super::config::IdentityConfig;
use super::error::{AuthError, Result};
use super::user_context::UserContext;
use crate::constants::ADMIN_ROLE;

/// Maps verified claims to a [`UserContext`]
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    config: IdentityConfig,
    recognized: HashSet<String>,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(config: IdentityConfig) -> Self {
        let recognized = config.recognized_roles.iter().cloned().collect();
        Self { config, recognized }
    }

    #[must_use]
    pub const fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn resolve(&self, claims: &JwtClaims) -> Result<UserContext> {
        self.resolve_at(claims, SystemTime::now())
    }

    /// Resolve against an explicit clock
    pub fn resolve_at(&self, claims: &JwtClaims, now: SystemTime) -> Result<UserContext> {
        let user_id = claims
            .sub
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingSubject)?;

        let exp = claims.exp.ok_or(AuthError::InvalidExpiry)?;
        let expires_at = u64::try_from(exp)
            .ok()
            .filter(|secs| *secs > 0)
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
            .ok_or(AuthError::InvalidExpiry)?;
        if now >= expires_at {
            return Err(AuthError::TokenExpired);
        }

        let roles = self.extract_roles(claims);
        let tenant_id = self.extract_tenant(claims, &roles)?;
        let credential_id = claims
            .jti
            .clone()
            .or_else(|| claims.sid.clone())
            .unwrap_or_else(|| format!("{user_id}@{exp}"));

        tracing::debug!(
            user = %user_id,
            roles = roles.len(),
            "Identity resolved"
        );

        Ok(UserContext::new(
            user_id.to_string(),
            tenant_id,
            roles,
            credential_id,
            expires_at,
        )
        .with_profile(claims.email.clone(), claims.name.clone()))
    }

    /// Union of realm and client roles, limited to recognized names
    fn extract_roles(&self, claims: &JwtClaims) -> BTreeSet<String> {
        let mut roles = BTreeSet::new();
        for role in claims
            .realm_roles()
            .chain(claims.client_roles(&self.config.client_id))
        {
            if self.recognized.contains(role) {
                roles.insert(role.to_string());
            } else {
                tracing::debug!(role, "Dropping unrecognized role claim");
            }
        }
        roles
    }

    fn extract_tenant(&self, claims: &JwtClaims, roles: &BTreeSet<String>) -> Result<String> {
        let tenant = &self.config.tenant;

        let Some(value) = claims.string_claim(&tenant.tenant_claim) else {
            if tenant.multi_tenant {
                tracing::warn!(claim = %tenant.tenant_claim, "Tenant claim missing");
                return Err(AuthError::MissingTenantClaim);
            }
            return Ok(tenant.default_tenant.clone());
        };

        let mut tenants: Vec<String> = Vec::new();
        for t in value.to_vec() {
            if !t.is_empty() && !tenants.contains(&t) {
                tenants.push(t);
            }
        }

        match tenants.as_slice() {
            [] => {
                if tenant.multi_tenant {
                    Err(AuthError::MissingTenantClaim)
                } else {
                    Ok(tenant.default_tenant.clone())
                }
            }
            [single] => Ok(single.clone()),
            [home, ..] if roles.contains(ADMIN_ROLE) => Ok(home.clone()),
            _ => {
                tracing::warn!(
                    count = tenants.len(),
                    "Non-admin credential carries multiple tenants"
                );
                Err(AuthError::AmbiguousTenantClaim)
            }
        }
    }
}
