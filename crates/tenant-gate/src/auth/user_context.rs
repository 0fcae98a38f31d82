//! Immutable identity derived from a verified credential

use std::collections::BTreeSet;
use std::time::SystemTime;

use serde::Serialize;

/// Verified identity bound to exactly one home tenant.
///
/// Built only by the identity resolver from unexpired, verified claims. Fields
/// are private so a context cannot be altered after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserContext {
    user_id: String,
    tenant_id: String,
    roles: BTreeSet<String>,
    credential_id: String,
    expires_at: SystemTime,
    email: Option<String>,
    name: Option<String>,
}

impl UserContext {
    pub(crate) fn new(
        user_id: String,
        tenant_id: String,
        roles: BTreeSet<String>,
        credential_id: String,
        expires_at: SystemTime,
    ) -> Self {
        Self {
            user_id,
            tenant_id,
            roles,
            credential_id,
            expires_at,
            email: None,
            name: None,
        }
    }

    #[must_use]
    pub(crate) fn with_profile(mut self, email: Option<String>, name: Option<String>) -> Self {
        self.email = email;
        self.name = name;
        self
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    #[must_use]
    pub const fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    #[must_use]
    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    #[must_use]
    pub const fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
pub(crate) fn test_context(user: &str, tenant: &str, roles: &[&str]) -> UserContext {
    use std::time::Duration;

    UserContext::new(
        user.to_string(),
        tenant.to_string(),
        roles.iter().map(|r| (*r).to_string()).collect(),
        format!("cred-{user}"),
        SystemTime::now() + Duration::from_secs(3600),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_has_role() {
        let ctx = test_context("alice", "acme", &["viewer", "operator"]);
        assert!(ctx.has_role("viewer"));
        assert!(ctx.has_role("operator"));
        assert!(!ctx.has_role("admin"));
    }

    #[test]
    fn test_roles_are_ordered_and_deduplicated() {
        let ctx = test_context("alice", "acme", &["viewer", "admin", "viewer"]);
        let roles: Vec<&str> = ctx.roles().iter().map(String::as_str).collect();
        assert_eq!(roles, vec!["admin", "viewer"]);
    }

    #[test]
    fn test_expiry() {
        let ctx = test_context("alice", "acme", &[]);
        assert!(!ctx.is_expired_at(SystemTime::now()));
        assert!(ctx.is_expired_at(SystemTime::now() + Duration::from_secs(7200)));
    }

    #[test]
    fn test_profile_fields() {
        let ctx = test_context("alice", "acme", &[])
            .with_profile(Some("alice@acme.test".into()), Some("Alice".into()));
        assert_eq!(ctx.email(), Some("alice@acme.test"));
        assert_eq!(ctx.name(), Some("Alice"));
        assert_eq!(ctx.credential_id(), "cred-alice");
    }
}
