//! Role-based access control
//!
//! Roles own permissions; users hold roles. A user is granted an action on a
//! resource when any held role owns a permission matching both.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use super::error::{AuthError, Result};
use super::user_context::UserContext;
use crate::constants::{ADMIN_ROLE, WILDCARD};

/// Resource pattern plus the actions it allows. Both sides accept `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Permission {
    resource: String,
    actions: BTreeSet<String>,
}

impl Permission {
    pub fn new<I, S>(resource: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource: resource.into(),
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    /// Permission granting everything on everything
    #[must_use]
    pub fn all() -> Self {
        Self::new(WILDCARD, [WILDCARD])
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub const fn actions(&self) -> &BTreeSet<String> {
        &self.actions
    }

    pub fn matches(&self, resource: &str, action: &str) -> bool {
        let resource_ok = self.resource == WILDCARD || self.resource == resource;
        resource_ok && (self.actions.contains(WILDCARD) || self.actions.contains(action))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<&str> = self.actions.iter().map(String::as_str).collect();
        write!(f, "{}:{}", self.resource, actions.join(","))
    }
}

impl FromStr for Permission {
    type Err = AuthError;

    /// Parse `resource:action[,action...]`
    fn from_str(s: &str) -> Result<Self> {
        let (resource, actions) = s
            .split_once(':')
            .ok_or_else(|| AuthError::Config(format!("invalid permission '{s}'")))?;
        let resource = resource.trim();
        let actions: BTreeSet<String> = actions
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
        if resource.is_empty() || actions.is_empty() {
            return Err(AuthError::Config(format!("invalid permission '{s}'")));
        }
        Ok(Self {
            resource: resource.to_string(),
            actions,
        })
    }
}

/// Named bundle of permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<Permission>,
}

impl Role {
    pub fn new(name: impl Into<String>, permissions: Vec<Permission>) -> Self {
        Self {
            name: name.into(),
            permissions,
        }
    }

    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.permissions.iter().any(|p| p.matches(resource, action))
    }
}

/// Role names seeded into every registry and recognized in credentials
pub const SEEDED_ROLES: &[&str] = &[
    ADMIN_ROLE,
    "tenant-admin",
    "operator",
    "user",
    "viewer",
    "dashboard-editor",
    "alert-manager",
    "search-user",
    "cost-viewer",
];

fn perm(resource: &str, actions: &[&str]) -> Permission {
    Permission::new(resource, actions.iter().copied())
}

fn seed_roles() -> HashMap<String, Role> {
    let roles = [
        Role::new(ADMIN_ROLE, vec![Permission::all()]),
        Role::new(
            "tenant-admin",
            vec![
                perm("dashboards", &["*"]),
                perm("alerts", &["*"]),
                perm("search", &["*"]),
                perm("cost", &["*"]),
                perm("users", &["read", "write", "invite"]),
                perm("settings", &["read", "write"]),
                perm("audit", &["read"]),
            ],
        ),
        Role::new(
            "operator",
            vec![
                perm("dashboards", &["read", "write"]),
                perm("alerts", &["read", "write", "acknowledge"]),
                perm("search", &["read"]),
                perm("cost", &["read"]),
            ],
        ),
        Role::new(
            "user",
            vec![
                perm("dashboards", &["read", "write"]),
                perm("alerts", &["read"]),
                perm("search", &["read"]),
            ],
        ),
        Role::new(
            "viewer",
            vec![
                perm("dashboards", &["read"]),
                perm("alerts", &["read"]),
                perm("search", &["read"]),
                perm("cost", &["read"]),
            ],
        ),
        Role::new("dashboard-editor", vec![perm("dashboards", &["read", "write"])]),
        Role::new(
            "alert-manager",
            vec![perm("alerts", &["read", "write", "acknowledge"])],
        ),
        Role::new("search-user", vec![perm("search", &["read"])]),
        Role::new("cost-viewer", vec![perm("cost", &["read"])]),
    ];

    roles.into_iter().map(|r| (r.name.clone(), r)).collect()
}

/// Process-wide role table.
///
/// Reads take a lock-free snapshot; writers serialize on a mutex and publish a
/// new snapshot, so in-flight checks keep the table they started with.
#[derive(Debug)]
pub struct RoleRegistry {
    roles: ArcSwap<HashMap<String, Role>>,
    write_lock: Mutex<()>,
}

impl RoleRegistry {
    /// Registry holding the standard role set
    #[must_use]
    pub fn seeded() -> Self {
        Self::from_roles(seed_roles().into_values())
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::from_roles(std::iter::empty())
    }

    pub fn from_roles(roles: impl IntoIterator<Item = Role>) -> Self {
        let map = roles.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self {
            roles: ArcSwap::from_pointee(map),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Role> {
        self.roles.load().get(name).cloned()
    }

    /// Snapshot of all roles, sorted by name
    #[must_use]
    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.roles.load().values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        roles
    }

    #[must_use]
    pub fn role_names(&self) -> Vec<String> {
        self.roles().into_iter().map(|r| r.name).collect()
    }

    fn snapshot(&self) -> Arc<HashMap<String, Role>> {
        self.roles.load_full()
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, Role>) -> bool) -> bool {
        let _guard = self.write_lock.lock();
        let mut next = HashMap::clone(&self.roles.load());
        let changed = f(&mut next);
        if changed {
            self.roles.store(Arc::new(next));
        }
        changed
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::seeded()
    }
}

/// Unmet requirements of a denied request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DenyReason {
    /// Roles of which at least one was required
    pub missing_roles: Vec<String>,
    /// Permissions not granted by any held role, as `resource:action`
    pub missing_permissions: Vec<String>,
    /// Requested tenant is outside the caller's scope
    pub tenant_denied: bool,
}

impl DenyReason {
    #[must_use]
    pub fn tenant() -> Self {
        Self {
            tenant_denied: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missing_roles.is_empty() && self.missing_permissions.is_empty() && !self.tenant_denied
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing_roles.is_empty() {
            parts.push(format!(
                "requires one of roles [{}]",
                self.missing_roles.join(", ")
            ));
        }
        if !self.missing_permissions.is_empty() {
            parts.push(format!(
                "missing permissions [{}]",
                self.missing_permissions.join(", ")
            ));
        }
        if self.tenant_denied {
            parts.push("tenant not accessible".to_string());
        }
        if parts.is_empty() {
            write!(f, "not permitted")
        } else {
            write!(f, "{}", parts.join("; "))
        }
    }
}

/// Pure role and permission checks against an injected registry
#[derive(Debug, Clone)]
pub struct PermissionEvaluator {
    registry: Arc<RoleRegistry>,
}

impl PermissionEvaluator {
    #[must_use]
    pub const fn new(registry: Arc<RoleRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<RoleRegistry> {
        &self.registry
    }

    /// Granted iff any held role owns a matching permission
    pub fn has_permission(&self, ctx: &UserContext, resource: &str, action: &str) -> bool {
        let roles = self.registry.snapshot();
        ctx.roles()
            .iter()
            .filter_map(|name| roles.get(name))
            .any(|role| role.allows(resource, action))
    }

    pub fn has_role(&self, ctx: &UserContext, name: &str) -> bool {
        ctx.has_role(name)
    }

    pub fn has_any_role<S: AsRef<str>>(&self, ctx: &UserContext, names: &[S]) -> bool {
        names.iter().any(|n| ctx.has_role(n.as_ref()))
    }

    /// Required `(resource, action)` pairs the context does not hold, as `resource:action`
    pub fn missing_permissions<R, A>(&self, ctx: &UserContext, required: &[(R, A)]) -> Vec<String>
    where
        R: AsRef<str>,
        A: AsRef<str>,
    {
        required
            .iter()
            .filter(|(r, a)| !self.has_permission(ctx, r.as_ref(), a.as_ref()))
            .map(|(r, a)| format!("{}:{}", r.as_ref(), a.as_ref()))
            .collect()
    }

    /// The any-of role list when none of it is held, else empty
    pub fn missing_roles<S: AsRef<str>>(&self, ctx: &UserContext, any_of: &[S]) -> Vec<String> {
        if any_of.is_empty() || self.has_any_role(ctx, any_of) {
            Vec::new()
        } else {
            any_of.iter().map(|s| s.as_ref().to_string()).collect()
        }
    }

    fn is_admin(ctx: &UserContext) -> bool {
        ctx.has_role(ADMIN_ROLE)
    }

    /// The registry is shared by every tenant, so only the global admin may change it
    fn authorize_change(actor: &UserContext) -> Result<()> {
        if Self::is_admin(actor) {
            Ok(())
        } else {
            Err(AuthError::RegistryChangeDenied(format!(
                "requires the {ADMIN_ROLE} role"
            )))
        }
    }

    /// Add a permission to a role, creating the role if needed
    pub fn add_role_permission(
        &self,
        actor: &UserContext,
        role: &str,
        permission: Permission,
    ) -> Result<()> {
        Self::authorize_change(actor).inspect_err(|e| {
            tracing::warn!(actor = %actor.user_id(), role, error = %e, "Role registry change denied");
        })?;

        let changed = self.registry.update(|roles| {
            let entry = roles
                .entry(role.to_string())
                .or_insert_with(|| Role::new(role, Vec::new()));
            if entry.permissions.contains(&permission) {
                false
            } else {
                entry.permissions.push(permission.clone());
                true
            }
        });

        tracing::info!(
            actor = %actor.user_id(),
            role,
            permission = %permission,
            changed,
            "Role permission added"
        );
        Ok(())
    }

    /// Remove a permission from a role; returns whether it was present
    pub fn remove_role_permission(
        &self,
        actor: &UserContext,
        role: &str,
        permission: &Permission,
    ) -> Result<bool> {
        Self::authorize_change(actor).inspect_err(|e| {
            tracing::warn!(actor = %actor.user_id(), role, error = %e, "Role registry change denied");
        })?;

        let removed = self.registry.update(|roles| {
            roles.get_mut(role).is_some_and(|entry| {
                let before = entry.permissions.len();
                entry.permissions.retain(|p| p != permission);
                entry.permissions.len() != before
            })
        });

        tracing::info!(
            actor = %actor.user_id(),
            role,
            permission = %permission,
            removed,
            "Role permission removed"
        );
        Ok(removed)
    }
}
