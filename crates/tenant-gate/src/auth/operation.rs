//! Protected operation descriptors

use serde::Serialize;

/// Named operation on a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub name: String,
    pub resource: String,
    pub action: String,
}

impl Operation {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
            action: action.into(),
        }
    }
}

/// Everything the gate needs to decide one access
#[derive(Debug, Clone, Serialize)]
pub struct GuardRequest {
    pub operation: Operation,
    /// Any one of these roles admits
    pub required_roles: Vec<String>,
    /// Every `(resource, action)` pair must be granted
    pub required_permissions: Vec<(String, String)>,
    /// Target tenant for tenant-scoped resources
    pub tenant_id: Option<String>,
    pub allow_cross_tenant: bool,
}

impl GuardRequest {
    /// Request that requires the operation's own `resource:action`
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        let required = (operation.resource.clone(), operation.action.clone());
        Self {
            operation,
            required_roles: Vec::new(),
            required_permissions: vec![required],
            tenant_id: None,
            allow_cross_tenant: false,
        }
    }

    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_permission(mut self, resource: impl Into<String>, action: impl Into<String>) -> Self {
        self.required_permissions.push((resource.into(), action.into()));
        self
    }

    #[must_use]
    pub fn without_permissions(mut self) -> Self {
        self.required_permissions.clear();
        self
    }

    #[must_use]
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub const fn cross_tenant(mut self, allow: bool) -> Self {
        self.allow_cross_tenant = allow;
        self
    }
}
