//! Constants for the authorization core

use std::time::Duration;

/// Matches any resource or action in a permission
pub const WILDCARD: &str = "*";

/// Role allowed to open cross-tenant scopes and change any registry entry
pub const ADMIN_ROLE: &str = "admin";

/// Refresh is scheduled this long before the access token expires
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(30);

/// Upper bound on a single refresh round-trip to the credential provider
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Claim carrying the tenant id
pub const DEFAULT_TENANT_CLAIM: &str = "tenant_id";

/// Record and query field carrying the tenant id
pub const DEFAULT_TENANT_FIELD: &str = "tenant_id";

/// Tenant assigned in single-tenant deployments
pub const DEFAULT_TENANT: &str = "default";

/// Pending audit events held before new ones are dropped
pub const DEFAULT_AUDIT_BUFFER: usize = 1024;

/// Tracing target for audit events
pub const AUDIT_TARGET: &str = "audit";
