//! Authorization and multi-tenant isolation core
//!
//! Session tokens, identity, role-based permissions and tenant scoping for
//! multi-tenant dashboards. See [`auth::AuthorizationGate`] for the entry point.

pub mod auth;
pub mod config;
mod constants;
mod error;
pub mod observability;

pub use auth::{
    AuthError, AuthState, AuthorizationGate, GateBuilder, GuardDecision, GuardRequest, Operation,
    TenantScope, UserContext,
};
pub use config::{Config, ConfigBuilder, TelemetryConfig};
pub use constants::{ADMIN_ROLE, DEFAULT_REFRESH_THRESHOLD, DEFAULT_REFRESH_TIMEOUT, WILDCARD};
pub use error::{Error, Result};
