//! Authentication, authorization and tenant isolation
//!
//! Credentials are verified as JWTs, mapped onto a [`UserContext`], and every
//! protected operation passes through the [`AuthorizationGate`].
//!
//! # Layers
//!
//! - [`ClaimsVerifier`] checks signatures against an HS secret or a JWKS
//! - [`IdentityResolver`] maps claims to user, tenant and recognized roles
//! - [`PermissionEvaluator`] answers role and permission queries from a [`RoleRegistry`]
//! - [`TokenLifecycleManager`] stores tokens and schedules refresh
//! - [`TenantContextManager`] opens [`TenantScope`]s that filter data and audit the outcome
//!
//! # OIDC Support
//!
//! With the `oidc` feature, [`oidc::discover`] fills issuer, JWKS and token
//! endpoints from the provider's discovery document.

mod audit;
mod claims;
mod config;
mod error;
mod gate;
mod identity;
mod jwks;
mod jwt;
#[cfg(feature = "oidc")]
pub mod oidc;
mod operation;
mod provider;
mod query;
mod rbac;
mod tenant;
mod tokens;
mod user_context;

pub use audit::{
    AuditEvent, AuditHealth, AuditOutcome, AuditSink, AuditStore, AuditStoreError,
    BufferedAuditSink, MemoryAuditSink, TracingAuditStore,
};
pub use claims::{JwtClaims, OneOrMany, RoleClaims};
pub use config::{AuthConfig, IdentityConfig, JwtConfig, ProviderConfig, TenantConfig, TokenConfig};
pub use error::{AuthError, ErrorKind, Result};
pub use gate::{AuthState, AuthorizationGate, GateBuilder, GuardDecision};
pub use identity::IdentityResolver;
pub use jwks::{Jwk, JwkSet, JwksCache};
pub use jwt::ClaimsVerifier;
pub use operation::{GuardRequest, Operation};
pub use provider::{CredentialProvider, Credentials, HttpCredentialProvider, UnconfiguredProvider};
pub use query::{Filter, FilterOp, Query, TenantOwned};
pub use rbac::{DenyReason, Permission, PermissionEvaluator, Role, RoleRegistry, SEEDED_ROLES};
pub use tenant::{TenantContextManager, TenantScope};
pub use tokens::{ArmedRefresh, TokenLifecycleManager, TokenSet};
pub use user_context::UserContext;
