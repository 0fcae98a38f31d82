//! Authentication and authorization error types

use std::time::Duration;

use thiserror::Error;

use super::rbac::DenyReason;

/// Error taxonomy used to decide how far a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing, invalid or expired credential
    Authentication,
    /// Valid identity, insufficient role or permission
    Authorization,
    /// Cross-tenant access without override
    TenantIsolation,
    /// Provider unreachable or refresh rejected
    Refresh,
    /// Deployment or claim configuration problem
    Configuration,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::TenantIsolation => "tenant_isolation",
            Self::Refresh => "refresh",
            Self::Configuration => "configuration",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication required")]
    NotAuthenticated,

    #[error("login already in progress")]
    LoginInProgress,

    #[error("session ended while the request was in flight")]
    SessionSuperseded,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid issuer")]
    InvalidIssuer,

    #[error("invalid audience")]
    InvalidAudience,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("missing subject claim")]
    MissingSubject,

    #[error("missing or invalid expiry claim")]
    InvalidExpiry,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("no matching key for algorithm")]
    NoMatchingKey,

    #[error("JWKS fetch failed: {0}")]
    JwksFetch(#[source] reqwest::Error),

    #[error("JWKS parse failed: {0}")]
    JwksParse(String),

    #[error("credential rejected by provider: {0}")]
    CredentialRejected(String),

    #[error("access denied: {0}")]
    AccessDenied(DenyReason),

    #[error("role registry change denied: {0}")]
    RegistryChangeDenied(String),

    #[error("access to the requested tenant is not permitted")]
    TenantIsolation,

    #[error("refresh token expired")]
    RefreshTokenExpired,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("token refresh timed out after {0:?}")]
    RefreshTimeout(Duration),

    #[error("missing tenant claim")]
    MissingTenantClaim,

    #[error("credential carries multiple tenants")]
    AmbiguousTenantClaim,

    #[error("OIDC discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AuthError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAuthenticated
            | Self::LoginInProgress
            | Self::SessionSuperseded
            | Self::InvalidToken
            | Self::TokenExpired
            | Self::InvalidIssuer
            | Self::InvalidAudience
            | Self::InvalidSignature
            | Self::MissingSubject
            | Self::InvalidExpiry
            | Self::KeyNotFound(_)
            | Self::NoMatchingKey
            | Self::JwksFetch(_)
            | Self::JwksParse(_)
            | Self::CredentialRejected(_) => ErrorKind::Authentication,

            Self::AccessDenied(_) | Self::RegistryChangeDenied(_) => ErrorKind::Authorization,

            Self::TenantIsolation => ErrorKind::TenantIsolation,

            Self::RefreshTokenExpired | Self::RefreshFailed(_) | Self::RefreshTimeout(_) => {
                ErrorKind::Refresh
            }

            Self::MissingTenantClaim
            | Self::AmbiguousTenantClaim
            | Self::DiscoveryFailed(_)
            | Self::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Authorization failure, including tenant isolation
    #[must_use]
    pub const fn is_authorization(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Authorization | ErrorKind::TenantIsolation
        )
    }

    #[must_use]
    pub const fn is_tenant_isolation(&self) -> bool {
        matches!(self, Self::TenantIsolation)
    }

    /// Errors that end the session (full logout) rather than a single operation
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Authentication | ErrorKind::Refresh)
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::TokenExpired,
            ErrorKind::InvalidIssuer => Self::InvalidIssuer,
            ErrorKind::InvalidAudience => Self::InvalidAudience,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::MissingRequiredClaim(claim) if claim == "exp" => Self::InvalidExpiry,
            ErrorKind::MissingRequiredClaim(claim) if claim == "sub" => Self::MissingSubject,
            _ => Self::InvalidToken,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
