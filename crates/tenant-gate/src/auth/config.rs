//! Authorization configuration types

use std::time::Duration;

use url::Url;

use crate::constants::{
    DEFAULT_AUDIT_BUFFER, DEFAULT_REFRESH_THRESHOLD, DEFAULT_REFRESH_TIMEOUT,
    DEFAULT_TENANT, DEFAULT_TENANT_CLAIM, DEFAULT_TENANT_FIELD,
};

use super::rbac::SEEDED_ROLES;

/// JWT verification configuration
#[derive(Clone)]
pub struct JwtConfig {
    /// Expected `iss` claim; also the base for OIDC discovery
    pub issuer: Option<Url>,
    /// Expected audience claims (must contain at least one match)
    pub audience: Vec<String>,
    /// JWKS URI (if not using OIDC discovery)
    pub jwks_uri: Option<Url>,
    /// Clock skew tolerance for exp/nbf validation
    pub clock_skew: Duration,
    /// HS256/384/512 secret for symmetric signing
    pub hs_secret: Option<String>,
    pub jwks_cache_ttl: Duration,
    pub jwks_refresh_interval: Duration,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("jwks_uri", &self.jwks_uri)
            .field("clock_skew", &self.clock_skew)
            .field("hs_secret", &self.hs_secret.as_ref().map(|_| "[REDACTED]"))
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .field("jwks_refresh_interval", &self.jwks_refresh_interval)
            .finish()
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: vec![],
            jwks_uri: None,
            clock_skew: Duration::from_secs(60),
            hs_secret: None,
            jwks_cache_ttl: Duration::from_secs(3600),
            jwks_refresh_interval: Duration::from_secs(300),
        }
    }
}

impl JwtConfig {
    #[must_use]
    pub fn new(issuer: Url) -> Self {
        Self {
            issuer: Some(issuer),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_audience(mut self, audience: Vec<String>) -> Self {
        self.audience = audience;
        self
    }

    #[must_use]
    pub fn with_jwks_uri(mut self, uri: Url) -> Self {
        self.jwks_uri = Some(uri);
        self
    }

    #[must_use]
    pub fn with_hs_secret(mut self, secret: String) -> Self {
        self.hs_secret = Some(secret);
        self
    }

    /// Whether any key source is configured
    #[must_use]
    pub const fn has_key_source(&self) -> bool {
        self.hs_secret.is_some() || self.jwks_uri.is_some() || self.issuer.is_some()
    }
}

/// Multi-tenancy configuration
#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// Require a tenant claim on every credential
    pub multi_tenant: bool,
    /// Claim name containing the tenant id
    pub tenant_claim: String,
    /// Tenant used when `multi_tenant` is off and no claim is present
    pub default_tenant: String,
    /// Record and query field carrying the tenant id
    pub tenant_field: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            multi_tenant: true,
            tenant_claim: DEFAULT_TENANT_CLAIM.to_string(),
            default_tenant: DEFAULT_TENANT.to_string(),
            tenant_field: DEFAULT_TENANT_FIELD.to_string(),
        }
    }
}

/// Claims-to-identity mapping
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Client id whose `resource_access` roles are honored
    pub client_id: String,
    /// Role names kept from claims; anything else is dropped
    pub recognized_roles: Vec<String>,
    pub tenant: TenantConfig,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            recognized_roles: SEEDED_ROLES.iter().map(|r| (*r).to_string()).collect(),
            tenant: TenantConfig::default(),
        }
    }
}

/// Token lifetime handling
#[derive(Debug, Clone, Copy)]
pub struct TokenConfig {
    /// Refresh fires this long before the access token expires
    pub refresh_threshold: Duration,
    /// Maximum duration of a single refresh call
    pub refresh_timeout: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }
}

/// Credential provider endpoints and client credentials
#[derive(Clone, Default)]
pub struct ProviderConfig {
    pub token_endpoint: Option<Url>,
    pub introspection_endpoint: Option<Url>,
    pub end_session_endpoint: Option<Url>,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// HTTP timeout for provider calls (None = client default)
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("token_endpoint", &self.token_endpoint)
            .field("introspection_endpoint", &self.introspection_endpoint)
            .field("end_session_endpoint", &self.end_session_endpoint)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Complete authorization configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt: JwtConfig,
    pub identity: IdentityConfig,
    pub tokens: TokenConfig,
    pub provider: ProviderConfig,
    /// Pending audit events before new ones are dropped
    pub audit_buffer: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt: JwtConfig::default(),
            identity: IdentityConfig::default(),
            tokens: TokenConfig::default(),
            provider: ProviderConfig::default(),
            audit_buffer: DEFAULT_AUDIT_BUFFER,
        }
    }
}
