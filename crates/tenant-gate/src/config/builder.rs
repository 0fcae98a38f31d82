//! Configuration builder

use std::time::Duration;

use url::Url;

use crate::Error;
use crate::auth::AuthConfig;

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub auth: AuthConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    #[must_use]
    pub const fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    #[must_use]
    pub const fn telemetry(&self) -> &TelemetryConfig {
        &self.telemetry
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json_logs: bool,
}

/// Configuration builder with fluent API.
///
/// Later calls win, so sources are applied lowest precedence first.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    auth: AuthConfig,
    telemetry: TelemetryConfig,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Verification

    #[must_use]
    pub fn issuer(mut self, issuer: Url) -> Self {
        self.auth.jwt.issuer = Some(issuer);
        self
    }

    #[must_use]
    pub fn audience(mut self, audience: Vec<String>) -> Self {
        self.auth.jwt.audience = audience;
        self
    }

    #[must_use]
    pub fn jwks_uri(mut self, uri: Url) -> Self {
        self.auth.jwt.jwks_uri = Some(uri);
        self
    }

    #[must_use]
    pub fn hs_secret(mut self, secret: String) -> Self {
        self.auth.jwt.hs_secret = Some(secret);
        self
    }

    #[must_use]
    pub const fn clock_skew(mut self, skew: Duration) -> Self {
        self.auth.jwt.clock_skew = skew;
        self
    }

    // Provider

    /// Client id used both for provider calls and for client role claims
    #[must_use]
    pub fn client_id(mut self, client_id: String) -> Self {
        self.auth.identity.client_id.clone_from(&client_id);
        self.auth.provider.client_id = client_id;
        self
    }

    #[must_use]
    pub fn client_secret(mut self, secret: String) -> Self {
        self.auth.provider.client_secret = Some(secret);
        self
    }

    #[must_use]
    pub fn token_endpoint(mut self, endpoint: Url) -> Self {
        self.auth.provider.token_endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn introspection_endpoint(mut self, endpoint: Url) -> Self {
        self.auth.provider.introspection_endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn end_session_endpoint(mut self, endpoint: Url) -> Self {
        self.auth.provider.end_session_endpoint = Some(endpoint);
        self
    }

    // Tenancy and roles

    #[must_use]
    pub const fn multi_tenant(mut self, enabled: bool) -> Self {
        self.auth.identity.tenant.multi_tenant = enabled;
        self
    }

    #[must_use]
    pub fn tenant_claim(mut self, claim: String) -> Self {
        self.auth.identity.tenant.tenant_claim = claim;
        self
    }

    #[must_use]
    pub fn default_tenant(mut self, tenant: String) -> Self {
        self.auth.identity.tenant.default_tenant = tenant;
        self
    }

    #[must_use]
    pub fn tenant_field(mut self, field: String) -> Self {
        self.auth.identity.tenant.tenant_field = field;
        self
    }

    #[must_use]
    pub fn recognized_roles(mut self, roles: Vec<String>) -> Self {
        self.auth.identity.recognized_roles = roles;
        self
    }

    // Tokens and audit

    #[must_use]
    pub const fn refresh_threshold(mut self, threshold: Duration) -> Self {
        self.auth.tokens.refresh_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.auth.tokens.refresh_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn audit_buffer(mut self, capacity: usize) -> Self {
        self.auth.audit_buffer = capacity;
        self
    }

    // Logging

    #[must_use]
    pub fn log_level(mut self, level: String) -> Self {
        self.telemetry.log_level = level;
        self
    }

    #[must_use]
    pub const fn json_logs(mut self, enabled: bool) -> Self {
        self.telemetry.json_logs = enabled;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> crate::Result<Config> {
        let auth = self.auth;

        if !auth.jwt.has_key_source() {
            return Err(Error::Config(
                "one of issuer, jwks_uri or hs_secret is required".into(),
            ));
        }
        if auth.identity.tenant.tenant_claim.trim().is_empty() {
            return Err(Error::Config("tenant_claim must not be empty".into()));
        }
        if !auth.identity.tenant.multi_tenant && auth.identity.tenant.default_tenant.is_empty() {
            return Err(Error::Config(
                "default_tenant is required when multi_tenant is off".into(),
            ));
        }
        if auth.tokens.refresh_timeout.is_zero() {
            return Err(Error::Config("refresh_timeout must be positive".into()));
        }
        if auth.audit_buffer == 0 {
            return Err(Error::Config("audit_buffer must be positive".into()));
        }

        let log_level = if self.telemetry.log_level.is_empty() {
            "info".to_string()
        } else {
            self.telemetry.log_level
        };

        Ok(Config {
            auth,
            telemetry: TelemetryConfig {
                log_level,
                json_logs: self.telemetry.json_logs,
            },
        })
    }
}
