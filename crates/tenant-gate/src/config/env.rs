//! Environment variable loading for configuration

use std::env;
use std::time::Duration;

use url::Url;

use super::builder::ConfigBuilder;
use crate::Result;

/// Environment variable names
pub(super) mod vars {
    pub const TG_ISSUER: &str = "TG_ISSUER";
    pub const TG_AUDIENCE: &str = "TG_AUDIENCE";
    pub const TG_JWKS_URI: &str = "TG_JWKS_URI";
    pub const TG_HS_SECRET: &str = "TG_HS_SECRET";
    pub const TG_CLIENT_ID: &str = "TG_CLIENT_ID";
    pub const TG_CLIENT_SECRET: &str = "TG_CLIENT_SECRET";
    pub const TG_TOKEN_ENDPOINT: &str = "TG_TOKEN_ENDPOINT";
    pub const TG_MULTI_TENANT: &str = "TG_MULTI_TENANT";
    pub const TG_TENANT_CLAIM: &str = "TG_TENANT_CLAIM";
    pub const TG_DEFAULT_TENANT: &str = "TG_DEFAULT_TENANT";
    pub const TG_REFRESH_THRESHOLD_SECS: &str = "TG_REFRESH_THRESHOLD_SECS";
    pub const TG_REFRESH_TIMEOUT_SECS: &str = "TG_REFRESH_TIMEOUT_SECS";
    pub const TG_AUDIT_BUFFER: &str = "TG_AUDIT_BUFFER";
    pub const RUST_LOG: &str = "RUST_LOG";
    pub const TG_JSON_LOGS: &str = "TG_JSON_LOGS";

    pub const ALL: &[&str] = &[
        TG_ISSUER,
        TG_AUDIENCE,
        TG_JWKS_URI,
        TG_HS_SECRET,
        TG_CLIENT_ID,
        TG_CLIENT_SECRET,
        TG_TOKEN_ENDPOINT,
        TG_MULTI_TENANT,
        TG_TENANT_CLAIM,
        TG_DEFAULT_TENANT,
        TG_REFRESH_THRESHOLD_SECS,
        TG_REFRESH_TIMEOUT_SECS,
        TG_AUDIT_BUFFER,
        RUST_LOG,
        TG_JSON_LOGS,
    ];
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| crate::Error::Config(format!("Invalid {name}: {e}")))
}

/// Load configuration from environment variables
pub fn load_from_env(mut builder: ConfigBuilder) -> Result<ConfigBuilder> {
    // Verification
    if let Ok(issuer) = env::var(vars::TG_ISSUER) {
        builder = builder.issuer(parse_url(vars::TG_ISSUER, &issuer)?);
    }

    if let Ok(audience) = env::var(vars::TG_AUDIENCE) {
        let audience = audience
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
        builder = builder.audience(audience);
    }

    if let Ok(uri) = env::var(vars::TG_JWKS_URI) {
        builder = builder.jwks_uri(parse_url(vars::TG_JWKS_URI, &uri)?);
    }

    if let Ok(secret) = env::var(vars::TG_HS_SECRET) {
        builder = builder.hs_secret(secret);
    }

    // Provider
    if let Ok(client_id) = env::var(vars::TG_CLIENT_ID) {
        builder = builder.client_id(client_id);
    }

    if let Ok(secret) = env::var(vars::TG_CLIENT_SECRET) {
        builder = builder.client_secret(secret);
    }

    if let Ok(endpoint) = env::var(vars::TG_TOKEN_ENDPOINT) {
        builder = builder.token_endpoint(parse_url(vars::TG_TOKEN_ENDPOINT, &endpoint)?);
    }

    // Tenancy
    if let Ok(val) = env::var(vars::TG_MULTI_TENANT) {
        builder = builder.multi_tenant(parse_bool(&val));
    }

    if let Ok(claim) = env::var(vars::TG_TENANT_CLAIM) {
        builder = builder.tenant_claim(claim);
    }

    if let Ok(tenant) = env::var(vars::TG_DEFAULT_TENANT) {
        builder = builder.default_tenant(tenant);
    }

    // Tokens
    if let Ok(secs_str) = env::var(vars::TG_REFRESH_THRESHOLD_SECS)
        && let Ok(secs) = secs_str.parse::<u64>()
    {
        builder = builder.refresh_threshold(Duration::from_secs(secs));
    }

    if let Ok(secs_str) = env::var(vars::TG_REFRESH_TIMEOUT_SECS)
        && let Ok(secs) = secs_str.parse::<u64>()
    {
        builder = builder.refresh_timeout(Duration::from_secs(secs));
    }

    if let Ok(size_str) = env::var(vars::TG_AUDIT_BUFFER)
        && let Ok(size) = size_str.parse::<usize>()
    {
        builder = builder.audit_buffer(size);
    }

    // Logging
    if let Ok(level) = env::var(vars::RUST_LOG) {
        builder = builder.log_level(level);
    }

    if let Ok(val) = env::var(vars::TG_JSON_LOGS) {
        builder = builder.json_logs(parse_bool(&val));
    }

    Ok(builder)
}

pub(super) fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
pub(super) mod tests {
    use std::sync::Mutex;

    use super::*;

    pub(in crate::config) static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Run `f` with exactly `vars` set among the loader's variables
    pub(in crate::config) fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_MUTEX
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let old_values: Vec<_> = vars::ALL.iter().map(|k| (*k, env::var(k).ok())).collect();

        for key in vars::ALL {
            // SAFETY: We hold a mutex lock to ensure no concurrent modifications
            unsafe { env::remove_var(key) };
        }
        for (key, value) in vars {
            // SAFETY: We hold a mutex lock to ensure no concurrent modifications
            unsafe { env::set_var(key, value) };
        }

        let result = f();

        for (key, old_value) in old_values {
            match old_value {
                // SAFETY: We hold a mutex lock to ensure no concurrent modifications
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("no"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_load_verification_settings() {
        with_env_vars(
            &[
                ("TG_ISSUER", "https://auth.example.com/realms/acme"),
                ("TG_AUDIENCE", "dashboard, api,"),
                ("TG_JWKS_URI", "https://auth.example.com/realms/acme/certs"),
            ],
            || {
                let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
                let jwt = &config.auth.jwt;
                assert_eq!(
                    jwt.issuer.as_ref().map(Url::as_str),
                    Some("https://auth.example.com/realms/acme")
                );
                assert_eq!(jwt.audience, vec!["dashboard", "api"]);
                assert!(jwt.jwks_uri.is_some());
                assert!(jwt.hs_secret.is_none());
            },
        );
    }

    #[test]
    fn test_load_invalid_url() {
        with_env_vars(&[("TG_ISSUER", "not a valid url")], || {
            let err = load_from_env(ConfigBuilder::new()).unwrap_err();
            assert!(err.to_string().contains("TG_ISSUER"));
        });
    }

    #[test]
    fn test_load_provider_settings() {
        with_env_vars(
            &[
                ("TG_HS_SECRET", "secret"),
                ("TG_CLIENT_ID", "dashboard"),
                ("TG_CLIENT_SECRET", "s3cret"),
                ("TG_TOKEN_ENDPOINT", "https://auth.example.com/token"),
            ],
            || {
                let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
                assert_eq!(config.auth.identity.client_id, "dashboard");
                assert_eq!(config.auth.provider.client_secret.as_deref(), Some("s3cret"));
                assert!(config.auth.provider.token_endpoint.is_some());
            },
        );
    }

    #[test]
    fn test_load_tenancy_settings() {
        with_env_vars(
            &[
                ("TG_HS_SECRET", "secret"),
                ("TG_MULTI_TENANT", "false"),
                ("TG_TENANT_CLAIM", "org"),
                ("TG_DEFAULT_TENANT", "main"),
            ],
            || {
                let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
                let tenant = &config.auth.identity.tenant;
                assert!(!tenant.multi_tenant);
                assert_eq!(tenant.tenant_claim, "org");
                assert_eq!(tenant.default_tenant, "main");
            },
        );
    }

    #[test]
    fn test_load_token_and_audit_settings() {
        with_env_vars(
            &[
                ("TG_HS_SECRET", "secret"),
                ("TG_REFRESH_THRESHOLD_SECS", "60"),
                ("TG_REFRESH_TIMEOUT_SECS", "5"),
                ("TG_AUDIT_BUFFER", "256"),
                ("RUST_LOG", "debug"),
                ("TG_JSON_LOGS", "yes"),
            ],
            || {
                let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
                assert_eq!(config.auth.tokens.refresh_threshold, Duration::from_secs(60));
                assert_eq!(config.auth.tokens.refresh_timeout, Duration::from_secs(5));
                assert_eq!(config.auth.audit_buffer, 256);
                assert_eq!(config.telemetry.log_level, "debug");
                assert!(config.telemetry.json_logs);
            },
        );
    }

    #[test]
    fn test_load_invalid_numbers_ignored() {
        with_env_vars(
            &[
                ("TG_HS_SECRET", "secret"),
                ("TG_REFRESH_THRESHOLD_SECS", "soon"),
                ("TG_AUDIT_BUFFER", "-1"),
            ],
            || {
                let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
                assert_eq!(
                    config.auth.tokens.refresh_threshold,
                    crate::constants::DEFAULT_REFRESH_THRESHOLD
                );
                assert_eq!(
                    config.auth.audit_buffer,
                    crate::constants::DEFAULT_AUDIT_BUFFER
                );
            },
        );
    }

    #[test]
    fn test_load_no_env_vars() {
        with_env_vars(&[], || {
            let result = load_from_env(ConfigBuilder::new()).unwrap().build();
            assert!(result.is_err());
        });
    }
}
