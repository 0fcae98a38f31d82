//! TOML configuration file loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::builder::ConfigBuilder;
use crate::Result;

/// Configuration file locations checked in order
const CONFIG_PATHS: &[&str] = &[
    "./tenant-gate.toml",
    "~/.config/tenant-gate/config.toml",
    "/etc/tenant-gate/config.toml",
];

/// Find the first existing configuration file
pub fn find_config_file() -> Option<PathBuf> {
    for path_str in CONFIG_PATHS {
        let path = if path_str.starts_with('~') {
            if let Ok(home) = std::env::var("HOME") {
                PathBuf::from(path_str.replacen('~', &home, 1))
            } else {
                continue;
            }
        } else {
            PathBuf::from(path_str)
        };

        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path, builder: ConfigBuilder) -> Result<ConfigBuilder> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        crate::Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let file_config: FileConfig = toml::from_str(&content).map_err(|e| {
        crate::Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;

    apply_file_config(builder, file_config)
}

fn parse_url(what: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| crate::Error::Config(format!("Invalid {what}: {e}")))
}

fn apply_file_config(mut builder: ConfigBuilder, config: FileConfig) -> Result<ConfigBuilder> {
    // Verification settings
    if let Some(jwt) = config.jwt {
        if let Some(issuer) = jwt.issuer {
            builder = builder.issuer(parse_url("issuer URL", &issuer)?);
        }
        if let Some(audience) = jwt.audience {
            builder = builder.audience(audience);
        }
        if let Some(uri) = jwt.jwks_uri {
            builder = builder.jwks_uri(parse_url("JWKS URI", &uri)?);
        }
        if let Some(secret) = jwt.hs_secret {
            builder = builder.hs_secret(secret);
        }
        if let Some(skew) = jwt.clock_skew_secs {
            builder = builder.clock_skew(Duration::from_secs(skew));
        }
    }

    // Provider settings
    if let Some(provider) = config.provider {
        if let Some(client_id) = provider.client_id {
            builder = builder.client_id(client_id);
        }
        if let Some(secret) = provider.client_secret {
            builder = builder.client_secret(secret);
        }
        if let Some(endpoint) = provider.token_endpoint {
            builder = builder.token_endpoint(parse_url("token endpoint", &endpoint)?);
        }
        if let Some(endpoint) = provider.introspection_endpoint {
            builder =
                builder.introspection_endpoint(parse_url("introspection endpoint", &endpoint)?);
        }
        if let Some(endpoint) = provider.end_session_endpoint {
            builder = builder.end_session_endpoint(parse_url("end-session endpoint", &endpoint)?);
        }
    }

    // Tenancy settings
    if let Some(tenancy) = config.tenancy {
        if let Some(multi) = tenancy.multi_tenant {
            builder = builder.multi_tenant(multi);
        }
        if let Some(claim) = tenancy.tenant_claim {
            builder = builder.tenant_claim(claim);
        }
        if let Some(tenant) = tenancy.default_tenant {
            builder = builder.default_tenant(tenant);
        }
        if let Some(field) = tenancy.tenant_field {
            builder = builder.tenant_field(field);
        }
        if let Some(roles) = tenancy.recognized_roles {
            builder = builder.recognized_roles(roles);
        }
    }

    // Token settings
    if let Some(tokens) = config.tokens {
        if let Some(secs) = tokens.refresh_threshold_secs {
            builder = builder.refresh_threshold(Duration::from_secs(secs));
        }
        if let Some(secs) = tokens.refresh_timeout_secs {
            builder = builder.refresh_timeout(Duration::from_secs(secs));
        }
    }

    if let Some(audit) = config.audit
        && let Some(size) = audit.buffer
    {
        builder = builder.audit_buffer(size);
    }

    // Observability settings
    if let Some(obs) = config.observability {
        if let Some(level) = obs.log_level {
            builder = builder.log_level(level);
        }
        if let Some(json) = obs.json_logs {
            builder = builder.json_logs(json);
        }
    }

    Ok(builder)
}

/// Root configuration file structure
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    jwt: Option<JwtFileConfig>,
    provider: Option<ProviderFileConfig>,
    tenancy: Option<TenancyFileConfig>,
    tokens: Option<TokensFileConfig>,
    audit: Option<AuditFileConfig>,
    observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Deserialize)]
struct JwtFileConfig {
    issuer: Option<String>,
    audience: Option<Vec<String>>,
    jwks_uri: Option<String>,
    hs_secret: Option<String>,
    clock_skew_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProviderFileConfig {
    client_id: Option<String>,
    client_secret: Option<String>,
    token_endpoint: Option<String>,
    introspection_endpoint: Option<String>,
    end_session_endpoint: Option<String>,
}

// Strict: the admin role name is fixed, so a stray `admin_role` must not pass silently
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TenancyFileConfig {
    multi_tenant: Option<bool>,
    tenant_claim: Option<String>,
    default_tenant: Option<String>,
    tenant_field: Option<String>,
    recognized_roles: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokensFileConfig {
    refresh_threshold_secs: Option<u64>,
    refresh_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AuditFileConfig {
    buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: Option<String>,
    json_logs: Option<bool>,
}
